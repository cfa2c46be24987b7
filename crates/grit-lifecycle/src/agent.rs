//! Agent job construction
//!
//! Agent jobs are rendered from a cluster-wide template in the
//! `grit-agent-config` ConfigMap, then completed with the volumes, mounts,
//! arguments and environment a specific checkpoint or restore needs. The
//! config is read through a reflector store so reconciles never hit the API
//! server for it.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Volume,
    VolumeMount,
};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use minijinja::{context, Environment, UndefinedBehavior};

use grit_common::crd::{Checkpoint, Restore};
use grit_common::{
    agent_job_name, Error, Result, GRIT_AGENT_CONFIG_NAME, GRIT_AGENT_LABEL, GRIT_AGENT_NAME,
};

/// ConfigMap key: base directory on each node for staged checkpoint data
pub const HOST_PATH_KEY: &str = "host-path";

/// ConfigMap key: the agent job manifest template
pub const AGENT_TEMPLATE_KEY: &str = "grit-agent-template.yaml";

/// Mount point of the shared-storage claim inside the agent container
pub const PVC_DIR_IN_CONTAINER: &str = "/mnt/pvc-data";

/// Parsed agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Base host directory; per-checkpoint data lives at `<base>/<ns>/<name>`
    pub host_path: String,
    /// Job manifest template with `namespace`/`jobName`/`nodeName` placeholders
    pub template: String,
}

impl AgentConfig {
    /// Extract the configuration from the `grit-agent-config` ConfigMap
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        let data = cm
            .data
            .as_ref()
            .ok_or_else(|| Error::config_missing("grit-agent-config has no data"))?;

        let host_path = data
            .get(HOST_PATH_KEY)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::config_missing(format!("no {HOST_PATH_KEY} in grit-agent-config"))
            })?;

        let template = data
            .get(AGENT_TEMPLATE_KEY)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                Error::config_missing(format!("no {AGENT_TEMPLATE_KEY} in grit-agent-config"))
            })?;

        Ok(Self {
            host_path: host_path.to_string(),
            template: template.clone(),
        })
    }
}

/// Cached access to the agent configuration
#[derive(Clone)]
pub struct AgentManager {
    namespace: String,
    store: Store<ConfigMap>,
}

impl AgentManager {
    /// Create a manager reading `grit-agent-config` from the given namespace
    pub fn new(namespace: impl Into<String>, store: Store<ConfigMap>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
        }
    }

    /// Current agent configuration, from the reflector cache
    pub fn config(&self) -> Result<AgentConfig> {
        let key = ObjectRef::<ConfigMap>::new(GRIT_AGENT_CONFIG_NAME).within(&self.namespace);
        let cm = self.store.get(&key).ok_or_else(|| {
            Error::config_missing(format!(
                "ConfigMap({}/{GRIT_AGENT_CONFIG_NAME}) doesn't exist",
                self.namespace
            ))
        })?;
        AgentConfig::from_config_map(&cm)
    }

    /// Base host directory, if the configuration is currently readable
    pub fn host_path(&self) -> Option<String> {
        self.config().ok().map(|c| c.host_path)
    }
}

/// Host directory staged for one checkpoint
pub fn host_work_path(host_base: &str, namespace: &str, checkpoint_name: &str) -> String {
    format!(
        "{}/{namespace}/{checkpoint_name}",
        host_base.trim_end_matches('/')
    )
}

/// Build the agent job for a checkpoint, or for a restore of that checkpoint
///
/// The rendered template must declare exactly one container; the builder
/// appends to its arguments, environment and mounts rather than replacing
/// them. For checkpoint jobs data flows host → claim; for restore jobs the
/// direction is swapped.
pub fn build_agent_job(
    config: &AgentConfig,
    ckpt: &Checkpoint,
    restore: Option<&Restore>,
) -> Result<Job> {
    let namespace = ckpt
        .namespace()
        .ok_or_else(|| Error::validation(ckpt.name_any(), "checkpoint must be namespaced"))?;
    let ckpt_name = ckpt.name_any();
    let ckpt_status = ckpt.status.clone().unwrap_or_default();

    let (job_name, node_name) = match restore {
        Some(restore) => (
            agent_job_name(&restore.name_any()),
            restore
                .status
                .as_ref()
                .map(|s| s.node_name.clone())
                .unwrap_or_default(),
        ),
        None => (agent_job_name(&ckpt_name), ckpt_status.node_name.clone()),
    };

    let rendered = render_template(&config.template, &namespace, &job_name, &node_name)?;
    let mut job: Job = serde_yaml::from_str(&rendered)
        .map_err(|e| Error::bad_template(format!("failed to decode agent job: {e}")))?;

    // The watch topology keys off the name and label, not the template
    job.metadata.name = Some(job_name);
    job.metadata.namespace = Some(namespace.clone());
    job.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(GRIT_AGENT_LABEL.to_string(), GRIT_AGENT_NAME.to_string());

    let pod_spec = job
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| Error::bad_template("agent job template has no pod spec"))?;

    if pod_spec.containers.len() != 1 {
        return Err(Error::BadContainerCount {
            count: pod_spec.containers.len(),
        });
    }

    let host_work = host_work_path(&config.host_path, &namespace, &ckpt_name);
    let pvc_sub_path = format!("{PVC_DIR_IN_CONTAINER}/{namespace}/{ckpt_name}");

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(Volume {
        name: "host-data".to_string(),
        host_path: Some(HostPathVolumeSource {
            path: host_work.clone(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    });
    if let Some(claim) = &ckpt.spec.volume_claim {
        volumes.push(Volume {
            name: "pvc-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.claim_name.clone(),
                read_only: claim.read_only,
            }),
            ..Default::default()
        });
    }

    let container = &mut pod_spec.containers[0];
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.push(VolumeMount {
        name: "host-data".to_string(),
        mount_path: host_work.clone(),
        ..Default::default()
    });
    if ckpt.spec.volume_claim.is_some() {
        mounts.push(VolumeMount {
            name: "pvc-data".to_string(),
            mount_path: PVC_DIR_IN_CONTAINER.to_string(),
            ..Default::default()
        });
    }

    let (action, src_dir, dst_dir) = match restore {
        Some(_) => ("restore", &pvc_sub_path, &host_work),
        None => ("checkpoint", &host_work, &pvc_sub_path),
    };
    let args = container.args.get_or_insert_with(Vec::new);
    args.push(format!("--action={action}"));
    args.push(format!("--src-dir={src_dir}"));
    args.push(format!("--dst-dir={dst_dir}"));
    args.push(format!("--host-work-path={host_work}"));

    let env = container.env.get_or_insert_with(Vec::new);
    env.push(env_var("TARGET_NAMESPACE", &namespace));
    env.push(env_var("TARGET_NAME", &ckpt.spec.pod_name));
    env.push(env_var("TARGET_UID", &ckpt_status.pod_uid));

    Ok(job)
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Render the job template with the placement context
///
/// Templates ship with Go-template style field references (`{{.jobName}}`);
/// the leading dot is normalized away before rendering. Missing keys render
/// as empty.
fn render_template(
    template: &str,
    namespace: &str,
    job_name: &str,
    node_name: &str,
) -> Result<String> {
    let source = template.replace("{{.", "{{");

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.render_str(
        &source,
        context! { namespace, jobName => job_name, nodeName => node_name },
    )
    .map_err(|e| Error::bad_template(format!("failed to render agent job template: {e}")))
}

/// True if the agent job finished successfully
///
/// Completion and failure are computed independently; a running job is
/// neither.
pub fn is_job_completed(job: &Job) -> bool {
    let Some(status) = job.status.as_ref() else {
        return false;
    };

    if status.succeeded.unwrap_or(0) > 0 {
        return true;
    }

    status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Complete" && c.status == "True")
        })
        .unwrap_or(false)
}

/// True if the agent job failed
pub fn is_job_failed(job: &Job) -> bool {
    let Some(status) = job.status.as_ref() else {
        return false;
    };

    if status.failed.unwrap_or(0) > 0 {
        return true;
    }

    status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use kube::api::ObjectMeta;

    use grit_common::crd::{
        CheckpointSpec, CheckpointStatus, RestoreSpec, RestoreStatus, VolumeClaimSource,
        WorkloadOwnerRef,
    };

    const TEMPLATE: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: {{.jobName}}
  namespace: {{.namespace}}
spec:
  backoffLimit: 0
  template:
    spec:
      nodeName: {{.nodeName}}
      restartPolicy: Never
      containers:
      - name: grit-agent
        image: ghcr.io/kaito-project/grit-agent:v0.1.0
        args:
        - --v=2
"#;

    fn sample_config() -> AgentConfig {
        AgentConfig {
            host_path: "/var/lib/grit".to_string(),
            template: TEMPLATE.to_string(),
        }
    }

    fn sample_checkpoint() -> Checkpoint {
        let mut ckpt = Checkpoint::new(
            "c1",
            CheckpointSpec {
                pod_name: "p1".to_string(),
                volume_claim: Some(VolumeClaimSource {
                    claim_name: "ckpt-storage".to_string(),
                    read_only: None,
                }),
                auto_migration: false,
            },
        );
        ckpt.metadata.namespace = Some("foo".to_string());
        ckpt.status = Some(CheckpointStatus {
            node_name: "n1".to_string(),
            pod_uid: "uid-1".to_string(),
            ..Default::default()
        });
        ckpt
    }

    fn sample_restore() -> Restore {
        Restore {
            metadata: ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("foo".to_string()),
                ..Default::default()
            },
            spec: RestoreSpec {
                checkpoint_name: "c1".to_string(),
                owner_ref: WorkloadOwnerRef::default(),
            },
            status: Some(RestoreStatus {
                node_name: "n2".to_string(),
                target_pod: "p1-x".to_string(),
                ..Default::default()
            }),
        }
    }

    fn container_of(job: &Job) -> &k8s_openapi::api::core::v1::Container {
        &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn checkpoint_job_name_and_placement() {
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), None).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("grit-agent-c1"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("foo"));
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.node_name.as_deref(), Some("n1"));
    }

    #[test]
    fn restore_job_uses_restore_name_and_node() {
        let restore = sample_restore();
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), Some(&restore)).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("grit-agent-c1"));
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.node_name.as_deref(), Some("n2"));
    }

    #[test]
    fn job_carries_agent_label() {
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), None).unwrap();
        assert_eq!(
            job.metadata.labels.as_ref().unwrap().get(GRIT_AGENT_LABEL),
            Some(&GRIT_AGENT_NAME.to_string())
        );
    }

    #[test]
    fn job_appends_both_volumes_and_mounts() {
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), None).unwrap();
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        let volumes = pod_spec.volumes.as_ref().unwrap();
        let host = volumes.iter().find(|v| v.name == "host-data").unwrap();
        assert_eq!(
            host.host_path.as_ref().unwrap().path,
            "/var/lib/grit/foo/c1"
        );
        assert_eq!(
            host.host_path.as_ref().unwrap().type_.as_deref(),
            Some("DirectoryOrCreate")
        );

        let pvc = volumes.iter().find(|v| v.name == "pvc-data").unwrap();
        assert_eq!(
            pvc.persistent_volume_claim.as_ref().unwrap().claim_name,
            "ckpt-storage"
        );

        let mounts = container_of(&job).volume_mounts.as_ref().unwrap();
        let host_mount = mounts.iter().find(|m| m.name == "host-data").unwrap();
        assert_eq!(host_mount.mount_path, "/var/lib/grit/foo/c1");
        let pvc_mount = mounts.iter().find(|m| m.name == "pvc-data").unwrap();
        assert_eq!(pvc_mount.mount_path, PVC_DIR_IN_CONTAINER);
    }

    #[test]
    fn job_without_claim_skips_pvc_volume() {
        let mut ckpt = sample_checkpoint();
        ckpt.spec.volume_claim = None;
        let job = build_agent_job(&sample_config(), &ckpt, None).unwrap();
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        assert!(pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .all(|v| v.name != "pvc-data"));
    }

    #[test]
    fn checkpoint_args_stage_host_to_claim() {
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), None).unwrap();
        let args = container_of(&job).args.as_ref().unwrap();

        // Template args are appended to, not replaced
        assert!(args.contains(&"--v=2".to_string()));
        assert!(args.contains(&"--action=checkpoint".to_string()));
        assert!(args.contains(&"--src-dir=/var/lib/grit/foo/c1".to_string()));
        assert!(args.contains(&"--dst-dir=/mnt/pvc-data/foo/c1".to_string()));
        assert!(args.contains(&"--host-work-path=/var/lib/grit/foo/c1".to_string()));
    }

    #[test]
    fn restore_args_swap_direction() {
        let restore = sample_restore();
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), Some(&restore)).unwrap();
        let args = container_of(&job).args.as_ref().unwrap();

        assert!(args.contains(&"--action=restore".to_string()));
        assert!(args.contains(&"--src-dir=/mnt/pvc-data/foo/c1".to_string()));
        assert!(args.contains(&"--dst-dir=/var/lib/grit/foo/c1".to_string()));
    }

    #[test]
    fn job_exports_target_env() {
        let job = build_agent_job(&sample_config(), &sample_checkpoint(), None).unwrap();
        let env = container_of(&job).env.as_ref().unwrap();

        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.as_deref())
        };
        assert_eq!(get("TARGET_NAMESPACE"), Some("foo"));
        assert_eq!(get("TARGET_NAME"), Some("p1"));
        assert_eq!(get("TARGET_UID"), Some("uid-1"));
    }

    #[test]
    fn missing_placeholder_renders_empty() {
        let mut ckpt = sample_checkpoint();
        ckpt.status = None;
        // nodeName placeholder renders empty; the job decodes with no node
        let job = build_agent_job(&sample_config(), &ckpt, None).unwrap();
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod_spec.node_name.is_none());
    }

    #[test]
    fn garbage_template_is_bad_template() {
        let config = AgentConfig {
            host_path: "/var/lib/grit".to_string(),
            template: "not: valid: yaml: {{".to_string(),
        };
        let err = build_agent_job(&config, &sample_checkpoint(), None).unwrap_err();
        assert!(matches!(err, Error::BadTemplate { .. }));
    }

    #[test]
    fn two_containers_is_bad_container_count() {
        let config = AgentConfig {
            host_path: "/var/lib/grit".to_string(),
            template: r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: {{.jobName}}
spec:
  template:
    spec:
      containers:
      - name: one
      - name: two
"#
            .to_string(),
        };
        let err = build_agent_job(&config, &sample_checkpoint(), None).unwrap_err();
        assert!(matches!(err, Error::BadContainerCount { count: 2 }));
    }

    #[test]
    fn config_map_without_keys_is_config_missing() {
        let cm = ConfigMap::default();
        assert!(matches!(
            AgentConfig::from_config_map(&cm).unwrap_err(),
            Error::ConfigMissing { .. }
        ));

        let cm = ConfigMap {
            data: Some(std::collections::BTreeMap::from([(
                HOST_PATH_KEY.to_string(),
                "/var/lib/grit".to_string(),
            )])),
            ..Default::default()
        };
        let err = AgentConfig::from_config_map(&cm).unwrap_err();
        assert!(err.to_string().contains(AGENT_TEMPLATE_KEY));
    }

    #[test]
    fn config_map_host_path_is_trimmed() {
        let cm = ConfigMap {
            data: Some(std::collections::BTreeMap::from([
                (HOST_PATH_KEY.to_string(), " /var/lib/grit\n".to_string()),
                (AGENT_TEMPLATE_KEY.to_string(), TEMPLATE.to_string()),
            ])),
            ..Default::default()
        };
        let config = AgentConfig::from_config_map(&cm).unwrap();
        assert_eq!(config.host_path, "/var/lib/grit");
    }

    #[test]
    fn test_host_work_path() {
        assert_eq!(host_work_path("/var/lib/grit", "foo", "c1"), "/var/lib/grit/foo/c1");
        assert_eq!(host_work_path("/var/lib/grit/", "foo", "c1"), "/var/lib/grit/foo/c1");
    }

    // =========================================================================
    // Job status predicates
    // =========================================================================

    fn job_with_condition(type_: &str, status: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn job_with_counts(succeeded: i32, failed: i32) -> Job {
        Job {
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn completed_via_count_or_condition() {
        assert!(is_job_completed(&job_with_counts(1, 0)));
        assert!(is_job_completed(&job_with_condition("Complete", "True")));
        assert!(!is_job_completed(&job_with_condition("Complete", "False")));
        assert!(!is_job_completed(&job_with_counts(0, 0)));
        assert!(!is_job_completed(&Job::default()));
    }

    #[test]
    fn failed_via_count_or_condition() {
        assert!(is_job_failed(&job_with_counts(0, 1)));
        assert!(is_job_failed(&job_with_condition("Failed", "True")));
        assert!(!is_job_failed(&job_with_condition("Failed", "False")));
        assert!(!is_job_failed(&job_with_counts(1, 0)));
        assert!(!is_job_failed(&Job::default()));
    }

    #[test]
    fn predicates_are_independent() {
        let running = job_with_counts(0, 0);
        assert!(!is_job_completed(&running) && !is_job_failed(&running));

        assert!(is_job_completed(&job_with_counts(1, 0)));
        assert!(!is_job_failed(&job_with_counts(1, 0)));
        assert!(is_job_failed(&job_with_counts(0, 2)));
        assert!(!is_job_completed(&job_with_counts(0, 2)));
    }
}
