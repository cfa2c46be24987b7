//! Pod-spec fingerprinting
//!
//! Checkpoint data can only restore a pod whose desired state matches the
//! checkpointed one. The fingerprint must be stable across the rewrites the
//! platform applies per node, so node-assigned fields are neutralized before
//! hashing: `nodeName`, the generated `kube-api-access-*` service-account
//! volume names, and the matching mounts in init and main containers.

use k8s_openapi::api::core::v1::PodSpec;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Prefix of the projected service-account token volume the platform injects
const KUBE_API_ACCESS_PREFIX: &str = "kube-api-access-";

/// Stand-in for neutralized kube-api-access volume/mount names
const KUBE_API_ACCESS_STAND_IN: &str = "kube-api-access";

/// Number of hex characters kept from the digest
const HASH_LEN: usize = 16;

/// Compute the stable fingerprint of a pod spec
///
/// Two pods that differ only in `nodeName` and/or kube-api-access volume
/// (and mount) names hash equal.
pub fn compute_pod_spec_hash(spec: &PodSpec) -> Result<String> {
    let normalized = normalize(spec);
    let bytes = serde_json::to_vec(&normalized)
        .map_err(|e| Error::internal("hash", format!("failed to serialize pod spec: {e}")))?;

    let digest = Sha256::digest(&bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_LEN);
    Ok(encoded)
}

/// Clear the fields the platform rewrites per node
fn normalize(spec: &PodSpec) -> PodSpec {
    let mut spec = spec.clone();

    spec.node_name = None;

    if let Some(volumes) = spec.volumes.as_mut() {
        for volume in volumes.iter_mut() {
            if volume.name.starts_with(KUBE_API_ACCESS_PREFIX) {
                volume.name = KUBE_API_ACCESS_STAND_IN.to_string();
            }
        }
    }

    for container in spec.containers.iter_mut() {
        neutralize_mounts(&mut container.volume_mounts);
    }
    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers.iter_mut() {
            neutralize_mounts(&mut container.volume_mounts);
        }
    }

    spec
}

fn neutralize_mounts(mounts: &mut Option<Vec<k8s_openapi::api::core::v1::VolumeMount>>) {
    if let Some(mounts) = mounts.as_mut() {
        for mount in mounts.iter_mut() {
            if mount.name.starts_with(KUBE_API_ACCESS_PREFIX) {
                mount.name = KUBE_API_ACCESS_STAND_IN.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, Volume, VolumeMount};

    fn sample_spec(node: &str, token_suffix: &str) -> PodSpec {
        PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("nginx:1.27".to_string()),
                volume_mounts: Some(vec![VolumeMount {
                    name: format!("kube-api-access-{token_suffix}"),
                    mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: format!("kube-api-access-{token_suffix}"),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let spec = sample_spec("n1", "abcde");
        let h1 = compute_pod_spec_hash(&spec).unwrap();
        let h2 = compute_pod_spec_hash(&spec).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), HASH_LEN);
    }

    #[test]
    fn test_hash_ignores_node_name() {
        let h1 = compute_pod_spec_hash(&sample_spec("n1", "abcde")).unwrap();
        let h2 = compute_pod_spec_hash(&sample_spec("n2", "abcde")).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_ignores_api_access_volume_names() {
        let h1 = compute_pod_spec_hash(&sample_spec("n1", "abcde")).unwrap();
        let h2 = compute_pod_spec_hash(&sample_spec("n2", "zzzzz")).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_ignores_api_access_mounts_in_init_containers() {
        let mut spec = sample_spec("n1", "abcde");
        spec.init_containers = Some(vec![Container {
            name: "init".to_string(),
            volume_mounts: Some(vec![VolumeMount {
                name: "kube-api-access-abcde".to_string(),
                mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]);

        let mut other = spec.clone();
        other.init_containers.as_mut().unwrap()[0]
            .volume_mounts
            .as_mut()
            .unwrap()[0]
            .name = "kube-api-access-zzzzz".to_string();

        assert_eq!(
            compute_pod_spec_hash(&spec).unwrap(),
            compute_pod_spec_hash(&other).unwrap()
        );
    }

    #[test]
    fn test_hash_changes_on_image_change() {
        let mut other = sample_spec("n1", "abcde");
        other.containers[0].image = Some("nginx:1.28".to_string());

        assert_ne!(
            compute_pod_spec_hash(&sample_spec("n1", "abcde")).unwrap(),
            compute_pod_spec_hash(&other).unwrap()
        );
    }

    #[test]
    fn test_hash_keeps_user_volume_names() {
        let mut spec = sample_spec("n1", "abcde");
        spec.volumes
            .as_mut()
            .unwrap()
            .push(Volume {
                name: "data".to_string(),
                ..Default::default()
            });

        let mut other = spec.clone();
        other.volumes.as_mut().unwrap()[1].name = "cache".to_string();

        assert_ne!(
            compute_pod_spec_hash(&spec).unwrap(),
            compute_pod_spec_hash(&other).unwrap()
        );
    }

    #[test]
    fn test_normalize_does_not_mutate_input() {
        let spec = sample_spec("n1", "abcde");
        let before = spec.clone();
        let _ = compute_pod_spec_hash(&spec).unwrap();
        assert_eq!(spec, before);
    }
}
