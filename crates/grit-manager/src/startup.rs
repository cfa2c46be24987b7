//! Startup tasks for the manager
//!
//! The operator installs its own CRDs on startup using server-side apply,
//! so the CRD versions always match the operator version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use grit_common::crd::{Checkpoint, Restore};
use grit_common::{Error, Result};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "grit-manager";

/// Install or update the Checkpoint and Restore CRDs
pub async fn ensure_crds_installed(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("installing Checkpoint CRD");
    crds.patch(
        "checkpoints.kaito.sh",
        &params,
        &Patch::Apply(&Checkpoint::crd()),
    )
    .await
    .map_err(Error::from)?;

    info!("installing Restore CRD");
    crds.patch("restores.kaito.sh", &params, &Patch::Apply(&Restore::crd()))
        .await
        .map_err(Error::from)?;

    info!("all GRIT CRDs installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names_match_apply_targets() {
        assert_eq!(Checkpoint::crd().metadata.name.as_deref(), Some("checkpoints.kaito.sh"));
        assert_eq!(Restore::crd().metadata.name.as_deref(), Some("restores.kaito.sh"));
    }

    #[test]
    fn test_crds_are_namespaced_with_status_subresource() {
        for crd in [Checkpoint::crd(), Restore::crd()] {
            assert_eq!(crd.spec.scope, "Namespaced");
            let version = &crd.spec.versions[0];
            assert_eq!(version.name, "v1alpha1");
            assert!(version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some());
        }
    }

    #[test]
    fn test_crd_shortnames() {
        assert!(Checkpoint::crd()
            .spec
            .names
            .short_names
            .as_ref()
            .unwrap()
            .contains(&"ckpt".to_string()));
        assert!(Restore::crd()
            .spec
            .names
            .short_names
            .as_ref()
            .unwrap()
            .contains(&"rt".to_string()));
    }
}
