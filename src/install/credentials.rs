//! Munge key secret materialization

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use std::path::Path;

use crate::utils::errors::{BurstError, Result};

/// Key under which the munge key is stored in the secret
pub const MUNGE_KEY_FIELD: &str = "munge.key";

/// Read a local munge key and wrap it in a namespaced secret.
///
/// The bytes go into `data`, which the API server receives base64 encoded,
/// so binary keys survive intact.
pub fn materialize(local_secret_path: &Path, secret_name: &str, namespace: &str) -> Result<Secret> {
    let content = std::fs::read(local_secret_path)
        .map_err(|e| BurstError::from_credential_io(local_secret_path, e))?;

    tracing::debug!(
        path = %local_secret_path.display(),
        secret = %secret_name,
        namespace = %namespace,
        bytes = content.len(),
        "Materialized munge key secret"
    );

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    "fluxburst-gke".to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some([(MUNGE_KEY_FIELD.to_string(), ByteString(content))].into()),
        ..Default::default()
    })
}
