//! Google Cloud Storage using OpenDAL.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use opendal::layers::LoggingLayer;
use opendal::services::Gcs;
use opendal::Operator;
use serde::{Deserialize, Serialize};

use super::operator::{OperatorBackend, OperatorDescriptor};
use crate::services::profiles::Credentials;
use crate::services::storage::{
    Capability, CapabilitySet, Entry, OperationError, OperationResult, PathStyle, ProviderKind,
    TransferLimits,
};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::List,
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Mkdir,
    Capability::Copy,
    Capability::Move,
    Capability::ServerSideCopy,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Metadata,
    Capability::PresignedUrls,
    Capability::BatchDelete,
    Capability::Containers,
]);

/// GCS batch requests accept at most 100 calls.
pub const LIMITS: TransferLimits = TransferLimits {
    min_part_size: 5 * 1024 * 1024,
    max_part_size: 5 * 1024 * 1024 * 1024,
    max_parts: 10_000,
    max_batch_delete: 100,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsConfig {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl GcsConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            root: None,
        }
    }
}

fn build_operator(config: &GcsConfig, credentials: Option<&Credentials>) -> OperationResult<Operator> {
    let mut builder = Gcs::default().bucket(&config.bucket);
    if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        builder = builder.endpoint(endpoint);
    }
    if let Some(root) = config.root.as_deref() {
        builder = builder.root(root);
    }

    match credentials {
        Some(Credentials::ServiceAccount { json: Some(json), .. }) => {
            // OpenDAL expects the key file base64 encoded.
            builder = builder.credential(&STANDARD.encode(json));
        }
        Some(Credentials::ServiceAccount { path: Some(path), .. }) => {
            let path = path
                .to_str()
                .ok_or_else(|| OperationError::invalid_input("Invalid credentials path"))?;
            builder = builder.credential_path(path);
        }
        Some(Credentials::ServiceAccount { .. }) => {
            return Err(OperationError::invalid_input(
                "Service account credentials need either json or path",
            ));
        }
        Some(Credentials::Anonymous) => builder = builder.allow_anonymous(),
        None => {}
        Some(other) => {
            return Err(OperationError::invalid_input(format!(
                "GCS does not accept {} credentials",
                other.kind_name()
            )));
        }
    }

    Ok(Operator::new(builder)?.layer(LoggingLayer::default()).finish())
}

pub fn backend(config: &GcsConfig, credentials: Option<Credentials>) -> OperationResult<OperatorBackend> {
    build_operator(config, credentials.as_ref())?;

    let descriptor = OperatorDescriptor {
        kind: ProviderKind::Gcs,
        style: PathStyle::ObjectKey,
        capabilities: CAPABILITIES,
        limits: LIMITS,
        uri_base: format!("gs://{}", config.bucket),
        container: Some(Entry::bucket(config.bucket.clone())),
    };
    let config = config.clone();
    Ok(OperatorBackend::new(descriptor, move || {
        build_operator(&config, credentials.as_ref())
    }))
}
