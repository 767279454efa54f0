//! Provider abstraction over structurally different storage backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ProviderRegistry                         │
//! │  - Eager instances, lazy factories (one init per name)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StorageProvider                          │
//! │  - Capability guard, path normalization, retry              │
//! │  - Delegates multi-step work to the transfer engine         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    dyn StorageBackend                       │
//! │  S3 │ GCS │ SFTP │ FTP │ SMB │ Local                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers branch on [`CapabilitySet`] membership, never on the backend
//! type. Every operation ends in an [`OperationResult`].

pub mod backends;
mod capability;
mod factory;
mod ids;
pub mod pagination;
pub mod path;
mod provider;
mod registry;
mod result;
mod traits;
mod types;

pub use capability::{Capability, CapabilitySet};
pub use factory::ProviderFactory;
pub use ids::EntryIdTracker;
pub use path::PathStyle;
pub use provider::StorageProvider;
pub use registry::{ProviderInit, ProviderRegistry};
pub use result::{OperationError, OperationResult, OperationResultExt, OperationStatus};
pub use traits::{BoxedStorageBackend, CompletedPart, StorageBackend, TransferLimits};
pub use types::*;
