//! Connection profiles.
//!
//! A [`Profile`] names a provider kind, its configuration and where its
//! secret lives. The [`ProfileManager`] validates and selects the default
//! local profile; [`ProfileStore`] and [`CredentialProvider`] are the
//! persistence and secret collaborators.

mod credentials;
mod manager;
mod store;
mod types;

#[cfg(feature = "keyring")]
pub use credentials::KeyringCredentialProvider;
pub use credentials::{default_credential_provider, CredentialProvider, MemoryCredentialProvider};
pub use manager::{ProfileError, ProfileManager, ProfileResult};
pub use store::{JsonFileProfileStore, MemoryProfileStore, ProfileStore};
pub use types::{
    CredentialRef, Credentials, Profile, ProviderConfig, ValidationCode, ValidationError,
    CREDENTIAL_SERVICE, DEFAULT_LOCAL_ID,
};
