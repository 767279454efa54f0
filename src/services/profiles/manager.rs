//! Profile manager.
//!
//! Owns validation and default-local selection. Persistence goes through a
//! [`ProfileStore`], secrets through a [`CredentialProvider`].

use async_lock::RwLock;
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use super::credentials::CredentialProvider;
use super::store::ProfileStore;
use super::types::{
    CredentialRef, Credentials, Profile, ValidationCode, ValidationError, DEFAULT_LOCAL_ID,
};
use crate::services::storage::{
    OperationError, OperationStatus, ProviderFactory, ProviderInit, ProviderRegistry,
};
use crate::settings::EngineSettings;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Invalid profile: {0}")]
    Validation(#[from] ValidationError),

    #[error("Profile '{0}' not found")]
    NotFound(String),

    #[error("Profile store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("Credential error: {0:#}")]
    Credential(#[source] anyhow::Error),
}

impl From<ProfileError> for OperationError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::Validation(v) => v.into(),
            ProfileError::NotFound(id) => OperationError::new(
                OperationStatus::NotFound,
                "profile_not_found",
                format!("Profile '{}' not found", id),
            ),
            ProfileError::Store(cause) => OperationError::error(format!("Profile store error: {:#}", cause))
                .with_code("profile_store")
                .with_cause(cause),
            ProfileError::Credential(cause) => OperationError::error(format!("Credential error: {:#}", cause))
                .with_code("credential_store")
                .with_cause(cause),
        }
    }
}

pub type ProfileResult<T> = Result<T, ProfileError>;

/// CRUD over the profile set.
///
/// Exactly one profile is the default local profile. It is created on
/// first load when the store has none and can never be deleted.
///
/// Registries passed to [`ProfileManager::provider_for`] are remembered;
/// updating or deleting a profile, or changing its credentials, evicts its
/// provider from each of them.
pub struct ProfileManager {
    store: Box<dyn ProfileStore>,
    credentials: Arc<dyn CredentialProvider>,
    settings: EngineSettings,
    local_root: PathBuf,
    profiles: RwLock<Vec<Profile>>,
    registries: Mutex<Vec<Weak<ProviderRegistry>>>,
}

impl ProfileManager {
    pub fn new(
        store: Box<dyn ProfileStore>,
        credentials: Arc<dyn CredentialProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            credentials,
            settings,
            local_root: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            profiles: RwLock::new(Vec::new()),
            registries: Mutex::new(Vec::new()),
        }
    }

    /// Root used when the default local profile has to be created.
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = root.into();
        self
    }

    /// Load profiles from the store.
    ///
    /// Invalid and duplicate profiles are skipped with a warning. A missing
    /// default local profile is created and saved.
    pub async fn load(&self) -> ProfileResult<()> {
        let stored = self.store.load().await.map_err(ProfileError::Store)?;

        let mut profiles: Vec<Profile> = Vec::with_capacity(stored.len() + 1);
        let mut changed = false;
        for mut profile in stored {
            if let Err(e) = profile.validate() {
                warn!("Skipping invalid profile '{}': {}", profile.id, e);
                changed = true;
                continue;
            }
            if profiles.iter().any(|p| p.id == profile.id) {
                warn!("Skipping duplicate profile id '{}'", profile.id);
                changed = true;
                continue;
            }
            if profile.default_local && profiles.iter().any(|p| p.default_local) {
                warn!("Profile '{}' is not the first default local profile; unmarking", profile.id);
                profile.default_local = false;
                changed = true;
            }
            profiles.push(profile);
        }

        if !profiles.iter().any(|p| p.default_local) {
            let mut local = Profile::default_local(self.local_root.clone());
            if profiles.iter().any(|p| p.id == local.id) {
                local.id = format!("{}-{}", DEFAULT_LOCAL_ID, uuid::Uuid::new_v4());
            }
            info!("Creating default local profile at {}", self.local_root.display());
            profiles.insert(0, local);
            changed = true;
        }

        if changed {
            self.store.save(&profiles).await.map_err(ProfileError::Store)?;
        }
        debug!("Loaded {} profiles", profiles.len());
        *self.profiles.write().await = profiles;
        Ok(())
    }

    /// All profiles, the default local profile first.
    pub async fn list(&self) -> Vec<Profile> {
        let mut profiles = self.profiles.read().await.clone();
        profiles.sort_by_key(|p| !p.default_local);
        profiles
    }

    pub async fn get(&self, id: &str) -> ProfileResult<Profile> {
        self.profiles
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    pub async fn default_local(&self) -> ProfileResult<Profile> {
        self.profiles
            .read()
            .await
            .iter()
            .find(|p| p.default_local)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(DEFAULT_LOCAL_ID.to_string()))
    }

    fn check_name(profiles: &[Profile], profile: &Profile) -> Result<(), ValidationError> {
        if profiles
            .iter()
            .any(|p| p.id != profile.id && p.name.eq_ignore_ascii_case(&profile.name))
        {
            return Err(ValidationError::new(
                ValidationCode::DuplicateName,
                "name",
                format!("a profile named '{}' already exists", profile.name),
            ));
        }
        Ok(())
    }

    fn remember(&self, registry: &Arc<ProviderRegistry>) {
        let mut registries = self.registries.lock().unwrap_or_else(|p| p.into_inner());
        registries.retain(|r| r.strong_count() > 0);
        if !registries.iter().any(|r| r.as_ptr() == Arc::as_ptr(registry)) {
            registries.push(Arc::downgrade(registry));
        }
    }

    /// Drop the provider built for `id` from every remembered registry.
    async fn invalidate(&self, id: &str) {
        let live: Vec<Arc<ProviderRegistry>> = self
            .registries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for registry in live {
            if registry.evict(id).await {
                debug!("Evicted provider for profile '{}'", id);
            }
        }
    }

    /// Persist `next`, keeping the in-memory set unchanged if the store fails.
    async fn commit(&self, profiles: &mut Vec<Profile>, next: Vec<Profile>) -> ProfileResult<()> {
        self.store.save(&next).await.map_err(ProfileError::Store)?;
        *profiles = next;
        Ok(())
    }

    pub async fn create(&self, profile: Profile) -> ProfileResult<Profile> {
        profile.validate().inspect_err(|e| warn!("Rejected profile: {}", e))?;

        let mut profiles = self.profiles.write().await;
        if profiles.iter().any(|p| p.id == profile.id) {
            return Err(ValidationError::new(
                ValidationCode::DuplicateId,
                "id",
                format!("a profile with id '{}' already exists", profile.id),
            )
            .into());
        }
        if profile.default_local {
            return Err(ValidationError::new(
                ValidationCode::DefaultLocalProtected,
                "defaultLocal",
                "a default local profile already exists",
            )
            .into());
        }
        Self::check_name(&profiles, &profile)?;

        let mut next = profiles.clone();
        next.push(profile.clone());
        self.commit(&mut profiles, next).await?;
        info!("Created profile '{}' ({})", profile.name, profile.provider.as_str());
        Ok(profile)
    }

    /// Replace an existing profile. The default local flag cannot move. A
    /// profile without a credential reference keeps the stored one.
    pub async fn update(&self, mut profile: Profile) -> ProfileResult<Profile> {
        profile.validate().inspect_err(|e| warn!("Rejected profile: {}", e))?;

        let mut profiles = self.profiles.write().await;
        let index = profiles
            .iter()
            .position(|p| p.id == profile.id)
            .ok_or_else(|| ProfileError::NotFound(profile.id.clone()))?;
        if profiles[index].default_local != profile.default_local {
            return Err(ValidationError::new(
                ValidationCode::DefaultLocalProtected,
                "defaultLocal",
                "the default local profile cannot be changed",
            )
            .into());
        }
        Self::check_name(&profiles, &profile)?;
        if profile.credential.is_none() {
            profile.credential = profiles[index].credential.clone();
        }

        let mut next = profiles.clone();
        next[index] = profile.clone();
        self.commit(&mut profiles, next).await?;
        drop(profiles);

        self.invalidate(&profile.id).await;
        info!("Updated profile '{}'", profile.name);
        Ok(profile)
    }

    /// Delete a profile and its stored secret.
    pub async fn delete(&self, id: &str) -> ProfileResult<()> {
        let mut profiles = self.profiles.write().await;
        let index = profiles
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        if profiles[index].default_local {
            return Err(ValidationError::new(
                ValidationCode::DefaultLocalProtected,
                "id",
                "the default local profile cannot be deleted",
            )
            .into());
        }

        let mut next = profiles.clone();
        let removed = next.remove(index);
        self.commit(&mut profiles, next).await?;
        drop(profiles);

        self.invalidate(id).await;
        if let Some(reference) = removed.credential.as_ref() {
            if let Err(e) = self.credentials.delete(reference).await {
                warn!("Failed to delete secret for profile '{}': {:#}", id, e);
            }
        }
        info!("Deleted profile '{}'", removed.name);
        Ok(())
    }

    /// Store `credentials` for a profile, attaching a credential reference
    /// when it has none.
    pub async fn set_credential(&self, id: &str, credentials: &Credentials) -> ProfileResult<()> {
        let mut profiles = self.profiles.write().await;
        let index = profiles
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        let attached = profiles[index].credential.clone();
        let reference = attached
            .clone()
            .unwrap_or_else(|| CredentialRef::for_profile(id));
        self.credentials
            .set(&reference, credentials)
            .await
            .map_err(ProfileError::Credential)?;
        debug!("Stored {} credentials for profile '{}'", credentials.kind_name(), id);

        if attached.is_none() {
            let mut next = profiles.clone();
            next[index].credential = Some(reference);
            self.commit(&mut profiles, next).await?;
        }
        drop(profiles);

        self.invalidate(id).await;
        Ok(())
    }

    /// Resolve the stored credentials for a profile.
    pub async fn credentials_for(&self, id: &str) -> ProfileResult<Option<Credentials>> {
        let profile = self.get(id).await?;
        match profile.credential {
            Some(reference) => self
                .credentials
                .get(&reference)
                .await
                .map_err(ProfileError::Credential),
            None => Ok(None),
        }
    }

    /// Register a lazy factory for the profile under its id, replacing any
    /// provider already built for it. Credentials are resolved when the
    /// provider is first requested.
    pub async fn provider_for(&self, id: &str, registry: &Arc<ProviderRegistry>) -> ProfileResult<String> {
        let profile = self.get(id).await?;
        self.remember(registry);
        registry.evict(&profile.id).await;
        let credentials = self.credentials.clone();
        let settings = self.settings.clone();
        let name = profile.id.clone();

        let init: ProviderInit = Arc::new(move || {
            let profile = profile.clone();
            let credentials = credentials.clone();
            let settings = settings.clone();
            async move {
                let secret = match profile.credential.as_ref() {
                    Some(reference) => credentials
                        .get(reference)
                        .await
                        .map_err(|e| OperationError::from(ProfileError::Credential(e)))?,
                    None => None,
                };
                ProviderFactory::create(&profile.name, &profile.config, secret, &settings)
            }
            .boxed()
        });
        registry.register_factory(name.clone(), init).await;
        Ok(name)
    }
}
