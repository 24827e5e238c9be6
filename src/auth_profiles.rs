//! Per-agent model-provider credentials (`<agentDir>/auth-profiles.json`).
//!
//! Profiles synced from external CLI tools live under reserved ids and are
//! reconciled on every load. Reconciliation never downgrades a refreshable
//! `oauth` profile, never replaces a fresher credential with an older one,
//! and never keeps two records of one credential.

pub mod external;

use crate::error::{AuthError, Result};
use crate::fs_util::{FileMode, write_atomic};
use crate::paths::Paths;

use external::{EXTERNAL_INTEGRATIONS, ExternalCredential, ExternalIntegration, ExternalRead};

use anyhow::Context as _;
use parking_lot::Mutex;
use serde::ser::SerializeStruct as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const AUTH_PROFILES_FILENAME: &str = "auth-profiles.json";
pub const AUTH_STORE_VERSION: u32 = 1;

/// One stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthProfile {
    /// Refreshable once it carries a refresh token.
    Oauth {
        provider: String,
        access: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
    /// Bearer token without refresh capability.
    Token {
        provider: String,
        #[serde(alias = "access")]
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
    },
    ApiKey {
        provider: String,
        key: String,
    },
}

impl AuthProfile {
    pub fn provider(&self) -> &str {
        match self {
            AuthProfile::Oauth { provider, .. }
            | AuthProfile::Token { provider, .. }
            | AuthProfile::ApiKey { provider, .. } => provider,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthProfile::Oauth { .. } => "oauth",
            AuthProfile::Token { .. } => "token",
            AuthProfile::ApiKey { .. } => "api_key",
        }
    }

    /// The secret sent to the provider.
    pub fn access(&self) -> &str {
        match self {
            AuthProfile::Oauth { access, .. } => access,
            AuthProfile::Token { token, .. } => token,
            AuthProfile::ApiKey { key, .. } => key,
        }
    }

    pub fn refresh(&self) -> Option<&str> {
        match self {
            AuthProfile::Oauth { refresh, .. } => refresh.as_deref(),
            _ => None,
        }
    }

    pub fn expires(&self) -> Option<i64> {
        match self {
            AuthProfile::Oauth { expires, .. } | AuthProfile::Token { expires, .. } => *expires,
            AuthProfile::ApiKey { .. } => None,
        }
    }

    fn from_external(provider: &str, credential: &ExternalCredential) -> Self {
        match &credential.refresh {
            Some(refresh) => AuthProfile::Oauth {
                provider: provider.to_string(),
                access: credential.access.clone(),
                refresh: Some(refresh.clone()),
                expires: credential.expires,
            },
            None => AuthProfile::Token {
                provider: provider.to_string(),
                token: credential.access.clone(),
                expires: credential.expires,
            },
        }
    }

    /// Same provider and the same access and refresh values.
    fn holds_same_secret(&self, provider: &str, access: &str, refresh: Option<&str>) -> bool {
        self.provider() == provider && self.access() == access && self.refresh() == refresh
    }
}

/// Persisted store for one agent.
///
/// Entries are parsed one by one. An entry this build cannot read stays in
/// `unrecognized` and is written back untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "StoredProfiles")]
pub struct AuthProfileStore {
    pub version: u32,
    pub profiles: BTreeMap<String, AuthProfile>,
    pub unrecognized: BTreeMap<String, Value>,
}

impl Default for AuthProfileStore {
    fn default() -> Self {
        Self {
            version: AUTH_STORE_VERSION,
            profiles: BTreeMap::new(),
            unrecognized: BTreeMap::new(),
        }
    }
}

/// On-disk shape before entries are interpreted.
#[derive(Deserialize)]
struct StoredProfiles {
    #[serde(default = "default_store_version")]
    version: u32,
    #[serde(default)]
    profiles: Map<String, Value>,
}

fn default_store_version() -> u32 {
    AUTH_STORE_VERSION
}

impl From<StoredProfiles> for AuthProfileStore {
    fn from(stored: StoredProfiles) -> Self {
        let mut store = AuthProfileStore {
            version: stored.version,
            ..AuthProfileStore::default()
        };
        for (id, value) in stored.profiles {
            match AuthProfile::deserialize(&value) {
                Ok(profile) => {
                    store.profiles.insert(id, profile);
                }
                Err(error) => {
                    tracing::warn!(%error, profile_id = %id, "keeping unreadable auth profile as-is");
                    store.unrecognized.insert(id, value);
                }
            }
        }
        store
    }
}

impl Serialize for AuthProfileStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(untagged)]
        enum Entry<'a> {
            Known(&'a AuthProfile),
            Unrecognized(&'a Value),
        }

        let mut profiles: BTreeMap<&str, Entry<'_>> = self
            .unrecognized
            .iter()
            .map(|(id, value)| (id.as_str(), Entry::Unrecognized(value)))
            .collect();
        for (id, profile) in &self.profiles {
            profiles.insert(id, Entry::Known(profile));
        }

        let mut state = serializer.serialize_struct("AuthProfileStore", 2)?;
        state.serialize_field("version", &self.version)?;
        state.serialize_field("profiles", &profiles)?;
        state.end()
    }
}

impl AuthProfileStore {
    pub fn for_provider<'a>(
        &'a self,
        provider: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a AuthProfile)> + 'a {
        self.profiles
            .iter()
            .filter(move |(_, profile)| profile.provider() == provider)
    }

    fn has_duplicate_of(
        &self,
        skip_id: &str,
        provider: &str,
        access: &str,
        refresh: Option<&str>,
    ) -> bool {
        self.profiles
            .iter()
            .any(|(id, profile)| id != skip_id && profile.holds_same_secret(provider, access, refresh))
    }
}

/// Path of the store inside an agent directory.
pub fn auth_profiles_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join(AUTH_PROFILES_FILENAME)
}

/// Expiry ordering. A credential without expiry is older than any
/// credential that has one.
fn compare_freshness(external: Option<i64>, stored: Option<i64>) -> Ordering {
    match (external, stored) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// What the reserved-id profile should become, or `None` to leave it.
fn next_reserved_profile(
    integration: &ExternalIntegration,
    existing: Option<&AuthProfile>,
    credential: &ExternalCredential,
) -> Option<AuthProfile> {
    let candidate = AuthProfile::from_external(integration.provider, credential);
    let Some(existing) = existing else {
        return Some(candidate);
    };
    if *existing == candidate {
        return None;
    }
    if existing.provider() != integration.provider {
        return Some(candidate);
    }

    let freshness = compare_freshness(credential.expires, existing.expires());
    match existing.refresh() {
        Some(stored_refresh) => {
            // A token-only credential never replaces a refreshable one.
            let external_refresh = credential.refresh.as_deref()?;
            match freshness {
                Ordering::Greater => Some(candidate),
                Ordering::Less => None,
                // Same expiry: a new refresh token means the tool re-authenticated.
                Ordering::Equal if external_refresh != stored_refresh => Some(candidate),
                Ordering::Equal if credential.expires.is_none() => Some(candidate),
                Ordering::Equal => None,
            }
        }
        None => {
            if credential.refresh.is_some() {
                return (freshness != Ordering::Less).then_some(candidate);
            }
            match freshness {
                Ordering::Greater => Some(candidate),
                Ordering::Equal if credential.expires.is_none() => Some(candidate),
                _ => None,
            }
        }
    }
}

/// Apply one integration to the store. Returns whether the store changed.
fn reconcile_integration(
    store: &mut AuthProfileStore,
    integration: &ExternalIntegration,
    credential: &ExternalCredential,
) -> bool {
    let id = integration.profile_id;
    let mut changed = false;

    let duplicate = store.has_duplicate_of(
        id,
        integration.provider,
        &credential.access,
        credential.refresh.as_deref(),
    );
    if duplicate {
        tracing::debug!(
            profile_id = id,
            "external credential already stored under another profile, not syncing"
        );
    } else if let Some(next) = next_reserved_profile(integration, store.profiles.get(id), credential) {
        tracing::info!(profile_id = id, kind = next.kind(), "synced credential from external CLI");
        store.profiles.insert(id.to_string(), next);
        changed = true;
    }

    let reserved_is_duplicate = store.profiles.get(id).is_some_and(|reserved| {
        store.has_duplicate_of(id, reserved.provider(), reserved.access(), reserved.refresh())
    });
    if reserved_is_duplicate {
        tracing::info!(profile_id = id, "removing synced profile that duplicates another profile");
        store.profiles.remove(id);
        changed = true;
    }

    changed
}

/// Reconcile every external integration into `store`.
pub fn reconcile_external_credentials(
    store: &mut AuthProfileStore,
    paths: &Paths,
    integrations: &[ExternalIntegration],
) -> bool {
    let mut changed = false;
    for integration in integrations {
        match integration.read(paths) {
            ExternalRead::Missing => {}
            ExternalRead::Malformed(error) => {
                tracing::warn!(
                    %error,
                    profile_id = integration.profile_id,
                    "skipping unreadable external credential file"
                );
            }
            ExternalRead::Found(credential) => {
                changed |= reconcile_integration(store, integration, &credential);
            }
        }
    }
    changed
}

/// A store as read from disk.
struct LoadedStore {
    store: AuthProfileStore,
    /// The file exists but could not be read as a store. It must be moved
    /// aside before anything is written in its place.
    corrupt: bool,
}

fn read_auth_profile_store(agent_dir: &Path) -> LoadedStore {
    let path = auth_profiles_path(agent_dir);
    let fallback = |corrupt| LoadedStore {
        store: AuthProfileStore::default(),
        corrupt,
    };
    let bytes = match crate::fs_util::read_optional(&path) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return fallback(false),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "failed to read auth profile store");
            return fallback(true);
        }
    };
    match serde_json::from_slice::<AuthProfileStore>(&bytes) {
        Ok(store) => LoadedStore {
            store,
            corrupt: false,
        },
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "auth profile store is corrupt, starting empty");
            fallback(true)
        }
    }
}

/// Load a store. Missing and corrupt files both yield an empty store.
pub fn load_auth_profile_store(agent_dir: &Path) -> AuthProfileStore {
    read_auth_profile_store(agent_dir).store
}

/// Rename an unreadable store to `auth-profiles.json.corrupt-<millis>`.
fn move_corrupt_store_aside(agent_dir: &Path) -> Result<PathBuf> {
    let path = auth_profiles_path(agent_dir);
    let aside = path.with_file_name(format!(
        "{AUTH_PROFILES_FILENAME}.corrupt-{}",
        chrono::Utc::now().timestamp_millis()
    ));
    std::fs::rename(&path, &aside).with_context(|| {
        format!("failed to move corrupt auth profile store {} aside", path.display())
    })?;
    tracing::warn!(path = %aside.display(), "moved corrupt auth profile store aside");
    Ok(aside)
}

fn persist(agent_dir: &Path, loaded: &LoadedStore) -> Result<()> {
    if loaded.corrupt {
        move_corrupt_store_aside(agent_dir)?;
    }
    save_auth_profile_store(agent_dir, &loaded.store)
}

fn save_auth_profile_store(agent_dir: &Path, store: &AuthProfileStore) -> Result<()> {
    let path = auth_profiles_path(agent_dir);
    let mut data =
        serde_json::to_vec_pretty(store).context("failed to serialize auth profile store")?;
    data.push(b'\n');
    write_atomic(&path, &data, FileMode::OwnerOnly)
        .map_err(|source| AuthError::WriteFailed { path, source })?;
    Ok(())
}

/// `<provider>:<name>` with both parts non-empty.
fn validate_profile_id(id: &str) -> Result<()> {
    match id.split_once(':') {
        Some((provider, name)) if !provider.trim().is_empty() && !name.trim().is_empty() => Ok(()),
        _ => Err(AuthError::InvalidProfileId(id.to_string()).into()),
    }
}

/// Credential store access, serialized per agent directory.
pub struct AuthProfiles {
    paths: Paths,
    integrations: &'static [ExternalIntegration],
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for AuthProfiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProfiles")
            .field("integrations", &self.integrations.len())
            .finish_non_exhaustive()
    }
}

impl AuthProfiles {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            integrations: EXTERNAL_INTEGRATIONS,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Keyed by the absolute path so `./a` and `a` share one lock. Locks
    /// nobody holds are dropped on the way.
    fn lock_for(&self, agent_dir: &Path) -> Arc<Mutex<()>> {
        let key = std::path::absolute(agent_dir).unwrap_or_else(|_| agent_dir.to_path_buf());
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key).or_default().clone()
    }

    /// Load the agent's store, fold in external CLI credentials, and persist
    /// the result when reconciliation changed anything.
    pub fn ensure_auth_profile_store(&self, agent_dir: &Path) -> Result<AuthProfileStore> {
        let lock = self.lock_for(agent_dir);
        let _guard = lock.lock();

        let mut loaded = read_auth_profile_store(agent_dir);
        if reconcile_external_credentials(&mut loaded.store, &self.paths, self.integrations) {
            persist(agent_dir, &loaded)?;
        }
        Ok(loaded.store)
    }

    /// Insert or replace a profile.
    pub fn upsert_auth_profile(
        &self,
        agent_dir: &Path,
        profile_id: &str,
        profile: AuthProfile,
    ) -> Result<()> {
        validate_profile_id(profile_id)?;
        let lock = self.lock_for(agent_dir);
        let _guard = lock.lock();

        let mut loaded = read_auth_profile_store(agent_dir);
        if loaded.store.profiles.get(profile_id) == Some(&profile) {
            return Ok(());
        }
        loaded.store.unrecognized.remove(profile_id);
        loaded.store.profiles.insert(profile_id.to_string(), profile);
        persist(agent_dir, &loaded)
    }

    pub fn remove_auth_profile(&self, agent_dir: &Path, profile_id: &str) -> Result<()> {
        let lock = self.lock_for(agent_dir);
        let _guard = lock.lock();

        let mut loaded = read_auth_profile_store(agent_dir);
        let removed = loaded.store.profiles.remove(profile_id).is_some()
            | loaded.store.unrecognized.remove(profile_id).is_some();
        if !removed {
            return Err(AuthError::NotFound {
                id: profile_id.to_string(),
            }
            .into());
        }
        persist(agent_dir, &loaded)
    }

    /// Reconciled profiles for one provider, ordered by id.
    pub fn profiles_for_provider(
        &self,
        agent_dir: &Path,
        provider: &str,
    ) -> Result<Vec<(String, AuthProfile)>> {
        let store = self.ensure_auth_profile_store(agent_dir)?;
        Ok(store
            .for_provider(provider)
            .map(|(id, profile)| (id.clone(), profile.clone()))
            .collect())
    }
}
