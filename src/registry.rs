#![forbid(unsafe_code)]

// Identity and ban registry — preconfigured admin accounts and banned
// address/device fingerprints, consulted before a session exists.

use crate::persistence::Store;
use crate::room::permissions::Role;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::info;

/// Hash a password for storage in an admin record.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash. A malformed stored hash counts
/// as a failed verification rather than an error — admission fails closed.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// A banned network address and/or device fingerprint. Matching either field
/// is independently sufficient to refuse admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl BanEntry {
    fn matches(&self, address: &str, device_id: &str) -> bool {
        self.address.as_deref() == Some(address)
            || (!device_id.is_empty() && self.device_id.as_deref() == Some(device_id))
    }
}

/// A preconfigured admin account. Joining under this display name requires
/// the matching password.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRecord {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

struct RegistryState {
    admins: Vec<AdminRecord>,
    banned: Vec<BanEntry>,
}

/// Shared registry. The inner lock is a `std` lock held only for brief
/// lookups — ban checks run in the HTTP upgrade path, never across awaits.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<StdRwLock<RegistryState>>,
    store: Store,
}

impl Registry {
    /// Load admin accounts and the ban list from the store.
    pub fn load(store: Store) -> Self {
        let admins: Vec<AdminRecord> = store.load_or_default("admins");
        let banned: Vec<BanEntry> = store.load_or_default("banned");
        info!("Registry loaded: {} admin account(s), {} ban entrie(s)", admins.len(), banned.len());
        Self {
            inner: Arc::new(StdRwLock::new(RegistryState { admins, banned })),
            store,
        }
    }

    /// True if either the address or the device fingerprint matches any
    /// stored entry (OR semantics).
    pub fn is_banned(&self, address: &str, device_id: &str) -> bool {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.banned.iter().any(|b| b.matches(address, device_id))
    }

    /// Look up a preconfigured admin account by display name.
    pub fn find_admin(&self, name: &str) -> Option<AdminRecord> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.admins.iter().find(|a| a.username == name).cloned()
    }

    /// Record a ban and persist. Takes effect for future admissions only —
    /// pairing with a kick is the caller's job.
    pub fn add_ban(&self, entry: BanEntry) {
        let banned = {
            let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if !state.banned.contains(&entry) {
                state.banned.push(entry);
            }
            state.banned.clone()
        };
        self.store.save_detached("banned", &banned);
    }

    /// Remove every entry matching the given address or device fingerprint.
    /// Returns false if nothing matched.
    pub fn remove_ban(&self, address: Option<&str>, device_id: Option<&str>) -> bool {
        let (removed, banned) = {
            let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let before = state.banned.len();
            state.banned.retain(|b| {
                let addr_hit = address.is_some() && b.address.as_deref() == address;
                let dev_hit = device_id.is_some() && b.device_id.as_deref() == device_id;
                !(addr_hit || dev_hit)
            });
            (state.banned.len() != before, state.banned.clone())
        };
        if removed {
            self.store.save_detached("banned", &banned);
        }
        removed
    }

    pub fn banned_snapshot(&self) -> Vec<BanEntry> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.banned.clone()
    }

    /// Synchronous persist of the ban list, for shutdown.
    pub fn flush(&self) -> anyhow::Result<()> {
        let banned = self.banned_snapshot();
        self.store.save("banned", &banned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_registry() -> Registry {
        let dir = std::env::temp_dir().join(format!("openmic-test-{}", uuid::Uuid::new_v4()));
        Registry::load(Store::with_dir(dir))
    }

    fn ban(address: Option<&str>, device_id: Option<&str>) -> BanEntry {
        BanEntry {
            address: address.map(String::from),
            device_id: device_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_either_field_is_sufficient() {
        let registry = scratch_registry();
        registry.add_ban(ban(Some("10.0.0.9"), Some("device-1")));

        // Same address, fresh device fingerprint
        assert!(registry.is_banned("10.0.0.9", "fresh-device"));
        // Fresh address, same device fingerprint
        assert!(registry.is_banned("192.168.1.4", "device-1"));
        // Neither matches
        assert!(!registry.is_banned("192.168.1.4", "fresh-device"));
    }

    #[tokio::test]
    async fn test_address_only_entry_ignores_device() {
        let registry = scratch_registry();
        registry.add_ban(ban(Some("10.0.0.9"), None));

        assert!(registry.is_banned("10.0.0.9", "anything"));
        assert!(!registry.is_banned("10.0.0.1", "anything"));
    }

    #[tokio::test]
    async fn test_empty_device_id_never_matches() {
        let registry = scratch_registry();
        registry.add_ban(ban(None, Some("device-1")));

        // Clients that send no fingerprint must not match device bans
        assert!(!registry.is_banned("10.0.0.9", ""));
    }

    #[tokio::test]
    async fn test_unban_by_either_field() {
        let registry = scratch_registry();
        registry.add_ban(ban(Some("10.0.0.9"), Some("device-1")));

        assert!(registry.remove_ban(None, Some("device-1")));
        assert!(!registry.is_banned("10.0.0.9", "device-1"));
        assert!(!registry.remove_ban(Some("10.0.0.9"), None));
    }

    #[tokio::test]
    async fn test_duplicate_bans_collapse() {
        let registry = scratch_registry();
        registry.add_ban(ban(Some("10.0.0.9"), None));
        registry.add_ban(ban(Some("10.0.0.9"), None));
        assert_eq!(registry.banned_snapshot().len(), 1);
    }

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("correct-horse-battery-staple").unwrap();
        assert!(verify_password("correct-horse-battery-staple", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn test_malformed_hash_fails_closed() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
