use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;

use super::CredentialStorage;

/// Session fields in the OS keychain, one entry per field.
pub struct KeyringStorage {
    service: String,
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeyringStorage {
    /// Keychain service name, one per API host.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the entry for `key`, creating it on first use.
    fn with_entry<T>(&self, key: &str, f: impl FnOnce(&Entry) -> Result<T>) -> Result<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = match entries.entry(key.to_string()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => slot.insert(
                Entry::new(&self.service, key).context("Failed to create keyring entry")?,
            ),
        };
        f(entry)
    }
}

impl CredentialStorage for KeyringStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve value from keychain"),
        })
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.with_entry(key, |entry| {
            entry
                .set_password(value)
                .context("Failed to store value in keychain")
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_remove_through_mock_keychain() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let storage = KeyringStorage::with_service("sensordash:test-host");

        assert_eq!(storage.load("accessToken").unwrap(), None);

        storage.store("accessToken", "tok-1").unwrap();
        storage.store("refreshToken", "ref-1").unwrap();
        assert_eq!(storage.load("accessToken").unwrap().as_deref(), Some("tok-1"));
        assert_eq!(storage.load("refreshToken").unwrap().as_deref(), Some("ref-1"));

        storage.store("accessToken", "tok-2").unwrap();
        assert_eq!(storage.load("accessToken").unwrap().as_deref(), Some("tok-2"));

        storage.remove("accessToken").unwrap();
        assert_eq!(storage.load("accessToken").unwrap(), None);
        // Removing a missing entry is not an error.
        storage.remove("accessToken").unwrap();
        assert_eq!(storage.load("refreshToken").unwrap().as_deref(), Some("ref-1"));
    }
}
