//! ConfigStore: section/key JSON store on the local filesystem.
//!
//! Layout is `<root>/<section>/<key>` where the key file name is the
//! URL-safe base64 encoding of the key and the file content is the
//! JSON-encoded value. All mutations are serialized through one mutex and
//! written atomically.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::atomic::write_owner_only;
use crate::error::{StoreError, StoreResult};

/// Section holding the agent's own settings.
pub const SETTINGS_SECTION: &str = "settings";
pub const SERVER_KEY: &str = "server";
pub const PROFILE_KEY: &str = "profile";
pub const AGENT_KEY: &str = "agent";

/// Value of `settings/server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_secret: Option<String>,
}

#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "config store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn section_dir(&self, section: &str) -> StoreResult<PathBuf> {
        if section.is_empty() || section.contains('/') || section.starts_with('.') {
            return Err(StoreError::InvalidIdentifier(section.to_string()));
        }
        Ok(self.root.join(section))
    }

    fn key_path(&self, section: &str, key: &str) -> StoreResult<PathBuf> {
        Ok(self.section_dir(section)?.join(URL_SAFE.encode(key)))
    }

    fn read_value(path: &Path) -> StoreResult<Option<Value>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialize {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn write_value(&self, section: &str, key: &str, value: &Value) -> StoreResult<()> {
        let dir = self.section_dir(section)?;
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(URL_SAFE.encode(key));
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_owner_only(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        debug!(%section, %key, "config value stored");
        Ok(())
    }

    // ── Single values ──────────────────────────────────────────────

    /// Fetch a value; `NotFound` if the section or key is absent.
    pub fn get(&self, section: &str, key: &str) -> StoreResult<Value> {
        let path = self.key_path(section, key)?;
        Self::read_value(&path)?.ok_or_else(|| StoreError::NotFound {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    /// Fetch a value, `None` when absent.
    pub fn try_get(&self, section: &str, key: &str) -> StoreResult<Option<Value>> {
        match self.get(section, key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert a new key; fails with `KeyExists` if it is already present.
    pub fn set(&self, section: &str, key: &str, value: &Value) -> StoreResult<()> {
        let _guard = self.guard();
        if self.key_path(section, key)?.exists() {
            return Err(StoreError::KeyExists {
                section: section.to_string(),
                key: key.to_string(),
            });
        }
        self.write_value(section, key, value)
    }

    /// Insert or overwrite a key.
    pub fn update(&self, section: &str, key: &str, value: &Value) -> StoreResult<()> {
        let _guard = self.guard();
        self.write_value(section, key, value)
    }

    /// Remove a key. Removing an absent key is not an error.
    pub fn delete(&self, section: &str, key: &str) -> StoreResult<()> {
        let _guard = self.guard();
        let path = self.key_path(section, key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%section, %key, "config value deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    // ── Sections ───────────────────────────────────────────────────

    /// Remove a whole section and every key in it.
    pub fn delete_section(&self, section: &str) -> StoreResult<()> {
        let _guard = self.guard();
        let dir = self.section_dir(section)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Section names, sorted.
    pub fn sections(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Decoded key names of a section, sorted. Empty if the section is absent.
    pub fn section_keys(&self, section: &str) -> StoreResult<Vec<String>> {
        let dir = self.section_dir(section)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            match URL_SAFE
                .decode(&file_name)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
            {
                Some(key) => keys.push(key),
                None => warn!(%section, file = %file_name, "ignoring undecodable key file"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn get_section(&self, section: &str) -> StoreResult<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for key in self.section_keys(section)? {
            if let Some(value) = self.try_get(section, &key)? {
                values.insert(key, value);
            }
        }
        Ok(values)
    }

    pub fn get_all(&self) -> StoreResult<BTreeMap<String, BTreeMap<String, Value>>> {
        let mut all = BTreeMap::new();
        for section in self.sections()? {
            let values = self.get_section(&section)?;
            all.insert(section, values);
        }
        Ok(all)
    }

    /// Remove every section.
    pub fn clear(&self) -> StoreResult<()> {
        for section in self.sections()? {
            self.delete_section(&section)?;
        }
        Ok(())
    }

    // ── Agent settings ─────────────────────────────────────────────

    pub fn server_settings(&self) -> StoreResult<Option<ServerSettings>> {
        let Some(value) = self.try_get(SETTINGS_SECTION, SERVER_KEY)? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Deserialize {
                path: self.root.join(SETTINGS_SECTION),
                reason: e.to_string(),
            })
    }

    pub fn set_server_settings(&self, settings: &ServerSettings) -> StoreResult<()> {
        let value =
            serde_json::to_value(settings).map_err(|e| StoreError::Serialize(e.to_string()))?;
        self.update(SETTINGS_SECTION, SERVER_KEY, &value)
    }

    /// Manager URL; `ConfigMissing` if the agent was never registered.
    pub fn server_url(&self) -> StoreResult<String> {
        match self.server_settings()? {
            Some(settings) if !settings.url.is_empty() => Ok(settings.url),
            _ => Err(StoreError::ConfigMissing),
        }
    }

    /// Raw `settings/agent` object, if any.
    pub fn agent_settings(&self) -> StoreResult<Option<Value>> {
        self.try_get(SETTINGS_SECTION, AGENT_KEY)
    }

    pub fn profile(&self) -> StoreResult<Option<Value>> {
        self.try_get(SETTINGS_SECTION, PROFILE_KEY)
    }

    /// Whether the stored server profile marks this server as managed.
    pub fn profile_managed(&self) -> StoreResult<bool> {
        Ok(self
            .profile()?
            .and_then(|profile| profile.get("managed").and_then(Value::as_bool))
            .unwrap_or(false))
    }
}
