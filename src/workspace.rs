//! Workspace identity: ids, sharing keys, and the registry of known workspaces.

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{required_text, StoreError, StoreResult};
use crate::kv::{get_json, set_json, SharedKv};
use crate::models::{LinkState, Workspace};

pub const CURRENT_WORKSPACE_KEY: &str = "current-workspace";
pub const SAVED_WORKSPACES_KEY: &str = "saved-workspaces";
/// Slot used when no workspace is selected.
pub const DEFAULT_DB_KEY: &str = "trello-db";

const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_LEN: usize = 8;

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{8}$").expect("static regex"));

pub fn generate_workspace_key() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

pub fn generate_workspace_id() -> String {
    format!("ws_{}", uuid::Uuid::new_v4().simple())
}

/// Strict format check; callers normalize first when matching user input.
pub fn is_valid_workspace_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

pub fn workspace_db_key(workspace_id: &str) -> String {
    format!("{DEFAULT_DB_KEY}-{workspace_id}")
}

pub fn db_key_for(workspace_id: Option<&str>) -> String {
    workspace_id.map(workspace_db_key).unwrap_or_else(|| DEFAULT_DB_KEY.to_string())
}

/// Build a workspace value with a fresh id; `custom_key` is normalized and validated.
pub fn new_workspace(name: &str, custom_key: Option<&str>) -> StoreResult<Workspace> {
    let name = required_text(name, "workspace name")?;
    let key = match custom_key {
        Some(k) => {
            let k = normalize_key(k);
            if !is_valid_workspace_key(&k) {
                return Err(StoreError::validation("workspace key must be 8 letters or digits"));
            }
            k
        }
        None => generate_workspace_key(),
    };
    let now = Utc::now();
    Ok(Workspace {
        id: generate_workspace_id(),
        name,
        key,
        created_at: now,
        last_accessed: now,
        cloud_linked: false,
    })
}

/// Saved-workspace list and current pointer, kept in two process-wide slots.
#[derive(Clone)]
pub struct WorkspaceRegistry {
    kv: SharedKv,
}

impl WorkspaceRegistry {
    pub fn new(kv: SharedKv) -> Self { Self { kv } }

    pub fn kv(&self) -> &SharedKv { &self.kv }

    /// Unreadable bookkeeping degrades to "nothing saved".
    pub fn saved(&self) -> Vec<Workspace> {
        match get_json::<Vec<Workspace>>(self.kv.as_ref(), SAVED_WORKSPACES_KEY) {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "saved workspace list unreadable; treating as empty");
                Vec::new()
            }
        }
    }

    pub fn current(&self) -> Option<Workspace> {
        match get_json::<Workspace>(self.kv.as_ref(), CURRENT_WORKSPACE_KEY) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "current workspace pointer unreadable");
                None
            }
        }
    }

    /// Point at `workspace`, refreshing its `last_accessed`.
    pub fn set_current(&self, workspace: &Workspace) -> StoreResult<Workspace> {
        let mut updated = workspace.clone();
        updated.last_accessed = Utc::now();
        set_json(self.kv.as_ref(), CURRENT_WORKSPACE_KEY, &updated)?;
        Ok(updated)
    }

    pub fn clear_current(&self) -> StoreResult<()> {
        self.kv.remove(CURRENT_WORKSPACE_KEY)?;
        Ok(())
    }

    /// Insert or replace by id.
    pub fn save(&self, workspace: &Workspace) -> StoreResult<()> {
        let mut list = self.saved();
        match list.iter_mut().find(|w| w.id == workspace.id) {
            Some(existing) => *existing = workspace.clone(),
            None => list.push(workspace.clone()),
        }
        set_json(self.kv.as_ref(), SAVED_WORKSPACES_KEY, &list)?;
        debug!(workspace = %workspace.id, "workspace saved");
        Ok(())
    }

    pub fn get(&self, workspace_id: &str) -> Option<Workspace> {
        self.saved().into_iter().find(|w| w.id == workspace_id)
    }

    pub fn find_by_key(&self, key: &str) -> Option<Workspace> {
        self.saved().into_iter().find(|w| w.key.eq_ignore_ascii_case(key.trim()))
    }

    /// Drop the registry entry and its database slot. Returns the removed entry.
    pub fn remove(&self, workspace_id: &str) -> StoreResult<Option<Workspace>> {
        let mut list = self.saved();
        let removed = list.iter().position(|w| w.id == workspace_id).map(|i| list.remove(i));
        set_json(self.kv.as_ref(), SAVED_WORKSPACES_KEY, &list)?;
        self.kv.remove(&workspace_db_key(workspace_id))?;
        if self.current().map(|w| w.id == workspace_id).unwrap_or(false) {
            self.clear_current()?;
        }
        Ok(removed)
    }

    /// Set the cloud-linked flag; never cleared once set.
    pub fn mark_cloud_linked(&self, workspace_id: &str) -> StoreResult<()> {
        if let Some(mut ws) = self.get(workspace_id) {
            if !ws.cloud_linked {
                ws.cloud_linked = true;
                self.save(&ws)?;
            }
        }
        Ok(())
    }

    pub fn link_state(&self, workspace_id: &str) -> LinkState {
        match self.get(workspace_id) {
            None => LinkState::Uninitialized,
            Some(ws) if ws.cloud_linked => LinkState::CloudLinked,
            Some(_) => LinkState::LocalOnly,
        }
    }

    pub fn db_bytes(&self, workspace_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.kv.get(&workspace_db_key(workspace_id))?)
    }
}
