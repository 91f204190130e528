//! Local-authoritative workspace lifecycle with opportunistic cloud replication.

use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::kv::SharedKv;
use crate::mirror::{CloudMirror, CloudWorkspace, Replication, Subscription};
use crate::models::*;
use crate::repo::{BoardRepo, BoardStore, CardRepo, ListRepo, Removed};
use crate::reorder::{self, CardMove};
use crate::workspace::{is_valid_workspace_key, new_workspace, normalize_key, workspace_db_key, WorkspaceRegistry};

/// An open workspace: its board store plus the mirror every mutation is pushed to.
/// Reads are always local.
pub struct WorkspaceSession {
    workspace: Workspace,
    store: BoardStore,
    mirror: CloudMirror,
}

impl WorkspaceSession {
    pub fn new(workspace: Workspace, store: BoardStore, mirror: CloudMirror) -> Self {
        Self { workspace, store, mirror }
    }

    pub fn workspace(&self) -> &Workspace { &self.workspace }

    pub fn store(&self) -> &BoardStore { &self.store }

    fn replicate(&self, ops: Vec<Replication>) {
        self.mirror.replicate(&self.workspace.key, ops);
    }

    fn replicate_removed(&self, removed: &Removed) {
        let ops = removed
            .cards
            .iter()
            .map(|id| Replication::RemoveCard(*id))
            .chain(removed.lists.iter().map(|id| Replication::RemoveList(*id)))
            .chain(removed.boards.iter().map(|id| Replication::RemoveBoard(*id)))
            .collect();
        self.replicate(ops);
    }

    /// Move a card to `index` in `dest_list_id`, renumbering both lists densely.
    pub fn move_card(&self, card_id: Id, dest_list_id: Id, index: usize) -> StoreResult<CardMove> {
        reorder::move_card(self, card_id, dest_list_id, index)
    }

    pub fn move_list(&self, list_id: Id, index: usize) -> StoreResult<Vec<List>> {
        reorder::move_list(self, list_id, index)
    }

    pub fn on_boards_change<F>(&self, cb: F) -> Subscription
    where
        F: FnMut(Vec<Board>) + Send + 'static,
    {
        self.mirror.on_boards_change(&self.workspace.key, cb)
    }

    pub fn on_lists_change<F>(&self, board_id: Id, cb: F) -> Subscription
    where
        F: FnMut(Vec<List>) + Send + 'static,
    {
        self.mirror.on_lists_change(&self.workspace.key, board_id, cb)
    }

    pub fn on_cards_change<F>(&self, list_id: Id, cb: F) -> Subscription
    where
        F: FnMut(Vec<Card>) + Send + 'static,
    {
        self.mirror.on_cards_change(&self.workspace.key, list_id, cb)
    }
}

impl BoardRepo for WorkspaceSession {
    fn boards(&self) -> StoreResult<Vec<Board>> { self.store.boards() }
    fn get_board(&self, id: Id) -> StoreResult<Option<Board>> { self.store.get_board(id) }

    fn create_board(&self, name: &str) -> StoreResult<Board> {
        let board = self.store.create_board(name)?;
        self.replicate(vec![Replication::Board(board.clone())]);
        Ok(board)
    }

    fn update_board(&self, id: Id, name: &str) -> StoreResult<bool> {
        let changed = self.store.update_board(id, name)?;
        if let Some(board) = self.store.get_board(id)?.filter(|_| changed) {
            self.replicate(vec![Replication::Board(board)]);
        }
        Ok(changed)
    }

    fn delete_board(&self, id: Id) -> StoreResult<Removed> {
        let removed = self.store.delete_board(id)?;
        self.replicate_removed(&removed);
        Ok(removed)
    }
}

impl ListRepo for WorkspaceSession {
    fn lists_by_board(&self, board_id: Id) -> StoreResult<Vec<List>> { self.store.lists_by_board(board_id) }
    fn get_list(&self, id: Id) -> StoreResult<Option<List>> { self.store.get_list(id) }

    fn create_list(&self, new: NewList) -> StoreResult<List> {
        let list = self.store.create_list(new)?;
        self.replicate(vec![Replication::List(list.clone())]);
        Ok(list)
    }

    fn update_list(&self, id: Id, name: &str) -> StoreResult<bool> {
        let changed = self.store.update_list(id, name)?;
        if let Some(list) = self.store.get_list(id)?.filter(|_| changed) {
            self.replicate(vec![Replication::List(list)]);
        }
        Ok(changed)
    }

    fn update_list_position(&self, id: Id, position: i64) -> StoreResult<bool> {
        let changed = self.store.update_list_position(id, position)?;
        if let Some(list) = self.store.get_list(id)?.filter(|_| changed) {
            self.replicate(vec![Replication::List(list)]);
        }
        Ok(changed)
    }

    fn delete_list(&self, id: Id) -> StoreResult<Removed> {
        let removed = self.store.delete_list(id)?;
        self.replicate_removed(&removed);
        Ok(removed)
    }
}

impl CardRepo for WorkspaceSession {
    fn cards_by_list(&self, list_id: Id) -> StoreResult<Vec<Card>> { self.store.cards_by_list(list_id) }
    fn get_card(&self, id: Id) -> StoreResult<Option<Card>> { self.store.get_card(id) }

    fn create_card(&self, new: NewCard) -> StoreResult<Card> {
        let card = self.store.create_card(new)?;
        self.replicate(vec![Replication::Card(card.clone())]);
        Ok(card)
    }

    fn update_card(&self, id: Id, upd: UpdateCard) -> StoreResult<bool> {
        let changed = self.store.update_card(id, upd)?;
        if let Some(card) = self.store.get_card(id)?.filter(|_| changed) {
            self.replicate(vec![Replication::Card(card)]);
        }
        Ok(changed)
    }

    fn update_card_position(&self, id: Id, list_id: Id, position: i64) -> StoreResult<bool> {
        let changed = self.store.update_card_position(id, list_id, position)?;
        if let Some(card) = self.store.get_card(id)?.filter(|_| changed) {
            self.replicate(vec![Replication::Card(card)]);
        }
        Ok(changed)
    }

    fn delete_card(&self, id: Id) -> StoreResult<Removed> {
        let removed = self.store.delete_card(id)?;
        self.replicate_removed(&removed);
        Ok(removed)
    }
}

/// Workspace create/join/delete with local writes first and the cloud attempted after.
/// Cloud trouble only ever produces a warning.
pub struct HybridWorkspaces {
    registry: WorkspaceRegistry,
    mirror: CloudMirror,
    session: Option<WorkspaceSession>,
}

impl HybridWorkspaces {
    pub fn new(kv: SharedKv, mirror: CloudMirror) -> Self {
        Self { registry: WorkspaceRegistry::new(kv), mirror, session: None }
    }

    pub fn registry(&self) -> &WorkspaceRegistry { &self.registry }

    pub fn mirror(&self) -> &CloudMirror { &self.mirror }

    pub fn saved_workspaces(&self) -> Vec<Workspace> { self.registry.saved() }

    pub fn current_workspace(&self) -> Option<Workspace> { self.registry.current() }

    pub fn link_state(&self, workspace_id: &str) -> LinkState { self.registry.link_state(workspace_id) }

    pub async fn create_workspace(&self, name: &str, custom_key: Option<&str>) -> StoreResult<Workspace> {
        let mut ws = new_workspace(name, custom_key)?;
        if self.registry.find_by_key(&ws.key).is_some() {
            return Err(StoreError::validation(format!("workspace key {} is already in use", ws.key)));
        }
        self.registry.save(&ws)?;
        info!(workspace = %ws.id, key = %ws.key, "workspace created locally");

        if self.mirror.is_enabled() {
            match self.mirror.save_workspace(&CloudWorkspace::from_workspace(&ws, None)).await {
                Ok(()) => {
                    self.registry.mark_cloud_linked(&ws.id)?;
                    ws.cloud_linked = true;
                    info!(workspace = %ws.id, "workspace saved to cloud");
                }
                Err(e) => warn!(workspace = %ws.id, error = %e, "failed to save workspace to cloud; local only"),
            }
        }
        Ok(ws)
    }

    /// Cloud first, local fallback. A workspace found in the cloud is saved locally and,
    /// when this device has never seen it, its database slot is hydrated from the snapshot.
    pub async fn find_workspace_by_key(&self, key: &str) -> Option<Workspace> {
        let key = normalize_key(key);
        if !is_valid_workspace_key(&key) {
            return None;
        }
        if let Some(cloud) = self.mirror.find_by_key(&key).await {
            let local = self.registry.get(&cloud.id);
            let mut ws = cloud.workspace();
            if let Some(local) = local {
                ws.last_accessed = ws.last_accessed.max(local.last_accessed);
            }
            if let Err(e) = self.registry.save(&ws) {
                warn!(workspace = %ws.id, error = %e, "could not record joined workspace locally");
            }
            self.hydrate(&cloud);
            return Some(ws);
        }
        self.registry.find_by_key(&key)
    }

    fn hydrate(&self, cloud: &CloudWorkspace) {
        let slot = workspace_db_key(&cloud.id);
        match self.registry.kv().get(&slot) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Some(bytes) = cloud.snapshot() {
                    match self.registry.kv().set(&slot, &bytes) {
                        Ok(()) => info!(workspace = %cloud.id, size = bytes.len(), "hydrated workspace from cloud"),
                        Err(e) => warn!(workspace = %cloud.id, error = %e, "failed to restore database from cloud"),
                    }
                }
            }
            Err(e) => warn!(workspace = %cloud.id, error = %e, "could not inspect local slot"),
        }
    }

    pub async fn remove_workspace(&mut self, workspace_id: &str) -> StoreResult<()> {
        if self.session.as_ref().map(|s| s.workspace.id == workspace_id).unwrap_or(false) {
            self.session = None;
        }
        let removed = self.registry.remove(workspace_id)?;
        if let Some(ws) = removed.filter(|_| self.mirror.is_enabled()) {
            if let Err(e) = self.mirror.delete_workspace(&ws.key).await {
                warn!(workspace = %ws.id, error = %e, "failed to delete workspace from cloud");
            }
        }
        Ok(())
    }

    /// Upload the workspace document with a snapshot of its database slot.
    pub async fn sync_workspace_to_cloud(&self, workspace: &Workspace) -> bool {
        if !self.mirror.is_enabled() {
            return false;
        }
        let snapshot = self.registry.db_bytes(&workspace.id).unwrap_or_else(|e| {
            warn!(workspace = %workspace.id, error = %e, "failed to read database for sync");
            None
        });
        let doc = CloudWorkspace::from_workspace(workspace, snapshot.as_deref());
        match self.mirror.save_workspace(&doc).await {
            Ok(()) => {
                if let Err(e) = self.registry.mark_cloud_linked(&workspace.id) {
                    warn!(workspace = %workspace.id, error = %e, "could not record cloud link");
                }
                true
            }
            Err(e) => {
                warn!(workspace = %workspace.id, error = %e, "failed to sync workspace to cloud");
                false
            }
        }
    }

    pub async fn sync_all_workspaces(&self) -> usize {
        let mut synced = 0;
        for ws in self.registry.saved() {
            if self.sync_workspace_to_cloud(&ws).await {
                synced += 1;
            }
        }
        synced
    }

    pub async fn is_cloud_available(&self) -> bool {
        self.mirror.is_available().await
    }

    /// Tear down any open session and load `workspace`. An `Init` error leaves no
    /// session open; `reset_workspace` is the remedy.
    pub fn open_workspace(&mut self, workspace: &Workspace) -> StoreResult<&WorkspaceSession> {
        self.session = None;
        let store = BoardStore::open(self.registry.kv().clone(), Some(&workspace.id))?;
        self.activate(workspace, store)
    }

    /// Wipe the workspace's database and open it fresh.
    pub fn reset_workspace(&mut self, workspace: &Workspace) -> StoreResult<&WorkspaceSession> {
        self.session = None;
        let store = BoardStore::reset(self.registry.kv().clone(), Some(&workspace.id))?;
        self.activate(workspace, store)
    }

    fn activate(&mut self, workspace: &Workspace, store: BoardStore) -> StoreResult<&WorkspaceSession> {
        let known = self.registry.get(&workspace.id).unwrap_or_else(|| workspace.clone());
        let current = self.registry.set_current(&known)?;
        self.registry.save(&current)?;
        info!(workspace = %current.id, "workspace opened");
        let session = self.session.insert(WorkspaceSession::new(current, store, self.mirror.clone()));
        Ok(&*session)
    }

    pub fn session(&self) -> StoreResult<&WorkspaceSession> {
        self.session.as_ref().ok_or(StoreError::NotInitialized)
    }

    pub fn close_workspace(&mut self) {
        self.session = None;
    }
}
