use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CloudConfig;
use crate::models::{Board, Card, Id, List, Workspace};
use crate::workspace::normalize_key;

pub const WORKSPACES: &str = "workspaces";
pub const BOARDS: &str = "boards";
pub const LISTS: &str = "lists";
pub const CARDS: &str = "cards";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("cloud sync not configured")]
    NotConfigured,
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("decode: {0}")]
    Decode(String),
}

/// Remote document collections. Last writer wins; no concurrency tokens.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, doc: &Value) -> Result<(), MirrorError>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, MirrorError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), MirrorError>;
    /// Documents whose fields equal every `(field, value)` filter.
    async fn query(&self, collection: &str, filters: &[(&str, String)]) -> Result<Vec<Value>, MirrorError>;
}

// ---------------- HTTP implementation ----------------
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

impl HttpDocumentStore {
    pub fn new(cfg: &CloudConfig) -> Self {
        let base = format!(
            "{}/v1/projects/{}/collections",
            cfg.endpoint.trim_end_matches('/'),
            cfg.project_id
        );
        info!("cloud document store at {base}");
        Self { client: reqwest::Client::new(), base, api_key: cfg.api_key.clone() }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{collection}/documents", self.base)
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{id}", self.collection_url(collection))
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: &Value) -> Result<(), MirrorError> {
        let resp = self.auth(self.client.put(self.doc_url(collection, id))).json(doc).send().await?;
        if !resp.status().is_success() {
            return Err(MirrorError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, MirrorError> {
        let resp = self.auth(self.client.get(self.doc_url(collection, id))).send().await?;
        match resp.status() {
            s if s == reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json::<Value>().await?)),
            s => Err(MirrorError::Status(s.as_u16())),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), MirrorError> {
        let resp = self.auth(self.client.delete(self.doc_url(collection, id))).send().await?;
        let status = resp.status();
        // already gone counts as deleted
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(MirrorError::Status(status.as_u16()))
        }
    }

    async fn query(&self, collection: &str, filters: &[(&str, String)]) -> Result<Vec<Value>, MirrorError> {
        let resp = self
            .auth(self.client.get(self.collection_url(collection)))
            .query(filters)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(MirrorError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<Vec<Value>>().await?)
    }
}

// ---------------- In-memory implementation ----------------
/// Process-local document store. `set_offline(true)` makes every call fail.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<DashMap<(String, String), Value>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self { Self::default() }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn count(&self, collection: &str) -> usize {
        self.docs.iter().filter(|e| e.key().0 == collection).count()
    }

    fn check(&self) -> Result<(), MirrorError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(MirrorError::Status(503))
        } else {
            Ok(())
        }
    }
}

fn field_matches(doc: &Value, field: &str, expected: &str) -> bool {
    match doc.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: &Value) -> Result<(), MirrorError> {
        self.check()?;
        self.docs.insert((collection.to_string(), id.to_string()), doc.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, MirrorError> {
        self.check()?;
        Ok(self.docs.get(&(collection.to_string(), id.to_string())).map(|d| d.value().clone()))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), MirrorError> {
        self.check()?;
        self.docs.remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }

    async fn query(&self, collection: &str, filters: &[(&str, String)]) -> Result<Vec<Value>, MirrorError> {
        self.check()?;
        Ok(self
            .docs
            .iter()
            .filter(|e| e.key().0 == collection)
            .filter(|e| filters.iter().all(|(f, v)| field_matches(e.value(), f, v)))
            .map(|e| e.value().clone())
            .collect())
    }
}

// ---------------- Documents ----------------
/// Workspace document; `data` carries a base64 image of the workspace's database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudWorkspace {
    pub id: String,
    pub name: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub data: String,
}

impl CloudWorkspace {
    pub fn from_workspace(ws: &Workspace, snapshot: Option<&[u8]>) -> Self {
        Self {
            id: ws.id.clone(),
            name: ws.name.clone(),
            key: ws.key.clone(),
            created_at: ws.created_at,
            last_accessed: ws.last_accessed,
            data: snapshot.map(|b| STANDARD.encode(b)).unwrap_or_default(),
        }
    }

    pub fn workspace(&self) -> Workspace {
        Workspace {
            id: self.id.clone(),
            name: self.name.clone(),
            key: self.key.clone(),
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            cloud_linked: true,
        }
    }

    /// Decoded database image, if the document carries a usable one.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        if self.data.is_empty() {
            return None;
        }
        match STANDARD.decode(&self.data) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("workspace {} carries an undecodable snapshot: {e}", self.key);
                None
            }
        }
    }
}

pub fn entity_doc_id(workspace_key: &str, id: Id) -> String {
    format!("{workspace_key}_{id}")
}

/// Entity payload tagged with its workspace key.
pub fn tagged_doc<T: Serialize>(workspace_key: &str, entity: &T) -> Result<Value, MirrorError> {
    let mut doc = serde_json::to_value(entity).map_err(|e| MirrorError::Decode(e.to_string()))?;
    match doc.as_object_mut() {
        Some(map) => {
            map.insert("workspace_key".into(), Value::String(workspace_key.to_string()));
            Ok(doc)
        }
        None => Err(MirrorError::Decode("entity did not serialize to an object".into())),
    }
}

/// One replicated mutation.
#[derive(Debug, Clone)]
pub enum Replication {
    Board(Board),
    List(List),
    Card(Card),
    RemoveBoard(Id),
    RemoveList(Id),
    RemoveCard(Id),
}

impl Replication {
    fn collection(&self) -> &'static str {
        match self {
            Replication::Board(_) | Replication::RemoveBoard(_) => BOARDS,
            Replication::List(_) | Replication::RemoveList(_) => LISTS,
            Replication::Card(_) | Replication::RemoveCard(_) => CARDS,
        }
    }
}

/// Stops its polling task when unsubscribed or dropped.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn inert() -> Self { Self { task: None } }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Run `fut` on the ambient tokio runtime without awaiting it.
/// Returns false (and drops the future) when no runtime is present.
pub fn spawn_detached<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => {
            warn!("no async runtime; cloud push skipped");
            false
        }
    }
}

async fn fetch<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    filters: &[(&str, String)],
) -> Result<Vec<T>, MirrorError> {
    store
        .query(collection, filters)
        .await?
        .into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(|e| MirrorError::Decode(e.to_string())))
        .collect()
}

fn sort_boards(v: &mut [Board]) {
    v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}
fn sort_lists(v: &mut [List]) {
    v.sort_by_key(|l| (l.position, l.id));
}
fn sort_cards(v: &mut [Card]) {
    v.sort_by_key(|c| (c.position, c.id));
}

async fn put_entity<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    workspace_key: &str,
    id: Id,
    entity: &T,
) -> Result<(), MirrorError> {
    let doc = tagged_doc(workspace_key, entity)?;
    store.put(collection, &entity_doc_id(workspace_key, id), &doc).await
}

async fn apply_op(store: &dyn DocumentStore, workspace_key: &str, op: &Replication) -> bool {
    let collection = op.collection();
    let result = match op {
        Replication::Board(b) => put_entity(store, collection, workspace_key, b.id, b).await,
        Replication::List(l) => put_entity(store, collection, workspace_key, l.id, l).await,
        Replication::Card(c) => put_entity(store, collection, workspace_key, c.id, c).await,
        Replication::RemoveBoard(id) | Replication::RemoveList(id) | Replication::RemoveCard(id) => {
            store.delete(collection, &entity_doc_id(workspace_key, *id)).await
        }
    };
    match result {
        Ok(()) => {
            metrics::increment_counter!("taskboard_cloud_push_total", "collection" => collection, "outcome" => "ok");
            true
        }
        Err(e) => {
            metrics::increment_counter!("taskboard_cloud_push_total", "collection" => collection, "outcome" => "failed");
            warn!("cloud push to {collection} failed for workspace {workspace_key}: {e}");
            false
        }
    }
}

/// Best-effort replica of local board data. Failures are logged and counted,
/// never returned from the push paths.
#[derive(Clone)]
pub struct CloudMirror {
    store: Option<Arc<dyn DocumentStore>>,
    poll_interval: Duration,
    /// Sender side of the push queue; the draining worker starts on first use.
    outbox: Arc<Mutex<Option<UnboundedSender<Push>>>>,
}

/// A queued mutation for one workspace.
struct Push {
    workspace_key: String,
    op: Replication,
}

impl CloudMirror {
    pub fn new(store: Arc<dyn DocumentStore>, poll_interval: Duration) -> Self {
        Self { store: Some(store), poll_interval, outbox: Arc::default() }
    }

    pub fn disabled() -> Self {
        Self { store: None, poll_interval: Duration::from_secs(5), outbox: Arc::default() }
    }

    pub fn from_config(cfg: Option<&CloudConfig>) -> Self {
        match cfg {
            Some(cfg) => Self::new(Arc::new(HttpDocumentStore::new(cfg)), cfg.poll_interval),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool { self.store.is_some() }

    fn store(&self) -> Result<&Arc<dyn DocumentStore>, MirrorError> {
        self.store.as_ref().ok_or(MirrorError::NotConfigured)
    }

    /// Apply one mutation remotely. Returns whether it landed.
    pub async fn apply(&self, workspace_key: &str, op: &Replication) -> bool {
        match self.store.as_ref() {
            Some(store) => apply_op(store.as_ref(), workspace_key, op).await,
            None => false,
        }
    }

    /// Fire-and-forget: queue `ops` behind every earlier replication from this mirror.
    /// A single worker applies the queue in order.
    pub fn replicate(&self, workspace_key: &str, ops: Vec<Replication>) {
        if !self.is_enabled() || ops.is_empty() {
            return;
        }
        let mut outbox = self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // a closed sender means the worker's runtime is gone
        if outbox.as_ref().map(|tx| tx.is_closed()).unwrap_or(true) {
            *outbox = self.start_worker();
        }
        let Some(tx) = outbox.clone() else { return };
        for op in ops {
            if tx.send(Push { workspace_key: workspace_key.to_string(), op }).is_err() {
                warn!("cloud push queue closed; dropping replication");
                *outbox = None;
                return;
            }
        }
    }

    fn start_worker(&self) -> Option<UnboundedSender<Push>> {
        let store = self.store.clone()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Push>();
        let started = spawn_detached(async move {
            while let Some(push) = rx.recv().await {
                apply_op(store.as_ref(), &push.workspace_key, &push.op).await;
            }
        });
        started.then_some(tx)
    }

    pub async fn push_board(&self, workspace_key: &str, board: &Board) -> bool {
        self.apply(workspace_key, &Replication::Board(board.clone())).await
    }

    pub async fn push_list(&self, workspace_key: &str, list: &List) -> bool {
        self.apply(workspace_key, &Replication::List(list.clone())).await
    }

    pub async fn push_card(&self, workspace_key: &str, card: &Card) -> bool {
        self.apply(workspace_key, &Replication::Card(card.clone())).await
    }

    pub async fn remove_board(&self, workspace_key: &str, id: Id) -> bool {
        self.apply(workspace_key, &Replication::RemoveBoard(id)).await
    }

    pub async fn remove_list(&self, workspace_key: &str, id: Id) -> bool {
        self.apply(workspace_key, &Replication::RemoveList(id)).await
    }

    pub async fn remove_card(&self, workspace_key: &str, id: Id) -> bool {
        self.apply(workspace_key, &Replication::RemoveCard(id)).await
    }

    pub async fn save_workspace(&self, ws: &CloudWorkspace) -> Result<(), MirrorError> {
        let doc = serde_json::to_value(ws).map_err(|e| MirrorError::Decode(e.to_string()))?;
        self.store()?.put(WORKSPACES, &ws.key, &doc).await
    }

    /// `None` when not found, not configured, or unreachable.
    pub async fn find_by_key(&self, key: &str) -> Option<CloudWorkspace> {
        let store = self.store.as_ref()?;
        let key = normalize_key(key);
        match store.get(WORKSPACES, &key).await {
            Ok(Some(doc)) => match serde_json::from_value(doc) {
                Ok(ws) => Some(ws),
                Err(e) => {
                    warn!("workspace document {key} is malformed: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("workspace lookup for {key} failed: {e}");
                None
            }
        }
    }

    pub async fn delete_workspace(&self, key: &str) -> Result<(), MirrorError> {
        self.store()?.delete(WORKSPACES, key).await
    }

    pub async fn is_available(&self) -> bool {
        match self.store.as_ref() {
            Some(store) => match store.get("test", "connectivity").await {
                Ok(_) => true,
                Err(e) => {
                    warn!("cloud not available: {e}");
                    false
                }
            },
            None => false,
        }
    }

    pub async fn fetch_boards(&self, workspace_key: &str) -> Result<Vec<Board>, MirrorError> {
        let mut v: Vec<Board> = fetch(self.store()?.as_ref(), BOARDS, &[("workspace_key", workspace_key.to_string())]).await?;
        sort_boards(&mut v);
        Ok(v)
    }

    pub async fn fetch_lists(&self, workspace_key: &str, board_id: Id) -> Result<Vec<List>, MirrorError> {
        let filters = [("workspace_key", workspace_key.to_string()), ("board_id", board_id.to_string())];
        let mut v: Vec<List> = fetch(self.store()?.as_ref(), LISTS, &filters).await?;
        sort_lists(&mut v);
        Ok(v)
    }

    pub async fn fetch_cards(&self, workspace_key: &str, list_id: Id) -> Result<Vec<Card>, MirrorError> {
        let filters = [("workspace_key", workspace_key.to_string()), ("list_id", list_id.to_string())];
        let mut v: Vec<Card> = fetch(self.store()?.as_ref(), CARDS, &filters).await?;
        sort_cards(&mut v);
        Ok(v)
    }

    pub fn on_boards_change<F>(&self, workspace_key: &str, cb: F) -> Subscription
    where
        F: FnMut(Vec<Board>) + Send + 'static,
    {
        self.watch(BOARDS, vec![("workspace_key", workspace_key.to_string())], sort_boards, cb)
    }

    pub fn on_lists_change<F>(&self, workspace_key: &str, board_id: Id, cb: F) -> Subscription
    where
        F: FnMut(Vec<List>) + Send + 'static,
    {
        let filters = vec![("workspace_key", workspace_key.to_string()), ("board_id", board_id.to_string())];
        self.watch(LISTS, filters, sort_lists, cb)
    }

    pub fn on_cards_change<F>(&self, workspace_key: &str, list_id: Id, cb: F) -> Subscription
    where
        F: FnMut(Vec<Card>) + Send + 'static,
    {
        let filters = vec![("workspace_key", workspace_key.to_string()), ("list_id", list_id.to_string())];
        self.watch(CARDS, filters, sort_cards, cb)
    }

    /// Poll `collection` and call `cb` with the full ordered sequence whenever it changes.
    fn watch<T, F>(
        &self,
        collection: &'static str,
        filters: Vec<(&'static str, String)>,
        sort: fn(&mut [T]),
        mut cb: F,
    ) -> Subscription
    where
        T: DeserializeOwned + PartialEq + Clone + Send + 'static,
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let Some(store) = self.store.clone() else { return Subscription::inert() };
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime; {collection} subscription inactive");
            return Subscription::inert();
        };
        let period = self.poll_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<T>> = None;
            loop {
                ticker.tick().await;
                match fetch::<T>(store.as_ref(), collection, &filters).await {
                    Ok(mut items) => {
                        sort(&mut items);
                        if last.as_ref() != Some(&items) {
                            cb(items.clone());
                            last = Some(items);
                        }
                    }
                    Err(e) => debug!("{collection} poll failed: {e}"),
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn board(id: Id, name: &str) -> Board {
        Board { id, name: name.into(), created_at: Utc::now() }
    }

    #[test]
    fn tagged_doc_carries_workspace_key() {
        let doc = tagged_doc("AB12CD34", &board(7, "B")).unwrap();
        assert_eq!(doc["workspace_key"], "AB12CD34");
        assert_eq!(doc["id"], 7);
        assert_eq!(entity_doc_id("AB12CD34", 7), "AB12CD34_7");
        let back: Board = serde_json::from_value(doc).unwrap();
        assert_eq!(back.name, "B");
    }

    #[test]
    fn cloud_workspace_snapshot_roundtrip() {
        let ws = crate::workspace::new_workspace("W", Some("WWWW1111")).unwrap();
        let doc = CloudWorkspace::from_workspace(&ws, Some(b"db-bytes"));
        assert_eq!(doc.snapshot().unwrap(), b"db-bytes");
        assert!(doc.workspace().cloud_linked);
        let empty = CloudWorkspace::from_workspace(&ws, None);
        assert!(empty.snapshot().is_none());
        let bad = CloudWorkspace { data: "%%%".into(), ..empty };
        assert!(bad.snapshot().is_none());
    }

    #[tokio::test]
    async fn disabled_mirror_is_inert() {
        let m = CloudMirror::disabled();
        assert!(!m.push_board("K", &board(1, "x")).await);
        assert!(m.find_by_key("AB12CD34").await.is_none());
        assert!(!m.is_available().await);
        assert!(matches!(m.delete_workspace("AB12CD34").await, Err(MirrorError::NotConfigured)));
        assert!(!m.on_boards_change("K", |_| {}).is_active());
    }

    #[tokio::test]
    async fn memory_store_filters_by_fields() {
        let store = MemoryDocumentStore::new();
        let m = CloudMirror::new(Arc::new(store.clone()), Duration::from_millis(10));
        let now = Utc::now();
        for (id, board_id, pos) in [(1, 1, 1), (2, 1, 0), (3, 2, 0)] {
            let l = List { id, board_id, name: format!("L{id}"), position: pos, created_at: now };
            assert!(m.push_list("KEY00001", &l).await);
        }
        let lists = m.fetch_lists("KEY00001", 1).await.unwrap();
        assert_eq!(lists.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 1]);
        assert!(m.fetch_lists("OTHER001", 1).await.unwrap().is_empty());

        assert!(m.remove_list("KEY00001", 1).await);
        assert_eq!(store.count(LISTS), 2);

        store.set_offline(true);
        assert!(!m.push_list("KEY00001", &lists[0]).await);
        assert!(m.fetch_lists("KEY00001", 1).await.is_err());
    }
}
