use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Params};
use tracing::{debug, info, warn};

use crate::error::{required_text, StoreError, StoreResult};
use crate::image::validate_card_image;
use crate::kv::SharedKv;
use crate::models::*;
use crate::schema::{self, RowDecode};
use crate::workspace::db_key_for;

/// Ids removed by a (cascading) delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removed {
    pub boards: Vec<Id>,
    pub lists: Vec<Id>,
    pub cards: Vec<Id>,
}

// Updates on an unknown id are a no-op and report `Ok(false)`.

pub trait BoardRepo {
    /// Newest first.
    fn boards(&self) -> StoreResult<Vec<Board>>;
    fn get_board(&self, id: Id) -> StoreResult<Option<Board>>;
    fn create_board(&self, name: &str) -> StoreResult<Board>;
    fn update_board(&self, id: Id, name: &str) -> StoreResult<bool>;
    fn delete_board(&self, id: Id) -> StoreResult<Removed>;
}

pub trait ListRepo {
    /// Ascending `position`.
    fn lists_by_board(&self, board_id: Id) -> StoreResult<Vec<List>>;
    fn get_list(&self, id: Id) -> StoreResult<Option<List>>;
    fn create_list(&self, new: NewList) -> StoreResult<List>;
    fn update_list(&self, id: Id, name: &str) -> StoreResult<bool>;
    fn update_list_position(&self, id: Id, position: i64) -> StoreResult<bool>;
    fn delete_list(&self, id: Id) -> StoreResult<Removed>;
}

pub trait CardRepo {
    /// Ascending `position`.
    fn cards_by_list(&self, list_id: Id) -> StoreResult<Vec<Card>>;
    fn get_card(&self, id: Id) -> StoreResult<Option<Card>>;
    fn create_card(&self, new: NewCard) -> StoreResult<Card>;
    fn update_card(&self, id: Id, upd: UpdateCard) -> StoreResult<bool>;
    /// Moves the card without touching siblings; see `reorder::move_card`.
    fn update_card_position(&self, id: Id, list_id: Id, position: i64) -> StoreResult<bool>;
    fn delete_card(&self, id: Id) -> StoreResult<Removed>;
}

pub trait Repo: BoardRepo + ListRepo + CardRepo {}

impl<T> Repo for T where T: BoardRepo + ListRepo + CardRepo {}

/// SQLite database held in memory and written back to its key-value slot
/// after every mutation. One instance per workspace session.
pub struct BoardStore {
    conn: Connection,
    kv: SharedKv,
    db_key: String,
}

impl BoardStore {
    /// Load the workspace's persisted image, or create a fresh one with the default board.
    pub fn open(kv: SharedKv, workspace_id: Option<&str>) -> StoreResult<Self> {
        let db_key = db_key_for(workspace_id);
        match kv.get(&db_key)? {
            Some(bytes) => {
                let conn = Self::load(&bytes)?;
                let store = Self { conn, kv, db_key };
                if schema::run_migrations(&store.conn)? {
                    store.persist()?;
                }
                info!(slot = %store.db_key, size = bytes.len(), "loaded board store");
                Ok(store)
            }
            None => Self::create_fresh(kv, db_key),
        }
    }

    /// Wipe the slot and start over. Data loss is accepted.
    pub fn reset(kv: SharedKv, workspace_id: Option<&str>) -> StoreResult<Self> {
        let db_key = db_key_for(workspace_id);
        kv.remove(&db_key)?;
        warn!(slot = %db_key, "board store reset");
        Self::create_fresh(kv, db_key)
    }

    /// `open`, falling back to `reset` when the persisted image cannot be used.
    pub fn open_or_reset(kv: SharedKv, workspace_id: Option<&str>) -> StoreResult<Self> {
        match Self::open(kv.clone(), workspace_id) {
            Err(e) if e.needs_reset() => {
                warn!(error = %e, "persisted board store unusable; resetting");
                Self::reset(kv, workspace_id)
            }
            other => other,
        }
    }

    pub fn db_key(&self) -> &str { &self.db_key }

    /// Serialized database image, as written to the slot.
    pub fn export(&self) -> StoreResult<Vec<u8>> {
        let data = self.conn.serialize(DatabaseName::Main)?;
        Ok(data.to_vec())
    }

    fn create_fresh(kv: SharedKv, db_key: String) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_schema(&conn)?;
        let store = Self { conn, kv, db_key };
        store.persist()?;
        info!(slot = %store.db_key, "created board store");
        Ok(store)
    }

    fn load(bytes: &[u8]) -> StoreResult<Connection> {
        if !schema::looks_like_sqlite(bytes) {
            return Err(StoreError::Init("persisted bytes are not a database image".into()));
        }
        let init = |e: rusqlite::Error| StoreError::Init(e.to_string());
        let mut conn = Connection::open_in_memory().map_err(init)?;
        conn.deserialize_read_exact(DatabaseName::Main, bytes, bytes.len(), false)
            .map_err(init)?;
        Ok(conn)
    }

    fn persist(&self) -> StoreResult<()> {
        let data = self.conn.serialize(DatabaseName::Main)?;
        self.kv.set(&self.db_key, &data)?;
        metrics::increment_counter!("taskboard_store_persist_total");
        Ok(())
    }

    fn query_all<T: RowDecode, P: Params>(&self, tail: &str, params: P) -> StoreResult<Vec<T>> {
        let sql = format!("{} {tail}", T::select_sql());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, T::decode)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_one<T: RowDecode>(&self, id: Id) -> StoreResult<Option<T>> {
        let sql = format!("{} WHERE id = ?1", T::select_sql());
        Ok(self.conn.query_row(&sql, [id], T::decode).optional()?)
    }

    fn ids<P: Params>(&self, sql: &str, params: P) -> StoreResult<Vec<Id>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |r| r.get::<_, Id>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn changed(&self, sql: &str, params: impl Params) -> StoreResult<bool> {
        let n = self.conn.execute(sql, params)?;
        self.persist()?;
        if n == 0 {
            debug!(sql, "update matched no row");
        }
        Ok(n > 0)
    }

    /// Delete the given lists' cards, then the lists. Runs inside the caller's transaction.
    fn delete_lists_cascade(&self, lists: &[Id], removed: &mut Removed) -> StoreResult<()> {
        for &list_id in lists {
            removed.cards.extend(self.ids("SELECT id FROM cards WHERE list_id = ?1", [list_id])?);
            self.conn.execute("DELETE FROM cards WHERE list_id = ?1", [list_id])?;
            let n = self.conn.execute("DELETE FROM lists WHERE id = ?1", [list_id])?;
            if n > 0 {
                removed.lists.push(list_id);
            }
        }
        Ok(())
    }
}

impl BoardRepo for BoardStore {
    fn boards(&self) -> StoreResult<Vec<Board>> {
        self.query_all("ORDER BY created_at DESC, id DESC", [])
    }

    fn get_board(&self, id: Id) -> StoreResult<Option<Board>> {
        self.query_one(id)
    }

    fn create_board(&self, name: &str) -> StoreResult<Board> {
        let name = required_text(name, "board name")?;
        let created_at = chrono::Utc::now();
        self.conn.execute(
            "INSERT INTO boards (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        let board = Board { id: self.conn.last_insert_rowid(), name, created_at };
        self.persist()?;
        debug!(board = board.id, "board created");
        Ok(board)
    }

    fn update_board(&self, id: Id, name: &str) -> StoreResult<bool> {
        let name = required_text(name, "board name")?;
        self.changed("UPDATE boards SET name = ?1 WHERE id = ?2", params![name, id])
    }

    fn delete_board(&self, id: Id) -> StoreResult<Removed> {
        let mut removed = Removed::default();
        let tx = self.conn.unchecked_transaction()?;
        let lists = self.ids("SELECT id FROM lists WHERE board_id = ?1", [id])?;
        self.delete_lists_cascade(&lists, &mut removed)?;
        if tx.execute("DELETE FROM boards WHERE id = ?1", [id])? > 0 {
            removed.boards.push(id);
        }
        tx.commit()?;
        self.persist()?;
        debug!(board = id, lists = removed.lists.len(), cards = removed.cards.len(), "board deleted");
        Ok(removed)
    }
}

impl ListRepo for BoardStore {
    fn lists_by_board(&self, board_id: Id) -> StoreResult<Vec<List>> {
        self.query_all("WHERE board_id = ?1 ORDER BY position, id", [board_id])
    }

    fn get_list(&self, id: Id) -> StoreResult<Option<List>> {
        self.query_one(id)
    }

    fn create_list(&self, new: NewList) -> StoreResult<List> {
        let name = required_text(&new.name, "list name")?;
        let created_at = chrono::Utc::now();
        self.conn.execute(
            "INSERT INTO lists (board_id, name, position, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![new.board_id, name, new.position, created_at],
        )?;
        let list = List {
            id: self.conn.last_insert_rowid(),
            board_id: new.board_id,
            name,
            position: new.position,
            created_at,
        };
        self.persist()?;
        Ok(list)
    }

    fn update_list(&self, id: Id, name: &str) -> StoreResult<bool> {
        let name = required_text(name, "list name")?;
        self.changed("UPDATE lists SET name = ?1 WHERE id = ?2", params![name, id])
    }

    fn update_list_position(&self, id: Id, position: i64) -> StoreResult<bool> {
        self.changed("UPDATE lists SET position = ?1 WHERE id = ?2", params![position, id])
    }

    fn delete_list(&self, id: Id) -> StoreResult<Removed> {
        let mut removed = Removed::default();
        let tx = self.conn.unchecked_transaction()?;
        self.delete_lists_cascade(&[id], &mut removed)?;
        tx.commit()?;
        self.persist()?;
        Ok(removed)
    }
}

impl CardRepo for BoardStore {
    fn cards_by_list(&self, list_id: Id) -> StoreResult<Vec<Card>> {
        self.query_all("WHERE list_id = ?1 ORDER BY position, id", [list_id])
    }

    fn get_card(&self, id: Id) -> StoreResult<Option<Card>> {
        self.query_one(id)
    }

    fn create_card(&self, new: NewCard) -> StoreResult<Card> {
        let title = required_text(&new.title, "card title")?;
        let description = optional_text(new.description.as_deref());
        let image = validate_card_image(new.image.as_deref())?;
        let created_at = chrono::Utc::now();
        self.conn.execute(
            "INSERT INTO cards (list_id, title, description, image, position, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![new.list_id, title, description, image, new.position, created_at],
        )?;
        let card = Card {
            id: self.conn.last_insert_rowid(),
            list_id: new.list_id,
            title,
            description,
            image,
            position: new.position,
            created_at,
        };
        self.persist()?;
        Ok(card)
    }

    fn update_card(&self, id: Id, upd: UpdateCard) -> StoreResult<bool> {
        let title = required_text(&upd.title, "card title")?;
        let description = optional_text(upd.description.as_deref());
        let image = validate_card_image(upd.image.as_deref())?;
        self.changed(
            "UPDATE cards SET title = ?1, description = ?2, image = ?3 WHERE id = ?4",
            params![title, description, image, id],
        )
    }

    fn update_card_position(&self, id: Id, list_id: Id, position: i64) -> StoreResult<bool> {
        self.changed(
            "UPDATE cards SET list_id = ?1, position = ?2 WHERE id = ?3",
            params![list_id, position, id],
        )
    }

    fn delete_card(&self, id: Id) -> StoreResult<Removed> {
        let n = self.conn.execute("DELETE FROM cards WHERE id = ?1", [id])?;
        self.persist()?;
        let mut removed = Removed::default();
        if n > 0 {
            removed.cards.push(id);
        }
        Ok(removed)
    }
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKv};
    use std::sync::Arc;

    fn store() -> (BoardStore, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (BoardStore::open(kv.clone(), Some("ws_test")).unwrap(), kv)
    }

    #[test]
    fn fresh_store_seeds_default_board_and_persists() {
        let (s, kv) = store();
        let boards = s.boards().unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].name, "Mi Tablero");
        assert!(kv.get("trello-db-ws_test").unwrap().is_some());
    }

    #[test]
    fn every_mutation_rewrites_the_slot() {
        let (s, kv) = store();
        let before = kv.get(s.db_key()).unwrap().unwrap();
        s.create_board("Second").unwrap();
        let after = kv.get(s.db_key()).unwrap().unwrap();
        assert_ne!(before, after);
        assert_eq!(after, s.export().unwrap());
    }

    #[test]
    fn optional_card_fields_are_normalized() {
        let (s, _) = store();
        let board = s.create_board("B").unwrap();
        let list = s.create_list(NewList { board_id: board.id, name: "L".into(), position: 0 }).unwrap();
        let card = s
            .create_card(NewCard { list_id: list.id, title: " T ".into(), description: Some("   ".into()), ..Default::default() })
            .unwrap();
        assert_eq!(card.title, "T");
        assert_eq!(card.description, None);
        let stored = s.get_card(card.id).unwrap().unwrap();
        assert_eq!(stored, card);
    }

    #[test]
    fn update_validates_before_touching_rows() {
        let (s, _) = store();
        let board = s.boards().unwrap().remove(0);
        assert!(matches!(s.update_board(board.id, " "), Err(StoreError::Validation(_))));
        assert_eq!(s.get_board(board.id).unwrap().unwrap().name, "Mi Tablero");
    }

    #[test]
    fn delete_list_cascades_to_cards_only() {
        let (s, _) = store();
        let board = s.boards().unwrap().remove(0);
        let a = s.create_list(NewList { board_id: board.id, name: "A".into(), position: 0 }).unwrap();
        let b = s.create_list(NewList { board_id: board.id, name: "B".into(), position: 1 }).unwrap();
        let c = s.create_card(NewCard { list_id: a.id, title: "x".into(), ..Default::default() }).unwrap();
        let removed = s.delete_list(a.id).unwrap();
        assert_eq!(removed.lists, vec![a.id]);
        assert_eq!(removed.cards, vec![c.id]);
        assert_eq!(s.lists_by_board(board.id).unwrap(), vec![b]);
        assert!(s.get_card(c.id).unwrap().is_none());
    }
}
