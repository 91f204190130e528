//! Table layout, load-time migrations, and typed row decoding.

use rusqlite::{Connection, Row};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::models::{Board, Card, List};

pub const DEFAULT_BOARD_NAME: &str = "Mi Tablero";

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS boards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        board_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        position INTEGER NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (board_id) REFERENCES boards (id) ON DELETE CASCADE
    );
    CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        list_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        image TEXT,
        position INTEGER NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (list_id) REFERENCES lists (id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_lists_board ON lists(board_id);
    CREATE INDEX IF NOT EXISTS idx_cards_list ON cards(list_id);
";

/// Create a fresh schema and seed the default board.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    conn.execute(
        "INSERT INTO boards (name, created_at) VALUES (?1, ?2)",
        rusqlite::params![DEFAULT_BOARD_NAME, chrono::Utc::now()],
    )?;
    Ok(())
}

/// Cheap sanity check before handing bytes to the engine.
pub fn looks_like_sqlite(bytes: &[u8]) -> bool {
    bytes.len() >= 100 && bytes.starts_with(SQLITE_HEADER)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Bring an older snapshot up to date. Returns true when anything changed.
pub fn run_migrations(conn: &Connection) -> StoreResult<bool> {
    let mut changed = false;
    if !column_exists(conn, "cards", "image").map_err(init_err)? {
        conn.execute("ALTER TABLE cards ADD COLUMN image TEXT DEFAULT ''", [])
            .map_err(|e| StoreError::Init(format!("failed to add cards.image: {e}")))?;
        info!("migration: added image column to cards");
        changed = true;
    }
    validate_schema(conn)?;
    Ok(changed)
}

/// Every column the decoders read must be present.
pub fn validate_schema(conn: &Connection) -> StoreResult<()> {
    for (table, columns) in [
        ("boards", Board::COLUMNS),
        ("lists", List::COLUMNS),
        ("cards", Card::COLUMNS),
    ] {
        for column in columns {
            if !column_exists(conn, table, column).map_err(init_err)? {
                return Err(StoreError::Init(format!("missing column {table}.{column}")));
            }
        }
    }
    Ok(())
}

fn init_err(e: rusqlite::Error) -> StoreError {
    StoreError::Init(e.to_string())
}

/// Statically typed decoding of a result row by column name.
pub trait RowDecode: Sized {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn decode(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn select_sql() -> String {
        format!("SELECT {} FROM {}", Self::COLUMNS.join(", "), Self::TABLE)
    }
}

impl RowDecode for Board {
    const TABLE: &'static str = "boards";
    const COLUMNS: &'static [&'static str] = &["id", "name", "created_at"];

    fn decode(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Board {
            id: row.get("id")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl RowDecode for List {
    const TABLE: &'static str = "lists";
    const COLUMNS: &'static [&'static str] = &["id", "board_id", "name", "position", "created_at"];

    fn decode(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(List {
            id: row.get("id")?,
            board_id: row.get("board_id")?,
            name: row.get("name")?,
            position: row.get("position")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl RowDecode for Card {
    const TABLE: &'static str = "cards";
    const COLUMNS: &'static [&'static str] =
        &["id", "list_id", "title", "description", "image", "position", "created_at"];

    fn decode(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Card {
            id: row.get("id")?,
            list_id: row.get("list_id")?,
            title: row.get("title")?,
            description: non_empty(row.get("description")?),
            image: non_empty(row.get("image")?),
            position: row.get("position")?,
            created_at: row.get("created_at")?,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
