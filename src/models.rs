use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// SQLite rowids
pub type Id = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub id: Id,
    pub board_id: Id,
    pub name: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Id,
    pub list_id: Id,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>, // data URI
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewList {
    pub board_id: Id,
    pub name: String,
    pub position: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCard {
    pub list_id: Id,
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub position: i64,
}

/// Editable card fields. `None` clears the optional column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCard {
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub cloud_linked: bool,
}

/// Workspace lifecycle as seen by the hybrid coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Uninitialized,
    LocalOnly,
    CloudLinked,
}
