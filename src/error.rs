use crate::kv::KvError;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("validation: {0}")] Validation(String),
    #[error("store not initialized")] NotInitialized,
    /// Persisted bytes unreadable or migration failed. Callers reset the store.
    #[error("initialization failed: {0}")] Init(String),
    #[error("not found")] NotFound,
    #[error("storage: {0}")] Storage(#[from] KvError),
    #[error("database: {0}")] Database(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    /// True when the recommended remediation is a full reset of the workspace slot.
    pub fn needs_reset(&self) -> bool {
        matches!(self, StoreError::Init(_))
    }
}

/// Trim `value` and reject it when nothing is left.
pub(crate) fn required_text(value: &str, what: &str) -> StoreResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::validation(format!("{what} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_text_trims_and_rejects_blank() {
        assert_eq!(required_text("  To Do ", "list name").unwrap(), "To Do");
        let err = required_text(" \t ", "board name").unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m == "board name cannot be empty"));
        assert!(!err.needs_reset());
        assert!(StoreError::Init("bad header".into()).needs_reset());
    }
}
