use std::fmt;
use std::str::FromStr;

use rusqlite::TransactionBehavior;

use crate::error::StoreError;

/// Transaction isolation, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// SQLite has no per-transaction isolation setting. A deferred WAL
    /// transaction reads from one snapshot and fails with `BUSY_SNAPSHOT`
    /// when it tries to write after another commit; an immediate one takes
    /// the write lock up front and runs fully serialized.
    pub fn transaction_behavior(self) -> Result<TransactionBehavior, StoreError> {
        match self {
            IsolationLevel::ReadCommitted => {
                Err(StoreError::UnsupportedIsolation(self.as_str().to_string()))
            }
            IsolationLevel::RepeatableRead => Ok(TransactionBehavior::Deferred),
            IsolationLevel::Serializable => Ok(TransactionBehavior::Immediate),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "read_committed" | "readcommitted" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" | "repeatableread" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(StoreError::UnsupportedIsolation(raw.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_spellings() {
        assert_eq!(
            "RepeatableRead".parse::<IsolationLevel>().expect("level"),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().expect("level"),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            " SERIALIZABLE ".parse::<IsolationLevel>().expect("level"),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn levels_are_ordered_by_strength() {
        assert!(IsolationLevel::ReadCommitted < IsolationLevel::RepeatableRead);
        assert!(IsolationLevel::RepeatableRead < IsolationLevel::Serializable);
        assert!(IsolationLevel::ReadCommitted.transaction_behavior().is_err());
    }
}
