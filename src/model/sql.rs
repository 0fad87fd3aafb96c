use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub rows: Vec<Map<String, Value>>,
    pub columns: Vec<ColumnDescription>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub row_count: u64,
    pub status_message: String,
}

/// Result of one statement: either a row set or a command tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Rows(RowSet),
    Command(CommandOutcome),
}

impl QueryResult {
    pub fn ok() -> Self {
        QueryResult::Command(CommandOutcome {
            row_count: 0,
            status_message: "OK".to_string(),
        })
    }

    pub fn row_count(&self) -> u64 {
        match self {
            QueryResult::Rows(set) => set.row_count,
            QueryResult::Command(outcome) => outcome.row_count,
        }
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        match self {
            QueryResult::Rows(set) => &set.rows,
            QueryResult::Command(_) => &[],
        }
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        match self {
            QueryResult::Rows(set) => &set.columns,
            QueryResult::Command(_) => &[],
        }
    }

    pub fn status_message(&self) -> Option<&str> {
        match self {
            QueryResult::Rows(_) => None,
            QueryResult::Command(outcome) => Some(&outcome.status_message),
        }
    }
}
