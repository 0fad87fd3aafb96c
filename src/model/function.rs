use crate::model::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionStatus {
    Active,
    Throttled,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFile {
    pub name: String,
    pub content: String,
}

/// One deployed version of an edge function. All versions of a function share `id` and `slug`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFunction {
    pub id: Id,
    pub slug: String,
    pub name: String,
    pub version: String,
    pub status: FunctionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entrypoint_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_map_path: Option<String>,
    pub files: Vec<FunctionFile>,
}

/// Deploy request for a function version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployFunction {
    pub name: String,
    pub files: Vec<FunctionFile>,
    pub entrypoint_path: Option<String>,
    pub import_map_path: Option<String>,
}

pub const DEFAULT_ENTRYPOINT: &str = "index.ts";

/// Last record for `slug` in list order
pub fn latest_version<'a>(functions: &'a [EdgeFunction], slug: &str) -> Option<&'a EdgeFunction> {
    functions.iter().rev().find(|f| f.slug == slug)
}
