use serde::{Deserialize, Serialize};

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub schema: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

/// Schema namespaces and table definitions of one project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Non-default schemas; `public` is implicit
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

impl Catalog {
    pub fn tables_in(&self, schemas: Option<&[String]>) -> Vec<TableDef> {
        self.tables
            .iter()
            .filter(|t| schemas.map_or(true, |s| s.iter().any(|name| name == &t.schema)))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty() && self.tables.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    pub schema: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, name: &str) -> TableDef {
        TableDef {
            schema: schema.to_string(),
            name: name.to_string(),
            comment: None,
            columns: vec![],
            primary_keys: vec![],
        }
    }

    #[test]
    fn test_tables_in_filters_by_schema() {
        let catalog = Catalog {
            schemas: vec!["analytics".to_string()],
            tables: vec![table("public", "users"), table("analytics", "events")],
        };
        assert_eq!(catalog.tables_in(None).len(), 2);
        let only = catalog.tables_in(Some(&["analytics".to_string()]));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "events");
    }
}
