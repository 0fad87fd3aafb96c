use crate::config::EngineConfig;
use crate::engine::dialect::{self, qualified_name, PreparedStatement, StatementKind};
use crate::engine::errors;
use crate::engine::types::{oid_for_engine_type, ENGINE_BOOLEAN, UNKNOWN_OID};
use crate::error::{PlatformError, Result, SqlErrorKind};
use crate::model::{
    Catalog, ColumnDef, ColumnDescription, CommandOutcome, Extension, Id, QueryResult, RowSet,
    TableDef, DEFAULT_SCHEMA,
};
use crate::store::PlatformStore;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteColumn, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::sync::Arc;

/// Engine namespace backing the default `public` schema
const ENGINE_DEFAULT_SCHEMA: &str = "main";

/// Version and description reported for well-known extensions
const KNOWN_EXTENSIONS: &[(&str, &str, &str)] = &[
    ("pgcrypto", "1.3", "cryptographic functions"),
    ("uuid-ossp", "1.1", "generate universally unique identifiers (UUIDs)"),
    (
        "pg_stat_statements",
        "1.10",
        "track planning and execution statistics of all SQL statements executed",
    ),
    (
        "pg_trgm",
        "1.6",
        "text similarity measurement and index searching based on trigrams",
    ),
    ("citext", "1.6", "data type for case-insensitive character strings"),
    ("hstore", "1.8", "data type for storing sets of (key, value) pairs"),
    ("vector", "0.5.1", "vector data type and ivfflat and hnsw access methods"),
    (
        "postgis",
        "3.3.2",
        "PostGIS geometry and geography spatial types and functions",
    ),
    ("plpgsql", "1.0", "PL/pgSQL procedural language"),
];

type ConnectionHandle = Arc<tokio::sync::Mutex<SqliteConnection>>;

/// Outcome of [`QueryEngine::execute_tracked`]
#[derive(Debug)]
pub struct Execution {
    pub result: Result<QueryResult>,
    /// A schema-changing statement ran to completion
    pub schema_changed: bool,
}

/// Executes Postgres-flavored SQL against one isolated in-memory database per project.
///
/// Databases are created on first use and populated from the project's catalog
/// in the store; after schema changes the catalog is read back from the engine.
pub struct QueryEngine {
    store: Arc<PlatformStore>,
    config: EngineConfig,
    connections: Mutex<HashMap<Id, ConnectionHandle>>,
}

impl QueryEngine {
    pub fn new(store: Arc<PlatformStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Run one or more statements; the result of the last one is returned
    pub async fn execute(&self, project_id: &str, statement: &str) -> Result<QueryResult> {
        self.execute_tracked(project_id, statement).await.result
    }

    /// Like [`QueryEngine::execute`], also reporting whether any statement that ran
    /// changed the schema, including when a later statement failed
    pub async fn execute_tracked(&self, project_id: &str, statement: &str) -> Execution {
        let mut schema_changed = false;
        let result = self
            .run_all(project_id, statement, &mut schema_changed)
            .await;
        Execution {
            result,
            schema_changed,
        }
    }

    async fn run_all(
        &self,
        project_id: &str,
        statement: &str,
        schema_changed: &mut bool,
    ) -> Result<QueryResult> {
        let prepared = dialect::prepare(statement)?;
        let handle = self.connection(project_id).await?;
        let mut conn = handle.lock().await;
        let timeout = self.config.statement_timeout();

        let mut last = QueryResult::ok();
        for stmt in &prepared {
            debug!("[{}] executing: {}", project_id, stmt.sql);
            let outcome = tokio::time::timeout(timeout, self.run(project_id, &mut conn, stmt)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    // sqlx cannot interrupt a busy worker: the discarded connection
                    // finishes the statement in the background, then closes
                    warn!(
                        "[{}] statement exceeded {} ms, discarding connection",
                        project_id, self.config.statement_timeout_ms
                    );
                    drop(conn);
                    self.release(project_id);
                    return Err(PlatformError::DatabaseConnection(format!(
                        "statement timed out after {} ms",
                        self.config.statement_timeout_ms
                    )));
                }
            };
            match result {
                Ok(result) => {
                    *schema_changed |= stmt.kind.changes_schema();
                    last = result;
                }
                Err(err) => {
                    if *schema_changed {
                        if let Err(refresh) = self.refresh_catalog(project_id, &mut conn).await {
                            warn!(
                                "[{}] catalog refresh after failed statement: {}",
                                project_id, refresh
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        if *schema_changed {
            self.refresh_catalog(project_id, &mut conn).await?;
        }
        Ok(last)
    }

    /// Create the project's database now instead of on first statement
    pub async fn materialize(&self, project_id: &str) -> Result<()> {
        self.connection(project_id).await.map(|_| ())
    }

    /// Discard the project's database and forget its catalog and extensions
    pub async fn reset(&self, project_id: &str) -> Result<()> {
        self.store.require_project(project_id)?;
        let previous = self.connections.lock().remove(project_id);
        if let Some(handle) = previous {
            // wait for any statement still running on it
            drop(handle.lock().await);
        }
        self.store.clear_schema_metadata(project_id)?;
        info!("[{}] database reset", project_id);
        Ok(())
    }

    /// Drop the project's connection; the database is rebuilt from the catalog on next use
    pub fn release(&self, project_id: &str) {
        self.connections.lock().remove(project_id);
    }

    pub fn release_all(&self) {
        self.connections.lock().clear();
    }

    pub fn is_materialized(&self, project_id: &str) -> bool {
        self.connections.lock().contains_key(project_id)
    }

    async fn connection(&self, project_id: &str) -> Result<ConnectionHandle> {
        if let Some(existing) = self.connections.lock().get(project_id).cloned() {
            return Ok(existing);
        }
        self.store.require_project(project_id)?;
        let conn = self.provision(project_id).await?;
        let handle = Arc::new(tokio::sync::Mutex::new(conn));
        let mut connections = self.connections.lock();
        Ok(connections
            .entry(project_id.to_string())
            .or_insert(handle)
            .clone())
    }

    async fn provision(&self, project_id: &str) -> Result<SqliteConnection> {
        let mut conn = SqliteConnection::connect("sqlite::memory:")
            .await
            .map_err(errors::connection_error)?;

        let catalog = self.store.catalog(project_id);
        for statement in replay_statements(&catalog) {
            debug!("[{}] replaying: {}", project_id, statement);
            sqlx::query(&statement)
                .persistent(false)
                .execute(&mut conn)
                .await
                .map_err(|e| {
                    PlatformError::DatabaseConnection(format!(
                        "failed to materialize project '{}': {}",
                        project_id, e
                    ))
                })?;
        }
        info!(
            "[{}] database provisioned with {} table(s)",
            project_id,
            catalog.tables.len()
        );
        Ok(conn)
    }

    async fn run(
        &self,
        project_id: &str,
        conn: &mut SqliteConnection,
        stmt: &PreparedStatement,
    ) -> Result<QueryResult> {
        match &stmt.kind {
            StatementKind::CreateSchema {
                name,
                if_not_exists,
            } => create_schema(conn, name, *if_not_exists).await,
            StatementKind::DropSchema { names, if_exists } => {
                drop_schemas(conn, names, *if_exists).await
            }
            StatementKind::CreateExtension {
                name,
                schema,
                version,
                if_not_exists,
            } => self.create_extension(
                project_id,
                name,
                schema.as_deref(),
                version.as_deref(),
                *if_not_exists,
            ),
            StatementKind::DropExtension { name, if_exists } => {
                let removed = self.store.remove_extension(project_id, name)?;
                if !removed && !if_exists {
                    return Err(PlatformError::sql(
                        SqlErrorKind::Execution,
                        format!("extension \"{}\" does not exist", name),
                    ));
                }
                Ok(QueryResult::ok())
            }
            StatementKind::Truncate { tables } => {
                for table in tables {
                    let (schema, table) = qualified_name(table);
                    let sql = format!(
                        "DELETE FROM {}.{}",
                        quote_ident(engine_schema(&schema)),
                        quote_ident(&table)
                    );
                    sqlx::query(&sql)
                        .persistent(false)
                        .execute(&mut *conn)
                        .await
                        .map_err(errors::translate)?;
                }
                Ok(QueryResult::ok())
            }
            StatementKind::CommentOnTable { table, comment } => {
                self.comment_on_table(project_id, table, comment.clone())
            }
            StatementKind::Ignored => Ok(QueryResult::ok()),
            _ if stmt.returns_rows => fetch_rows(conn, &stmt.sql).await,
            kind => {
                let done = sqlx::query(&stmt.sql)
                    .persistent(false)
                    .execute(&mut *conn)
                    .await
                    .map_err(errors::translate)?;
                match kind {
                    StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
                        let rows = done.rows_affected();
                        Ok(QueryResult::Command(CommandOutcome {
                            row_count: rows,
                            status_message: kind.command_tag(rows),
                        }))
                    }
                    _ => Ok(QueryResult::ok()),
                }
            }
        }
    }

    fn create_extension(
        &self,
        project_id: &str,
        name: &str,
        schema: Option<&str>,
        version: Option<&str>,
        if_not_exists: bool,
    ) -> Result<QueryResult> {
        let known = KNOWN_EXTENSIONS.iter().find(|(n, _, _)| *n == name);
        let extension = Extension {
            name: name.to_string(),
            schema: schema.unwrap_or(DEFAULT_SCHEMA).to_string(),
            version: version
                .map(str::to_string)
                .or_else(|| known.map(|(_, v, _)| v.to_string()))
                .unwrap_or_else(|| "1.0".to_string()),
            description: known.map(|(_, _, d)| d.to_string()).unwrap_or_default(),
        };
        let added = self.store.add_extension(project_id, extension)?;
        if !added && !if_not_exists {
            return Err(PlatformError::sql(
                SqlErrorKind::DuplicateObject,
                format!("extension \"{}\" already exists", name),
            ));
        }
        Ok(QueryResult::ok())
    }

    fn comment_on_table(
        &self,
        project_id: &str,
        table: &str,
        comment: Option<String>,
    ) -> Result<QueryResult> {
        let (schema, name) = qualified_name(table);
        let mut catalog = self.store.catalog(project_id);
        let entry = catalog
            .tables
            .iter_mut()
            .find(|t| t.schema == schema && t.name == name)
            .ok_or_else(|| {
                PlatformError::sql(
                    SqlErrorKind::UndefinedTable,
                    format!("relation \"{}\" does not exist", table),
                )
            })?;
        entry.comment = comment;
        self.store.replace_catalog(project_id, catalog)?;
        Ok(QueryResult::ok())
    }

    /// Read schemas, tables and columns back from the engine into the store
    async fn refresh_catalog(&self, project_id: &str, conn: &mut SqliteConnection) -> Result<()> {
        let previous = self.store.catalog(project_id);
        let mut catalog = Catalog::default();

        for database in attached_databases(conn).await? {
            let schema = platform_schema(&database);
            if schema != DEFAULT_SCHEMA {
                catalog.schemas.push(schema.clone());
            }

            let listing = format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                quote_ident(&database)
            );
            let tables = sqlx::query(&listing)
                .persistent(false)
                .fetch_all(&mut *conn)
                .await
                .map_err(errors::translate)?;

            for table in tables {
                let name: String = table.try_get("name").map_err(errors::translate)?;
                let comment = previous
                    .tables
                    .iter()
                    .find(|t| t.schema == schema && t.name == name)
                    .and_then(|t| t.comment.clone());
                let (columns, primary_keys) = table_columns(conn, &database, &name).await?;
                catalog.tables.push(TableDef {
                    schema: schema.clone(),
                    name,
                    comment,
                    columns,
                    primary_keys,
                });
            }
        }

        debug!(
            "[{}] catalog refreshed: {} schema(s), {} table(s)",
            project_id,
            catalog.schemas.len(),
            catalog.tables.len()
        );
        self.store.replace_catalog(project_id, catalog)
    }
}

async fn attached_databases(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query("PRAGMA database_list")
        .persistent(false)
        .fetch_all(&mut *conn)
        .await
        .map_err(errors::translate)?;
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("name").map_err(errors::translate)?;
        if name != "temp" {
            names.push(name);
        }
    }
    Ok(names)
}

async fn table_columns(
    conn: &mut SqliteConnection,
    database: &str,
    table: &str,
) -> Result<(Vec<ColumnDef>, Vec<String>)> {
    let pragma = format!(
        "PRAGMA {}.table_info({})",
        quote_ident(database),
        quote_ident(table)
    );
    let rows = sqlx::query(&pragma)
        .persistent(false)
        .fetch_all(&mut *conn)
        .await
        .map_err(errors::translate)?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut keyed: Vec<(i64, String)> = Vec::new();
    for row in rows {
        let name: String = row.try_get("name").map_err(errors::translate)?;
        let data_type: String = row.try_get("type").map_err(errors::translate)?;
        let not_null: i64 = row.try_get("notnull").map_err(errors::translate)?;
        let default_value: Option<String> = row.try_get("dflt_value").map_err(errors::translate)?;
        let pk: i64 = row.try_get("pk").map_err(errors::translate)?;
        if pk > 0 {
            keyed.push((pk, name.clone()));
        }
        columns.push(ColumnDef {
            name,
            data_type,
            // primary key columns are implicitly NOT NULL in Postgres
            is_nullable: not_null == 0 && pk == 0,
            default_value,
        });
    }
    keyed.sort();
    Ok((columns, keyed.into_iter().map(|(_, name)| name).collect()))
}

async fn create_schema(
    conn: &mut SqliteConnection,
    name: &str,
    if_not_exists: bool,
) -> Result<QueryResult> {
    let exists = name == DEFAULT_SCHEMA
        || attached_databases(conn)
            .await?
            .iter()
            .any(|db| platform_schema(db) == name);
    if exists {
        if if_not_exists {
            return Ok(QueryResult::ok());
        }
        return Err(PlatformError::sql(
            SqlErrorKind::DuplicateObject,
            format!("schema \"{}\" already exists", name),
        ));
    }
    let sql = format!("ATTACH DATABASE ':memory:' AS {}", quote_ident(name));
    sqlx::query(&sql)
        .persistent(false)
        .execute(&mut *conn)
        .await
        .map_err(errors::translate)?;
    Ok(QueryResult::ok())
}

async fn drop_schemas(
    conn: &mut SqliteConnection,
    names: &[String],
    if_exists: bool,
) -> Result<QueryResult> {
    let attached = attached_databases(conn).await?;
    for name in names {
        if name == DEFAULT_SCHEMA {
            return Err(PlatformError::sql(
                SqlErrorKind::Execution,
                "cannot drop the default schema \"public\"".to_string(),
            ));
        }
        if !attached.iter().any(|db| db == name) {
            if if_exists {
                continue;
            }
            return Err(PlatformError::sql(
                SqlErrorKind::UndefinedSchema,
                format!("schema \"{}\" does not exist", name),
            ));
        }
        let sql = format!("DETACH DATABASE {}", quote_ident(name));
        sqlx::query(&sql)
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(errors::translate)?;
    }
    Ok(QueryResult::ok())
}

async fn fetch_rows(conn: &mut SqliteConnection, sql: &str) -> Result<QueryResult> {
    let rows = sqlx::query(sql)
        .persistent(false)
        .fetch_all(&mut *conn)
        .await
        .map_err(errors::translate)?;

    let columns: Vec<SqliteColumn> = match rows.first() {
        Some(first) => first.columns().to_vec(),
        None => {
            // no rows to look at; describe the statement instead
            let statement = (&mut *conn).prepare(sql).await.map_err(errors::translate)?;
            statement.columns().to_vec()
        }
    };
    let declared: Vec<String> = columns
        .iter()
        .map(|c| c.type_info().name().to_string())
        .collect();

    let mut observed: Vec<Option<String>> = vec![None; columns.len()];
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut record = Map::new();
        for (index, column) in columns.iter().enumerate() {
            let (value, runtime) = decode_value(row, index, &declared[index])?;
            if observed[index].is_none() {
                observed[index] = runtime;
            }
            record.insert(column.name().to_string(), value);
        }
        records.push(record);
    }

    let descriptions = columns
        .iter()
        .zip(declared.iter().zip(observed))
        .map(|(column, (declared, observed))| ColumnDescription {
            name: column.name().to_string(),
            type_oid: match oid_for_engine_type(declared) {
                UNKNOWN_OID => observed
                    .as_deref()
                    .map(oid_for_engine_type)
                    .unwrap_or(UNKNOWN_OID),
                oid => oid,
            },
        })
        .collect();

    Ok(QueryResult::Rows(RowSet {
        row_count: records.len() as u64,
        rows: records,
        columns: descriptions,
    }))
}

/// JSON value of one cell plus the engine's runtime type of that cell
fn decode_value(row: &SqliteRow, index: usize, declared: &str) -> Result<(Value, Option<String>)> {
    let raw = row.try_get_raw(index).map_err(errors::translate)?;
    if raw.is_null() {
        return Ok((Value::Null, None));
    }
    let runtime = raw.type_info().name().to_string();

    let value = match runtime.as_str() {
        "INTEGER" | "BIGINT" | "BOOLEAN" => {
            let v: i64 = row.try_get_unchecked(index).map_err(errors::translate)?;
            if declared.eq_ignore_ascii_case(ENGINE_BOOLEAN) {
                Value::Bool(v != 0)
            } else {
                Value::from(v)
            }
        }
        "REAL" => {
            let v: f64 = row.try_get_unchecked(index).map_err(errors::translate)?;
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        "BLOB" => {
            let v: Vec<u8> = row.try_get_unchecked(index).map_err(errors::translate)?;
            Value::String(format!("\\x{}", hex::encode(v)))
        }
        _ => {
            let v: String = row.try_get_unchecked(index).map_err(errors::translate)?;
            Value::String(v)
        }
    };
    Ok((value, Some(runtime)))
}

/// DDL that recreates a catalog in an empty database
pub(crate) fn replay_statements(catalog: &Catalog) -> Vec<String> {
    let mut statements: Vec<String> = catalog
        .schemas
        .iter()
        .filter(|s| s.as_str() != DEFAULT_SCHEMA)
        .map(|s| format!("ATTACH DATABASE ':memory:' AS {}", quote_ident(s)))
        .collect();

    for table in &catalog.tables {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                let mut def = quote_ident(&column.name);
                if !column.data_type.is_empty() {
                    def.push(' ');
                    def.push_str(&column.data_type);
                }
                if !column.is_nullable && !table.primary_keys.contains(&column.name) {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &column.default_value {
                    def.push_str(&format!(" DEFAULT ({})", default));
                }
                def
            })
            .collect();
        if !table.primary_keys.is_empty() {
            let keys: Vec<String> = table.primary_keys.iter().map(|k| quote_ident(k)).collect();
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        statements.push(format!(
            "CREATE TABLE {}.{} ({})",
            quote_ident(engine_schema(&table.schema)),
            quote_ident(&table.name),
            parts.join(", ")
        ));
    }
    statements
}

fn engine_schema(schema: &str) -> &str {
    if schema == DEFAULT_SCHEMA {
        ENGINE_DEFAULT_SCHEMA
    } else {
        schema
    }
}

fn platform_schema(database: &str) -> String {
    if database == ENGINE_DEFAULT_SCHEMA {
        DEFAULT_SCHEMA.to_string()
    } else {
        database.to_string()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
