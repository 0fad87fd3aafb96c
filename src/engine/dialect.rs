//! Postgres-flavored SQL -> engine dialect.
//!
//! Statements are split on top-level `;`, comments dropped, and rewritten
//! outside of string literals. The rewrite is best-effort: constructs the
//! engine does not understand reach it unchanged and fail there.

use crate::engine::types::{engine_type_for, PG_TO_ENGINE};
use crate::error::{PlatformError, Result};
use itertools::Itertools;
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Engine expression standing in for Postgres' random UUID functions
pub const RANDOM_ID_EXPR: &str = "(lower(hex(randomblob(16))))";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    CreateSchema {
        name: String,
        if_not_exists: bool,
    },
    DropSchema {
        names: Vec<String>,
        if_exists: bool,
    },
    CreateExtension {
        name: String,
        schema: Option<String>,
        version: Option<String>,
        if_not_exists: bool,
    },
    DropExtension {
        name: String,
        if_exists: bool,
    },
    Truncate {
        tables: Vec<String>,
    },
    CommentOnTable {
        table: String,
        comment: Option<String>,
    },
    Transaction,
    /// Session and privilege commands with no effect on a simulated tenant
    Ignored,
    Other,
}

impl StatementKind {
    /// Whether the statement alters the catalog or installed extensions
    pub fn changes_schema(&self) -> bool {
        matches!(
            self,
            StatementKind::Ddl
                | StatementKind::CreateSchema { .. }
                | StatementKind::DropSchema { .. }
                | StatementKind::CreateExtension { .. }
                | StatementKind::DropExtension { .. }
                | StatementKind::CommentOnTable { .. }
        )
    }

    /// Command tag reported for a statement that affected `rows` rows
    pub fn command_tag(&self, rows: u64) -> String {
        match self {
            StatementKind::Insert => format!("INSERT 0 {}", rows),
            StatementKind::Update => format!("UPDATE {}", rows),
            StatementKind::Delete => format!("DELETE {}", rows),
            _ => "OK".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub kind: StatementKind,
    /// Engine-dialect text
    pub sql: String,
    pub returns_rows: bool,
}

/// Split, classify and rewrite a possibly multi-statement input
pub fn prepare(input: &str) -> Result<Vec<PreparedStatement>> {
    let statements = split_statements(input);
    if statements.is_empty() {
        return Err(PlatformError::Validation(
            "query must contain at least one statement".to_string(),
        ));
    }
    Ok(statements.iter().map(|s| prepare_one(s)).collect())
}

fn prepare_one(statement: &str) -> PreparedStatement {
    let kind = classify(statement);
    let keyword = leading_keyword(statement);
    let mut sql = map_code(statement, rewrite_expressions);
    if keyword == "CREATE" || keyword == "ALTER" {
        sql = map_code(&sql, rewrite_column_types);
    }
    if keyword == "START" {
        sql = "BEGIN".to_string();
    }
    let returns_rows = match kind {
        StatementKind::Select => true,
        StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
            has_returning(&sql)
        }
        _ => false,
    };
    PreparedStatement {
        kind,
        sql,
        returns_rows,
    }
}

fn leading_keyword(statement: &str) -> String {
    statement
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Classify one statement by its leading keyword
pub fn classify(statement: &str) -> StatementKind {
    let statement = statement.trim();
    match leading_keyword(statement).as_str() {
        "SELECT" | "WITH" | "VALUES" | "EXPLAIN" | "TABLE" | "PRAGMA" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" => classify_create(statement),
        "DROP" => classify_drop(statement),
        "ALTER" => StatementKind::Ddl,
        "TRUNCATE" => classify_truncate(statement),
        "COMMENT" => classify_comment(statement),
        "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
            StatementKind::Transaction
        }
        "SET" | "RESET" | "SHOW" | "GRANT" | "REVOKE" | "NOTIFY" | "LISTEN" | "UNLISTEN"
        | "DISCARD" => StatementKind::Ignored,
        _ => StatementKind::Other,
    }
}

static CREATE_SCHEMA_RE: OnceLock<Regex> = OnceLock::new();
static CREATE_EXTENSION_RE: OnceLock<Regex> = OnceLock::new();
static DROP_SCHEMA_RE: OnceLock<Regex> = OnceLock::new();
static DROP_EXTENSION_RE: OnceLock<Regex> = OnceLock::new();
static TRUNCATE_RE: OnceLock<Regex> = OnceLock::new();
static COMMENT_RE: OnceLock<Regex> = OnceLock::new();

fn classify_create(statement: &str) -> StatementKind {
    let schema_re = CREATE_SCHEMA_RE.get_or_init(|| {
        Regex::new(r#"(?is)^CREATE\s+SCHEMA\s+(?P<ine>IF\s+NOT\s+EXISTS\s+)?(?P<name>"[^"]+"|[\w$]+)"#)
            .expect("valid CREATE SCHEMA regex")
    });
    if let Some(caps) = schema_re.captures(statement) {
        return StatementKind::CreateSchema {
            name: identifier(&caps["name"]),
            if_not_exists: caps.name("ine").is_some(),
        };
    }

    let extension_re = CREATE_EXTENSION_RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^CREATE\s+EXTENSION\s+(?P<ine>IF\s+NOT\s+EXISTS\s+)?(?P<name>"[^"]+"|[\w-]+)(?:\s+WITH)?(?:\s+SCHEMA\s+(?P<schema>"[^"]+"|\w+))?(?:\s+VERSION\s+'?(?P<version>[\w.]+)'?)?"#,
        )
        .expect("valid CREATE EXTENSION regex")
    });
    if let Some(caps) = extension_re.captures(statement) {
        return StatementKind::CreateExtension {
            name: identifier(&caps["name"]),
            schema: caps.name("schema").map(|m| identifier(m.as_str())),
            version: caps.name("version").map(|m| m.as_str().to_string()),
            if_not_exists: caps.name("ine").is_some(),
        };
    }

    StatementKind::Ddl
}

fn classify_drop(statement: &str) -> StatementKind {
    let schema_re = DROP_SCHEMA_RE.get_or_init(|| {
        Regex::new(r#"(?is)^DROP\s+SCHEMA\s+(?P<ie>IF\s+EXISTS\s+)?(?P<names>.+?)(?:\s+(?:CASCADE|RESTRICT))?\s*$"#)
            .expect("valid DROP SCHEMA regex")
    });
    if let Some(caps) = schema_re.captures(statement) {
        return StatementKind::DropSchema {
            names: identifier_list(&caps["names"]),
            if_exists: caps.name("ie").is_some(),
        };
    }

    let extension_re = DROP_EXTENSION_RE.get_or_init(|| {
        Regex::new(r#"(?is)^DROP\s+EXTENSION\s+(?P<ie>IF\s+EXISTS\s+)?(?P<name>"[^"]+"|[\w-]+)"#)
            .expect("valid DROP EXTENSION regex")
    });
    if let Some(caps) = extension_re.captures(statement) {
        return StatementKind::DropExtension {
            name: identifier(&caps["name"]),
            if_exists: caps.name("ie").is_some(),
        };
    }

    StatementKind::Ddl
}

fn classify_truncate(statement: &str) -> StatementKind {
    let re = TRUNCATE_RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^TRUNCATE\s+(?:TABLE\s+)?(?:ONLY\s+)?(?P<tables>.+?)(?:\s+(?:RESTART|CONTINUE)\s+IDENTITY)?(?:\s+(?:CASCADE|RESTRICT))?\s*$"#,
        )
        .expect("valid TRUNCATE regex")
    });
    match re.captures(statement) {
        Some(caps) => StatementKind::Truncate {
            tables: caps["tables"]
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        },
        None => StatementKind::Other,
    }
}

fn classify_comment(statement: &str) -> StatementKind {
    let re = COMMENT_RE.get_or_init(|| {
        Regex::new(r#"(?is)^COMMENT\s+ON\s+TABLE\s+(?P<table>[\w."]+)\s+IS\s+(?:'(?P<text>(?:[^']|'')*)'|NULL)\s*$"#)
            .expect("valid COMMENT ON regex")
    });
    match re.captures(statement) {
        Some(caps) => StatementKind::CommentOnTable {
            table: caps["table"].to_string(),
            comment: caps.name("text").map(|m| m.as_str().replace("''", "'")),
        },
        None => StatementKind::Ignored,
    }
}

/// Unquote a quoted identifier, fold an unquoted one to lowercase
pub fn identifier(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\"\"", "\"")
    } else {
        raw.to_lowercase()
    }
}

fn identifier_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(identifier)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Split `schema.table` into its parts, defaulting the schema to `public`
pub fn qualified_name(raw: &str) -> (String, String) {
    let parts: Vec<&str> = raw.trim().splitn(2, '.').collect();
    match parts.as_slice() {
        [schema, table] => (identifier(schema), identifier(table)),
        _ => (crate::model::DEFAULT_SCHEMA.to_string(), identifier(raw)),
    }
}

static RETURNING_RE: OnceLock<Regex> = OnceLock::new();

fn has_returning(sql: &str) -> bool {
    let re = RETURNING_RE
        .get_or_init(|| Regex::new(r"(?i)\bRETURNING\b").expect("valid RETURNING regex"));
    let mut found = false;
    map_code(sql, |code| {
        found |= re.is_match(code);
        code.to_string()
    });
    found
}

static NOW_RE: OnceLock<Regex> = OnceLock::new();
static RANDOM_UUID_RE: OnceLock<Regex> = OnceLock::new();
static IDENTITY_RE: OnceLock<Regex> = OnceLock::new();
static CAST_RE: OnceLock<Regex> = OnceLock::new();
static ILIKE_RE: OnceLock<Regex> = OnceLock::new();
static PUBLIC_RE: OnceLock<Regex> = OnceLock::new();

fn rewrite_expressions(code: &str) -> String {
    let now = NOW_RE.get_or_init(|| Regex::new(r"(?i)\bnow\s*\(\s*\)").expect("valid now() regex"));
    let random_uuid = RANDOM_UUID_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:uuid_generate_v4|gen_random_uuid)\s*\(\s*\)")
            .expect("valid uuid function regex")
    });
    let identity = IDENTITY_RE.get_or_init(|| {
        Regex::new(r"(?i)\s+GENERATED\s+(?:ALWAYS|BY\s+DEFAULT)\s+AS\s+IDENTITY(?:\s*\([^)]*\))?")
            .expect("valid identity regex")
    });
    let cast = CAST_RE.get_or_init(|| {
        Regex::new(
            r"(?i)::\s*[A-Za-z_]\w*(?:\s+(?:varying|precision|with\s+time\s+zone|without\s+time\s+zone))?(?:\s*\(\s*\d+(?:\s*,\s*\d+)?\s*\))?(?:\s*\[\s*\])*",
        )
        .expect("valid cast regex")
    });
    let ilike = ILIKE_RE.get_or_init(|| Regex::new(r"(?i)\bILIKE\b").expect("valid ILIKE regex"));
    let public = PUBLIC_RE
        .get_or_init(|| Regex::new(r#"(?i)(?:"public"|\bpublic)\."#).expect("valid public regex"));

    let code = now.replace_all(code, "CURRENT_TIMESTAMP");
    let code = random_uuid.replace_all(&code, RANDOM_ID_EXPR);
    let code = identity.replace_all(&code, "");
    let code = cast.replace_all(&code, "");
    let code = ilike.replace_all(&code, "LIKE");
    public.replace_all(&code, "main.").into_owned()
}

static COLUMN_TYPE_RE: OnceLock<Regex> = OnceLock::new();

fn column_type_regex() -> &'static Regex {
    COLUMN_TYPE_RE.get_or_init(|| {
        let alternatives = PG_TO_ENGINE
            .iter()
            .map(|(pg, _)| *pg)
            .sorted_by(|a, b| b.len().cmp(&a.len()))
            .map(|pg| pg.split(' ').map(regex::escape).join(r"\s+"))
            .join("|");
        let pattern = format!(
            r#"(?i)(?P<lead>[(,]\s*|\bADD\s+(?:COLUMN\s+)?(?:IF\s+NOT\s+EXISTS\s+)?)(?P<col>"[^"]+"|[A-Za-z_][\w$]*)(?P<gap>\s+)(?P<ty>(?:{}))\b(?P<mods>\s*\(\s*\d+\s*(?:,\s*\d+\s*)?\))?(?P<tz>\s+with(?:out)?\s+time\s+zone)?(?P<arr>(?:\s*\[\s*\d*\s*\])*)"#,
            alternatives
        );
        Regex::new(&pattern).expect("valid column type regex")
    })
}

/// Translate column types in CREATE TABLE / ALTER TABLE ... ADD COLUMN
fn rewrite_column_types(code: &str) -> String {
    column_type_regex()
        .replace_all(code, |caps: &Captures| {
            let declared = format!(
                "{}{}{}{}",
                &caps["ty"],
                caps.name("mods").map_or("", |m| m.as_str()),
                caps.name("tz").map_or("", |m| m.as_str()),
                caps.name("arr").map_or("", |m| m.as_str()),
            );
            match engine_type_for(&declared) {
                Some(engine) => format!("{}{}{}{}", &caps["lead"], &caps["col"], &caps["gap"], engine),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Apply `f` to the parts of `sql` outside single-quoted and dollar-quoted literals
fn map_code<F>(sql: &str, mut f: F) -> String
where
    F: FnMut(&str) -> String,
{
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut code = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            out.push_str(&f(&code));
            code.clear();
            let end = quoted_end(&chars, i, '\'');
            out.extend(&chars[i..end]);
            i = end;
        } else if let Some(tag) = dollar_tag(&chars, i) {
            out.push_str(&f(&code));
            code.clear();
            let end = dollar_end(&chars, i + tag.len(), &tag);
            out.extend(&chars[i..end]);
            i = end;
        } else {
            code.push(c);
            i += 1;
        }
    }
    out.push_str(&f(&code));
    out
}

/// Index just past the literal opened at `start`; doubled quotes stay inside
fn quoted_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// `$$` or `$tag$` opening at `start`
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    if chars[start] != '$' {
        return None;
    }
    // `$1` is a parameter, not a tag
    if start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        return None;
    }
    let mut i = start + 1;
    while i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '_') {
        i += 1;
    }
    if i < chars.len() && chars[i] == '$' {
        Some(chars[start..=i].to_vec())
    } else {
        None
    }
}

fn dollar_end(chars: &[char], body_start: usize, tag: &[char]) -> usize {
    let mut i = body_start;
    while i + tag.len() <= chars.len() {
        if chars[i..i + tag.len()] == *tag {
            return i + tag.len();
        }
        i += 1;
    }
    chars.len()
}

/// Split on top-level `;`, dropping comments and empty statements
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' => {
                let end = quoted_end(&chars, i, c);
                current.extend(&chars[i..end]);
                i = end;
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                current.push(' ');
            }
            '/' if next == Some('*') => {
                let mut depth = 0;
                while i < chars.len() {
                    if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
                current.push(' ');
            }
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => {
                    let end = dollar_end(&chars, i + tag.len(), &tag);
                    current.extend(&chars[i..end]);
                    i = end;
                }
                None => {
                    current.push(c);
                    i += 1;
                }
            },
            ';' => {
                push_statement(&mut statements, &current);
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}
