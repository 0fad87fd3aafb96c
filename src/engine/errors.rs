//! Engine error translation. All sniffing of engine error text lives here.

use crate::error::{PlatformError, SqlErrorKind};
use regex::Regex;
use std::sync::OnceLock;

/// Substring patterns in engine messages, checked in order
const MESSAGE_PATTERNS: &[(&str, SqlErrorKind)] = &[
    ("no such table", SqlErrorKind::UndefinedTable),
    ("no such view", SqlErrorKind::UndefinedTable),
    ("unknown database", SqlErrorKind::UndefinedSchema),
    ("no such database", SqlErrorKind::UndefinedSchema),
    ("no such column", SqlErrorKind::UndefinedColumn),
    ("has no column named", SqlErrorKind::UndefinedColumn),
    ("already exists", SqlErrorKind::DuplicateObject),
    ("is already in use", SqlErrorKind::DuplicateObject),
    ("constraint failed", SqlErrorKind::ConstraintViolation),
    ("datatype mismatch", SqlErrorKind::TypeMismatch),
    ("type mismatch", SqlErrorKind::TypeMismatch),
    ("cannot convert", SqlErrorKind::TypeMismatch),
    ("syntax error", SqlErrorKind::Syntax),
    ("incomplete input", SqlErrorKind::Syntax),
    ("unrecognized token", SqlErrorKind::Syntax),
];

struct Rewrite {
    pattern: &'static str,
    template: &'static str,
}

/// Engine phrasing -> Postgres phrasing, first match wins
const REWRITES: &[Rewrite] = &[
    Rewrite {
        pattern: r"no such (?:table|view): (?:main\.)?(?P<name>[\w.]+)",
        template: "relation \"$name\" does not exist",
    },
    Rewrite {
        pattern: r"(?:unknown|no such) database:? (?P<name>\w+)",
        template: "schema \"$name\" does not exist",
    },
    Rewrite {
        pattern: r"table (?:main\.)?(?P<table>[\w.]+) has no column named (?P<name>\w+)",
        template: "column \"$name\" of relation \"$table\" does not exist",
    },
    Rewrite {
        pattern: r"no such column: (?P<name>[\w.]+)",
        template: "column \"$name\" does not exist",
    },
    Rewrite {
        pattern: r"(?:table|view|index) (?:main\.)?(?P<name>[\w.]+) already exists",
        template: "relation \"$name\" already exists",
    },
    Rewrite {
        pattern: r"database (?P<name>\w+) is already in use",
        template: "schema \"$name\" already exists",
    },
    Rewrite {
        pattern: r"UNIQUE constraint failed: (?P<cols>[\w., ]+)",
        template: "duplicate key value violates unique constraint on ($cols)",
    },
    Rewrite {
        pattern: r"NOT NULL constraint failed: (?P<cols>[\w.]+)",
        template: "null value in column \"$cols\" violates not-null constraint",
    },
];

static REWRITE_RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

fn rewrites() -> &'static [(Regex, &'static str)] {
    REWRITE_RES.get_or_init(|| {
        REWRITES
            .iter()
            .map(|r| (Regex::new(r.pattern).expect("valid error rewrite regex"), r.template))
            .collect()
    })
}

/// Classify an engine error message
pub fn classify_message(message: &str) -> SqlErrorKind {
    let lowered = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| lowered.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(SqlErrorKind::Execution)
}

/// Postgres-style wording for an engine message, or the message itself
pub fn postgres_message(message: &str) -> String {
    for (regex, template) in rewrites() {
        if let Some(captures) = regex.captures(message) {
            let mut rendered = String::new();
            captures.expand(template, &mut rendered);
            return rendered;
        }
    }
    message.to_string()
}

/// Translate a statement-level engine message into a `SQLError`
pub fn statement_error(message: &str) -> PlatformError {
    PlatformError::sql(classify_message(message), postgres_message(message))
}

/// Translate an error raised while running a statement
pub fn translate(err: sqlx::Error) -> PlatformError {
    match err {
        sqlx::Error::Database(db) => statement_error(db.message()),
        sqlx::Error::ColumnDecode { index, source } => PlatformError::sql(
            SqlErrorKind::TypeMismatch,
            format!("cannot decode column {}: {}", index, source),
        ),
        sqlx::Error::Decode(source) => {
            PlatformError::sql(SqlErrorKind::TypeMismatch, source.to_string())
        }
        sqlx::Error::TypeNotFound { type_name } => PlatformError::sql(
            SqlErrorKind::TypeMismatch,
            format!("type \"{}\" does not exist", type_name),
        ),
        sqlx::Error::ColumnNotFound(name) => PlatformError::sql(
            SqlErrorKind::UndefinedColumn,
            format!("column \"{}\" does not exist", name),
        ),
        sqlx::Error::ColumnIndexOutOfBounds { index, len } => PlatformError::sql(
            SqlErrorKind::Execution,
            format!("column index {} out of range for {} columns", index, len),
        ),
        sqlx::Error::RowNotFound => {
            PlatformError::sql(SqlErrorKind::Execution, "no rows returned".to_string())
        }
        other => connection_error(other),
    }
}

/// Failures of the engine itself rather than of a statement
pub fn connection_error(err: sqlx::Error) -> PlatformError {
    PlatformError::DatabaseConnection(err.to_string())
}
