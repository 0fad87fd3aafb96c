//! Postgres type names, engine type names and wire type OIDs.

/// OID reported for anything without a better match
pub const UNKNOWN_OID: u32 = 705;

pub const ENGINE_INTEGER: &str = "INTEGER";
pub const ENGINE_REAL: &str = "REAL";
pub const ENGINE_NUMERIC: &str = "NUMERIC";
pub const ENGINE_TEXT: &str = "TEXT";
pub const ENGINE_BLOB: &str = "BLOB";
pub const ENGINE_BOOLEAN: &str = "BOOLEAN";
pub const ENGINE_DATE: &str = "DATE";
pub const ENGINE_TIME: &str = "TIME";
pub const ENGINE_DATETIME: &str = "DATETIME";

/// Postgres type name (lowercase, modifiers stripped) -> engine type name.
/// Engine names map onto themselves so translated DDL can be translated again.
pub(crate) const PG_TO_ENGINE: &[(&str, &str)] = &[
    ("timestamp without time zone", ENGINE_DATETIME),
    ("timestamp with time zone", ENGINE_DATETIME),
    ("time without time zone", ENGINE_TIME),
    ("time with time zone", ENGINE_TIME),
    ("character varying", ENGINE_TEXT),
    ("double precision", ENGINE_REAL),
    ("smallserial", ENGINE_INTEGER),
    ("bigserial", ENGINE_INTEGER),
    ("serial8", ENGINE_INTEGER),
    ("serial4", ENGINE_INTEGER),
    ("serial2", ENGINE_INTEGER),
    ("serial", ENGINE_INTEGER),
    ("smallint", ENGINE_INTEGER),
    ("bigint", ENGINE_INTEGER),
    ("integer", ENGINE_INTEGER),
    ("int8", ENGINE_INTEGER),
    ("int4", ENGINE_INTEGER),
    ("int2", ENGINE_INTEGER),
    ("int", ENGINE_INTEGER),
    ("oid", ENGINE_INTEGER),
    ("float8", ENGINE_REAL),
    ("float4", ENGINE_REAL),
    ("float", ENGINE_REAL),
    ("real", ENGINE_REAL),
    ("numeric", ENGINE_NUMERIC),
    ("decimal", ENGINE_NUMERIC),
    ("money", ENGINE_NUMERIC),
    ("boolean", ENGINE_BOOLEAN),
    ("bool", ENGINE_BOOLEAN),
    ("varchar", ENGINE_TEXT),
    ("character", ENGINE_TEXT),
    ("bpchar", ENGINE_TEXT),
    ("char", ENGINE_TEXT),
    ("citext", ENGINE_TEXT),
    ("text", ENGINE_TEXT),
    ("name", ENGINE_TEXT),
    ("uuid", ENGINE_TEXT),
    ("jsonb", ENGINE_TEXT),
    ("json", ENGINE_TEXT),
    ("xml", ENGINE_TEXT),
    ("inet", ENGINE_TEXT),
    ("cidr", ENGINE_TEXT),
    ("macaddr", ENGINE_TEXT),
    ("interval", ENGINE_TEXT),
    ("tsvector", ENGINE_TEXT),
    ("bytea", ENGINE_BLOB),
    ("blob", ENGINE_BLOB),
    ("timestamptz", ENGINE_DATETIME),
    ("timestamp", ENGINE_DATETIME),
    ("datetime", ENGINE_DATETIME),
    ("timetz", ENGINE_TIME),
    ("time", ENGINE_TIME),
    ("date", ENGINE_DATE),
];

const ENGINE_OIDS: &[(&str, u32)] = &[
    (ENGINE_BOOLEAN, 16),
    (ENGINE_BLOB, 17),
    ("BIGINT", 20),
    (ENGINE_INTEGER, 23),
    (ENGINE_TEXT, 25),
    (ENGINE_REAL, 701),
    (ENGINE_DATE, 1082),
    (ENGINE_TIME, 1083),
    (ENGINE_DATETIME, 1114),
    (ENGINE_NUMERIC, 1700),
];

/// Engine type for a Postgres type name such as `varchar(255)` or `integer[]`.
/// Arrays are stored as JSON text.
pub fn engine_type_for(pg_type: &str) -> Option<&'static str> {
    let normalized = pg_type.trim().to_lowercase();
    if normalized.ends_with(']') || normalized.starts_with('_') {
        return Some(ENGINE_TEXT);
    }
    let base = match normalized.find('(') {
        Some(paren) => {
            // "timestamp(3) with time zone" keeps its suffix
            let close = normalized[paren..].find(')').map(|i| paren + i + 1);
            let suffix = close.map(|c| &normalized[c..]).unwrap_or("");
            format!("{}{}", normalized[..paren].trim_end(), suffix)
        }
        None => normalized,
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");
    PG_TO_ENGINE
        .iter()
        .find(|(pg, _)| *pg == base)
        .map(|(_, engine)| *engine)
}

/// Wire OID for an engine type name; the engine's own spelling (any case) is accepted
pub fn oid_for_engine_type(engine_type: &str) -> u32 {
    ENGINE_OIDS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(engine_type.trim()))
        .map(|(_, oid)| *oid)
        .unwrap_or(UNKNOWN_OID)
}

/// Wire OID for a declared column type as written in DDL
pub fn oid_for_declared_type(declared: &str) -> u32 {
    match engine_type_for(declared) {
        Some(engine) => oid_for_engine_type(engine),
        None => oid_for_engine_type(declared),
    }
}
