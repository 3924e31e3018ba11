//! Type mapping between catalog types and field types, default literals, and cast expressions.

use super::DialectKind;
use crate::model::FieldType;
use serde_json::Value;

/// Map a raw catalog type to a field type. `None` when the type has no mapping.
pub fn field_type_of(kind: DialectKind, raw: &str) -> Option<FieldType> {
    let t = raw.trim().to_lowercase();
    match kind {
        DialectKind::Postgres => postgres_field_type(&t),
        DialectKind::Mysql => mysql_field_type(&t),
        DialectKind::Sqlite => sqlite_field_type(&t),
    }
}

fn postgres_field_type(t: &str) -> Option<FieldType> {
    let base = t.split('(').next().unwrap_or(t).trim();
    match base {
        "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" | "uuid" | "citext" => {
            Some(FieldType::Text)
        }
        "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "smallint" | "serial" | "bigserial" => {
            Some(FieldType::Number)
        }
        "real" | "double precision" | "numeric" | "decimal" | "float4" | "float8" => Some(FieldType::Float),
        "boolean" | "bool" => Some(FieldType::Boolean),
        "date"
        | "timestamp"
        | "timestamptz"
        | "timestamp with time zone"
        | "timestamp without time zone" => Some(FieldType::Date),
        _ => None,
    }
}

fn mysql_field_type(t: &str) -> Option<FieldType> {
    if t.starts_with("tinyint(1)") || t == "bool" || t == "boolean" {
        return Some(FieldType::Boolean);
    }
    let base = t.split(['(', ' ']).next().unwrap_or(t);
    match base {
        "varchar" | "char" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum" => Some(FieldType::Text),
        "int" | "integer" | "bigint" | "smallint" | "mediumint" | "tinyint" => Some(FieldType::Number),
        "float" | "double" | "decimal" | "numeric" | "real" => Some(FieldType::Float),
        "date" | "datetime" | "timestamp" => Some(FieldType::Date),
        _ => None,
    }
}

/// SQLite declared types follow column affinity rules; boolean and date are checked
/// before the INT rule so that `BOOLEAN`/`DATETIME` keep their meaning.
fn sqlite_field_type(t: &str) -> Option<FieldType> {
    if t.is_empty() {
        return None;
    }
    if t.contains("bool") {
        Some(FieldType::Boolean)
    } else if t.contains("date") || t.contains("time") {
        Some(FieldType::Date)
    } else if t.contains("int") {
        Some(FieldType::Number)
    } else if t.contains("char") || t.contains("clob") || t.contains("text") {
        Some(FieldType::Text)
    } else if t.contains("real") || t.contains("floa") || t.contains("doub") || t.contains("numeric") || t.contains("decimal") {
        Some(FieldType::Float)
    } else {
        None
    }
}

/// Column type used when creating or altering a column.
pub fn sql_type(kind: DialectKind, field_type: FieldType, auto_increment: bool) -> &'static str {
    match (kind, field_type) {
        (DialectKind::Postgres, FieldType::Number) if auto_increment => "serial",
        (DialectKind::Postgres, FieldType::Text) => "text",
        (DialectKind::Postgres, FieldType::Number) => "integer",
        (DialectKind::Postgres, FieldType::Float) => "double precision",
        (DialectKind::Postgres, FieldType::Boolean) => "boolean",
        (DialectKind::Postgres, FieldType::Date) => "timestamp with time zone",
        (DialectKind::Mysql, FieldType::Text) => "varchar(255)",
        (DialectKind::Mysql, FieldType::Number) => "int",
        (DialectKind::Mysql, FieldType::Float) => "double",
        (DialectKind::Mysql, FieldType::Boolean) => "tinyint(1)",
        (DialectKind::Mysql, FieldType::Date) => "datetime",
        (DialectKind::Sqlite, FieldType::Text) => "TEXT",
        (DialectKind::Sqlite, FieldType::Number) => "INTEGER",
        (DialectKind::Sqlite, FieldType::Float) => "REAL",
        (DialectKind::Sqlite, FieldType::Boolean) => "BOOLEAN",
        (DialectKind::Sqlite, FieldType::Date) => "DATETIME",
    }
}

/// Marker stored in `defaultValue` for "current timestamp" defaults.
pub const NOW: &str = "now";

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Render a default value as a SQL literal for the given column type.
pub fn render_default(kind: DialectKind, field_type: FieldType, value: &Value) -> String {
    match (field_type, value) {
        (_, Value::Null) => "NULL".to_string(),
        (FieldType::Date, Value::String(s)) if s.eq_ignore_ascii_case(NOW) => "CURRENT_TIMESTAMP".to_string(),
        (FieldType::Boolean, Value::Bool(b)) => match kind {
            DialectKind::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
            _ => if *b { "1" } else { "0" }.to_string(),
        },
        (FieldType::Number | FieldType::Float, Value::Number(n)) => n.to_string(),
        (_, Value::String(s)) => quote_literal(s),
        (_, other) => quote_literal(&other.to_string()),
    }
}

/// Parse a catalog default expression into a default value. `None` means no default
/// (or a sequence default, which is reported as autoIncrement instead).
pub fn parse_default(field_type: FieldType, raw: &str) -> Option<Value> {
    let mut s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.to_lowercase().starts_with("nextval(") {
        return None;
    }
    while s.starts_with('(') && s.ends_with(')') {
        s = s[1..s.len() - 1].trim();
    }
    // PostgreSQL casts: 'abc'::text, 0::integer
    if let Some(idx) = s.rfind("::") {
        if !s[idx..].contains('\'') {
            s = s[..idx].trim();
        }
    }
    let lowered = s.to_lowercase();
    if matches!(
        lowered.as_str(),
        "current_timestamp" | "current_timestamp()" | "now()" | "datetime('now')" | "localtimestamp"
    ) {
        return Some(Value::String(NOW.to_string()));
    }
    let unquoted = if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].replace("''", "'")
    } else {
        s.to_string()
    };
    match field_type {
        FieldType::Number => unquoted
            .parse::<i64>()
            .ok()
            .map(Value::from)
            .or(Some(Value::String(unquoted))),
        FieldType::Float => unquoted
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .or(Some(Value::String(unquoted))),
        FieldType::Boolean => match unquoted.to_lowercase().as_str() {
            "true" | "t" | "1" | "b'1'" => Some(Value::Bool(true)),
            "false" | "f" | "0" | "b'0'" => Some(Value::Bool(false)),
            _ => Some(Value::String(unquoted)),
        },
        FieldType::Text | FieldType::Date => Some(Value::String(unquoted)),
    }
}

/// Default values compare numerically when both sides are numbers.
pub fn defaults_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.as_f64() == y.as_f64(),
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

const TRUE_TOKENS: &str = "'true','t','yes','y','1','on'";
const FALSE_TOKENS: &str = "'false','f','no','n','0','off'";

/// Expression converting existing values of `col` from one field type to another.
/// `None` when the engine relabels the column without converting data.
pub fn cast_expression(kind: DialectKind, col: &str, from: FieldType, to: FieldType) -> Option<String> {
    use FieldType::*;
    if from == to {
        return None;
    }
    match kind {
        DialectKind::Postgres => Some(match (from, to) {
            (Text, Number) => format!(
                "CASE WHEN TRIM({c}) ~ '^-?[0-9]+$' THEN TRIM({c})::integer ELSE NULL END",
                c = col
            ),
            (Text, Float) => format!(
                "CASE WHEN TRIM({c}) ~ '^-?[0-9]+(\\.[0-9]+)?$' THEN TRIM({c})::double precision ELSE NULL END",
                c = col
            ),
            (Text, Boolean) => format!(
                "CASE WHEN LOWER(TRIM({c})) IN ({t}) THEN TRUE WHEN LOWER(TRIM({c})) IN ({f}) THEN FALSE ELSE NULL END",
                c = col,
                t = TRUE_TOKENS,
                f = FALSE_TOKENS
            ),
            (Text, Date) => format!("NULLIF(TRIM({c}), '')::timestamp with time zone", c = col),
            (Date, Number) => format!("EXTRACT(EPOCH FROM {})::integer", col),
            (Date, Float) => format!("EXTRACT(EPOCH FROM {})::double precision", col),
            (Number | Float, Date) => format!("to_timestamp({})", col),
            (Number, Float) => format!("{}::double precision", col),
            (Float, Number) => format!("ROUND({})::integer", col),
            (Boolean, Number) => format!("{}::integer", col),
            (Boolean, Float) => format!("{}::integer::double precision", col),
            (Number | Float, Boolean) => format!("({} <> 0)", col),
            (_, Text) => format!("{}::text", col),
            (Date, Boolean) | (Boolean, Date) => "NULL".to_string(),
            _ => return None,
        }),
        DialectKind::Mysql => match (from, to) {
            (Text, Number) => Some(format!(
                "CASE WHEN TRIM({c}) REGEXP '^-?[0-9]+$' THEN CAST(TRIM({c}) AS SIGNED) ELSE NULL END",
                c = col
            )),
            (Text, Float) => Some(format!(
                "CASE WHEN TRIM({c}) REGEXP '^-?[0-9]+(\\\\.[0-9]+)?$' THEN CAST(TRIM({c}) AS DOUBLE) ELSE NULL END",
                c = col
            )),
            (Text, Boolean) => Some(format!(
                "CASE WHEN LOWER(TRIM({c})) IN ({t}) THEN 1 WHEN LOWER(TRIM({c})) IN ({f}) THEN 0 ELSE NULL END",
                c = col,
                t = TRUE_TOKENS,
                f = FALSE_TOKENS
            )),
            (Date, Number | Float) => Some(format!("UNIX_TIMESTAMP({})", col)),
            (Number | Float, Date) => Some(format!("FROM_UNIXTIME({})", col)),
            (Number | Float, Boolean) => Some(format!("({} <> 0)", col)),
            (Date, Boolean) | (Boolean, Date) => Some("NULL".to_string()),
            _ => None,
        },
        DialectKind::Sqlite => match (from, to) {
            (Text, Number) => Some(format!(
                "CASE WHEN TRIM({c}) GLOB '[0-9]*' OR TRIM({c}) GLOB '-[0-9]*' THEN CAST(TRIM({c}) AS INTEGER) ELSE NULL END",
                c = col
            )),
            (Text, Float) => Some(format!("CAST(NULLIF(TRIM({}), '') AS REAL)", col)),
            (Text, Boolean) => Some(format!(
                "CASE WHEN LOWER(TRIM({c})) IN ({t}) THEN 1 WHEN LOWER(TRIM({c})) IN ({f}) THEN 0 ELSE NULL END",
                c = col,
                t = TRUE_TOKENS,
                f = FALSE_TOKENS
            )),
            (Date, Number) => Some(format!("CAST(strftime('%s', {}) AS INTEGER)", col)),
            (Date, Float) => Some(format!("CAST(strftime('%s', {}) AS REAL)", col)),
            (Number | Float, Date) => Some(format!("datetime({}, 'unixepoch')", col)),
            (Float, Number) => Some(format!("CAST(ROUND({}) AS INTEGER)", col)),
            (Number, Float) => Some(format!("CAST({} AS REAL)", col)),
            (Number | Float, Boolean) => Some(format!("({} <> 0)", col)),
            (Date, Boolean) | (Boolean, Date) => Some("NULL".to_string()),
            (_, Text) => Some(format!("CAST({} AS TEXT)", col)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_catalog_types() {
        assert_eq!(field_type_of(DialectKind::Postgres, "character varying"), Some(FieldType::Text));
        assert_eq!(field_type_of(DialectKind::Postgres, "timestamp with time zone"), Some(FieldType::Date));
        assert_eq!(field_type_of(DialectKind::Mysql, "tinyint(1)"), Some(FieldType::Boolean));
        assert_eq!(field_type_of(DialectKind::Mysql, "tinyint(4)"), Some(FieldType::Number));
        assert_eq!(field_type_of(DialectKind::Mysql, "int unsigned"), Some(FieldType::Number));
        assert_eq!(field_type_of(DialectKind::Sqlite, "DATETIME"), Some(FieldType::Date));
        assert_eq!(field_type_of(DialectKind::Sqlite, "BOOLEAN"), Some(FieldType::Boolean));
        assert_eq!(field_type_of(DialectKind::Sqlite, "VARCHAR(20)"), Some(FieldType::Text));
    }

    #[test]
    fn unmapped_types_are_reported() {
        assert_eq!(field_type_of(DialectKind::Postgres, "jsonb"), None);
        assert_eq!(field_type_of(DialectKind::Mysql, "blob"), None);
        assert_eq!(field_type_of(DialectKind::Sqlite, ""), None);
        assert_eq!(field_type_of(DialectKind::Sqlite, "BLOB"), None);
    }

    #[test]
    fn parses_engine_defaults() {
        assert_eq!(parse_default(FieldType::Text, "'guest'::text"), Some(json!("guest")));
        assert_eq!(parse_default(FieldType::Text, "'it''s'"), Some(json!("it's")));
        assert_eq!(parse_default(FieldType::Number, "nextval('user_id_seq'::regclass)"), None);
        assert_eq!(parse_default(FieldType::Number, "(0)"), Some(json!(0)));
        assert_eq!(parse_default(FieldType::Boolean, "false"), Some(json!(false)));
        assert_eq!(parse_default(FieldType::Boolean, "1"), Some(json!(true)));
        assert_eq!(parse_default(FieldType::Date, "CURRENT_TIMESTAMP"), Some(json!(NOW)));
        assert_eq!(parse_default(FieldType::Date, "now()"), Some(json!(NOW)));
    }

    #[test]
    fn rendered_default_parses_back() {
        for kind in [DialectKind::Postgres, DialectKind::Mysql, DialectKind::Sqlite] {
            for (t, v) in [
                (FieldType::Text, json!("a'b")),
                (FieldType::Number, json!(42)),
                (FieldType::Boolean, json!(true)),
                (FieldType::Date, json!(NOW)),
            ] {
                let rendered = render_default(kind, t, &v);
                assert!(defaults_equal(parse_default(t, &rendered).as_ref(), Some(&v)), "{:?} {}", kind, rendered);
            }
        }
    }

    #[test]
    fn casts_only_when_needed() {
        assert_eq!(cast_expression(DialectKind::Postgres, "\"c\"", FieldType::Text, FieldType::Text), None);
        assert!(cast_expression(DialectKind::Postgres, "\"c\"", FieldType::Date, FieldType::Number)
            .unwrap()
            .contains("EPOCH"));
        assert_eq!(cast_expression(DialectKind::Mysql, "`c`", FieldType::Number, FieldType::Text), None);
        assert!(cast_expression(DialectKind::Mysql, "`c`", FieldType::Text, FieldType::Number).is_some());
        assert!(cast_expression(DialectKind::Sqlite, "\"c\"", FieldType::Text, FieldType::Boolean)
            .unwrap()
            .contains("'yes'"));
        assert_eq!(cast_expression(DialectKind::Sqlite, "\"c\"", FieldType::Boolean, FieldType::Number), None);
    }
}
