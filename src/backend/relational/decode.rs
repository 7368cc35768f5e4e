//! Row decoding into JSON records.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Dialect-specific decoders handle the actual value extraction

use super::Dialect;
use crate::models::Record;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Binary,
    Json,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, dialect: Dialect) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if dialect == Dialect::Sqlite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    // SQLite stores dates as text
    if dialect != Dialect::Sqlite
        && (lower.starts_with("timestamp")
            || lower == "datetime"
            || lower == "date"
            || lower == "time"
            || lower == "timetz")
    {
        return TypeCategory::Temporal;
    }

    TypeCategory::Text
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary data as base64 text.
pub fn binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Decode a nullable column, treating decode failures as absent.
fn get<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

/// Trait for converting database rows to records.
pub trait RowToRecord {
    fn to_record(&self) -> Record;
}

macro_rules! impl_row_to_record {
    ($row:ty, $dialect:expr, $decoder:path) => {
        impl RowToRecord for $row {
            fn to_record(&self) -> Record {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let category = categorize_type(col.type_info().name(), $dialect);
                        (col.name().to_string(), $decoder(self, idx, category))
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_record!(MySqlRow, Dialect::MySql, mysql::decode_column);
impl_row_to_record!(PgRow, Dialect::Postgres, postgres::decode_column);
impl_row_to_record!(SqliteRow, Dialect::Sqlite, sqlite::decode_column);

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Decimal => get::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0)),
            // Signed first, then the unsigned widths MySQL reports as INT UNSIGNED
            TypeCategory::Integer => get::<_, i64>(row, idx)
                .map(JsonValue::from)
                .or_else(|| get::<_, u64>(row, idx).map(JsonValue::from))
                .or_else(|| get::<_, i8>(row, idx).map(JsonValue::from))
                .or_else(|| get::<_, u8>(row, idx).map(JsonValue::from)),
            TypeCategory::Boolean => get::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float => get::<_, f64>(row, idx)
                .or_else(|| get::<_, f32>(row, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx),
            TypeCategory::Temporal => get::<_, chrono::DateTime<chrono::Utc>>(row, idx)
                .map(|v| JsonValue::String(v.to_rfc3339()))
                .or_else(|| get::<_, chrono::NaiveDateTime>(row, idx).map(|v| v.to_string().into()))
                .or_else(|| get::<_, chrono::NaiveDate>(row, idx).map(|v| v.to_string().into()))
                .or_else(|| get::<_, chrono::NaiveTime>(row, idx).map(|v| v.to_string().into())),
            TypeCategory::Text => get::<_, String>(row, idx).map(JsonValue::String),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Decimal => get::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0)),
            TypeCategory::Integer => get::<_, i64>(row, idx)
                .or_else(|| get::<_, i32>(row, idx).map(i64::from))
                .or_else(|| get::<_, i16>(row, idx).map(i64::from))
                .map(JsonValue::from),
            TypeCategory::Boolean => get::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float => get::<_, f64>(row, idx)
                .or_else(|| get::<_, f32>(row, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx),
            TypeCategory::Temporal => get::<_, chrono::DateTime<chrono::Utc>>(row, idx)
                .map(|v| JsonValue::String(v.to_rfc3339()))
                .or_else(|| get::<_, chrono::NaiveDateTime>(row, idx).map(|v| v.to_string().into()))
                .or_else(|| get::<_, chrono::NaiveDate>(row, idx).map(|v| v.to_string().into()))
                .or_else(|| get::<_, chrono::NaiveTime>(row, idx).map(|v| v.to_string().into())),
            TypeCategory::Text => get::<_, String>(row, idx).map(JsonValue::String),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Integer => get::<_, i64>(row, idx).map(JsonValue::from),
            TypeCategory::Boolean => get::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => get::<_, f64>(row, idx).map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            // Untyped expression columns report "NULL"; take whatever the value holds
            _ => get::<_, String>(row, idx)
                .map(JsonValue::String)
                .or_else(|| get::<_, i64>(row, idx).map(JsonValue::from))
                .or_else(|| get::<_, f64>(row, idx).map(float_value)),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT", Dialect::MySql), TypeCategory::Integer);
        assert_eq!(categorize_type("BIGINT", Dialect::Postgres), TypeCategory::Integer);
        assert_eq!(categorize_type("SERIAL", Dialect::Postgres), TypeCategory::Integer);
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(categorize_type("DECIMAL", Dialect::MySql), TypeCategory::Decimal);
        assert_eq!(categorize_type("NUMERIC", Dialect::Postgres), TypeCategory::Decimal);
        // SQLite NUMERIC is a float
        assert_eq!(categorize_type("numeric", Dialect::Sqlite), TypeCategory::Float);
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(categorize_type("TIMESTAMPTZ", Dialect::Postgres), TypeCategory::Temporal);
        assert_eq!(categorize_type("DATETIME", Dialect::MySql), TypeCategory::Temporal);
        assert_eq!(categorize_type("DATETIME", Dialect::Sqlite), TypeCategory::Text);
    }

    #[test]
    fn test_categorize_type_json_and_binary() {
        assert_eq!(categorize_type("jsonb", Dialect::Postgres), TypeCategory::Json);
        assert_eq!(categorize_type("BYTEA", Dialect::Postgres), TypeCategory::Binary);
        assert_eq!(categorize_type("BLOB", Dialect::Sqlite), TypeCategory::Binary);
    }

    #[test]
    fn test_binary_value_is_base64() {
        assert_eq!(binary_value(b"hello"), JsonValue::String("aGVsbG8=".to_string()));
    }
}
