//! `Value` 与 PostgreSQL 之间的编解码
//!
//! 每种列类型解码为各自的 `Value` 变体，不做拓宽；不支持的类型是映射错误。

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo};
use trellis_domain_core::{Record, Value};
use trellis_errors::{AppError, AppResult};
use uuid::Uuid;

pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// 绑定一个参数，空值以带类型的 NULL 发送
pub(crate) fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value.clone() {
        Value::Bool(v) => query.bind(v),
        Value::SmallInt(v) => query.bind(v),
        Value::Int(v) => query.bind(v),
        Value::BigInt(v) => query.bind(v),
        Value::Real(v) => query.bind(v),
        Value::Double(v) => query.bind(v),
        Value::Text(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
        Value::Uuid(v) => query.bind(v),
        Value::Bytes(v) => query.bind(v),
    }
}

pub(crate) fn bind_all<'q>(mut query: PgQuery<'q>, values: &[Value]) -> PgQuery<'q> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

fn column_value<'r, T>(row: &'r PgRow, idx: usize, column: &str) -> AppResult<Option<T>>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx)
        .map_err(|e| AppError::mapping(format!("column '{}': {}", column, e)))
}

/// 一行解码为 `Record`
pub(crate) fn decode_row(row: &PgRow) -> AppResult<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match column.type_info().name() {
            "BOOL" => Value::Bool(column_value(row, idx, name)?),
            "INT2" => Value::SmallInt(column_value(row, idx, name)?),
            "INT4" => Value::Int(column_value(row, idx, name)?),
            "INT8" => Value::BigInt(column_value(row, idx, name)?),
            "FLOAT4" => Value::Real(column_value(row, idx, name)?),
            "FLOAT8" => Value::Double(column_value(row, idx, name)?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                Value::Text(column_value::<String>(row, idx, name)?)
            }
            "TIMESTAMPTZ" => Value::Timestamp(column_value::<DateTime<Utc>>(row, idx, name)?),
            "UUID" => Value::Uuid(column_value::<Uuid>(row, idx, name)?),
            "BYTEA" => Value::Bytes(column_value::<Vec<u8>>(row, idx, name)?),
            other => {
                return Err(AppError::mapping(format!(
                    "column '{}' has unsupported type {}",
                    name, other
                )));
            }
        };
        record.push(name, value);
    }
    Ok(record)
}

/// 驱动错误：解码类错误归为映射错误，其余原样作为数据库错误
pub(crate) fn driver_error(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            AppError::mapping(e.to_string())
        }
        other => AppError::database(other.to_string()),
    }
}
