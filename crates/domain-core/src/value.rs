//! 列值类型
//!
//! 每个变体都携带 `Option`，空值仍保留列类型，绑定参数时驱动可以发送带类型的 NULL。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_errors::AppError;
use uuid::Uuid;

/// 单个列值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(Option<bool>),
    SmallInt(Option<i16>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Real(Option<f32>),
    Double(Option<f64>),
    Text(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
    Uuid(Option<Uuid>),
    Bytes(Option<Vec<u8>>),
}

impl Value {
    /// 是否为数据库 NULL
    pub fn is_null(&self) -> bool {
        match self {
            Value::Bool(v) => v.is_none(),
            Value::SmallInt(v) => v.is_none(),
            Value::Int(v) => v.is_none(),
            Value::BigInt(v) => v.is_none(),
            Value::Real(v) => v.is_none(),
            Value::Double(v) => v.is_none(),
            Value::Text(v) => v.is_none(),
            Value::Timestamp(v) => v.is_none(),
            Value::Uuid(v) => v.is_none(),
            Value::Bytes(v) => v.is_none(),
        }
    }

    /// 对应的 SQL 类型名
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::SmallInt(_) => "INT2",
            Value::Int(_) => "INT4",
            Value::BigInt(_) => "INT8",
            Value::Real(_) => "FLOAT4",
            Value::Double(_) => "FLOAT8",
            Value::Text(_) => "TEXT",
            Value::Timestamp(_) => "TIMESTAMPTZ",
            Value::Uuid(_) => "UUID",
            Value::Bytes(_) => "BYTEA",
        }
    }

    /// 无类型信息时使用的 NULL
    pub fn null() -> Self {
        Value::Text(None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(Some(v)) => write!(f, "{}", v),
            Value::SmallInt(Some(v)) => write!(f, "{}", v),
            Value::Int(Some(v)) => write!(f, "{}", v),
            Value::BigInt(Some(v)) => write!(f, "{}", v),
            Value::Real(Some(v)) => write!(f, "{}", v),
            Value::Double(Some(v)) => write!(f, "{}", v),
            Value::Text(Some(v)) => write!(f, "'{}'", v),
            Value::Timestamp(Some(v)) => write!(f, "{}", v.to_rfc3339()),
            Value::Uuid(Some(v)) => write!(f, "{}", v),
            Value::Bytes(Some(v)) => write!(f, "<{} bytes>", v.len()),
            _ => f.write_str("NULL"),
        }
    }
}

/// 列类型与目标字段类型不匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl From<TypeMismatch> for AppError {
    fn from(err: TypeMismatch) -> Self {
        AppError::mapping(err.to_string())
    }
}

/// 从列值读取字段
///
/// 不做类型转换：`INT8` 列不能读成 `i32`。NULL 返回 `Ok(None)`。
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Option<Self>, TypeMismatch>;
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Option<Self>, TypeMismatch> {
        Ok(Some(T::from_value(value)?))
    }
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident, $sql:literal;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(Some(v))
                }
            }

            impl From<Option<$ty>> for Value {
                fn from(v: Option<$ty>) -> Self {
                    Value::$variant(v)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Option<Self>, TypeMismatch> {
                    match value {
                        Value::$variant(v) => Ok(v.clone()),
                        other => Err(TypeMismatch {
                            expected: $sql,
                            found: other.type_name(),
                        }),
                    }
                }
            }
        )*
    };
}

value_conversions! {
    bool => Bool, "BOOL";
    i16 => SmallInt, "INT2";
    i32 => Int, "INT4";
    i64 => BigInt, "INT8";
    f32 => Real, "FLOAT4";
    f64 => Double, "FLOAT8";
    String => Text, "TEXT";
    DateTime<Utc> => Timestamp, "TIMESTAMPTZ";
    Uuid => Uuid, "UUID";
    Vec<u8> => Bytes, "BYTEA";
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(Some(v.to_string()))
    }
}

impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        Value::Text(v.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_null() {
        let value = Value::from(None::<i32>);
        assert!(value.is_null());
        assert_eq!(value.type_name(), "INT4");
        assert_eq!(value.to_string(), "NULL");
    }

    #[test]
    fn test_from_value_exact_type() {
        assert_eq!(i32::from_value(&Value::Int(Some(7))), Ok(Some(7)));
        assert_eq!(i32::from_value(&Value::Int(None)), Ok(None));
        assert_eq!(
            Option::<String>::from_value(&Value::Text(None)),
            Ok(Some(None))
        );
    }

    #[test]
    fn test_from_value_does_not_widen() {
        let err = i32::from_value(&Value::BigInt(Some(7))).unwrap_err();
        assert_eq!(err.expected, "INT4");
        assert_eq!(err.found, "INT8");

        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Mapping(_)));
    }
}
