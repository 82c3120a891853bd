//! 结果行与显式映射
//!
//! 列名匹配不区分大小写。缺失的列和 NULL 都映射为字段的默认值，
//! 类型不匹配是硬错误。

use trellis_errors::{AppError, AppResult};

use crate::value::{FromValue, Value};

/// 一行数据：按列顺序保存的 (列名, 值)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一列（构建器风格）
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    /// 追加一列；同名列（不区分大小写）会被覆盖
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.position(&column) {
            Some(idx) => self.columns[idx].1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// 第一列的值
    pub fn first_value(&self) -> Option<&Value> {
        self.columns.first().map(|(_, value)| value)
    }

    /// 按列名取值，不区分大小写
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.position(column).map(|idx| &self.columns[idx].1)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.position(column).is_some()
    }

    /// 读取字段：列缺失或为 NULL 时返回默认值
    pub fn get<T: FromValue + Default>(&self, column: &str) -> AppResult<T> {
        Ok(self.try_get(column)?.unwrap_or_default())
    }

    /// 读取字段：列缺失或为 NULL 时返回 `None`
    ///
    /// NULL 不论列类型都不做类型检查，只有非空值的类型不符才是映射错误。
    pub fn try_get<T: FromValue>(&self, column: &str) -> AppResult<Option<T>> {
        match self.value(column) {
            Some(value) if value.is_null() => Ok(None),
            Some(value) => T::from_value(value)
                .map_err(|e| AppError::mapping(format!("column '{}': {}", column, e))),
            None => Ok(None),
        }
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(column))
    }
}

impl<S: Into<String>, V: Into<Value>> FromIterator<(S, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (column, value) in iter {
            record.push(column, value);
        }
        record
    }
}

/// 行到记录类型的显式映射
///
/// 实现方按字段调用 [`Record::get`]，以保持大小写不敏感、缺列容忍的约定。
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> AppResult<Self>;
}

impl FromRecord for Record {
    fn from_record(record: &Record) -> AppResult<Self> {
        Ok(record.clone())
    }
}
