//! 实体基础 trait

use crate::record::{FromRecord, Record};
use crate::value::Value;

/// 代理主键类型，由数据库在插入时分配
pub type EntityKey = i32;

/// 实体对应的表结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    /// 表名
    pub name: &'static str,
    /// 主键列（自增）
    pub key: &'static str,
    /// 非主键列，顺序与 [`Entity::values`] 一致
    pub columns: &'static [&'static str],
    /// 引用其他实体主键的列，刷新时会替换其中的临时键
    pub foreign_keys: &'static [&'static str],
}

impl TableMeta {
    pub const fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            name,
            key: "id",
            columns,
            foreign_keys: &[],
        }
    }

    pub const fn with_key(mut self, key: &'static str) -> Self {
        self.key = key;
        self
    }

    pub const fn with_foreign_keys(mut self, foreign_keys: &'static [&'static str]) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }

    /// 主键列 + 非主键列
    pub fn select_columns(&self) -> Vec<&'static str> {
        std::iter::once(self.key)
            .chain(self.columns.iter().copied())
            .collect()
    }

    pub fn is_foreign_key(&self, column: &str) -> bool {
        self.foreign_keys
            .iter()
            .any(|fk| fk.eq_ignore_ascii_case(column))
    }
}

/// 实体 trait
///
/// 主键在插入时由数据库分配，之后对应用只读。尚未刷新的新实体持有负数临时键。
pub trait Entity: FromRecord + Clone + Send + Sync + 'static {
    const TABLE: TableMeta;

    fn id(&self) -> EntityKey;

    fn set_id(&mut self, id: EntityKey);

    /// 非主键列的值，顺序与 `TABLE.columns` 一致
    fn values(&self) -> Vec<Value>;

    fn to_record(&self) -> Record {
        let mut record = Record::new().with(Self::TABLE.key, self.id());
        for (column, value) in Self::TABLE.columns.iter().zip(self.values()) {
            record.push(*column, value);
        }
        record
    }

    /// 尚未持久化（未分配或临时键）
    fn is_transient(&self) -> bool {
        self.id() <= 0
    }
}

/// 负数键是暂存插入时分配的临时键
pub fn is_temporary_key(key: EntityKey) -> bool {
    key < 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_errors::AppResult;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Chapter {
        id: i32,
        book_id: i32,
        title: String,
    }

    impl FromRecord for Chapter {
        fn from_record(record: &Record) -> AppResult<Self> {
            Ok(Self {
                id: record.get("id")?,
                book_id: record.get("book_id")?,
                title: record.get("title")?,
            })
        }
    }

    impl Entity for Chapter {
        const TABLE: TableMeta =
            TableMeta::new("chapters", &["book_id", "title"]).with_foreign_keys(&["book_id"]);

        fn id(&self) -> EntityKey {
            self.id
        }

        fn set_id(&mut self, id: EntityKey) {
            self.id = id;
        }

        fn values(&self) -> Vec<Value> {
            vec![self.book_id.into(), self.title.clone().into()]
        }
    }

    #[test]
    fn test_to_record_round_trips_through_from_record() {
        let chapter = Chapter {
            id: 4,
            book_id: 2,
            title: "Ownership".to_string(),
        };
        let record = chapter.to_record();
        assert_eq!(record.column_names().collect::<Vec<_>>(), ["id", "book_id", "title"]);
        assert_eq!(Chapter::from_record(&record).unwrap(), chapter);
    }

    #[test]
    fn test_table_meta() {
        let table = Chapter::TABLE;
        assert_eq!(table.select_columns(), ["id", "book_id", "title"]);
        assert!(table.is_foreign_key("BOOK_ID"));
        assert!(!table.is_foreign_key("title"));
    }

    #[test]
    fn test_transient_and_temporary_keys() {
        let mut chapter = Chapter::default();
        assert!(chapter.is_transient());
        chapter.set_id(-1);
        assert!(is_temporary_key(chapter.id()));
        chapter.set_id(10);
        assert!(!chapter.is_transient());
    }
}
