//! Work 实体

use trellis_domain_core::{Entity, EntityKey, FromRecord, Record, TableMeta, Value};
use trellis_errors::AppResult;

/// 作品
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Work {
    pub id: EntityKey,
    pub name: Option<String>,
}

impl Work {
    /// 尚未保存的新作品
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: Some(name.into()),
        }
    }
}

impl FromRecord for Work {
    fn from_record(record: &Record) -> AppResult<Self> {
        Ok(Self {
            id: record.get("id")?,
            name: record.get("name")?,
        })
    }
}

impl Entity for Work {
    const TABLE: TableMeta = TableMeta::new("works", &["name"]);

    fn id(&self) -> EntityKey {
        self.id
    }

    fn set_id(&mut self, id: EntityKey) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![self.name.clone().into()]
    }
}
