#![allow(dead_code)]

use trellis_adapter_memory::{MemoryStore, SessionEvent};
use trellis_domain_core::{Entity, EntityKey, FromRecord, Record, TableMeta, Value};
use trellis_errors::AppResult;
use trellis_persistence::DbUnitOfWork;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Author {
    pub id: i32,
    pub name: Option<String>,
}

impl Author {
    pub fn named(name: &str) -> Self {
        Self {
            id: 0,
            name: Some(name.to_string()),
        }
    }
}

impl FromRecord for Author {
    fn from_record(record: &Record) -> AppResult<Self> {
        Ok(Self {
            id: record.get("id")?,
            name: record.get("name")?,
        })
    }
}

impl Entity for Author {
    const TABLE: TableMeta = TableMeta::new("authors", &["name"]);

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

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Book {
    pub id: i32,
    pub title: Option<String>,
    pub author_id: i32,
}

impl Book {
    pub fn by(author: &Author, title: Option<&str>) -> Self {
        Self {
            id: 0,
            title: title.map(str::to_string),
            author_id: author.id,
        }
    }
}

impl FromRecord for Book {
    fn from_record(record: &Record) -> AppResult<Self> {
        Ok(Self {
            id: record.get("id")?,
            title: record.get("title")?,
            author_id: record.get("author_id")?,
        })
    }
}

impl Entity for Book {
    const TABLE: TableMeta =
        TableMeta::new("books", &["title", "author_id"]).with_foreign_keys(&["author_id"]);

    fn id(&self) -> EntityKey {
        self.id
    }

    fn set_id(&mut self, id: EntityKey) {
        self.id = id;
    }

    fn values(&self) -> Vec<Value> {
        vec![self.title.clone().into(), self.author_id.into()]
    }
}

/// authors / books 两张表，books.title 非空，books.author_id 引用 authors
pub fn library() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .create_table("authors")
        .create_table("books")
        .not_null("books", "title")
        .foreign_key("books", "author_id", "authors");
    store
}

pub fn unit_of_work(store: &MemoryStore) -> DbUnitOfWork {
    DbUnitOfWork::new(Box::new(store.session()))
}

/// 日志中的事务事件
pub fn transaction_events(store: &MemoryStore) -> Vec<SessionEvent> {
    store
        .journal()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::Begin(_) | SessionEvent::Commit | SessionEvent::Rollback
            )
        })
        .collect()
}

/// 日志中的写事件
pub fn write_events(store: &MemoryStore) -> Vec<SessionEvent> {
    store
        .journal()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::Insert { .. } | SessionEvent::Update { .. } | SessionEvent::Delete { .. }
            )
        })
        .collect()
}
