//! 进程内存储
//!
//! 多个 [`MemorySession`](crate::MemorySession) 共享同一个 `MemoryStore`。
//! 事务按会话做快照，回滚时整体恢复；未提交的写入对其他会话可见（读未提交）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use trellis_domain_core::{EntityKey, Record, Value};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{IsolationLevel, Parameter, ResultSet};

use crate::session::MemorySession;

/// 已注册的存储过程 / 命令
pub type ProcedureFn = Arc<dyn Fn(&[Parameter]) -> AppResult<Vec<ResultSet>> + Send + Sync>;

/// 会话操作日志，测试用来断言实际发生的存储调用
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Open,
    Close,
    Begin(Option<IsolationLevel>),
    Commit,
    Rollback,
    Select { table: String },
    Insert { table: String, key: EntityKey },
    Update { table: String, key: EntityKey },
    Delete { table: String, key: EntityKey },
    Execute { command: String },
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryTable {
    pub key: String,
    pub rows: Vec<Record>,
    pub next_key: EntityKey,
    pub not_null: Vec<String>,
}

impl MemoryTable {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            rows: Vec::new(),
            next_key: 1,
            not_null: Vec::new(),
        }
    }

    pub fn position(&self, key: EntityKey) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get::<i32>(&self.key).ok() == Some(key))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ForeignKey {
    pub table: String,
    pub column: String,
    pub references: String,
}

pub(crate) type Tables = HashMap<String, MemoryTable>;

#[derive(Default)]
pub(crate) struct StoreState {
    pub tables: Tables,
    pub foreign_keys: Vec<ForeignKey>,
    pub procedures: HashMap<String, ProcedureFn>,
    pub journal: Vec<SessionEvent>,
    pub default_schema: Option<String>,
}

impl StoreState {
    pub fn table(&self, name: &str) -> AppResult<&MemoryTable> {
        self.tables.get(name).ok_or_else(|| missing_relation(name))
    }

    pub fn table_mut(&mut self, name: &str) -> AppResult<&mut MemoryTable> {
        self.tables.get_mut(name).ok_or_else(|| missing_relation(name))
    }

    /// 插入/更新前检查非空与外键约束
    pub fn check_row(&self, table: &str, row: &Record) -> AppResult<()> {
        let meta = self.table(table)?;
        for column in &meta.not_null {
            if row.value(column).is_none_or(Value::is_null) {
                return Err(AppError::database(format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    column, table
                )));
            }
        }

        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(key) = row.try_get::<i32>(&fk.column)? else {
                continue;
            };
            let exists = self
                .tables
                .get(&fk.references)
                .is_some_and(|target| target.position(key).is_some());
            if !exists {
                return Err(fk_violation(table, &fk.column, &fk.references));
            }
        }
        Ok(())
    }

    /// 删除前检查是否仍被引用
    pub fn check_unreferenced(&self, table: &str, key: EntityKey) -> AppResult<()> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.references == table) {
            let referenced = self.tables.get(&fk.table).is_some_and(|source| {
                source
                    .rows
                    .iter()
                    .any(|row| row.get::<i32>(&fk.column).ok() == Some(key))
            });
            if referenced {
                return Err(fk_violation(&fk.table, &fk.column, table));
            }
        }
        Ok(())
    }

    /// 按名称查找过程：先全名，再去掉 schema 前缀，不区分大小写
    pub fn procedure(&self, name: &str) -> Option<ProcedureFn> {
        let lookup = |n: &str| self.procedures.get(&n.to_ascii_lowercase()).cloned();
        lookup(name).or_else(|| {
            name.split_once('.')
                .and_then(|(_, unqualified)| lookup(unqualified))
        })
    }
}

fn missing_relation(name: &str) -> AppError {
    AppError::database(format!("relation \"{}\" does not exist", name))
}

fn fk_violation(table: &str, column: &str, references: &str) -> AppError {
    AppError::database(format!(
        "insert or update on table \"{}\" violates foreign key constraint \"{}_{}_fkey\" referencing \"{}\"",
        table, table, column, references
    ))
}

/// 共享的内存数据库
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_schema(self, schema: impl Into<String>) -> Self {
        self.state().default_schema = Some(schema.into());
        self
    }

    /// 建表，主键列为 `id`
    pub fn create_table(&self, name: &str) -> &Self {
        self.create_table_with_key(name, "id")
    }

    pub fn create_table_with_key(&self, name: &str, key: &str) -> &Self {
        self.state()
            .tables
            .entry(name.to_string())
            .or_insert_with(|| MemoryTable::new(key));
        self
    }

    /// 非空约束
    pub fn not_null(&self, table: &str, column: &str) -> &Self {
        if let Some(meta) = self.state().tables.get_mut(table) {
            meta.not_null.push(column.to_string());
        }
        self
    }

    /// 外键约束：`table.column` 引用 `references` 的主键
    pub fn foreign_key(&self, table: &str, column: &str, references: &str) -> &Self {
        self.state().foreign_keys.push(ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
            references: references.to_string(),
        });
        self
    }

    /// 注册存储过程或原始命令的处理函数，名称不区分大小写
    pub fn register_procedure<F>(&self, name: &str, procedure: F) -> &Self
    where
        F: Fn(&[Parameter]) -> AppResult<Vec<ResultSet>> + Send + Sync + 'static,
    {
        self.state()
            .procedures
            .insert(name.to_ascii_lowercase(), Arc::new(procedure));
        self
    }

    /// 直接写入一行（绕过会话与日志），返回分配的主键
    pub fn seed(&self, table: &str, row: Record) -> AppResult<EntityKey> {
        let mut state = self.state();
        let meta = state.table_mut(table)?;
        let key = meta.next_key;
        meta.next_key += 1;

        let mut stored = Record::new().with(meta.key.clone(), key);
        for (column, value) in row.iter() {
            if !column.eq_ignore_ascii_case(&meta.key) {
                stored.push(column, value.clone());
            }
        }
        meta.rows.push(stored);
        Ok(key)
    }

    /// 表中当前的所有行
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state()
            .tables
            .get(table)
            .map(|meta| meta.rows.clone())
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<SessionEvent> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// 新会话（一条独立连接）
    pub fn session(&self) -> MemorySession {
        MemorySession::new(self.clone())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
