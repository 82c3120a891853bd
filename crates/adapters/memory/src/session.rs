use async_trait::async_trait;
use tracing::warn;
use trellis_domain_core::{EntityKey, Record, TableMeta, Value};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{Command, IsolationLevel, ResultSet, Session};

use crate::store::{MemoryStore, SessionEvent, StoreState, Tables};

/// 内存会话
///
/// 首次使用时自动打开。事务开始时对全部表做快照，回滚时恢复。
pub struct MemorySession {
    store: MemoryStore,
    open: bool,
    snapshot: Option<Tables>,
}

impl MemorySession {
    pub(crate) fn new(store: MemoryStore) -> Self {
        Self {
            store,
            open: false,
            snapshot: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    /// 自动打开并记录事件，返回存储状态
    fn enter(&mut self, event: SessionEvent) -> std::sync::MutexGuard<'_, StoreState> {
        let mut state = self.store.state();
        if !self.open {
            state.journal.push(SessionEvent::Open);
            self.open = true;
        }
        state.journal.push(event);
        state
    }
}

fn row_from(table: &TableMeta, key: EntityKey, key_column: &str, values: &[Value]) -> AppResult<Record> {
    if values.len() != table.columns.len() {
        return Err(AppError::database(format!(
            "INSERT/UPDATE on \"{}\" has {} values for {} columns",
            table.name,
            values.len(),
            table.columns.len()
        )));
    }
    let mut row = Record::new().with(key_column, key);
    for (column, value) in table.columns.iter().zip(values) {
        row.push(*column, value.clone());
    }
    Ok(row)
}

#[async_trait]
impl Session for MemorySession {
    fn default_schema(&self) -> Option<String> {
        self.store.state().default_schema.clone()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> AppResult<()> {
        if !self.open {
            self.store.state().journal.push(SessionEvent::Open);
            self.open = true;
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.open {
            return Ok(());
        }
        if self.snapshot.is_some() {
            // 关闭连接时未提交的事务被丢弃
            self.rollback().await?;
        }
        self.store.state().journal.push(SessionEvent::Close);
        self.open = false;
        Ok(())
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> AppResult<()> {
        if self.snapshot.is_some() {
            return Err(AppError::database("there is already a transaction in progress"));
        }
        let snapshot = self.enter(SessionEvent::Begin(isolation)).tables.clone();
        self.snapshot = Some(snapshot);
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        if self.snapshot.take().is_none() {
            return Err(AppError::database("there is no transaction in progress"));
        }
        self.enter(SessionEvent::Commit);
        Ok(())
    }

    async fn rollback(&mut self) -> AppResult<()> {
        let Some(snapshot) = self.snapshot.take() else {
            warn!("Rollback requested without a transaction in progress");
            return Ok(());
        };
        self.enter(SessionEvent::Rollback).tables = snapshot;
        Ok(())
    }

    async fn select_all(&mut self, table: &TableMeta) -> AppResult<Vec<Record>> {
        let state = self.enter(SessionEvent::Select {
            table: table.name.to_string(),
        });
        Ok(state.table(table.name)?.rows.clone())
    }

    async fn select_by_key(
        &mut self,
        table: &TableMeta,
        key: EntityKey,
    ) -> AppResult<Option<Record>> {
        let state = self.enter(SessionEvent::Select {
            table: table.name.to_string(),
        });
        let meta = state.table(table.name)?;
        Ok(meta.position(key).map(|idx| meta.rows[idx].clone()))
    }

    async fn insert(&mut self, table: &TableMeta, values: &[Value]) -> AppResult<EntityKey> {
        let mut state = self.store.state();
        let meta = state.table(table.name)?;
        let key = meta.next_key;
        let row = row_from(table, key, &meta.key.clone(), values)?;
        state.check_row(table.name, &row)?;

        let meta = state.table_mut(table.name)?;
        meta.next_key += 1;
        meta.rows.push(row);
        drop(state);

        self.enter(SessionEvent::Insert {
            table: table.name.to_string(),
            key,
        });
        Ok(key)
    }

    async fn update(&mut self, table: &TableMeta, key: EntityKey, values: &[Value]) -> AppResult<u64> {
        let mut state = self.enter(SessionEvent::Update {
            table: table.name.to_string(),
            key,
        });
        let meta = state.table(table.name)?;
        let Some(idx) = meta.position(key) else {
            return Ok(0);
        };
        let row = row_from(table, key, &meta.key.clone(), values)?;
        state.check_row(table.name, &row)?;

        state.table_mut(table.name)?.rows[idx] = row;
        Ok(1)
    }

    async fn delete(&mut self, table: &TableMeta, key: EntityKey) -> AppResult<u64> {
        let mut state = self.enter(SessionEvent::Delete {
            table: table.name.to_string(),
            key,
        });
        let Some(idx) = state.table(table.name)?.position(key) else {
            return Ok(0);
        };
        state.check_unreferenced(table.name, key)?;

        state.table_mut(table.name)?.rows.remove(idx);
        Ok(1)
    }

    async fn execute(&mut self, command: &Command) -> AppResult<Vec<ResultSet>> {
        let procedure = {
            let state = self.enter(SessionEvent::Execute {
                command: command.text.clone(),
            });
            state.procedure(&command.text)
        };
        let procedure = procedure.ok_or_else(|| {
            AppError::database(format!("function {}() does not exist", command.text))
        })?;

        let inputs: Vec<_> = command.input_parameters().cloned().collect();
        procedure(&inputs)
    }
}
