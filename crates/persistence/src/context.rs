//! 会话上下文：变更跟踪、标识映射与刷新
//!
//! 一个 `DbContext` 独占一个 [`Session`]，Unit of Work 持有它，Repository 只持有弱引用。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use trellis_domain_core::{EntityKey, Record, TableMeta, Value, is_temporary_key};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{IsolationLevel, Session};
use trellis_telemetry::UOW_FLUSHES_TOTAL;
use uuid::Uuid;

/// 活动事务句柄
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    /// 事务 ID
    pub id: Uuid,
    /// 开始时间
    pub started_at: DateTime<Utc>,
    /// 隔离级别，`None` 为数据库默认值
    pub isolation_level: Option<IsolationLevel>,
    /// 由刷新自行开启（而非调用方显式开启）
    pub implicit: bool,
}

impl TransactionHandle {
    pub(crate) fn new(isolation_level: Option<IsolationLevel>, implicit: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            isolation_level,
            implicit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 暂存的更改
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub table: TableMeta,
    /// 插入时为临时键
    pub key: EntityKey,
    pub kind: ChangeKind,
    pub values: Vec<Value>,
}

/// 变更跟踪器
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    pending: Vec<PendingChange>,
    next_temporary: EntityKey,
    /// 临时键 -> 数据库键
    resolved: HashMap<EntityKey, EntityKey>,
}

impl ChangeTracker {
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &[PendingChange] {
        &self.pending
    }

    /// 已刷新的临时键换成数据库键，其余原样返回
    pub fn resolve(&self, key: EntityKey) -> EntityKey {
        self.resolved.get(&key).copied().unwrap_or(key)
    }

    pub fn resolved_key(&self, temporary: EntityKey) -> Option<EntityKey> {
        self.resolved.get(&temporary).copied()
    }

    /// 该行是否有尚未刷新的更改
    pub fn has_pending(&self, table: &TableMeta, key: EntityKey) -> bool {
        self.pending
            .iter()
            .any(|c| c.table.name == table.name && c.key == key)
    }

    /// 尚未刷新的插入
    pub fn staged_insert(&self, table: &TableMeta, key: EntityKey) -> Option<&PendingChange> {
        self.pending
            .iter()
            .find(|c| c.kind == ChangeKind::Insert && c.table.name == table.name && c.key == key)
    }

    /// 暂存插入，返回分配的临时键
    pub fn stage_insert(&mut self, table: TableMeta, values: Vec<Value>) -> EntityKey {
        self.next_temporary -= 1;
        let key = self.next_temporary;
        self.pending.push(PendingChange {
            table,
            key,
            kind: ChangeKind::Insert,
            values,
        });
        key
    }

    pub fn stage_update(
        &mut self,
        table: TableMeta,
        key: EntityKey,
        values: Vec<Value>,
    ) -> AppResult<()> {
        let key = self.resolve(key);
        if let Some(existing) = self.find_pending(&table, key, None) {
            match existing.kind {
                ChangeKind::Delete => {
                    return Err(AppError::misuse(format!(
                        "{} {} is staged for deletion and cannot be updated",
                        table.name, key
                    )));
                }
                ChangeKind::Insert | ChangeKind::Update => {
                    existing.values = values;
                    return Ok(());
                }
            }
        }
        if is_temporary_key(key) {
            return Err(AppError::misuse(format!(
                "{} with temporary key {} is not staged in this unit of work",
                table.name, key
            )));
        }
        self.pending.push(PendingChange {
            table,
            key,
            kind: ChangeKind::Update,
            values,
        });
        Ok(())
    }

    pub fn stage_delete(&mut self, table: TableMeta, key: EntityKey) {
        let key = self.resolve(key);
        if is_temporary_key(key) {
            // 尚未写入的插入直接撤销
            self.pending
                .retain(|c| !(c.table.name == table.name && c.key == key));
            return;
        }
        if self
            .find_pending(&table, key, Some(ChangeKind::Delete))
            .is_some()
        {
            return;
        }
        self.pending
            .retain(|c| !(c.table.name == table.name && c.key == key));
        self.pending.push(PendingChange {
            table,
            key,
            kind: ChangeKind::Delete,
            values: Vec::new(),
        });
    }

    /// 刷新成功后清空暂存并记录键映射
    fn complete(&mut self, applied: usize, assigned: &HashMap<EntityKey, EntityKey>) {
        self.pending.drain(..applied.min(self.pending.len()));
        self.resolved.extend(assigned.iter().map(|(k, v)| (*k, *v)));
    }

    /// 丢弃所有暂存更改；已解析的键映射保留，临时键不会复用
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn find_pending(
        &mut self,
        table: &TableMeta,
        key: EntityKey,
        kind: Option<ChangeKind>,
    ) -> Option<&mut PendingChange> {
        self.pending.iter_mut().find(|c| {
            c.table.name == table.name && c.key == key && kind.is_none_or(|k| c.kind == k)
        })
    }
}

/// 会话内标识映射：(表, 主键) -> 行
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    rows: HashMap<(&'static str, EntityKey), Record>,
}

impl IdentityMap {
    pub fn get(&self, table: &TableMeta, key: EntityKey) -> Option<&Record> {
        self.rows.get(&(table.name, key))
    }

    pub fn put(&mut self, table: &TableMeta, key: EntityKey, record: Record) {
        self.rows.insert((table.name, key), record);
    }

    pub fn remove(&mut self, table: &TableMeta, key: EntityKey) {
        self.rows.remove(&(table.name, key));
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// 上下文内的可变状态，由一把异步锁保护
pub(crate) struct ContextState {
    pub session: Box<dyn Session>,
    pub tracker: ChangeTracker,
    pub identity: IdentityMap,
    pub transaction: Option<TransactionHandle>,
    pub isolation_level: Option<IsolationLevel>,
    /// 刷新在写入途中被放弃（取消），已写入的部分仍在暂存列表里，回滚前不能再写
    pub flush_interrupted: bool,
}

struct Applied {
    table: TableMeta,
    key: EntityKey,
    kind: ChangeKind,
    record: Option<Record>,
    rows: usize,
}

impl ContextState {
    /// 把暂存更改写入数据库
    ///
    /// 没有暂存更改时不访问数据库。没有活动事务时在一个隐式事务中写入，
    /// 失败则回滚隐式事务并保留暂存更改。
    pub async fn flush(&mut self) -> AppResult<usize> {
        if self.flush_interrupted {
            return Err(AppError::misuse(
                "a previous flush was interrupted, roll back the transaction before writing again",
            ));
        }
        if !self.tracker.has_changes() {
            return Ok(0);
        }

        let implicit = self.transaction.is_none();
        if implicit {
            self.session.begin(self.isolation_level).await?;
            self.transaction = Some(TransactionHandle::new(self.isolation_level, true));
        }

        let pending = self.tracker.pending().to_vec();
        let mut assigned: HashMap<EntityKey, EntityKey> = HashMap::new();
        let mut applied = Vec::with_capacity(pending.len());
        let mut failure = None;

        self.flush_interrupted = true;
        for change in &pending {
            match self.apply(change, &mut assigned).await {
                Ok(done) => applied.push(done),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            if implicit {
                self.abort_implicit().await;
            } else {
                // 已写入的部分留在调用方的事务里，由调用方决定提交或回滚
                self.tracker.complete(applied.len(), &assigned);
                self.remember(&applied);
            }
            self.flush_interrupted = false;
            return Err(err);
        }

        if implicit {
            if let Err(err) = self.session.commit().await {
                self.abort_implicit().await;
                self.flush_interrupted = false;
                return Err(err);
            }
            self.transaction = None;
        }

        self.tracker.complete(applied.len(), &assigned);
        self.remember(&applied);
        self.flush_interrupted = false;

        let rows: usize = applied.iter().map(|a| a.rows).sum();
        counter!(UOW_FLUSHES_TOTAL).increment(1);
        debug!(changes = applied.len(), rows, implicit, "Pending changes flushed");
        Ok(rows)
    }

    /// 丢弃暂存更改和标识映射
    pub fn discard(&mut self) {
        self.tracker.clear();
        self.identity.clear();
        self.flush_interrupted = false;
    }

    async fn abort_implicit(&mut self) {
        if let Err(e) = self.session.rollback().await {
            warn!(error = %e, "Failed to roll back implicit flush transaction");
        }
        self.transaction = None;
    }

    async fn apply(
        &mut self,
        change: &PendingChange,
        assigned: &mut HashMap<EntityKey, EntityKey>,
    ) -> AppResult<Applied> {
        let table = change.table;
        match change.kind {
            ChangeKind::Insert => {
                let values = self.fix_up(&table, &change.values, assigned)?;
                let key = self.session.insert(&table, &values).await?;
                assigned.insert(change.key, key);
                Ok(Applied {
                    table,
                    key,
                    kind: change.kind,
                    record: Some(build_record(&table, key, &values)),
                    rows: 1,
                })
            }
            ChangeKind::Update => {
                let values = self.fix_up(&table, &change.values, assigned)?;
                let rows = self.session.update(&table, change.key, &values).await?;
                expect_one_row(&table, change.key, rows)?;
                Ok(Applied {
                    table,
                    key: change.key,
                    kind: change.kind,
                    record: Some(build_record(&table, change.key, &values)),
                    rows: 1,
                })
            }
            ChangeKind::Delete => {
                let rows = self.session.delete(&table, change.key).await?;
                expect_one_row(&table, change.key, rows)?;
                Ok(Applied {
                    table,
                    key: change.key,
                    kind: change.kind,
                    record: None,
                    rows: 1,
                })
            }
        }
    }

    /// 外键列中的临时键替换为数据库键
    fn fix_up(
        &self,
        table: &TableMeta,
        values: &[Value],
        assigned: &HashMap<EntityKey, EntityKey>,
    ) -> AppResult<Vec<Value>> {
        let mut fixed = values.to_vec();
        for (idx, column) in table.columns.iter().enumerate() {
            if !table.is_foreign_key(column) {
                continue;
            }
            if let Some(Value::Int(Some(key))) = fixed.get(idx) {
                let key = *key;
                if is_temporary_key(key) {
                    let real = assigned
                        .get(&key)
                        .copied()
                        .or_else(|| self.tracker.resolved_key(key))
                        .ok_or_else(|| {
                            AppError::misuse(format!(
                                "{}.{} references temporary key {} that was never staged",
                                table.name, column, key
                            ))
                        })?;
                    fixed[idx] = Value::Int(Some(real));
                }
            }
        }
        Ok(fixed)
    }

    fn remember(&mut self, applied: &[Applied]) {
        for done in applied {
            match (&done.kind, &done.record) {
                (ChangeKind::Delete, _) => self.identity.remove(&done.table, done.key),
                (_, Some(record)) => self.identity.put(&done.table, done.key, record.clone()),
                (_, None) => {}
            }
        }
    }
}

fn expect_one_row(table: &TableMeta, key: EntityKey, rows: u64) -> AppResult<()> {
    if rows == 0 {
        return Err(AppError::conflict(format!(
            "{} {} no longer exists in the store",
            table.name, key
        )));
    }
    Ok(())
}

pub(crate) fn build_record(table: &TableMeta, key: EntityKey, values: &[Value]) -> Record {
    let mut record = Record::new().with(table.key, key);
    for (column, value) in table.columns.iter().zip(values) {
        record.push(*column, value.clone());
    }
    record
}

/// 共享上下文
pub(crate) struct DbContext {
    state: Mutex<ContextState>,
    default_schema: Option<String>,
}

impl DbContext {
    pub fn new(session: Box<dyn Session>, isolation_level: Option<IsolationLevel>) -> Self {
        Self {
            default_schema: session.default_schema(),
            state: Mutex::new(ContextState {
                session,
                tracker: ChangeTracker::default(),
                identity: IdentityMap::default(),
                transaction: None,
                isolation_level,
                flush_interrupted: false,
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().await
    }

    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }
}
