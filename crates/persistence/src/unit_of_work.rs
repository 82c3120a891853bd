//! 基于会话的 Unit of Work 实现

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_domain_core::{Entity, EntityKey};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{Command, IsolationLevel, Session, UnitOfWork};
use trellis_telemetry::{UOW_COMMITS_TOTAL, UOW_ROLLBACKS_TOTAL};

use crate::cancel::cancellable;
use crate::context::{DbContext, TransactionHandle};
use crate::procedure::ProcedureCommand;
use crate::repository::{Repository, qualified_procedure};

type RepositoryCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Unit of Work
///
/// 独占一个会话和至多一个活动事务；每个实体类型的 Repository 首次请求时创建并缓存。
pub struct DbUnitOfWork {
    context: Arc<DbContext>,
    repositories: Mutex<RepositoryCache>,
}

impl DbUnitOfWork {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self::build(session, None)
    }

    /// 显式事务（包括刷新开启的隐式事务）使用给定隔离级别
    pub fn with_isolation_level(session: Box<dyn Session>, level: IsolationLevel) -> Self {
        Self::build(session, Some(level))
    }

    fn build(session: Box<dyn Session>, isolation_level: Option<IsolationLevel>) -> Self {
        Self {
            context: Arc::new(DbContext::new(session, isolation_level)),
            repositories: Mutex::new(HashMap::new()),
        }
    }

    /// 实体 `T` 的 Repository，同一 Unit of Work 内总是同一个实例
    pub fn repository<T: Entity>(&self) -> AppResult<Arc<Repository<T>>> {
        let cached = {
            let mut cache = self
                .repositories
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(TypeId::of::<T>()).or_insert_with(|| {
                debug!(table = T::TABLE.name, "Repository created");
                Arc::new(Repository::<T>::new(Arc::downgrade(&self.context)))
                    as Arc<dyn Any + Send + Sync>
            }))
        };

        cached.downcast::<Repository<T>>().map_err(|_| {
            AppError::internal(format!(
                "repository cache entry for '{}' has an unexpected type",
                T::TABLE.name
            ))
        })
    }

    /// 刷新暂存的更改，返回写入的行数
    ///
    /// 取消时返回 `AppError::Cancelled`；刷新开启的隐式事务保持登记，需要调用方回滚。
    /// 写入途中被取消后，回滚之前的刷新和提交都返回 `AppError::Misuse`。
    pub async fn save_changes(&self, cancel: &CancellationToken) -> AppResult<usize> {
        cancellable(cancel, async {
            let mut state = self.context.lock().await;
            state.flush().await
        })
        .await
    }

    /// 开始事务，已有活动事务时无操作
    pub async fn begin_transaction(&self) -> AppResult<()> {
        let mut state = self.context.lock().await;
        if let Some(active) = &state.transaction {
            debug!(transaction_id = %active.id, "Transaction already active");
            return Ok(());
        }

        let level = state.isolation_level;
        state.session.begin(level).await?;
        let handle = TransactionHandle::new(level, false);
        debug!(
            transaction_id = %handle.id,
            isolation_level = ?handle.isolation_level,
            "Transaction started"
        );
        state.transaction = Some(handle);
        Ok(())
    }

    /// 先刷新暂存的更改，再提交活动事务
    ///
    /// 没有暂存更改也没有活动事务时不访问数据库。
    pub async fn commit_transaction(&self) -> AppResult<()> {
        let mut state = self.context.lock().await;
        state.flush().await?;

        let Some(handle) = state.transaction.take() else {
            return Ok(());
        };
        if let Err(e) = state.session.commit().await {
            state.transaction = Some(handle);
            return Err(e);
        }

        counter!(UOW_COMMITS_TOTAL).increment(1);
        info!(
            transaction_id = %handle.id,
            elapsed_ms = (Utc::now() - handle.started_at).num_milliseconds(),
            "Transaction committed"
        );
        Ok(())
    }

    /// 回滚活动事务并丢弃暂存的更改，没有活动事务时无操作
    pub async fn rollback_transaction(&self) -> AppResult<()> {
        let mut state = self.context.lock().await;
        let Some(handle) = state.transaction.take() else {
            return Ok(());
        };

        state.discard();
        state.session.rollback().await?;

        counter!(UOW_ROLLBACKS_TOTAL).increment(1);
        info!(transaction_id = %handle.id, implicit = handle.implicit, "Transaction rolled back");
        Ok(())
    }

    pub async fn has_active_transaction(&self) -> bool {
        self.context.lock().await.transaction.is_some()
    }

    /// 当前活动事务
    pub async fn transaction(&self) -> Option<TransactionHandle> {
        self.context.lock().await.transaction.clone()
    }

    /// 调用存储过程，`prepend_default_schema` 为 true 时加会话的默认 schema 前缀
    pub fn load_procedure(&self, name: &str, prepend_default_schema: bool) -> ProcedureCommand {
        let command = qualified_procedure(
            self.context.default_schema(),
            name,
            prepend_default_schema,
        );
        ProcedureCommand::new(Arc::downgrade(&self.context), command)
    }

    /// 执行原始 SQL
    pub fn load_command(&self, text: &str) -> ProcedureCommand {
        ProcedureCommand::new(Arc::downgrade(&self.context), Command::text(text))
    }

    /// 已刷新的临时键对应的数据库键
    pub async fn resolve_key(&self, temporary: EntityKey) -> Option<EntityKey> {
        self.context.lock().await.tracker.resolved_key(temporary)
    }

    /// 释放：回滚仍活动的事务并关闭连接
    ///
    /// 之后已取出的 Repository 和命令再使用会返回 `AppError::Misuse`。
    pub async fn dispose(self) -> AppResult<()> {
        let mut state = self.context.lock().await;
        let mut result = Ok(());

        if let Some(handle) = state.transaction.take() {
            state.discard();
            match state.session.rollback().await {
                Ok(()) => {
                    counter!(UOW_ROLLBACKS_TOTAL).increment(1);
                    warn!(transaction_id = %handle.id, "Active transaction rolled back on dispose");
                }
                Err(e) => result = Err(e),
            }
        }

        if state.session.is_open() {
            if let Err(e) = state.session.close().await {
                if result.is_ok() {
                    result = Err(e);
                } else {
                    warn!(error = %e, "Failed to close connection on dispose");
                }
            }
        }

        debug!("Unit of work disposed");
        result
    }
}

#[async_trait]
impl UnitOfWork for DbUnitOfWork {
    async fn begin_transaction(&self) -> AppResult<()> {
        DbUnitOfWork::begin_transaction(self).await
    }

    async fn commit_transaction(&self) -> AppResult<()> {
        DbUnitOfWork::commit_transaction(self).await
    }

    async fn rollback_transaction(&self) -> AppResult<()> {
        DbUnitOfWork::rollback_transaction(self).await
    }

    async fn save_changes(&self, cancel: &CancellationToken) -> AppResult<usize> {
        DbUnitOfWork::save_changes(self, cancel).await
    }

    async fn has_active_transaction(&self) -> bool {
        DbUnitOfWork::has_active_transaction(self).await
    }
}
