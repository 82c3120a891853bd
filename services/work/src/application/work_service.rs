//! Work 应用服务
//!
//! 读操作直接经由仓储；写操作包在事务里：开启事务，仓储操作只暂存，
//! 成功时提交，任何错误都先回滚再原样返回。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use trellis_domain_core::EntityKey;
use trellis_errors::{AppError, AppResult};
use trellis_persistence::{DbUnitOfWork, Repository};

use crate::domain::Work;

/// Work 服务边界
#[async_trait]
pub trait WorkService: Send + Sync {
    async fn get_all(&self) -> AppResult<Vec<Work>>;

    /// 不存在时返回 `NotFound`
    async fn get_one(&self, id: EntityKey) -> AppResult<Work>;

    /// 保存新作品，返回带数据库主键的实体
    async fn add(&self, work: Work) -> AppResult<Work>;

    /// 用调用方给出的字段覆盖已有作品
    async fn update(&self, work: Work) -> AppResult<Work>;

    async fn delete(&self, id: EntityKey) -> AppResult<()>;
}

pub struct WorkServiceImpl {
    uow: Arc<DbUnitOfWork>,
}

impl WorkServiceImpl {
    pub fn new(uow: Arc<DbUnitOfWork>) -> Self {
        Self { uow }
    }

    fn works(&self) -> AppResult<Arc<Repository<Work>>> {
        self.uow.repository::<Work>()
    }

    async fn existing(works: &Repository<Work>, id: EntityKey) -> AppResult<Work> {
        works
            .find(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Work {} not found", id)))
    }

    /// 成功则提交，失败则回滚并返回原错误
    async fn finish<R>(&self, result: AppResult<R>) -> AppResult<R> {
        let error = match result {
            Ok(value) => match self.uow.commit_transaction().await {
                Ok(()) => return Ok(value),
                Err(e) => e,
            },
            Err(e) => e,
        };

        warn!(error = %error, "Work operation failed, rolling back");
        self.uow.rollback_transaction().await?;
        Err(error)
    }
}

#[async_trait]
impl WorkService for WorkServiceImpl {
    async fn get_all(&self) -> AppResult<Vec<Work>> {
        self.works()?.get_all().await
    }

    async fn get_one(&self, id: EntityKey) -> AppResult<Work> {
        Self::existing(&*self.works()?, id).await
    }

    async fn add(&self, mut work: Work) -> AppResult<Work> {
        let works = self.works()?;
        self.uow.begin_transaction().await?;

        let result = works.insert(&mut work, true).await;
        self.finish(result).await?;

        info!(work_id = work.id, "Work added");
        Ok(work)
    }

    async fn update(&self, work: Work) -> AppResult<Work> {
        let works = self.works()?;
        self.uow.begin_transaction().await?;

        let result = async {
            let mut existing = Self::existing(&works, work.id).await?;
            existing.name = work.name;
            works.update(&existing, false).await?;
            Ok(existing)
        }
        .await;
        let updated = self.finish(result).await?;

        info!(work_id = updated.id, "Work updated");
        Ok(updated)
    }

    async fn delete(&self, id: EntityKey) -> AppResult<()> {
        let works = self.works()?;
        self.uow.begin_transaction().await?;

        let result = async {
            let existing = Self::existing(&works, id).await?;
            works.delete(&existing, false).await
        }
        .await;
        self.finish(result).await?;

        info!(work_id = id, "Work deleted");
        Ok(())
    }
}
