//! Unit of Work trait 定义

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use trellis_errors::AppResult;

/// Unit of Work trait
///
/// 事务控制部分，与具体实体类型无关，服务层通过它编排提交与回滚。
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// 开始事务（已有活动事务时无操作）
    async fn begin_transaction(&self) -> AppResult<()>;

    /// 先刷新暂存的更改，再提交活动事务（没有事务时只刷新）
    async fn commit_transaction(&self) -> AppResult<()>;

    /// 回滚活动事务（没有事务时无操作）
    async fn rollback_transaction(&self) -> AppResult<()>;

    /// 刷新暂存的更改，返回写入的行数
    async fn save_changes(&self, cancel: &CancellationToken) -> AppResult<usize>;

    /// 是否存在活动事务
    async fn has_active_transaction(&self) -> bool;
}
