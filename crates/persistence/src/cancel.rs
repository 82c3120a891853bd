use std::future::Future;

use tokio_util::sync::CancellationToken;
use trellis_errors::{AppError, AppResult};

/// 取消信号触发时放弃 `fut` 并返回 `AppError::Cancelled`
///
/// 不做任何回滚，活动事务仍需调用方显式回滚。
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::cancelled("operation cancelled")),
        result = fut => result,
    }
}
