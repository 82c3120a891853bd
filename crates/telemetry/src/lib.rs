//! telemetry - 可观测性库

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use trellis_errors::{AppError, AppResult};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Unit of Work 刷新次数
pub const UOW_FLUSHES_TOTAL: &str = "trellis_uow_flushes_total";
/// 事务提交次数
pub const UOW_COMMITS_TOTAL: &str = "trellis_uow_commits_total";
/// 事务回滚次数
pub const UOW_ROLLBACKS_TOTAL: &str = "trellis_uow_rollbacks_total";
/// 存储过程执行次数（按 procedure 标签区分）
pub const PROCEDURE_EXECUTIONS_TOTAL: &str = "trellis_procedure_executions_total";

/// 初始化 tracing
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> AppResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::internal(format!("Failed to install Prometheus recorder: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            UOW_FLUSHES_TOTAL,
            UOW_COMMITS_TOTAL,
            UOW_ROLLBACKS_TOTAL,
            PROCEDURE_EXECUTIONS_TOTAL,
        ] {
            assert!(name.starts_with("trellis_"));
            assert!(name.ends_with("_total"));
        }
    }
}
