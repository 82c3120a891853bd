//! Work Service 入口
//!
//! 加载配置、初始化遥测、建立连接池，然后通过 Unit of Work 读取全部作品。

use std::sync::Arc;

use tracing::info;
use trellis_adapter_postgres::{PgSession, PostgresConfig, check_connection, create_pool};
use trellis_config::AppConfig;
use trellis_persistence::DbUnitOfWork;
use trellis_telemetry::{init_metrics, init_tracing, init_tracing_json};
use work_service::{WorkService, WorkServiceImpl};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load("config")?;
    if config.is_production() {
        init_tracing_json(&config.telemetry.log_level);
    } else {
        init_tracing(&config.telemetry.log_level);
    }
    let _metrics = init_metrics()?;

    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        "Runtime initialized"
    );

    let pg_config = PostgresConfig::from_database_config(&config.database)?
        .with_application_name(config.app_name.clone());
    let pool = create_pool(&pg_config).await?;
    check_connection(&pool).await?;

    let session = Box::new(PgSession::new(pool).with_default_schema(pg_config.schema.clone()));
    let uow = Arc::new(match pg_config.isolation_level {
        Some(level) => DbUnitOfWork::with_isolation_level(session, level),
        None => DbUnitOfWork::new(session),
    });

    let service = WorkServiceImpl::new(uow.clone());
    let works = service.get_all().await?;
    info!(count = works.len(), "Works loaded");

    drop(service);
    if let Ok(uow) = Arc::try_unwrap(uow) {
        uow.dispose().await?;
    }
    Ok(())
}
