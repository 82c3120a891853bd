//! PostgreSQL 配置模块
//!
//! 连接池、SSL、默认 schema 与语句超时设置

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use trellis_config::DatabaseConfig;
use trellis_errors::AppResult;
use trellis_ports::IsolationLevel;

/// SSL 模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// 禁用 SSL
    Disable,
    /// 允许 SSL（如果服务器支持）
    #[default]
    Prefer,
    /// 要求 SSL
    Require,
    /// 验证 CA 证书
    VerifyCa,
    /// 验证完整证书链
    VerifyFull,
}

impl SslMode {
    /// 转换为连接串中的 sslmode 值
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

/// PostgreSQL 配置
#[derive(Clone)]
pub struct PostgresConfig {
    /// 数据库 URL（不含查询参数）
    pub url: String,
    /// 默认 schema：写入 search_path，并作为存储过程名前缀
    pub schema: Option<String>,
    /// SSL 模式
    pub ssl_mode: SslMode,

    // 连接池配置
    /// 最小连接数
    pub pool_min: u32,
    /// 最大连接数
    pub pool_max: u32,
    /// 空闲超时
    pub idle_timeout: Duration,
    /// 获取连接超时
    pub acquire_timeout: Duration,
    /// 连接最大生命周期
    pub max_lifetime: Option<Duration>,

    /// 单条语句超时，由服务器执行
    pub statement_timeout: Option<Duration>,
    /// Unit of Work 使用的隔离级别
    pub isolation_level: Option<IsolationLevel>,
    /// 应用名称（用于连接标识）
    pub application_name: Option<String>,
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("url", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .field("statement_timeout", &self.statement_timeout)
            .field("isolation_level", &self.isolation_level)
            .finish_non_exhaustive()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: None,
            ssl_mode: SslMode::default(),
            pool_min: 1,
            pool_max: 10,
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(1800)),
            statement_timeout: None,
            isolation_level: None,
            application_name: None,
        }
    }
}

impl PostgresConfig {
    /// 从 URL 创建配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 从应用配置的数据库段创建
    pub fn from_database_config(config: &DatabaseConfig) -> AppResult<Self> {
        let isolation_level = config
            .isolation_level
            .as_deref()
            .map(str::parse::<IsolationLevel>)
            .transpose()?;

        let mut pg = Self::new(config.url.expose_secret().clone())
            .with_pool(1, config.max_connections)
            .with_statement_timeout(Duration::from_secs(config.command_timeout_secs));
        pg.schema = config.default_schema.clone();
        pg.isolation_level = isolation_level;
        Ok(pg)
    }

    /// 设置 Schema
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// 设置 SSL 模式
    pub fn with_ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// 设置连接池配置
    pub fn with_pool(mut self, min: u32, max: u32) -> Self {
        self.pool_min = min.min(max);
        self.pool_max = max;
        self
    }

    /// 设置获取连接超时
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// 设置应用名称
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// 获取带 SSL 与会话参数的连接 URL
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();
        let mut params = vec![format!("sslmode={}", self.ssl_mode.as_str())];

        if let Some(ref app_name) = self.application_name {
            params.push(format!("application_name={}", app_name));
        }

        let mut options = Vec::new();
        if let Some(ref schema) = self.schema {
            options.push(format!("--search_path%3D{}", schema));
        }
        if let Some(timeout) = self.statement_timeout {
            options.push(format!("--statement_timeout%3D{}", timeout.as_millis()));
        }
        if !options.is_empty() {
            params.push(format!("options={}", options.join("%20")));
        }

        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&params.join("&"));
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    #[test]
    fn test_default_config() {
        let config = PostgresConfig::default();
        assert_eq!(config.pool_min, 1);
        assert_eq!(config.pool_max, 10);
        assert_eq!(config.ssl_mode, SslMode::Prefer);
        assert_eq!(config.statement_timeout, None);
    }

    #[test]
    fn test_ssl_mode() {
        assert_eq!(SslMode::Disable.as_str(), "disable");
        assert_eq!(SslMode::Prefer.as_str(), "prefer");
        assert_eq!(SslMode::Require.as_str(), "require");
        assert_eq!(SslMode::VerifyCa.as_str(), "verify-ca");
        assert_eq!(SslMode::VerifyFull.as_str(), "verify-full");
    }

    #[test]
    fn test_connection_url() {
        let config = PostgresConfig::new("postgres://user@localhost:5432/mydb")
            .with_ssl_mode(SslMode::Require)
            .with_application_name("test_app")
            .with_schema("dbo")
            .with_statement_timeout(Duration::from_secs(120));

        let url = config.connection_url();
        assert!(url.starts_with("postgres://user@localhost:5432/mydb?sslmode=require"));
        assert!(url.contains("application_name=test_app"));
        assert!(url.contains("options=--search_path%3Ddbo%20--statement_timeout%3D120000"));
    }

    #[test]
    fn test_connection_url_keeps_existing_query() {
        let url = PostgresConfig::new("postgres://localhost/db?connect_timeout=5").connection_url();
        assert_eq!(url, "postgres://localhost/db?connect_timeout=5&sslmode=prefer");
    }

    #[test]
    fn test_from_database_config() {
        let db = DatabaseConfig {
            url: Secret::new("postgres://app:secret@db/works".to_string()),
            max_connections: 20,
            command_timeout_secs: 30,
            default_schema: Some("dbo".into()),
            isolation_level: Some("repeatable-read".into()),
        };

        let config = PostgresConfig::from_database_config(&db).unwrap();
        assert_eq!(config.pool_max, 20);
        assert_eq!(config.statement_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.schema.as_deref(), Some("dbo"));
        assert_eq!(config.isolation_level, Some(IsolationLevel::RepeatableRead));
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_from_database_config_rejects_unknown_isolation() {
        let db = DatabaseConfig {
            url: Secret::new("postgres://db/works".to_string()),
            max_connections: 5,
            command_timeout_secs: 30,
            default_schema: None,
            isolation_level: Some("snapshot".into()),
        };

        assert!(PostgresConfig::from_database_config(&db).is_err());
    }
}
