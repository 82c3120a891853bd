//! PostgreSQL 会话
//!
//! 每个会话从连接池取一条连接并独占到关闭。事务直接在这条连接上用
//! BEGIN / COMMIT / ROLLBACK 控制，生命周期由 Unit of Work 决定。

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::{Either, PgConnection, PgPool, Postgres, Row};
use tracing::{debug, warn};
use trellis_domain_core::{EntityKey, Record, TableMeta, Value};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{Command, CommandKind, IsolationLevel, ResultSet, Session};

use crate::codec::{bind_all, decode_row, driver_error};
use crate::sql;

/// sqlx 连接上的 [`Session`]
pub struct PgSession {
    pool: PgPool,
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
    default_schema: Option<String>,
}

impl PgSession {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            conn: None,
            in_transaction: false,
            default_schema: None,
        }
    }

    /// 存储过程名的默认 schema 前缀
    pub fn with_default_schema(mut self, schema: Option<String>) -> Self {
        self.default_schema = schema;
        self
    }

    /// 已打开的连接，未打开时先从池中获取
    async fn connection(&mut self) -> AppResult<&mut PgConnection> {
        if self.conn.is_none() {
            self.open().await?;
        }
        self.conn
            .as_deref_mut()
            .ok_or_else(|| AppError::internal("connection is not open"))
    }

    async fn run_statement(&mut self, statement: &str) -> AppResult<()> {
        let conn: &mut PgConnection = self.connection().await?;
        sqlx::Executor::execute(conn, sqlx::raw_sql(statement))
            .await
            .map_err(driver_error)?;
        Ok(())
    }

    async fn fetch_rows(&mut self, statement: &str, values: &[Value]) -> AppResult<Vec<Record>> {
        let conn = self.connection().await?;
        let rows = bind_all(sqlx::query(statement), values)
            .fetch_all(&mut *conn)
            .await
            .map_err(driver_error)?;
        rows.iter().map(decode_row).collect()
    }

    /// 无参数的原始 SQL 可能包含多条语句，每条语句一个结果集
    async fn fetch_sets(&mut self, statement: &str) -> AppResult<Vec<ResultSet>> {
        let conn = self.connection().await?;
        let mut stream = sqlx::raw_sql(statement).fetch_many(&mut *conn);

        let mut sets = Vec::new();
        let mut rows = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(driver_error)? {
            match item {
                Either::Left(_) => sets.push(ResultSet::from_rows(std::mem::take(&mut rows))),
                Either::Right(row) => rows.push(decode_row(&row)?),
            }
        }
        if !rows.is_empty() {
            sets.push(ResultSet::from_rows(rows));
        }
        Ok(sets)
    }
}

#[async_trait]
impl Session for PgSession {
    fn default_schema(&self) -> Option<String> {
        self.default_schema.clone()
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.conn.is_none() {
            let conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| AppError::database(format!("Failed to acquire connection: {}", e)))?;
            self.conn = Some(conn);
            debug!("Connection acquired");
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        if self.in_transaction {
            self.rollback().await?;
        }
        self.conn = None;
        debug!("Connection released");
        Ok(())
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> AppResult<()> {
        self.run_statement(&sql::begin(isolation)).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let result = self.run_statement("COMMIT").await;
        // COMMIT 失败时服务器同样结束了事务
        self.in_transaction = false;
        result
    }

    async fn rollback(&mut self) -> AppResult<()> {
        if !self.in_transaction {
            warn!("Rollback requested without a transaction in progress");
            return Ok(());
        }
        self.in_transaction = false;
        if let Err(e) = self.run_statement("ROLLBACK").await {
            // 连接状态未知，不再归还连接池
            if let Some(conn) = self.conn.take() {
                drop(conn.detach());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn select_all(&mut self, table: &TableMeta) -> AppResult<Vec<Record>> {
        self.fetch_rows(&sql::select_all(table), &[]).await
    }

    async fn select_by_key(
        &mut self,
        table: &TableMeta,
        key: EntityKey,
    ) -> AppResult<Option<Record>> {
        let rows = self
            .fetch_rows(&sql::select_by_key(table), &[Value::from(key)])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert(&mut self, table: &TableMeta, values: &[Value]) -> AppResult<EntityKey> {
        let statement = sql::insert(table);
        let conn = self.connection().await?;
        let row = bind_all(sqlx::query(&statement), values)
            .fetch_one(&mut *conn)
            .await
            .map_err(driver_error)?;
        row.try_get::<i32, _>(0).map_err(driver_error)
    }

    async fn update(&mut self, table: &TableMeta, key: EntityKey, values: &[Value]) -> AppResult<u64> {
        let statement = sql::update(table);
        let conn = self.connection().await?;
        let result = bind_all(sqlx::query(&statement), values)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(driver_error)?;
        Ok(result.rows_affected())
    }

    async fn delete(&mut self, table: &TableMeta, key: EntityKey) -> AppResult<u64> {
        let statement = sql::delete(table);
        let conn = self.connection().await?;
        let result = sqlx::query(&statement)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(driver_error)?;
        Ok(result.rows_affected())
    }

    async fn execute(&mut self, command: &Command) -> AppResult<Vec<ResultSet>> {
        let inputs: Vec<Value> = command.input_parameters().map(|p| p.value.clone()).collect();
        match command.kind {
            CommandKind::StoredProcedure => {
                let rows = self.fetch_rows(&sql::call_procedure(command), &inputs).await?;
                Ok(vec![ResultSet::from_rows(rows)])
            }
            CommandKind::Text if inputs.is_empty() => self.fetch_sets(&command.text).await,
            CommandKind::Text => {
                let rows = self.fetch_rows(&command.text, &inputs).await?;
                Ok(vec![ResultSet::from_rows(rows)])
            }
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // 事务未结束的连接不归还连接池，断开后由服务器回滚
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                warn!("Session dropped with an open transaction, discarding connection");
                drop(conn.detach());
            }
        }
    }
}
