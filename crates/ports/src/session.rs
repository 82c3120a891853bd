//! 数据库会话 trait 定义
//!
//! 一个 `Session` 对应一条底层连接，由 Unit of Work 独占持有。

use async_trait::async_trait;
use trellis_domain_core::{EntityKey, Record, TableMeta, Value};
use trellis_errors::AppResult;

use crate::command::{Command, ResultSet};
use crate::isolation::IsolationLevel;

/// 数据库会话
///
/// 同一时刻只允许一个调用方使用（单写者），并发保护由持有者负责。
/// 所有存储层错误以 `AppError::Database` 原样返回。
#[async_trait]
pub trait Session: Send {
    /// 存储过程名前缀的默认 schema
    fn default_schema(&self) -> Option<String>;

    /// 连接是否已打开
    fn is_open(&self) -> bool;

    /// 打开连接（已打开时无操作）
    async fn open(&mut self) -> AppResult<()>;

    /// 关闭连接（未打开时无操作）
    async fn close(&mut self) -> AppResult<()>;

    /// 开始事务，`None` 使用数据库默认隔离级别
    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> AppResult<()>;

    /// 提交事务
    async fn commit(&mut self) -> AppResult<()>;

    /// 回滚事务
    async fn rollback(&mut self) -> AppResult<()>;

    /// 读取整张表，顺序为存储的自然顺序
    async fn select_all(&mut self, table: &TableMeta) -> AppResult<Vec<Record>>;

    /// 按主键读取一行
    async fn select_by_key(&mut self, table: &TableMeta, key: EntityKey)
        -> AppResult<Option<Record>>;

    /// 插入一行（`values` 与 `table.columns` 对齐），返回数据库分配的主键
    async fn insert(&mut self, table: &TableMeta, values: &[Value]) -> AppResult<EntityKey>;

    /// 按主键更新一行，返回受影响行数
    async fn update(&mut self, table: &TableMeta, key: EntityKey, values: &[Value])
        -> AppResult<u64>;

    /// 按主键删除一行，返回受影响行数
    async fn delete(&mut self, table: &TableMeta, key: EntityKey) -> AppResult<u64>;

    /// 执行存储过程或原始命令，返回全部结果集
    async fn execute(&mut self, command: &Command) -> AppResult<Vec<ResultSet>>;
}
