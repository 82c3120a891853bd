//! Work Service - 作品服务
//!
//! 演示数据访问层的用法：仓储读写、事务边界与存储过程读取。

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{WorkService, WorkServiceImpl};
pub use domain::Work;
pub use infrastructure::WorkProcedures;
