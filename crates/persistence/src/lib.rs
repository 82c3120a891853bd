//! persistence - Unit of Work、Repository 与存储过程执行桥
//!
//! 对外只暴露 [`DbUnitOfWork`]、[`Repository`] 和 [`ProcedureCommand`]；
//! 会话状态（变更跟踪、标识映射、事务句柄）留在 crate 内部。

mod cancel;
mod context;
mod procedure;
mod repository;
mod unit_of_work;

pub use context::TransactionHandle;
pub use procedure::{ProcedureCommand, ProcedureResults};
pub use repository::Repository;
pub use unit_of_work::DbUnitOfWork;

pub use trellis_ports::{CommandBehavior, IsolationLevel, ParameterDirection, UnitOfWork};
