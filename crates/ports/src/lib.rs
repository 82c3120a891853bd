//! ports - 抽象 trait 层
//!
//! 定义数据库会话、命令描述和事务控制的抽象接口

mod command;
mod isolation;
mod session;
mod unit_of_work;

pub use command::*;
pub use isolation::*;
pub use session::*;
pub use unit_of_work::*;
