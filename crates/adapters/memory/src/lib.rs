//! 内存适配器
//!
//! 进程内的 [`Session`](trellis_ports::Session) 实现，带操作日志和约束检查，
//! 用于测试与本地运行，不需要数据库。

mod session;
mod store;

pub use session::MemorySession;
pub use store::{MemoryStore, ProcedureFn, SessionEvent};
