//! trellis-adapter-postgres - PostgreSQL 适配器

mod codec;
mod config;
mod connection;
mod session;
pub mod sql;

pub use config::*;
pub use connection::*;
pub use session::*;
