//! domain-core - 实体模型与行映射
//!
//! 实体、列值和结果行，供 Repository 与存储过程桥共同使用

mod entity;
mod record;
mod value;

pub use entity::*;
pub use record::*;
pub use value::*;
