//! # LitePACS Index
//!
//! 事务性索引数据库：患者/检查/系列/实例四层结构、DICOM标签、
//! 标识符索引、元数据、附件描述、变更日志、转发日志与患者回收顺序，
//! 全部落在单个嵌入式SQLite文件中，不依赖外部数据库服务。

pub mod attachments;
pub mod changes;
pub mod database;
pub mod deletion;
pub mod identifiers;
pub mod metadata;
pub mod recycling;
pub mod schema;

pub use database::{IndexDatabase, IndexTransaction};
pub use deletion::DeletionOutcome;
pub use recycling::RecyclingQuota;
