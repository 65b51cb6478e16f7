//! # LitePACS Engine
//!
//! 存储核心的对外入口：入库流水线、变更分发、查询引擎与实例缓存。
//! 前端（HTTP、DICOM网络）只依赖本模块暴露的编程接口。

pub mod cache;
pub mod context;
pub mod fanout;
pub mod find;
pub mod listener;

pub use context::ServerContext;
pub use find::{ConstraintKind, FindQuery, TagConstraint};
pub use listener::StoreListener;
