//! # LitePACS Web
//!
//! 存储核心之上的REST管理接口。入库端点接受JSON信封
//! （标签摘要加base64负载），信封解码扮演范围之外的DICOM解析器。

pub mod handlers;
pub mod server;

pub use server::{build_router, serve};
