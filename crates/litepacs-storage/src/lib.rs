//! # LitePACS Storage
//!
//! 内容寻址的附件存储：不透明二进制负载按uuid落盘，
//! 支持zlib压缩与MD5完整性校验。

pub mod accessor;
pub mod compression;
pub mod filesystem;

pub use accessor::StorageAccessor;
pub use filesystem::FilesystemStorage;
