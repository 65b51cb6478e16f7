//! 错误定义模块

use thiserror::Error;

/// LitePACS系统统一错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("缺少必需的DICOM标签: {0}")]
    MissingRequiredTag(String),

    #[error("资源已存在: {0}")]
    DuplicateResource(String),

    #[error("资源未找到: {0}")]
    UnknownResource(String),

    #[error("附件内容损坏: {0}")]
    CorruptedFile(String),

    #[error("磁盘空间不足")]
    DiskFull,

    #[error("存储已满，无可回收的患者")]
    FullStorage,

    #[error("数据库忙，请重试")]
    DatabaseBusy,

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("文件格式错误: {0}")]
    BadFileFormat(String),

    #[error("内存不足")]
    NotEnoughMemory,

    #[error("调用顺序错误: {0}")]
    BadSequenceOfCalls(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// LitePACS系统统一结果类型
pub type Result<T> = std::result::Result<T, StoreError>;
