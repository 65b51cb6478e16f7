//! 配置管理
//!
//! 支持配置文件与LITEPACS_前缀环境变量两种来源。

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// 存储核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 最大患者数量，0表示不限制
    pub max_patient_count: u32,
    /// 最大存储大小（字节），0表示不限制
    pub max_storage_size: u64,
    /// 是否对附件启用zlib压缩
    pub compression_enabled: bool,
    /// 是否为附件记录并校验MD5
    pub store_md5_for_attachments: bool,
    /// 索引数据库路径，":memory:"表示内存数据库
    pub database_path: String,
    /// 附件存储根目录
    pub storage_path: String,
    /// 优化查询路径的结果数上限，0表示不限制
    pub limit_find_results: u32,
    /// 非优化查询路径扫描的实例数上限，0表示不限制
    pub limit_find_instances: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_patient_count: 0,
            max_storage_size: 0,
            compression_enabled: true,
            store_md5_for_attachments: true,
            database_path: "./data/index.db".to_string(),
            storage_path: "./data/storage".to_string(),
            limit_find_results: 100,
            limit_find_instances: 100,
        }
    }
}

/// HTTP管理接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8042,
        }
    }
}

/// 服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 存储核心配置
    pub store: StoreConfig,
    /// HTTP接口配置
    pub http: HttpConfig,
    /// 日志过滤表达式
    pub log_filter: Option<String>,
}

impl ServerConfig {
    /// 从配置文件和环境变量加载
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("LITEPACS").separator("__"))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let config: ServerConfig = settings
            .try_deserialize()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }
}
