//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// 资源层级，从患者到影像实例共四层
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceLevel {
    /// 层级在数据库中的整数编码
    pub fn as_code(self) -> i64 {
        match self {
            ResourceLevel::Patient => 1,
            ResourceLevel::Study => 2,
            ResourceLevel::Series => 3,
            ResourceLevel::Instance => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ResourceLevel::Patient),
            2 => Ok(ResourceLevel::Study),
            3 => Ok(ResourceLevel::Series),
            4 => Ok(ResourceLevel::Instance),
            _ => Err(StoreError::Internal(format!("无效的资源层级编码: {}", code))),
        }
    }

    /// 下一层级（Patient -> Study等），Instance没有子层级
    pub fn child(self) -> Option<ResourceLevel> {
        match self {
            ResourceLevel::Patient => Some(ResourceLevel::Study),
            ResourceLevel::Study => Some(ResourceLevel::Series),
            ResourceLevel::Series => Some(ResourceLevel::Instance),
            ResourceLevel::Instance => None,
        }
    }

    /// 上一层级，Patient没有父层级
    pub fn parent(self) -> Option<ResourceLevel> {
        match self {
            ResourceLevel::Patient => None,
            ResourceLevel::Study => Some(ResourceLevel::Patient),
            ResourceLevel::Series => Some(ResourceLevel::Study),
            ResourceLevel::Instance => Some(ResourceLevel::Series),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceLevel::Patient => "Patient",
            ResourceLevel::Study => "Study",
            ResourceLevel::Series => "Series",
            ResourceLevel::Instance => "Instance",
        }
    }
}

/// 变更日志条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    CompletedSeries,
    NewSeries,
    NewInstance,
    NewPatient,
    NewStudy,
    Deleted,
}

impl ChangeKind {
    pub fn as_code(self) -> i64 {
        match self {
            ChangeKind::CompletedSeries => 1,
            ChangeKind::NewSeries => 2,
            ChangeKind::NewInstance => 3,
            ChangeKind::NewPatient => 4,
            ChangeKind::NewStudy => 5,
            ChangeKind::Deleted => 6,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ChangeKind::CompletedSeries),
            2 => Ok(ChangeKind::NewSeries),
            3 => Ok(ChangeKind::NewInstance),
            4 => Ok(ChangeKind::NewPatient),
            5 => Ok(ChangeKind::NewStudy),
            6 => Ok(ChangeKind::Deleted),
            _ => Err(StoreError::Internal(format!("无效的变更类型编码: {}", code))),
        }
    }

    /// 资源新建时对应的变更类型
    pub fn for_new_resource(level: ResourceLevel) -> ChangeKind {
        match level {
            ResourceLevel::Patient => ChangeKind::NewPatient,
            ResourceLevel::Study => ChangeKind::NewStudy,
            ResourceLevel::Series => ChangeKind::NewSeries,
            ResourceLevel::Instance => ChangeKind::NewInstance,
        }
    }
}

/// 元数据键，用户自定义范围从1024开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    RemoteAet,
    IndexInSeries,
    ExpectedNumberOfInstances,
    ReceptionDate,
    LastUpdate,
    User(u32),
}

/// 用户自定义元数据键的起始编码
pub const METADATA_USER_RANGE_START: u32 = 1024;

impl MetadataKey {
    pub fn as_code(self) -> i64 {
        match self {
            MetadataKey::RemoteAet => 1,
            MetadataKey::IndexInSeries => 2,
            MetadataKey::ExpectedNumberOfInstances => 3,
            MetadataKey::ReceptionDate => 4,
            MetadataKey::LastUpdate => 7,
            MetadataKey::User(code) => code as i64,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(MetadataKey::RemoteAet),
            2 => Ok(MetadataKey::IndexInSeries),
            3 => Ok(MetadataKey::ExpectedNumberOfInstances),
            4 => Ok(MetadataKey::ReceptionDate),
            7 => Ok(MetadataKey::LastUpdate),
            c if c >= METADATA_USER_RANGE_START as i64 && c <= u32::MAX as i64 => {
                Ok(MetadataKey::User(c as u32))
            }
            _ => Err(StoreError::Internal(format!("无效的元数据键编码: {}", code))),
        }
    }
}

/// 附件内容类型，用户自定义范围从1024开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Dicom,
    DicomAsJson,
    User(u32),
}

impl ContentType {
    pub fn as_code(self) -> i64 {
        match self {
            ContentType::Dicom => 1,
            ContentType::DicomAsJson => 2,
            ContentType::User(code) => code as i64,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(ContentType::Dicom),
            2 => Ok(ContentType::DicomAsJson),
            c if c >= 1024 && c <= u32::MAX as i64 => Ok(ContentType::User(c as u32)),
            _ => Err(StoreError::Internal(format!("无效的附件类型编码: {}", code))),
        }
    }
}

/// 附件压缩算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    None,
    Zlib,
}

impl CompressionKind {
    pub fn as_code(self) -> i64 {
        match self {
            CompressionKind::None => 1,
            CompressionKind::Zlib => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(CompressionKind::None),
            2 => Ok(CompressionKind::Zlib),
            _ => Err(StoreError::Internal(format!("无效的压缩算法编码: {}", code))),
        }
    }
}

/// 附件描述符，uuid是附件存储中的键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub uuid: String,
    pub content_type: ContentType,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression: CompressionKind,
    pub uncompressed_md5: String,
    pub compressed_md5: String,
}

/// 全局属性键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalProperty {
    SchemaVersion,
    FlushInterval,
    AttachmentMd5Policy,
}

impl GlobalProperty {
    pub fn as_code(self) -> i64 {
        match self {
            GlobalProperty::SchemaVersion => 1,
            GlobalProperty::FlushInterval => 2,
            GlobalProperty::AttachmentMd5Policy => 3,
        }
    }
}

/// 入库操作的结果状态，AlreadyStored不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Success,
    AlreadyStored,
    FilteredOut,
    Failure,
    FullStorage,
    MissingRequiredTag,
}

/// 变更日志条目，public_id和level是删除后仍然有效的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub kind: ChangeKind,
    pub level: ResourceLevel,
    pub public_id: String,
    pub date: DateTime<Utc>,
}

/// 资源转发日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedResource {
    pub seq: i64,
    pub level: ResourceLevel,
    pub public_id: String,
    pub remote_aet: String,
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub date: DateTime<Utc>,
}

/// 系列完整性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesStatus {
    Complete,
    Missing,
    Inconsistent,
    Unknown,
}

impl SeriesStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesStatus::Complete => "Complete",
            SeriesStatus::Missing => "Missing",
            SeriesStatus::Inconsistent => "Inconsistent",
            SeriesStatus::Unknown => "Unknown",
        }
    }
}

/// 单个已删除资源的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedResource {
    pub public_id: String,
    pub level: ResourceLevel,
}

/// 删除操作报告：被删除的资源以及仍然保留的最深祖先
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletionReport {
    pub deleted: Vec<DeletedResource>,
    pub remaining_ancestor: Option<DeletedResource>,
}

/// 资源快照，各层级特有字段为Option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub public_id: String,
    pub level: ResourceLevel,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub main_dicom_tags: std::collections::BTreeMap<String, String>,
    /// 仅系列层级：完整性状态
    pub series_status: Option<SeriesStatus>,
    /// 仅系列层级：预期实例数
    pub expected_number_of_instances: Option<u32>,
    /// 仅实例层级：DICOM文件大小与uuid
    pub file_size: Option<u64>,
    pub file_uuid: Option<String>,
    /// 仅实例层级：在系列中的序号
    pub index_in_series: Option<u32>,
}

/// 存储统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total_compressed_size: u64,
    pub total_uncompressed_size: u64,
    pub count_patients: u64,
    pub count_studies: u64,
    pub count_series: u64,
    pub count_instances: u64,
}
