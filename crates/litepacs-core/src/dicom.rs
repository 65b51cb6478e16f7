//! DICOM标签与标签摘要
//!
//! 核心只处理前端解析器产出的标签摘要，不解析像素数据。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::models::ResourceLevel;

/// DICOM标签，(group, element)对
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DicomTag {
    pub group: u16,
    pub element: u16,
}

impl DicomTag {
    pub const fn new(group: u16, element: u16) -> Self {
        Self { group, element }
    }

    /// 从"GGGG,EEEE"形式解析
    pub fn parse(s: &str) -> Result<Self> {
        let (g, e) = s
            .split_once(',')
            .ok_or_else(|| StoreError::BadFileFormat(format!("无效的DICOM标签: {}", s)))?;
        let group = u16::from_str_radix(g.trim(), 16)
            .map_err(|_| StoreError::BadFileFormat(format!("无效的DICOM标签: {}", s)))?;
        let element = u16::from_str_radix(e.trim(), 16)
            .map_err(|_| StoreError::BadFileFormat(format!("无效的DICOM标签: {}", s)))?;
        Ok(Self { group, element })
    }
}

impl fmt::Display for DicomTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x},{:04x}", self.group, self.element)
    }
}

// 层级识别所需的标签
pub const TAG_PATIENT_ID: DicomTag = DicomTag::new(0x0010, 0x0020);
pub const TAG_STUDY_INSTANCE_UID: DicomTag = DicomTag::new(0x0020, 0x000d);
pub const TAG_SERIES_INSTANCE_UID: DicomTag = DicomTag::new(0x0020, 0x000e);
pub const TAG_SOP_INSTANCE_UID: DicomTag = DicomTag::new(0x0008, 0x0018);
pub const TAG_ACCESSION_NUMBER: DicomTag = DicomTag::new(0x0008, 0x0050);

// 患者层级主标签
pub const TAG_PATIENT_NAME: DicomTag = DicomTag::new(0x0010, 0x0010);
pub const TAG_PATIENT_BIRTH_DATE: DicomTag = DicomTag::new(0x0010, 0x0030);
pub const TAG_PATIENT_SEX: DicomTag = DicomTag::new(0x0010, 0x0040);

// 检查层级主标签
pub const TAG_STUDY_DATE: DicomTag = DicomTag::new(0x0008, 0x0020);
pub const TAG_STUDY_TIME: DicomTag = DicomTag::new(0x0008, 0x0030);
pub const TAG_STUDY_ID: DicomTag = DicomTag::new(0x0020, 0x0010);
pub const TAG_STUDY_DESCRIPTION: DicomTag = DicomTag::new(0x0008, 0x1030);
pub const TAG_REFERRING_PHYSICIAN: DicomTag = DicomTag::new(0x0008, 0x0090);

// 系列层级主标签
pub const TAG_SERIES_DATE: DicomTag = DicomTag::new(0x0008, 0x0021);
pub const TAG_SERIES_TIME: DicomTag = DicomTag::new(0x0008, 0x0031);
pub const TAG_MODALITY: DicomTag = DicomTag::new(0x0008, 0x0060);
pub const TAG_MANUFACTURER: DicomTag = DicomTag::new(0x0008, 0x0070);
pub const TAG_SERIES_NUMBER: DicomTag = DicomTag::new(0x0020, 0x0011);
pub const TAG_SERIES_DESCRIPTION: DicomTag = DicomTag::new(0x0008, 0x103e);
pub const TAG_BODY_PART_EXAMINED: DicomTag = DicomTag::new(0x0018, 0x0015);

// 实例层级主标签
pub const TAG_INSTANCE_NUMBER: DicomTag = DicomTag::new(0x0020, 0x0013);
pub const TAG_IMAGE_INDEX: DicomTag = DicomTag::new(0x0054, 0x1330);
pub const TAG_INSTANCE_CREATION_DATE: DicomTag = DicomTag::new(0x0008, 0x0012);
pub const TAG_INSTANCE_CREATION_TIME: DicomTag = DicomTag::new(0x0008, 0x0013);

// 系列预期实例数的候选标签
pub const TAG_NUMBER_OF_SLICES: DicomTag = DicomTag::new(0x0054, 0x0081);
pub const TAG_IMAGES_IN_ACQUISITION: DicomTag = DicomTag::new(0x0020, 0x1002);
pub const TAG_CARDIAC_NUMBER_OF_IMAGES: DicomTag = DicomTag::new(0x0018, 0x1090);

const PATIENT_MAIN_TAGS: &[DicomTag] = &[
    TAG_PATIENT_NAME,
    TAG_PATIENT_ID,
    TAG_PATIENT_BIRTH_DATE,
    TAG_PATIENT_SEX,
];

const STUDY_MAIN_TAGS: &[DicomTag] = &[
    TAG_STUDY_DATE,
    TAG_STUDY_TIME,
    TAG_STUDY_ID,
    TAG_STUDY_INSTANCE_UID,
    TAG_STUDY_DESCRIPTION,
    TAG_ACCESSION_NUMBER,
    TAG_REFERRING_PHYSICIAN,
];

const SERIES_MAIN_TAGS: &[DicomTag] = &[
    TAG_SERIES_DATE,
    TAG_SERIES_TIME,
    TAG_MODALITY,
    TAG_MANUFACTURER,
    TAG_SERIES_NUMBER,
    TAG_SERIES_INSTANCE_UID,
    TAG_SERIES_DESCRIPTION,
    TAG_BODY_PART_EXAMINED,
];

const INSTANCE_MAIN_TAGS: &[DicomTag] = &[
    TAG_SOP_INSTANCE_UID,
    TAG_INSTANCE_NUMBER,
    TAG_IMAGE_INDEX,
    TAG_INSTANCE_CREATION_DATE,
    TAG_INSTANCE_CREATION_TIME,
];

const PATIENT_IDENTIFIER_TAGS: &[DicomTag] = &[TAG_PATIENT_ID];
const STUDY_IDENTIFIER_TAGS: &[DicomTag] = &[TAG_STUDY_INSTANCE_UID, TAG_ACCESSION_NUMBER];
const SERIES_IDENTIFIER_TAGS: &[DicomTag] = &[TAG_SERIES_INSTANCE_UID];
const INSTANCE_IDENTIFIER_TAGS: &[DicomTag] = &[TAG_SOP_INSTANCE_UID];

/// 某层级的主标签集合
pub fn main_tags_for_level(level: ResourceLevel) -> &'static [DicomTag] {
    match level {
        ResourceLevel::Patient => PATIENT_MAIN_TAGS,
        ResourceLevel::Study => STUDY_MAIN_TAGS,
        ResourceLevel::Series => SERIES_MAIN_TAGS,
        ResourceLevel::Instance => INSTANCE_MAIN_TAGS,
    }
}

/// 某层级的索引标识标签集合
pub fn identifier_tags_for_level(level: ResourceLevel) -> &'static [DicomTag] {
    match level {
        ResourceLevel::Patient => PATIENT_IDENTIFIER_TAGS,
        ResourceLevel::Study => STUDY_IDENTIFIER_TAGS,
        ResourceLevel::Series => SERIES_IDENTIFIER_TAGS,
        ResourceLevel::Instance => INSTANCE_IDENTIFIER_TAGS,
    }
}

/// 标签所属的查询层级，未知标签返回None
pub fn level_of_tag(tag: DicomTag) -> Option<ResourceLevel> {
    for level in [
        ResourceLevel::Patient,
        ResourceLevel::Study,
        ResourceLevel::Series,
        ResourceLevel::Instance,
    ] {
        if main_tags_for_level(level).contains(&tag)
            || identifier_tags_for_level(level).contains(&tag)
        {
            return Some(level);
        }
    }
    None
}

/// DICOM标签摘要，标签到字符串值的有序映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DicomMap {
    values: BTreeMap<DicomTag, String>,
}

impl DicomMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: DicomTag, value: impl Into<String>) {
        self.values.insert(tag, value.into());
    }

    pub fn get(&self, tag: DicomTag) -> Option<&str> {
        self.values.get(&tag).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DicomTag, &String)> {
        self.values.iter()
    }

    /// 必需标签的值，缺失或为空时返回MissingRequiredTag
    pub fn required(&self, tag: DicomTag) -> Result<&str> {
        match self.get(tag) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(StoreError::MissingRequiredTag(tag.to_string())),
        }
    }

    /// 提取某层级的主标签子集
    pub fn extract_level(&self, level: ResourceLevel) -> DicomMap {
        let mut result = DicomMap::new();
        for tag in main_tags_for_level(level) {
            if let Some(value) = self.get(*tag) {
                result.set(*tag, value);
            }
        }
        result
    }

    /// 序列化为JSON摘要，键为"gggg,eeee"
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(tag, value)| (tag.to_string(), serde_json::Value::String(value.clone())))
            .collect();
        serde_json::Value::Object(map)
    }

    /// 从JSON摘要反序列化
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| StoreError::BadFileFormat("标签摘要必须是JSON对象".to_string()))?;

        let mut map = DicomMap::new();
        for (key, item) in object {
            let tag = DicomTag::parse(key)?;
            let text = item
                .as_str()
                .ok_or_else(|| StoreError::BadFileFormat(format!("标签{}的值必须是字符串", key)))?;
            map.set(tag, text);
        }
        Ok(map)
    }
}

/// 前端解析器产出的DICOM实例：标签摘要加原始字节
#[derive(Debug, Clone)]
pub struct ParsedDicomInstance {
    pub tags: DicomMap,
    pub data: Vec<u8>,
}

impl ParsedDicomInstance {
    pub fn new(tags: DicomMap, data: Vec<u8>) -> Self {
        Self { tags, data }
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.tags.get(TAG_PATIENT_ID)
    }

    pub fn study_instance_uid(&self) -> Option<&str> {
        self.tags.get(TAG_STUDY_INSTANCE_UID)
    }

    pub fn series_instance_uid(&self) -> Option<&str> {
        self.tags.get(TAG_SERIES_INSTANCE_UID)
    }

    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.tags.get(TAG_SOP_INSTANCE_UID)
    }
}
