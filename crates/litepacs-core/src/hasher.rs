//! 稳定公共标识符计算
//!
//! 检查、系列与实例的公共标识符由DICOM UID链的SHA-1哈希确定，
//! 同一实例无论从哪个入口进入都会得到相同的标识符。
//! 患者的公共标识符是随机UUID，患者行的复用由PatientID标识符索引保证。

use sha1::{Digest, Sha1};

use crate::dicom::{
    DicomMap, DicomTag, TAG_PATIENT_ID, TAG_SERIES_INSTANCE_UID, TAG_SOP_INSTANCE_UID,
    TAG_STUDY_INSTANCE_UID,
};
use crate::error::{Result, StoreError};
use crate::utils::is_valid_dicom_uid;

/// 计算SHA-1并格式化为五组8位十六进制，组间以'-'分隔
pub fn compute_sha1(data: &str) -> String {
    let digest = Sha1::digest(data.as_bytes());
    let hex: Vec<String> = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let flat = hex.concat();
    format!(
        "{}-{}-{}-{}-{}",
        &flat[0..8],
        &flat[8..16],
        &flat[16..24],
        &flat[24..32],
        &flat[32..40]
    )
}

/// 由实例的UID链计算检查、系列、实例层级的公共标识符
#[derive(Debug, Clone)]
pub struct InstanceHasher {
    patient_id: String,
    study_uid: String,
    series_uid: String,
    instance_uid: String,
}

impl InstanceHasher {
    /// 从标签摘要构造
    ///
    /// 任一必需UID缺失返回MissingRequiredTag，UID格式非法返回BadFileFormat。
    pub fn new(tags: &DicomMap) -> Result<Self> {
        let required_uid = |tag: DicomTag| -> Result<String> {
            let value = tags.required(tag)?;
            if !is_valid_dicom_uid(value) {
                return Err(StoreError::BadFileFormat(format!(
                    "标签{}不是合法的DICOM UID: {}",
                    tag, value
                )));
            }
            Ok(value.to_string())
        };

        Ok(Self {
            patient_id: tags.required(TAG_PATIENT_ID)?.to_string(),
            study_uid: required_uid(TAG_STUDY_INSTANCE_UID)?,
            series_uid: required_uid(TAG_SERIES_INSTANCE_UID)?,
            instance_uid: required_uid(TAG_SOP_INSTANCE_UID)?,
        })
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn instance_uid(&self) -> &str {
        &self.instance_uid
    }

    pub fn hash_study(&self) -> String {
        compute_sha1(&format!("{}|{}", self.patient_id, self.study_uid))
    }

    pub fn hash_series(&self) -> String {
        compute_sha1(&format!(
            "{}|{}|{}",
            self.patient_id, self.study_uid, self.series_uid
        ))
    }

    pub fn hash_instance(&self) -> String {
        compute_sha1(&format!(
            "{}|{}|{}|{}",
            self.patient_id, self.study_uid, self.series_uid, self.instance_uid
        ))
    }
}
