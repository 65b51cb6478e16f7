//! 通用工具函数

use chrono::{DateTime, SecondsFormat, Utc};

/// 验证DICOM UID格式：至多64字节，点号分隔的非空数字段
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// 验证附件uuid格式（小写十六进制加连字符的标准UUID）
pub fn is_valid_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

/// 标识符规范化：去除首尾空白、非ASCII字符折叠、转大写
///
/// 规范化必须是幂等的：normalize(normalize(x)) == normalize(x)。
pub fn normalize_identifier(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_ascii() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// 当前UTC时间的ISO-8601字符串
pub fn now_iso_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 解析数据库中的ISO-8601时间字符串
pub fn parse_iso_string(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(is_valid_dicom_uid("123"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        // 空的数字段不合法
        assert!(!is_valid_dicom_uid("1..2"));
        assert!(!is_valid_dicom_uid(".1.2"));
        assert!(!is_valid_dicom_uid("1.2."));
        assert!(!is_valid_dicom_uid(&"1.2.".repeat(30)));
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("  abc  "), "ABC");
        assert_eq!(normalize_identifier("Doe^John"), "DOE^JOHN");
        assert_eq!(normalize_identifier("café"), "CAF_");

        // 幂等性
        let once = normalize_identifier(" Étude 12 ");
        assert_eq!(normalize_identifier(&once), once);
    }

    #[test]
    fn test_iso_round_trip() {
        let s = now_iso_string();
        assert!(parse_iso_string(&s).is_some());
    }
}
