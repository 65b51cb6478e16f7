//! DICOM标识符二级索引
//!
//! 主标签保存显示用原文，标识符表保存规范化形式，
//! 供C-FIND等精确与范围查找使用。

use litepacs_core::dicom::{identifier_tags_for_level, DicomMap, DicomTag};
use litepacs_core::utils::normalize_identifier;
use litepacs_core::{ResourceLevel, Result};
use sqlx::Row;

use crate::database::{map_sqlx, IndexTransaction};

impl<'a> IndexTransaction<'a> {
    /// 登记资源在其层级上的标识符标签
    pub async fn register_identifiers(
        &mut self,
        id: i64,
        level: ResourceLevel,
        tags: &DicomMap,
    ) -> Result<()> {
        for tag in identifier_tags_for_level(level) {
            if let Some(value) = tags.get(*tag) {
                if value.is_empty() {
                    continue;
                }
                sqlx::query(
                    "INSERT OR REPLACE INTO dicom_identifiers \
                     (resource_id, tag_group, tag_element, value) VALUES (?, ?, ?, ?)",
                )
                .bind(id)
                .bind(tag.group as i64)
                .bind(tag.element as i64)
                .bind(normalize_identifier(value))
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }

    /// 精确查找，输入值先规范化
    pub async fn lookup_identifier_exact(
        &mut self,
        tag: DicomTag,
        value: &str,
        level: ResourceLevel,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT d.resource_id FROM dicom_identifiers d \
             JOIN resources r ON r.internal_id = d.resource_id \
             WHERE d.tag_group = ? AND d.tag_element = ? AND d.value = ? \
               AND r.resource_level = ? ORDER BY d.resource_id",
        )
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(normalize_identifier(value))
        .bind(level.as_code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 闭区间范围查找（日期、时间等按字典序比较）
    pub async fn lookup_identifier_range(
        &mut self,
        tag: DicomTag,
        lower: Option<&str>,
        upper: Option<&str>,
        level: ResourceLevel,
    ) -> Result<Vec<i64>> {
        let lower = lower.map(normalize_identifier);
        let upper = upper.map(normalize_identifier);

        let rows = sqlx::query(
            "SELECT d.resource_id FROM dicom_identifiers d \
             JOIN resources r ON r.internal_id = d.resource_id \
             WHERE d.tag_group = ? AND d.tag_element = ? \
               AND (? IS NULL OR d.value >= ?) \
               AND (? IS NULL OR d.value <= ?) \
               AND r.resource_level = ? ORDER BY d.resource_id",
        )
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(lower.as_deref())
        .bind(lower.as_deref())
        .bind(upper.as_deref())
        .bind(upper.as_deref())
        .bind(level.as_code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 某层级某标签的全部(资源, 规范化值)，供通配匹配遍历
    pub async fn identifier_values(
        &mut self,
        tag: DicomTag,
        level: ResourceLevel,
    ) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT d.resource_id, d.value FROM dicom_identifiers d \
             JOIN resources r ON r.internal_id = d.resource_id \
             WHERE d.tag_group = ? AND d.tag_element = ? AND r.resource_level = ? \
             ORDER BY d.resource_id",
        )
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(level.as_code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    /// 按标识符查找公共标识符，外部查找入口
    pub async fn lookup_identifier(
        &mut self,
        tag: DicomTag,
        value: &str,
        level: ResourceLevel,
    ) -> Result<Vec<String>> {
        let ids = self.lookup_identifier_exact(tag, value, level).await?;
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            result.push(self.get_public_id(id).await?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::IndexDatabase;
    use litepacs_core::dicom::{TAG_PATIENT_ID, TAG_STUDY_INSTANCE_UID};

    #[tokio::test]
    async fn test_register_and_exact_lookup() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("study-1", ResourceLevel::Study).await.unwrap();

        let mut tags = DicomMap::new();
        tags.set(TAG_STUDY_INSTANCE_UID, "1.2.3");
        tx.register_identifiers(id, ResourceLevel::Study, &tags).await.unwrap();

        assert_eq!(
            tx.lookup_identifier_exact(TAG_STUDY_INSTANCE_UID, "1.2.3", ResourceLevel::Study)
                .await
                .unwrap(),
            vec![id]
        );
        // 患者层级不会命中检查层级的标识符
        assert!(tx
            .lookup_identifier_exact(TAG_STUDY_INSTANCE_UID, "1.2.3", ResourceLevel::Patient)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            tx.lookup_identifier(TAG_STUDY_INSTANCE_UID, "1.2.3", ResourceLevel::Study)
                .await
                .unwrap(),
            vec!["study-1"]
        );
    }

    #[tokio::test]
    async fn test_lookup_is_normalized() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("p", ResourceLevel::Patient).await.unwrap();

        let mut tags = DicomMap::new();
        tags.set(TAG_PATIENT_ID, "  p1 ");
        tx.register_identifiers(id, ResourceLevel::Patient, &tags).await.unwrap();

        // 存储与查询两侧都规范化
        assert_eq!(
            tx.lookup_identifier_exact(TAG_PATIENT_ID, "P1", ResourceLevel::Patient)
                .await
                .unwrap(),
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_range_lookup() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();

        for (public, value) in [("a", "20230101"), ("b", "20230615"), ("c", "20231231")] {
            let id = tx.create_resource(public, ResourceLevel::Patient).await.unwrap();
            let mut tags = DicomMap::new();
            tags.set(TAG_PATIENT_ID, value);
            tx.register_identifiers(id, ResourceLevel::Patient, &tags).await.unwrap();
        }

        let mid = tx
            .lookup_identifier_range(
                TAG_PATIENT_ID,
                Some("20230201"),
                Some("20230901"),
                ResourceLevel::Patient,
            )
            .await
            .unwrap();
        assert_eq!(mid.len(), 1);

        let open_upper = tx
            .lookup_identifier_range(TAG_PATIENT_ID, Some("20230615"), None, ResourceLevel::Patient)
            .await
            .unwrap();
        assert_eq!(open_upper.len(), 2);
    }
}
