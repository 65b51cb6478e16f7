//! 变更日志与转发日志
//!
//! 变更序号由行号保证单调递增；每条记录保存公共标识符与层级的快照，
//! 删除类条目在资源消失后仍然有效。

use litepacs_core::dicom::{
    TAG_PATIENT_ID, TAG_SERIES_INSTANCE_UID, TAG_SOP_INSTANCE_UID, TAG_STUDY_INSTANCE_UID,
};
use litepacs_core::utils::{now_iso_string, parse_iso_string};
use litepacs_core::{
    ChangeEvent, ChangeKind, ExportedResource, ResourceLevel, Result, StoreError,
};
use sqlx::Row;

use crate::database::{map_sqlx, IndexTransaction};

impl<'a> IndexTransaction<'a> {
    /// 追加一条变更记录，返回序号
    pub async fn log_change(
        &mut self,
        kind: ChangeKind,
        internal_id: Option<i64>,
        level: ResourceLevel,
        public_id: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO changes (change_kind, internal_id, resource_level, public_id, date) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(kind.as_code())
        .bind(internal_id)
        .bind(level.as_code())
        .bind(public_id)
        .bind(now_iso_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(result.last_insert_rowid())
    }

    /// 为已有资源追加变更记录
    pub async fn log_change_for(&mut self, kind: ChangeKind, id: i64) -> Result<i64> {
        let public_id = self.get_public_id(id).await?;
        let level = self.get_level(id).await?;
        self.log_change(kind, Some(id), level, &public_id).await
    }

    /// 读取序号大于since的变更，done表示已到达日志尾部
    pub async fn get_changes(
        &mut self,
        since: i64,
        limit: u32,
    ) -> Result<(Vec<ChangeEvent>, bool)> {
        // 多取一条用于判断是否到达尾部
        let rows = sqlx::query(
            "SELECT seq, change_kind, resource_level, public_id, date \
             FROM changes WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(since)
        .bind(limit as i64 + 1)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let done = rows.len() <= limit as usize;
        let mut events = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            events.push(ChangeEvent {
                seq: row.get(0),
                kind: ChangeKind::from_code(row.get(1))?,
                level: ResourceLevel::from_code(row.get(2))?,
                public_id: row.get(3),
                date: parse_iso_string(row.get::<String, _>(4).as_str())
                    .ok_or_else(|| StoreError::Database("变更日志时间格式损坏".to_string()))?,
            });
        }
        Ok((events, done))
    }

    /// 最新的变更序号，日志为空时为0
    pub async fn last_change_seq(&mut self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) FROM changes")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get(0))
    }

    /// 记录一次资源转发：沿层级向上收集四个UID后落盘
    pub async fn log_exported_resource(&mut self, id: i64, remote_aet: &str) -> Result<i64> {
        let public_id = self.get_public_id(id).await?;
        let level = self.get_level(id).await?;

        let mut patient_id = String::new();
        let mut study_uid = String::new();
        let mut series_uid = String::new();
        let mut sop_uid = String::new();

        let mut current = Some(id);
        while let Some(node) = current {
            let tags = self.get_main_dicom_tags(node).await?;
            match self.get_level(node).await? {
                ResourceLevel::Patient => {
                    patient_id = tags.get(TAG_PATIENT_ID).unwrap_or_default().to_string();
                }
                ResourceLevel::Study => {
                    study_uid = tags
                        .get(TAG_STUDY_INSTANCE_UID)
                        .unwrap_or_default()
                        .to_string();
                }
                ResourceLevel::Series => {
                    series_uid = tags
                        .get(TAG_SERIES_INSTANCE_UID)
                        .unwrap_or_default()
                        .to_string();
                }
                ResourceLevel::Instance => {
                    sop_uid = tags
                        .get(TAG_SOP_INSTANCE_UID)
                        .unwrap_or_default()
                        .to_string();
                }
            }
            current = self.get_parent(node).await?;
        }

        let result = sqlx::query(
            "INSERT INTO exported_resources \
             (resource_level, public_id, remote_aet, patient_id, study_instance_uid, \
              series_instance_uid, sop_instance_uid, date) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(level.as_code())
        .bind(&public_id)
        .bind(remote_aet)
        .bind(&patient_id)
        .bind(&study_uid)
        .bind(&series_uid)
        .bind(&sop_uid)
        .bind(now_iso_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(result.last_insert_rowid())
    }

    /// 读取转发日志
    pub async fn get_exported_resources(
        &mut self,
        since: i64,
        limit: u32,
    ) -> Result<(Vec<ExportedResource>, bool)> {
        let rows = sqlx::query(
            "SELECT seq, resource_level, public_id, remote_aet, patient_id, \
                    study_instance_uid, series_instance_uid, sop_instance_uid, date \
             FROM exported_resources WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(since)
        .bind(limit as i64 + 1)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let done = rows.len() <= limit as usize;
        let mut entries = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            entries.push(ExportedResource {
                seq: row.get(0),
                level: ResourceLevel::from_code(row.get(1))?,
                public_id: row.get(2),
                remote_aet: row.get(3),
                patient_id: row.get(4),
                study_instance_uid: row.get(5),
                series_instance_uid: row.get(6),
                sop_instance_uid: row.get(7),
                date: parse_iso_string(row.get::<String, _>(8).as_str())
                    .ok_or_else(|| StoreError::Database("转发日志时间格式损坏".to_string()))?,
            });
        }
        Ok((entries, done))
    }
}
