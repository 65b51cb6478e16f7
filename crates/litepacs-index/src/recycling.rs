//! 患者回收顺序与容量上限
//!
//! 回收顺序表中只保存未受保护的患者；受保护即不在表中。
//! 触达（新建后代、读写附件）把患者移到最近端，回收从最旧端选取。

use litepacs_core::{FileInfo, ResourceLevel, Result, StoreError};
use sqlx::Row;
use tracing::info;

use crate::database::{map_sqlx, IndexTransaction};

/// 容量上限配置，0表示不限制
#[derive(Debug, Clone, Copy, Default)]
pub struct RecyclingQuota {
    pub max_patient_count: u32,
    pub max_storage_size: u64,
}

impl<'a> IndexTransaction<'a> {
    /// 把新建患者加入回收顺序尾部
    pub async fn track_patient(&mut self, patient: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO patient_recycling_order (patient_id) VALUES (?)")
            .bind(patient)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// 触达患者：在回收顺序中移到最近端；受保护的患者不受影响
    pub async fn touch_patient(&mut self, patient: i64) -> Result<()> {
        let tracked = sqlx::query("SELECT seq FROM patient_recycling_order WHERE patient_id = ?")
            .bind(patient)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        if tracked.is_some() {
            sqlx::query("DELETE FROM patient_recycling_order WHERE patient_id = ?")
                .bind(patient)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            sqlx::query("INSERT INTO patient_recycling_order (patient_id) VALUES (?)")
                .bind(patient)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    /// 患者是否受保护（不在回收顺序中）
    pub async fn is_protected_patient(&mut self, patient: i64) -> Result<bool> {
        if self.get_level(patient).await? != ResourceLevel::Patient {
            return Err(StoreError::Internal(format!(
                "资源{}不是患者层级",
                patient
            )));
        }
        let row = sqlx::query("SELECT seq FROM patient_recycling_order WHERE patient_id = ?")
            .bind(patient)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_none())
    }

    /// 设置患者保护状态；解除保护的患者回到回收顺序尾部
    pub async fn set_protected_patient(&mut self, patient: i64, protected: bool) -> Result<()> {
        if self.get_level(patient).await? != ResourceLevel::Patient {
            return Err(StoreError::Internal(format!(
                "资源{}不是患者层级",
                patient
            )));
        }

        if protected {
            sqlx::query("DELETE FROM patient_recycling_order WHERE patient_id = ?")
                .bind(patient)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        } else {
            self.track_patient(patient).await?;
        }
        Ok(())
    }

    /// 选出最久未触达的未保护患者，可排除一个指定患者
    pub async fn select_patient_to_recycle(&mut self, avoid: Option<i64>) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT patient_id FROM patient_recycling_order \
             WHERE (? IS NULL OR patient_id != ?) ORDER BY seq LIMIT 1",
        )
        .bind(avoid)
        .bind(avoid)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get(0)))
    }

    /// 回收顺序中的患者数，一致性检查用
    pub async fn recycling_order_len(&mut self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM patient_recycling_order")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn is_recycling_needed(
        &mut self,
        quota: RecyclingQuota,
        additional_bytes: u64,
        additional_patients: u64,
    ) -> Result<bool> {
        if quota.max_storage_size != 0 {
            let current = self.total_compressed_size().await?;
            if current + additional_bytes > quota.max_storage_size {
                return Ok(true);
            }
        }

        if quota.max_patient_count != 0 {
            let count = self.resource_count(ResourceLevel::Patient).await?;
            if count + additional_patients > quota.max_patient_count as u64 {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 回收患者直到容量满足，返回提交后待清除的附件
    ///
    /// `additional_bytes`与`creates_new_patient`描述即将入库的实例；
    /// `avoid`是本次入库的目标患者，绝不回收。无患者可回收时返回FullStorage。
    pub async fn enforce_limits(
        &mut self,
        quota: RecyclingQuota,
        additional_bytes: u64,
        creates_new_patient: bool,
        avoid: Option<i64>,
    ) -> Result<Vec<FileInfo>> {
        let additional_patients = if creates_new_patient { 1 } else { 0 };
        let mut purge = Vec::new();

        while self
            .is_recycling_needed(quota, additional_bytes, additional_patients)
            .await?
        {
            let victim = self
                .select_patient_to_recycle(avoid)
                .await?
                .ok_or(StoreError::FullStorage)?;

            info!("Recycling patient {}", victim);
            let outcome = self.delete_resource(victim).await?;
            purge.extend(outcome.purge);
        }

        Ok(purge)
    }
}
