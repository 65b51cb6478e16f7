//! 资源元数据操作

use litepacs_core::{MetadataKey, Result};
use sqlx::Row;

use crate::database::{map_sqlx, IndexTransaction};

impl<'a> IndexTransaction<'a> {
    /// 写入元数据，同键覆盖
    pub async fn set_metadata(&mut self, id: i64, key: MetadataKey, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO metadata (resource_id, meta_key, value) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(key.as_code())
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// 读取元数据
    pub async fn lookup_metadata(&mut self, id: i64, key: MetadataKey) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM metadata WHERE resource_id = ? AND meta_key = ?")
            .bind(id)
            .bind(key.as_code())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get(0)))
    }

    /// 读取整数元数据，值缺失或非法时返回None
    pub async fn lookup_metadata_u32(&mut self, id: i64, key: MetadataKey) -> Result<Option<u32>> {
        Ok(self
            .lookup_metadata(id, key)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// 列出资源的全部元数据
    pub async fn list_metadata(&mut self, id: i64) -> Result<Vec<(MetadataKey, String)>> {
        let rows = sqlx::query(
            "SELECT meta_key, value FROM metadata WHERE resource_id = ? ORDER BY meta_key",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push((MetadataKey::from_code(row.get(0))?, row.get(1)));
        }
        Ok(result)
    }

    /// 删除元数据
    pub async fn delete_metadata(&mut self, id: i64, key: MetadataKey) -> Result<()> {
        sqlx::query("DELETE FROM metadata WHERE resource_id = ? AND meta_key = ?")
            .bind(id)
            .bind(key.as_code())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::database::IndexDatabase;
    use litepacs_core::{MetadataKey, ResourceLevel};

    #[tokio::test]
    async fn test_metadata_lifecycle() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("inst", ResourceLevel::Instance).await.unwrap();

        tx.set_metadata(id, MetadataKey::RemoteAet, "CT_SCANNER").await.unwrap();
        tx.set_metadata(id, MetadataKey::IndexInSeries, "7").await.unwrap();
        tx.set_metadata(id, MetadataKey::User(2000), "custom").await.unwrap();

        assert_eq!(
            tx.lookup_metadata(id, MetadataKey::RemoteAet).await.unwrap(),
            Some("CT_SCANNER".to_string())
        );
        assert_eq!(
            tx.lookup_metadata_u32(id, MetadataKey::IndexInSeries).await.unwrap(),
            Some(7)
        );

        // 同键覆盖
        tx.set_metadata(id, MetadataKey::RemoteAet, "MR_SCANNER").await.unwrap();
        assert_eq!(
            tx.lookup_metadata(id, MetadataKey::RemoteAet).await.unwrap(),
            Some("MR_SCANNER".to_string())
        );

        let all = tx.list_metadata(id).await.unwrap();
        assert_eq!(all.len(), 3);

        tx.delete_metadata(id, MetadataKey::User(2000)).await.unwrap();
        assert_eq!(tx.list_metadata(id).await.unwrap().len(), 2);
        assert_eq!(
            tx.lookup_metadata(id, MetadataKey::User(2000)).await.unwrap(),
            None
        );
    }
}
