//! 附件描述符表操作
//!
//! 同一资源每种内容类型至多一个附件；uuid全库唯一，
//! 指向附件存储中的实际文件。

use std::collections::BTreeSet;

use litepacs_core::{CompressionKind, ContentType, FileInfo, Result, StoreError};
use sqlx::Row;

use crate::database::{map_sqlx, IndexTransaction};

fn file_info_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FileInfo> {
    Ok(FileInfo {
        uuid: row.get("uuid"),
        content_type: ContentType::from_code(row.get("content_type"))?,
        compressed_size: row.get::<i64, _>("compressed_size") as u64,
        uncompressed_size: row.get::<i64, _>("uncompressed_size") as u64,
        compression: CompressionKind::from_code(row.get("compression"))?,
        uncompressed_md5: row.get("uncompressed_md5"),
        compressed_md5: row.get("compressed_md5"),
    })
}

impl<'a> IndexTransaction<'a> {
    /// 登记附件描述符
    pub async fn add_attachment(&mut self, id: i64, info: &FileInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO attached_files \
             (resource_id, content_type, uuid, compressed_size, uncompressed_size, \
              compression, uncompressed_md5, compressed_md5) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(info.content_type.as_code())
        .bind(&info.uuid)
        .bind(info.compressed_size as i64)
        .bind(info.uncompressed_size as i64)
        .bind(info.compression.as_code())
        .bind(&info.uncompressed_md5)
        .bind(&info.compressed_md5)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// 查找资源某内容类型的附件
    pub async fn lookup_attachment(
        &mut self,
        id: i64,
        content_type: ContentType,
    ) -> Result<Option<FileInfo>> {
        let row = sqlx::query(
            "SELECT uuid, content_type, compressed_size, uncompressed_size, \
                    compression, uncompressed_md5, compressed_md5 \
             FROM attached_files WHERE resource_id = ? AND content_type = ?",
        )
        .bind(id)
        .bind(content_type.as_code())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        row.map(|r| file_info_from_row(&r)).transpose()
    }

    /// 列出资源的全部附件内容类型
    pub async fn list_attachments(&mut self, id: i64) -> Result<Vec<ContentType>> {
        let rows = sqlx::query(
            "SELECT content_type FROM attached_files WHERE resource_id = ? ORDER BY content_type",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|r| ContentType::from_code(r.get(0)))
            .collect()
    }

    /// 删除附件描述符，返回待清理的描述符
    pub async fn delete_attachment(
        &mut self,
        id: i64,
        content_type: ContentType,
    ) -> Result<FileInfo> {
        let info = self
            .lookup_attachment(id, content_type)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(format!("资源{}无此类型附件", id)))?;

        sqlx::query("DELETE FROM attached_files WHERE resource_id = ? AND content_type = ?")
            .bind(id)
            .bind(content_type.as_code())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(info)
    }

    /// 全部附件压缩后大小之和
    pub async fn total_compressed_size(&mut self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(compressed_size), 0) FROM attached_files")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// 全部附件原始大小之和
    pub async fn total_uncompressed_size(&mut self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(uncompressed_size), 0) FROM attached_files")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// 索引引用的全部附件uuid，供孤儿清扫比对
    pub async fn referenced_attachment_uuids(&mut self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT uuid FROM attached_files")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::IndexDatabase;
    use litepacs_core::ResourceLevel;

    fn sample_info(uuid: &str, content_type: ContentType, size: u64) -> FileInfo {
        FileInfo {
            uuid: uuid.to_string(),
            content_type,
            uncompressed_size: size,
            compressed_size: size / 2,
            compression: CompressionKind::Zlib,
            uncompressed_md5: "aaaa".to_string(),
            compressed_md5: "bbbb".to_string(),
        }
    }

    #[tokio::test]
    async fn test_attachment_round_trip() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("inst", ResourceLevel::Instance).await.unwrap();

        let info = sample_info("11111111-2222-3333-4444-555555555555", ContentType::Dicom, 100);
        tx.add_attachment(id, &info).await.unwrap();

        assert_eq!(
            tx.lookup_attachment(id, ContentType::Dicom).await.unwrap(),
            Some(info.clone())
        );
        assert_eq!(
            tx.lookup_attachment(id, ContentType::DicomAsJson).await.unwrap(),
            None
        );
        assert_eq!(
            tx.list_attachments(id).await.unwrap(),
            vec![ContentType::Dicom]
        );
    }

    #[tokio::test]
    async fn test_one_attachment_per_content_type() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("inst", ResourceLevel::Instance).await.unwrap();

        tx.add_attachment(
            id,
            &sample_info("11111111-2222-3333-4444-555555555555", ContentType::Dicom, 10),
        )
        .await
        .unwrap();

        let second = sample_info("99999999-8888-7777-6666-555555555555", ContentType::Dicom, 20);
        assert!(tx.add_attachment(id, &second).await.is_err());
    }

    #[tokio::test]
    async fn test_uuid_unique_across_resources() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let a = tx.create_resource("a", ResourceLevel::Instance).await.unwrap();
        let b = tx.create_resource("b", ResourceLevel::Instance).await.unwrap();

        let info = sample_info("11111111-2222-3333-4444-555555555555", ContentType::Dicom, 10);
        tx.add_attachment(a, &info).await.unwrap();
        assert!(tx.add_attachment(b, &info).await.is_err());
    }

    #[tokio::test]
    async fn test_totals() {
        let db = IndexDatabase::open(":memory:").await.unwrap();
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("inst", ResourceLevel::Instance).await.unwrap();

        tx.add_attachment(
            id,
            &sample_info("11111111-2222-3333-4444-555555555555", ContentType::Dicom, 100),
        )
        .await
        .unwrap();
        tx.add_attachment(
            id,
            &sample_info(
                "99999999-8888-7777-6666-555555555555",
                ContentType::DicomAsJson,
                40,
            ),
        )
        .await
        .unwrap();

        assert_eq!(tx.total_uncompressed_size().await.unwrap(), 140);
        assert_eq!(tx.total_compressed_size().await.unwrap(), 70);

        let removed = tx.delete_attachment(id, ContentType::Dicom).await.unwrap();
        assert_eq!(removed.uncompressed_size, 100);
        assert_eq!(tx.total_uncompressed_size().await.unwrap(), 40);
    }
}
