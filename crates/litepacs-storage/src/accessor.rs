//! 附件存取器
//!
//! 在文件存储之上应用压缩与MD5策略，产出附件描述符。

use litepacs_core::{CompressionKind, ContentType, FileInfo, Result, StoreError};
use md5::{Digest, Md5};
use tracing::debug;
use uuid::Uuid;

use crate::compression::{zlib_compress, zlib_decompress};
use crate::filesystem::FilesystemStorage;

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 带压缩与校验策略的附件存取器
#[derive(Debug, Clone)]
pub struct StorageAccessor {
    storage: FilesystemStorage,
    compression_enabled: bool,
    store_md5: bool,
}

impl StorageAccessor {
    pub fn new(storage: FilesystemStorage, compression_enabled: bool, store_md5: bool) -> Self {
        Self {
            storage,
            compression_enabled,
            store_md5,
        }
    }

    pub fn storage(&self) -> &FilesystemStorage {
        &self.storage
    }

    /// 写入一个新附件并返回描述符
    ///
    /// 压缩启用但无收益时退回原始存储，压缩算法记录为None。
    pub async fn write(&self, data: &[u8], content_type: ContentType) -> Result<FileInfo> {
        let uuid = Uuid::new_v4().to_string();

        let uncompressed_md5 = if self.store_md5 {
            md5_hex(data)
        } else {
            String::new()
        };

        let (stored, compression) = if self.compression_enabled {
            let compressed = zlib_compress(data)?;
            if compressed.len() < data.len() {
                (compressed, CompressionKind::Zlib)
            } else {
                (data.to_vec(), CompressionKind::None)
            }
        } else {
            (data.to_vec(), CompressionKind::None)
        };

        let compressed_md5 = if self.store_md5 {
            if compression == CompressionKind::None {
                uncompressed_md5.clone()
            } else {
                md5_hex(&stored)
            }
        } else {
            String::new()
        };

        self.storage.create(&uuid, &stored).await?;

        debug!(
            "Stored attachment \"{}\" ({} -> {} bytes)",
            uuid,
            data.len(),
            stored.len()
        );

        Ok(FileInfo {
            uuid,
            content_type,
            uncompressed_size: data.len() as u64,
            compressed_size: stored.len() as u64,
            compression,
            uncompressed_md5,
            compressed_md5,
        })
    }

    /// 读取附件并按策略校验完整性
    pub async fn read(&self, info: &FileInfo) -> Result<Vec<u8>> {
        let stored = self.storage.read(&info.uuid).await?;

        if self.store_md5 && !info.compressed_md5.is_empty() && md5_hex(&stored) != info.compressed_md5
        {
            return Err(StoreError::CorruptedFile(format!(
                "附件{}的存储内容MD5不匹配",
                info.uuid
            )));
        }

        let data = match info.compression {
            CompressionKind::None => stored,
            CompressionKind::Zlib => zlib_decompress(&stored)?,
        };

        if data.len() as u64 != info.uncompressed_size {
            return Err(StoreError::CorruptedFile(format!(
                "附件{}的大小不匹配",
                info.uuid
            )));
        }

        if self.store_md5
            && !info.uncompressed_md5.is_empty()
            && md5_hex(&data) != info.uncompressed_md5
        {
            return Err(StoreError::CorruptedFile(format!(
                "附件{}的内容MD5不匹配",
                info.uuid
            )));
        }

        Ok(data)
    }

    /// 删除附件，幂等
    pub async fn remove(&self, uuid: &str) -> Result<()> {
        self.storage.remove(uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_accessor(compression: bool, md5: bool) -> (tempfile::TempDir, StorageAccessor) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        (dir, StorageAccessor::new(storage, compression, md5))
    }

    #[tokio::test]
    async fn test_write_read_compressed() {
        let (_dir, accessor) = make_accessor(true, true).await;
        let data = b"dicom payload ".repeat(64);

        let info = accessor.write(&data, ContentType::Dicom).await.unwrap();
        assert_eq!(info.compression, CompressionKind::Zlib);
        assert_eq!(info.uncompressed_size, data.len() as u64);
        assert!(info.compressed_size < info.uncompressed_size);
        assert_ne!(info.uncompressed_md5, info.compressed_md5);

        assert_eq!(accessor.read(&info).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_incompressible_falls_back_to_raw() {
        let (_dir, accessor) = make_accessor(true, true).await;
        // 单字节压缩后不会更小
        let info = accessor.write(b"x", ContentType::Dicom).await.unwrap();
        assert_eq!(info.compression, CompressionKind::None);
        assert_eq!(info.compressed_size, info.uncompressed_size);
        assert_eq!(info.uncompressed_md5, info.compressed_md5);
        assert_eq!(accessor.read(&info).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_no_compression_no_md5() {
        let (_dir, accessor) = make_accessor(false, false).await;
        let data = b"0123456789".repeat(32);

        let info = accessor.write(&data, ContentType::DicomAsJson).await.unwrap();
        assert_eq!(info.compression, CompressionKind::None);
        assert!(info.uncompressed_md5.is_empty());
        assert_eq!(accessor.read(&info).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let (dir, accessor) = make_accessor(false, true).await;
        let info = accessor
            .write(b"original content", ContentType::Dicom)
            .await
            .unwrap();

        // 直接篡改磁盘上的文件
        let path = dir
            .path()
            .join(&info.uuid[0..2])
            .join(&info.uuid[2..4])
            .join(&info.uuid);
        std::fs::write(&path, b"tampered content").unwrap();

        assert!(matches!(
            accessor.read(&info).await,
            Err(StoreError::CorruptedFile(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_idempotent() {
        let (_dir, accessor) = make_accessor(true, true).await;
        let info = accessor.write(b"data", ContentType::Dicom).await.unwrap();
        accessor.remove(&info.uuid).await.unwrap();
        accessor.remove(&info.uuid).await.unwrap();
        assert!(accessor.read(&info).await.is_err());
    }
}
