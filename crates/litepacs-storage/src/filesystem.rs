//! 附件文件存储
//!
//! 以uuid前两个字节对展开两级目录，限制单目录条目数。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use litepacs_core::{Result, StoreError};
use tracing::{debug, info};

/// 基于文件系统的内容寻址存储
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// 创建存储，根目录不存在时自动建立
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// uuid对应的存储路径：<root>/xx/yy/<uuid>
    fn path_of(&self, uuid: &str) -> Result<PathBuf> {
        if !litepacs_core::utils::is_valid_uuid(uuid) {
            return Err(StoreError::Internal(format!("无效的附件uuid: {}", uuid)));
        }
        let mut path = self.root.clone();
        path.push(&uuid[0..2]);
        path.push(&uuid[2..4]);
        path.push(uuid);
        Ok(path)
    }

    /// 原子写入新附件：临时文件落盘后重命名
    ///
    /// 返回前数据已持久化，调用方依赖该保证在索引提交前完成附件写入。
    pub async fn create(&self, uuid: &str, content: &[u8]) -> Result<()> {
        let path = self.path_of(uuid)?;

        if tokio::fs::try_exists(&path).await? {
            // uuid是随机生成的，路径已存在说明上层逻辑出错
            return Err(StoreError::Internal(format!("附件uuid冲突: {}", uuid)));
        }

        let parent = path.parent().expect("fan-out path always has a parent");
        tokio::fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.tmp", uuid));
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&temp, &path).await?;

        debug!("Created attachment \"{}\" ({} bytes)", uuid, content.len());
        Ok(())
    }

    /// 读取附件内容
    pub async fn read(&self, uuid: &str) -> Result<Vec<u8>> {
        let path = self.path_of(uuid)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::UnknownResource(uuid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 附件在磁盘上的大小
    pub async fn size_of(&self, uuid: &str) -> Result<u64> {
        let path = self.path_of(uuid)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::UnknownResource(uuid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 删除附件，重复删除不报错；空的展开目录顺带清理
    pub async fn remove(&self, uuid: &str) -> Result<()> {
        let path = self.path_of(uuid)?;
        debug!("Deleting attachment \"{}\"", uuid);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // 父目录非空时删除会失败，忽略即可
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
            if let Some(grand) = parent.parent() {
                let _ = tokio::fs::remove_dir(grand).await;
            }
        }
        Ok(())
    }

    /// 遍历存储中所有有效uuid，供孤儿附件清扫使用
    pub async fn list_all(&self) -> Result<BTreeSet<String>> {
        let mut result = BTreeSet::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if litepacs_core::utils::is_valid_uuid(&name)
                        && entry.path() == self.path_of(&name)?
                    {
                        result.insert(name);
                    }
                }
            }
        }
        Ok(result)
    }

    /// 清空整个存储
    pub async fn clear(&self) -> Result<()> {
        info!("Clearing attachment storage at {:?}", self.root);
        for uuid in self.list_all().await? {
            self.remove(&uuid).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn make_storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_create_read_remove() {
        let (_dir, storage) = make_storage().await;
        let uuid = Uuid::new_v4().to_string();

        storage.create(&uuid, b"hello dicom").await.unwrap();
        assert_eq!(storage.read(&uuid).await.unwrap(), b"hello dicom");
        assert_eq!(storage.size_of(&uuid).await.unwrap(), 11);

        storage.remove(&uuid).await.unwrap();
        assert!(matches!(
            storage.read(&uuid).await,
            Err(StoreError::UnknownResource(_))
        ));

        // 删除是幂等的
        storage.remove(&uuid).await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_layout() {
        let (dir, storage) = make_storage().await;
        let uuid = Uuid::new_v4().to_string();
        storage.create(&uuid, b"x").await.unwrap();

        let expected = dir
            .path()
            .join(&uuid[0..2])
            .join(&uuid[2..4])
            .join(&uuid);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_duplicate_uuid_rejected() {
        let (_dir, storage) = make_storage().await;
        let uuid = Uuid::new_v4().to_string();
        storage.create(&uuid, b"a").await.unwrap();
        assert!(storage.create(&uuid, b"b").await.is_err());
    }

    #[tokio::test]
    async fn test_list_all() {
        let (_dir, storage) = make_storage().await;
        let mut uuids = BTreeSet::new();
        for _ in 0..3 {
            let uuid = Uuid::new_v4().to_string();
            storage.create(&uuid, b"payload").await.unwrap();
            uuids.insert(uuid);
        }
        assert_eq!(storage.list_all().await.unwrap(), uuids);
    }

    #[tokio::test]
    async fn test_invalid_uuid_rejected() {
        let (_dir, storage) = make_storage().await;
        assert!(storage.read("not-a-uuid").await.is_err());
    }
}
