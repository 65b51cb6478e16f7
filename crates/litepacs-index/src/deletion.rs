//! 资源级联删除
//!
//! 删除沿子树向下级联；当被删节点是父资源仅剩的子节点时继续向上级联。
//! 附件uuid先缓存，由调用方在事务提交之后再从附件存储中清除。

use litepacs_core::{
    ChangeKind, DeletedResource, DeletionReport, FileInfo, ResourceLevel, Result, StoreError,
};
use sqlx::Row;
use tracing::debug;

use crate::database::{map_sqlx, IndexTransaction};

/// 删除操作的完整结果
#[derive(Debug, Clone)]
pub struct DeletionOutcome {
    pub report: DeletionReport,
    /// 提交后需要从附件存储清除的描述符
    pub purge: Vec<FileInfo>,
}

impl DeletionOutcome {
    /// 被清除附件压缩后大小之和
    pub fn purged_bytes(&self) -> u64 {
        self.purge.iter().map(|f| f.compressed_size).sum()
    }
}

impl<'a> IndexTransaction<'a> {
    /// 删除资源及其整个子树，必要时向上级联
    pub async fn delete_resource(&mut self, id: i64) -> Result<DeletionOutcome> {
        // 确认资源存在
        self.get_level(id).await?;

        // 向上级联：父资源只剩这一个子节点时，父资源一并删除
        let mut root = id;
        loop {
            match self.get_parent(root).await? {
                Some(parent) if self.count_children(parent).await? == 1 => root = parent,
                _ => break,
            }
        }

        let remaining_ancestor = match self.get_parent(root).await? {
            Some(parent) => {
                let snapshot = DeletedResource {
                    public_id: self.get_public_id(parent).await?,
                    level: self.get_level(parent).await?,
                };
                debug!(
                    "Remaining ancestor \"{}\" ({})",
                    snapshot.public_id,
                    snapshot.level.as_str()
                );
                Some(snapshot)
            }
            None => None,
        };

        // 收集root的整个子树（含root自身）
        let rows = sqlx::query(
            "WITH RECURSIVE sub(internal_id, public_id, resource_level) AS ( \
                 SELECT internal_id, public_id, resource_level \
                 FROM resources WHERE internal_id = ? \
                 UNION ALL \
                 SELECT r.internal_id, r.public_id, r.resource_level \
                 FROM resources r JOIN sub s ON r.parent_id = s.internal_id \
             ) \
             SELECT internal_id, public_id, resource_level FROM sub \
             ORDER BY resource_level, internal_id",
        )
        .bind(root)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let mut deleted = Vec::with_capacity(rows.len());
        let mut internal_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            internal_ids.push(row.get::<i64, _>(0));
            deleted.push(DeletedResource {
                public_id: row.get(1),
                level: ResourceLevel::from_code(row.get(2))?,
            });
        }

        // 缓存待清除的附件描述符
        let mut purge = Vec::new();
        for internal_id in &internal_ids {
            for content_type in self.list_attachments(*internal_id).await? {
                if let Some(info) = self.lookup_attachment(*internal_id, content_type).await? {
                    purge.push(info);
                }
            }
        }

        // 外键级联清除子树的标签、元数据、附件行、回收顺序及历史变更
        sqlx::query("DELETE FROM resources WHERE internal_id = ?")
            .bind(root)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        // 每个被删资源记录一条Deleted变更，internal_id为空保证快照长期有效
        for resource in &deleted {
            self.log_change(ChangeKind::Deleted, None, resource.level, &resource.public_id)
                .await?;
        }

        Ok(DeletionOutcome {
            report: DeletionReport {
                deleted,
                remaining_ancestor,
            },
            purge,
        })
    }

    /// 按公共标识符删除，层级不符返回UnknownResource
    pub async fn delete_resource_public(
        &mut self,
        public_id: &str,
        expected_level: ResourceLevel,
    ) -> Result<DeletionOutcome> {
        match self.lookup_resource(public_id).await? {
            Some((id, level)) if level == expected_level => self.delete_resource(id).await,
            _ => Err(StoreError::UnknownResource(public_id.to_string())),
        }
    }

    /// 供一致性检查使用：某附件uuid是否仍被索引引用
    pub async fn is_attachment_referenced(&mut self, uuid: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM attached_files WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }
}
