//! 索引数据库连接与事务
//!
//! 所有写操作都必须在事务内进行；嵌入式引擎不支持并发写入，
//! 事务在整个生命周期内持有唯一的写锁。

use std::str::FromStr;
use std::sync::Arc;

use litepacs_core::{GlobalProperty, ResourceLevel, Result, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::schema::{CREATE_INDEXES, CREATE_TABLES, SCHEMA_VERSION};

/// sqlx错误到统一错误类型的映射，保留可恢复错误的区分
pub(crate) fn map_sqlx(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return StoreError::DuplicateResource(db.message().to_string());
            }
            match db.code().as_deref() {
                Some("5") | Some("261") | Some("517") => StoreError::DatabaseBusy,
                Some("13") => StoreError::DiskFull,
                _ => StoreError::Database(e.to_string()),
            }
        }
        _ => StoreError::Database(e.to_string()),
    }
}

/// 嵌入式索引数据库
#[derive(Debug, Clone)]
pub struct IndexDatabase {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    in_memory: bool,
}

impl IndexDatabase {
    /// 打开或创建数据库，路径":memory:"表示内存数据库
    pub async fn open(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";

        let (options, max_connections) = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(map_sqlx)?
                .foreign_keys(true);
            // 内存数据库每个连接各自独立，只能使用单连接
            (options, 1)
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true);
            (options, 4)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            in_memory,
        };
        db.initialize().await?;
        Ok(db)
    }

    async fn initialize(&self) -> Result<()> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'global_properties'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if existing.is_none() {
            info!("Creating the index database");
        }

        for statement in CREATE_TABLES.iter().chain(CREATE_INDEXES.iter()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }

        let mut tx = self.transaction().await?;
        match tx.lookup_global_property(GlobalProperty::SchemaVersion).await? {
            None => {
                tx.set_global_property(GlobalProperty::SchemaVersion, &SCHEMA_VERSION.to_string())
                    .await?;
            }
            Some(version) => {
                let version: i64 = version
                    .parse()
                    .map_err(|_| StoreError::Database(format!("无效的结构版本: {}", version)))?;
                if version != SCHEMA_VERSION {
                    return Err(StoreError::Database(format!(
                        "数据库结构版本不兼容: 文件为{}，程序要求{}",
                        version, SCHEMA_VERSION
                    )));
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// 开启事务，独占写锁直到提交或回滚
    pub async fn transaction(&self) -> Result<IndexTransaction<'_>> {
        let guard = self.write_lock.lock().await;
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(IndexTransaction { tx, _guard: guard })
    }

    /// 将WAL日志落盘
    pub async fn flush_to_disk(&self) -> Result<()> {
        if !self.in_memory {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            debug!("Checkpointed the index database");
        }
        Ok(())
    }

    /// 关闭数据库连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 索引事务，所有读写方法的载体
///
/// 丢弃未提交的事务会自动回滚。
pub struct IndexTransaction<'a> {
    pub(crate) tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> IndexTransaction<'a> {
    /// 提交事务并释放写锁
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    /// 显式回滚
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx)
    }

    // ========== 资源层级操作 ==========

    /// 创建资源，公共标识符冲突返回DuplicateResource
    pub async fn create_resource(
        &mut self,
        public_id: &str,
        level: ResourceLevel,
    ) -> Result<i64> {
        let result =
            sqlx::query("INSERT INTO resources (public_id, resource_level, parent_id) VALUES (?, ?, NULL)")
                .bind(public_id)
                .bind(level.as_code())
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        Ok(result.last_insert_rowid())
    }

    /// 按公共标识符查找资源
    pub async fn lookup_resource(&mut self, public_id: &str) -> Result<Option<(i64, ResourceLevel)>> {
        let row = sqlx::query(
            "SELECT internal_id, resource_level FROM resources WHERE public_id = ?",
        )
        .bind(public_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let id: i64 = row.get(0);
                let level = ResourceLevel::from_code(row.get(1))?;
                Ok(Some((id, level)))
            }
            None => Ok(None),
        }
    }

    /// 资源的公共标识符
    pub async fn get_public_id(&mut self, id: i64) -> Result<String> {
        let row = sqlx::query("SELECT public_id FROM resources WHERE internal_id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| r.get(0))
            .ok_or_else(|| StoreError::UnknownResource(id.to_string()))
    }

    /// 资源的层级
    pub async fn get_level(&mut self, id: i64) -> Result<ResourceLevel> {
        let row = sqlx::query("SELECT resource_level FROM resources WHERE internal_id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => ResourceLevel::from_code(row.get(0)),
            None => Err(StoreError::UnknownResource(id.to_string())),
        }
    }

    /// 挂接父子关系，层级必须相邻
    pub async fn attach_child(&mut self, parent: i64, child: i64) -> Result<()> {
        let parent_level = self.get_level(parent).await?;
        let child_level = self.get_level(child).await?;
        if parent_level.child() != Some(child_level) {
            return Err(StoreError::Internal(format!(
                "层级不相邻: {} -> {}",
                parent_level.as_str(),
                child_level.as_str()
            )));
        }

        sqlx::query("UPDATE resources SET parent_id = ? WHERE internal_id = ?")
            .bind(parent)
            .bind(child)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// 父资源的内部标识符
    pub async fn get_parent(&mut self, id: i64) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT parent_id FROM resources WHERE internal_id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => Ok(row.get::<Option<i64>, _>(0)),
            None => Err(StoreError::UnknownResource(id.to_string())),
        }
    }

    /// 父资源的公共标识符
    pub async fn get_parent_public(&mut self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT a.public_id FROM resources a, resources b \
             WHERE a.internal_id = b.parent_id AND b.internal_id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get(0)))
    }

    /// 子资源的内部标识符列表
    pub async fn get_children(&mut self, id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT internal_id FROM resources WHERE parent_id = ? ORDER BY internal_id",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 子资源的公共标识符列表
    pub async fn get_children_public(&mut self, id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT public_id FROM resources WHERE parent_id = ? ORDER BY internal_id",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 子资源数量
    pub async fn count_children(&mut self, id: i64) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM resources WHERE parent_id = ?")
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// 某一层级的全部公共标识符
    pub async fn list_level(&mut self, level: ResourceLevel) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT public_id FROM resources WHERE resource_level = ? ORDER BY internal_id",
        )
        .bind(level.as_code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 某一层级的全部内部标识符
    pub async fn list_level_ids(&mut self, level: ResourceLevel) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT internal_id FROM resources WHERE resource_level = ? ORDER BY internal_id",
        )
        .bind(level.as_code())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// 某一层级的资源数量
    pub async fn resource_count(&mut self, level: ResourceLevel) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM resources WHERE resource_level = ?")
            .bind(level.as_code())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    // ========== 主DICOM标签 ==========

    /// 写入资源的主标签
    pub async fn set_main_dicom_tags(
        &mut self,
        id: i64,
        tags: &litepacs_core::dicom::DicomMap,
    ) -> Result<()> {
        for (tag, value) in tags.iter() {
            sqlx::query(
                "INSERT OR REPLACE INTO main_dicom_tags (resource_id, tag_group, tag_element, value) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(tag.group as i64)
            .bind(tag.element as i64)
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    /// 读取资源的主标签
    pub async fn get_main_dicom_tags(
        &mut self,
        id: i64,
    ) -> Result<litepacs_core::dicom::DicomMap> {
        let rows = sqlx::query(
            "SELECT tag_group, tag_element, value FROM main_dicom_tags WHERE resource_id = ?",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        let mut map = litepacs_core::dicom::DicomMap::new();
        for row in rows {
            let group: i64 = row.get(0);
            let element: i64 = row.get(1);
            let value: String = row.get(2);
            map.set(
                litepacs_core::dicom::DicomTag::new(group as u16, element as u16),
                value,
            );
        }
        Ok(map)
    }

    // ========== 全局属性 ==========

    /// 写入全局属性
    pub async fn set_global_property(
        &mut self,
        property: GlobalProperty,
        value: &str,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO global_properties (property, value) VALUES (?, ?)")
            .bind(property.as_code())
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// 读取全局属性
    pub async fn lookup_global_property(
        &mut self,
        property: GlobalProperty,
    ) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM global_properties WHERE property = ?")
            .bind(property.as_code())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use litepacs_core::StoreError;

    async fn open_memory() -> IndexDatabase {
        IndexDatabase::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();

        let id = tx.create_resource("patient-1", ResourceLevel::Patient).await.unwrap();
        assert_eq!(
            tx.lookup_resource("patient-1").await.unwrap(),
            Some((id, ResourceLevel::Patient))
        );
        assert_eq!(tx.lookup_resource("missing").await.unwrap(), None);
        tx.commit().await.unwrap();

        // 提交后在新事务中仍然可见
        let mut tx = db.transaction().await.unwrap();
        assert!(tx.lookup_resource("patient-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_public_id_rejected() {
        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();
        tx.create_resource("dup", ResourceLevel::Patient).await.unwrap();
        assert!(matches!(
            tx.create_resource("dup", ResourceLevel::Study).await,
            Err(StoreError::DuplicateResource(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_child_levels() {
        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();

        let patient = tx.create_resource("p", ResourceLevel::Patient).await.unwrap();
        let study = tx.create_resource("st", ResourceLevel::Study).await.unwrap();
        let series = tx.create_resource("se", ResourceLevel::Series).await.unwrap();

        tx.attach_child(patient, study).await.unwrap();
        tx.attach_child(study, series).await.unwrap();

        // 跳级挂接被拒绝
        let instance = tx.create_resource("in", ResourceLevel::Instance).await.unwrap();
        assert!(tx.attach_child(patient, instance).await.is_err());

        assert_eq!(tx.get_children(patient).await.unwrap(), vec![study]);
        assert_eq!(tx.get_parent(study).await.unwrap(), Some(patient));
        assert_eq!(tx.get_parent(patient).await.unwrap(), None);
        assert_eq!(
            tx.get_parent_public(series).await.unwrap(),
            Some("st".to_string())
        );
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let db = open_memory().await;
        {
            let mut tx = db.transaction().await.unwrap();
            tx.create_resource("ghost", ResourceLevel::Patient).await.unwrap();
            // 不提交直接丢弃
        }
        let mut tx = db.transaction().await.unwrap();
        assert_eq!(tx.lookup_resource("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_main_tags_round_trip() {
        use litepacs_core::dicom::{DicomMap, TAG_PATIENT_ID, TAG_PATIENT_NAME};

        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();
        let id = tx.create_resource("p", ResourceLevel::Patient).await.unwrap();

        let mut tags = DicomMap::new();
        tags.set(TAG_PATIENT_ID, "P1");
        tags.set(TAG_PATIENT_NAME, "Doe^John");
        tx.set_main_dicom_tags(id, &tags).await.unwrap();

        assert_eq!(tx.get_main_dicom_tags(id).await.unwrap(), tags);
    }

    #[tokio::test]
    async fn test_global_properties() {
        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();

        // 打开时已写入结构版本
        assert_eq!(
            tx.lookup_global_property(GlobalProperty::SchemaVersion)
                .await
                .unwrap(),
            Some(crate::schema::SCHEMA_VERSION.to_string())
        );

        tx.set_global_property(GlobalProperty::FlushInterval, "10").await.unwrap();
        assert_eq!(
            tx.lookup_global_property(GlobalProperty::FlushInterval).await.unwrap(),
            Some("10".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let db = open_memory().await;
        let mut tx = db.transaction().await.unwrap();
        tx.create_resource("a", ResourceLevel::Patient).await.unwrap();
        tx.create_resource("b", ResourceLevel::Patient).await.unwrap();
        tx.create_resource("s", ResourceLevel::Study).await.unwrap();

        assert_eq!(tx.list_level(ResourceLevel::Patient).await.unwrap(), vec!["a", "b"]);
        assert_eq!(tx.resource_count(ResourceLevel::Patient).await.unwrap(), 2);
        assert_eq!(tx.resource_count(ResourceLevel::Instance).await.unwrap(), 0);
    }
}
