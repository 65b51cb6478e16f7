//! 服务上下文
//!
//! 入库流水线与全部对外入口。每个写路径遵循固定顺序：
//! 附件I/O（无锁）-> 索引写锁内的事务 -> 提交后入队变更分发，
//! 监听器永远在索引锁之外被调用。

use std::collections::HashSet;
use std::sync::Arc;

use litepacs_core::config::StoreConfig;
use litepacs_core::dicom::{
    DicomMap, ParsedDicomInstance, TAG_CARDIAC_NUMBER_OF_IMAGES, TAG_IMAGES_IN_ACQUISITION,
    TAG_IMAGE_INDEX, TAG_INSTANCE_NUMBER, TAG_NUMBER_OF_SLICES, TAG_PATIENT_ID,
};
use litepacs_core::hasher::InstanceHasher;
use litepacs_core::utils::now_iso_string;
use litepacs_core::{
    ChangeEvent, ChangeKind, ContentType, DeletionReport, ExportedResource, FileInfo, MetadataKey,
    ResourceLevel, ResourceSnapshot, Result, SeriesStatus, Statistics, StoreError, StoreStatus,
};
use litepacs_index::{IndexDatabase, IndexTransaction, RecyclingQuota};
use litepacs_storage::{FilesystemStorage, StorageAccessor};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::InstanceCache;
use crate::fanout::ChangeFanout;
use crate::find::{execute_find, FindLimits, FindQuery};
use crate::listener::StoreListener;

/// 实例缓存容量
const INSTANCE_CACHE_CAPACITY: usize = 32;

/// 变更日志单次读取的内部上限
const CHANGE_FETCH_LIMIT: u32 = 1_000_000;

/// 存储核心的服务上下文，前端唯一依赖的入口类型
pub struct ServerContext {
    config: StoreConfig,
    index: IndexDatabase,
    accessor: StorageAccessor,
    listeners: Arc<Mutex<Vec<Arc<dyn StoreListener>>>>,
    fanout: ChangeFanout,
    cache: InstanceCache,
}

/// 索引事务的入库结果
enum IndexOutcome {
    Stored {
        events: Vec<ChangeEvent>,
        purge: Vec<FileInfo>,
    },
    AlreadyStored,
}

impl ServerContext {
    /// 打开索引与附件存储并启动变更分发
    pub async fn new(config: StoreConfig) -> Result<Arc<Self>> {
        let index = IndexDatabase::open(&config.database_path).await?;
        let storage = FilesystemStorage::new(config.storage_path.clone()).await?;
        let accessor = StorageAccessor::new(
            storage,
            config.compression_enabled,
            config.store_md5_for_attachments,
        );

        let listeners: Arc<Mutex<Vec<Arc<dyn StoreListener>>>> = Arc::new(Mutex::new(Vec::new()));
        let fanout = ChangeFanout::new(listeners.clone());

        let context = Arc::new(Self {
            config,
            index,
            accessor,
            listeners,
            fanout,
            cache: InstanceCache::new(INSTANCE_CACHE_CAPACITY),
        });

        // 两次运行之间上限配置可能收紧，启动时先回收一轮
        context.standalone_recycling().await?;
        Ok(context)
    }

    fn quota(&self) -> RecyclingQuota {
        RecyclingQuota {
            max_patient_count: self.config.max_patient_count,
            max_storage_size: self.config.max_storage_size,
        }
    }

    /// 注册监听器，按注册顺序收到事件
    pub async fn register_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.lock().await.push(listener);
    }

    async fn standalone_recycling(&self) -> Result<()> {
        let purge = {
            let mut tx = self.index.transaction().await?;
            let purge = tx.enforce_limits(self.quota(), 0, false, None).await?;
            tx.commit().await?;
            purge
        };
        self.purge_files(&purge).await;
        Ok(())
    }

    async fn purge_files(&self, files: &[FileInfo]) {
        for info in files {
            if let Err(e) = self.accessor.remove(&info.uuid).await {
                error!("Failed to purge attachment {}: {}", info.uuid, e);
            }
        }
    }

    async fn emit_events(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.fanout.signal_change(event).await;
        }
    }

    // ========== 入库流水线 ==========

    /// 存储一个已解析的DICOM实例
    pub async fn store(
        &self,
        instance: ParsedDicomInstance,
        remote_aet: &str,
    ) -> Result<(StoreStatus, String)> {
        // 1. 由UID链推导稳定标识符
        let hasher = match InstanceHasher::new(&instance.tags) {
            Ok(hasher) => hasher,
            Err(StoreError::MissingRequiredTag(tag)) => {
                warn!("Rejecting instance without required tag {}", tag);
                return Ok((StoreStatus::MissingRequiredTag, String::new()));
            }
            Err(e) => return Err(e),
        };
        let instance_public = hasher.hash_instance();

        // 2. 准入过滤
        let listeners = self.listeners.lock().await.clone();
        for listener in &listeners {
            match listener.filter_incoming(&instance).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Instance {} rejected by admission filter", instance_public);
                    return Ok((StoreStatus::FilteredOut, instance_public));
                }
                // 过滤器自身出错不拦截入库
                Err(e) => error!("Admission filter failed: {}", e),
            }
        }

        // 3. 事务之外写入两个附件
        let summary = serde_json::to_vec(&instance.tags.to_json())?;
        let dicom_info = self.accessor.write(&instance.data, ContentType::Dicom).await?;
        let json_info = match self.accessor.write(&summary, ContentType::DicomAsJson).await {
            Ok(info) => info,
            Err(e) => {
                self.purge_files(std::slice::from_ref(&dicom_info)).await;
                return Err(e);
            }
        };

        // 4-13. 单个事务内完成层级插入，失败补偿附件
        let outcome = self
            .store_in_index(&hasher, &instance.tags, remote_aet, &dicom_info, &json_info)
            .await;

        match outcome {
            Ok(IndexOutcome::Stored { events, purge }) => {
                // 回收掉的患者附件在提交之后才真正删除
                self.purge_files(&purge).await;

                // 14. 变更分发与入库回调都在索引锁之外
                self.emit_events(events).await;
                for listener in &listeners {
                    if let Err(e) = listener.on_stored(&instance_public, &instance).await {
                        error!("Stored-event listener failed: {}", e);
                    }
                }
                Ok((StoreStatus::Success, instance_public))
            }
            Ok(IndexOutcome::AlreadyStored) => {
                self.purge_files(&[dicom_info, json_info]).await;
                Ok((StoreStatus::AlreadyStored, instance_public))
            }
            Err(e) => {
                self.purge_files(&[dicom_info, json_info]).await;
                match e {
                    StoreError::FullStorage => Ok((StoreStatus::FullStorage, instance_public)),
                    e => {
                        error!("Store of {} failed: {}", instance_public, e);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn store_in_index(
        &self,
        hasher: &InstanceHasher,
        tags: &DicomMap,
        remote_aet: &str,
        dicom_info: &FileInfo,
        json_info: &FileInfo,
    ) -> Result<IndexOutcome> {
        let mut tx = self.index.transaction().await?;
        let first_seq = tx.last_change_seq().await?;

        // 实例已存在时直接放弃，事务丢弃即回滚
        if tx.lookup_resource(&hasher.hash_instance()).await?.is_some() {
            return Ok(IndexOutcome::AlreadyStored);
        }

        // 入库前先满足容量上限，绝不回收本次写入的患者。
        // 患者的公共标识符是随机UUID，复用经由PatientID标识符索引
        let existing_patient = tx
            .lookup_identifier_exact(TAG_PATIENT_ID, hasher.patient_id(), ResourceLevel::Patient)
            .await?
            .first()
            .copied();
        let additional = dicom_info.compressed_size + json_info.compressed_size;
        let purge = tx
            .enforce_limits(
                self.quota(),
                additional,
                existing_patient.is_none(),
                existing_patient,
            )
            .await?;

        let now = now_iso_string();

        // 自患者向下逐层查找或创建
        let patient = match existing_patient {
            Some(id) => id,
            None => {
                let id = tx
                    .create_resource(&Uuid::new_v4().to_string(), ResourceLevel::Patient)
                    .await?;
                tx.set_main_dicom_tags(id, &tags.extract_level(ResourceLevel::Patient)).await?;
                tx.register_identifiers(id, ResourceLevel::Patient, tags).await?;
                tx.track_patient(id).await?;
                tx.log_change_for(ChangeKind::NewPatient, id).await?;
                id
            }
        };

        let study = match tx.lookup_resource(&hasher.hash_study()).await? {
            Some((id, _)) => id,
            None => {
                let id = tx
                    .create_resource(&hasher.hash_study(), ResourceLevel::Study)
                    .await?;
                // 检查行冗余保存患者标签，加速检查层级搜索
                let mut study_tags = tags.extract_level(ResourceLevel::Study);
                let patient_tags = tags.extract_level(ResourceLevel::Patient);
                for (tag, value) in patient_tags.iter() {
                    study_tags.set(*tag, value.clone());
                }
                tx.set_main_dicom_tags(id, &study_tags).await?;
                tx.register_identifiers(id, ResourceLevel::Study, tags).await?;
                tx.attach_child(patient, id).await?;
                tx.log_change_for(ChangeKind::NewStudy, id).await?;
                id
            }
        };

        let (series, is_new_series) = match tx.lookup_resource(&hasher.hash_series()).await? {
            Some((id, _)) => (id, false),
            None => {
                let id = tx
                    .create_resource(&hasher.hash_series(), ResourceLevel::Series)
                    .await?;
                tx.set_main_dicom_tags(id, &tags.extract_level(ResourceLevel::Series)).await?;
                tx.register_identifiers(id, ResourceLevel::Series, tags).await?;
                tx.attach_child(study, id).await?;
                tx.log_change_for(ChangeKind::NewSeries, id).await?;
                (id, true)
            }
        };

        let instance = tx
            .create_resource(&hasher.hash_instance(), ResourceLevel::Instance)
            .await?;
        tx.set_main_dicom_tags(instance, &tags.extract_level(ResourceLevel::Instance)).await?;
        tx.register_identifiers(instance, ResourceLevel::Instance, tags).await?;
        tx.attach_child(series, instance).await?;
        tx.log_change_for(ChangeKind::NewInstance, instance).await?;

        // 登记两个附件
        tx.add_attachment(instance, dicom_info).await?;
        tx.add_attachment(instance, json_info).await?;

        // 实例元数据
        tx.set_metadata(instance, MetadataKey::ReceptionDate, &now).await?;
        tx.set_metadata(instance, MetadataKey::RemoteAet, remote_aet).await?;
        if let Some(index) = tags
            .get(TAG_INSTANCE_NUMBER)
            .or_else(|| tags.get(TAG_IMAGE_INDEX))
        {
            tx.set_metadata(instance, MetadataKey::IndexInSeries, index).await?;
        }

        if is_new_series {
            if let Some(expected) = tags
                .get(TAG_NUMBER_OF_SLICES)
                .or_else(|| tags.get(TAG_IMAGES_IN_ACQUISITION))
                .or_else(|| tags.get(TAG_CARDIAC_NUMBER_OF_IMAGES))
            {
                tx.set_metadata(series, MetadataKey::ExpectedNumberOfInstances, expected)
                    .await?;
            }
        }

        // 触达的每一层记录更新时间
        for id in [patient, study, series, instance] {
            tx.set_metadata(id, MetadataKey::LastUpdate, &now).await?;
        }

        // 患者移到回收顺序的最近端
        tx.touch_patient(patient).await?;

        // 系列因本实例而完整时记录一条变更
        if compute_series_status(&mut tx, series).await? == SeriesStatus::Complete {
            tx.log_change_for(ChangeKind::CompletedSeries, series).await?;
        }

        let (events, _) = tx.get_changes(first_seq, CHANGE_FETCH_LIMIT).await?;
        tx.commit().await?;

        Ok(IndexOutcome::Stored { events, purge })
    }

    // ========== 查找入口 ==========

    /// 资源快照，层级不符视为未知资源
    pub async fn get_resource(
        &self,
        public_id: &str,
        expected_level: ResourceLevel,
    ) -> Result<ResourceSnapshot> {
        let mut tx = self.index.transaction().await?;
        let (id, level) = match tx.lookup_resource(public_id).await? {
            Some((id, level)) if level == expected_level => (id, level),
            _ => return Err(StoreError::UnknownResource(public_id.to_string())),
        };

        let parent = tx.get_parent_public(id).await?;
        let children = tx.get_children_public(id).await?;
        let tags = tx.get_main_dicom_tags(id).await?;
        let main_dicom_tags = tags
            .iter()
            .map(|(tag, value)| (tag.to_string(), value.clone()))
            .collect();

        let mut snapshot = ResourceSnapshot {
            public_id: public_id.to_string(),
            level,
            parent,
            children,
            main_dicom_tags,
            series_status: None,
            expected_number_of_instances: None,
            file_size: None,
            file_uuid: None,
            index_in_series: None,
        };

        match level {
            ResourceLevel::Series => {
                snapshot.series_status = Some(compute_series_status(&mut tx, id).await?);
                snapshot.expected_number_of_instances = tx
                    .lookup_metadata_u32(id, MetadataKey::ExpectedNumberOfInstances)
                    .await?;
            }
            ResourceLevel::Instance => {
                let info = tx
                    .lookup_attachment(id, ContentType::Dicom)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Internal(format!("实例{}缺少DICOM附件", public_id))
                    })?;
                snapshot.file_size = Some(info.uncompressed_size);
                snapshot.file_uuid = Some(info.uuid);
                snapshot.index_in_series =
                    tx.lookup_metadata_u32(id, MetadataKey::IndexInSeries).await?;
            }
            _ => {}
        }

        Ok(snapshot)
    }

    /// 子资源的公共标识符
    pub async fn get_children_public(&self, public_id: &str) -> Result<Vec<String>> {
        let mut tx = self.index.transaction().await?;
        let (id, _) = tx
            .lookup_resource(public_id)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(public_id.to_string()))?;
        tx.get_children_public(id).await
    }

    /// 父资源的公共标识符
    pub async fn get_parent_public(&self, public_id: &str) -> Result<Option<String>> {
        let mut tx = self.index.transaction().await?;
        let (id, _) = tx
            .lookup_resource(public_id)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(public_id.to_string()))?;
        tx.get_parent_public(id).await
    }

    /// 某层级全部资源
    pub async fn list(&self, level: ResourceLevel) -> Result<Vec<String>> {
        let mut tx = self.index.transaction().await?;
        tx.list_level(level).await
    }

    /// 存储统计
    pub async fn statistics(&self) -> Result<Statistics> {
        let mut tx = self.index.transaction().await?;
        Ok(Statistics {
            total_compressed_size: tx.total_compressed_size().await?,
            total_uncompressed_size: tx.total_uncompressed_size().await?,
            count_patients: tx.resource_count(ResourceLevel::Patient).await?,
            count_studies: tx.resource_count(ResourceLevel::Study).await?,
            count_series: tx.resource_count(ResourceLevel::Series).await?,
            count_instances: tx.resource_count(ResourceLevel::Instance).await?,
        })
    }

    /// 结构化查询
    pub async fn find(&self, query: &FindQuery) -> Result<Vec<String>> {
        let mut tx = self.index.transaction().await?;
        let limits = FindLimits {
            max_results: self.config.limit_find_results,
            max_scanned_instances: self.config.limit_find_instances,
        };
        execute_find(&mut tx, &self.accessor, query, limits).await
    }

    // ========== 变更入口 ==========

    /// 删除资源及其子树
    pub async fn delete(
        &self,
        public_id: &str,
        expected_level: ResourceLevel,
    ) -> Result<DeletionReport> {
        let (outcome, events) = {
            let mut tx = self.index.transaction().await?;
            let first_seq = tx.last_change_seq().await?;
            let outcome = tx.delete_resource_public(public_id, expected_level).await?;
            let (events, _) = tx.get_changes(first_seq, CHANGE_FETCH_LIMIT).await?;
            tx.commit().await?;
            (outcome, events)
        };

        // 提交之后才清除附件与缓存
        self.purge_files(&outcome.purge).await;
        for resource in &outcome.report.deleted {
            if resource.level == ResourceLevel::Instance {
                self.cache.invalidate(&resource.public_id).await;
            }
        }
        self.emit_events(events).await;
        Ok(outcome.report)
    }

    /// 设置患者保护状态
    pub async fn set_protected(&self, patient_public_id: &str, protected: bool) -> Result<()> {
        let mut tx = self.index.transaction().await?;
        let (id, level) = tx
            .lookup_resource(patient_public_id)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(patient_public_id.to_string()))?;
        if level != ResourceLevel::Patient {
            return Err(StoreError::UnknownResource(patient_public_id.to_string()));
        }
        tx.set_protected_patient(id, protected).await?;
        tx.commit().await?;

        if protected {
            info!("Patient {} has been protected", patient_public_id);
        } else {
            info!("Patient {} has been unprotected", patient_public_id);
        }
        Ok(())
    }

    /// 患者是否受保护
    pub async fn is_protected(&self, patient_public_id: &str) -> Result<bool> {
        let mut tx = self.index.transaction().await?;
        let (id, level) = tx
            .lookup_resource(patient_public_id)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(patient_public_id.to_string()))?;
        if level != ResourceLevel::Patient {
            return Err(StoreError::UnknownResource(patient_public_id.to_string()));
        }
        tx.is_protected_patient(id).await
    }

    /// 为资源追加一个附件；该内容类型已存在时返回false
    pub async fn add_attachment(
        &self,
        public_id: &str,
        content_type: ContentType,
        data: &[u8],
    ) -> Result<bool> {
        let info = self.accessor.write(data, content_type).await?;

        let result: Result<bool> = async {
            let mut tx = self.index.transaction().await?;
            let (id, _) = tx
                .lookup_resource(public_id)
                .await?
                .ok_or_else(|| StoreError::UnknownResource(public_id.to_string()))?;

            if tx.lookup_attachment(id, content_type).await?.is_some() {
                return Ok(false);
            }

            tx.add_attachment(id, &info).await?;
            if let Some(patient) = find_patient_ancestor(&mut tx, id).await? {
                tx.touch_patient(patient).await?;
            }
            tx.commit().await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.purge_files(std::slice::from_ref(&info)).await;
                Ok(false)
            }
            Err(e) => {
                self.purge_files(std::slice::from_ref(&info)).await;
                Err(e)
            }
        }
    }

    /// 读取附件内容，读取也会触达所属患者
    pub async fn read_attachment(
        &self,
        public_id: &str,
        content_type: ContentType,
    ) -> Result<Vec<u8>> {
        let info = {
            let mut tx = self.index.transaction().await?;
            let (id, _) = tx
                .lookup_resource(public_id)
                .await?
                .ok_or_else(|| StoreError::UnknownResource(public_id.to_string()))?;
            let info = tx.lookup_attachment(id, content_type).await?.ok_or_else(|| {
                StoreError::UnknownResource(format!("{}无此类型附件", public_id))
            })?;
            if let Some(patient) = find_patient_ancestor(&mut tx, id).await? {
                tx.touch_patient(patient).await?;
            }
            tx.commit().await?;
            info
        };

        self.accessor.read(&info).await
    }

    /// 经由缓存读取已解析实例，同一实例至多一次并发加载
    pub async fn get_parsed_instance(&self, public_id: &str) -> Result<Arc<ParsedDicomInstance>> {
        self.cache
            .get_or_load(public_id, || async {
                let data = self.read_attachment(public_id, ContentType::Dicom).await?;
                let summary = self
                    .read_attachment(public_id, ContentType::DicomAsJson)
                    .await?;
                let value: serde_json::Value = serde_json::from_slice(&summary)?;
                Ok(ParsedDicomInstance::new(DicomMap::from_json(&value)?, data))
            })
            .await
    }

    // ========== 日志入口 ==========

    /// 读取变更日志
    pub async fn changes_since(&self, seq: i64, limit: u32) -> Result<(Vec<ChangeEvent>, bool)> {
        let mut tx = self.index.transaction().await?;
        tx.get_changes(seq, limit).await
    }

    /// 记录资源转发
    pub async fn log_exported(&self, public_id: &str, remote_aet: &str) -> Result<()> {
        let mut tx = self.index.transaction().await?;
        let (id, _) = tx
            .lookup_resource(public_id)
            .await?
            .ok_or_else(|| StoreError::UnknownResource(public_id.to_string()))?;
        tx.log_exported_resource(id, remote_aet).await?;
        tx.commit().await
    }

    /// 读取转发日志
    pub async fn exported_since(
        &self,
        seq: i64,
        limit: u32,
    ) -> Result<(Vec<ExportedResource>, bool)> {
        let mut tx = self.index.transaction().await?;
        tx.get_exported_resources(seq, limit).await
    }

    // ========== 维护 ==========

    /// 清除附件存储中不被索引引用的孤儿文件，返回清除数量
    ///
    /// 入库失败补偿窗口内产生的残留由此回收，启动时调用一次。
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let on_disk = self.accessor.storage().list_all().await?;
        let referenced: HashSet<String> = {
            let mut tx = self.index.transaction().await?;
            tx.referenced_attachment_uuids().await?.into_iter().collect()
        };

        let mut removed = 0;
        for uuid in on_disk {
            if !referenced.contains(&uuid) {
                self.accessor.remove(&uuid).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Reclaimed {} orphan attachments", removed);
        }
        Ok(removed)
    }

    /// 有序关闭：停止分发、落盘并关闭数据库
    pub async fn shutdown(&self) -> Result<()> {
        self.fanout.shutdown().await;
        self.index.flush_to_disk().await?;
        self.index.close().await;
        info!("Server context stopped");
        Ok(())
    }
}

/// 沿父链找到患者层级的祖先
async fn find_patient_ancestor(
    tx: &mut IndexTransaction<'_>,
    id: i64,
) -> Result<Option<i64>> {
    let mut current = id;
    loop {
        if tx.get_level(current).await? == ResourceLevel::Patient {
            return Ok(Some(current));
        }
        match tx.get_parent(current).await? {
            Some(parent) => current = parent,
            None => return Ok(None),
        }
    }
}

/// 系列完整性：预期实例数与各实例序号的比对
async fn compute_series_status(
    tx: &mut IndexTransaction<'_>,
    series: i64,
) -> Result<SeriesStatus> {
    let expected = match tx
        .lookup_metadata_u32(series, MetadataKey::ExpectedNumberOfInstances)
        .await?
    {
        Some(expected) if expected > 0 => expected,
        _ => return Ok(SeriesStatus::Unknown),
    };

    let mut seen = HashSet::new();
    for child in tx.get_children(series).await? {
        let index = match tx.lookup_metadata_u32(child, MetadataKey::IndexInSeries).await? {
            Some(index) => index,
            None => return Ok(SeriesStatus::Unknown),
        };
        if index == 0 || index > expected {
            return Ok(SeriesStatus::Inconsistent);
        }
        if !seen.insert(index) {
            return Ok(SeriesStatus::Inconsistent);
        }
    }

    if seen.len() as u32 == expected {
        Ok(SeriesStatus::Complete)
    } else {
        Ok(SeriesStatus::Missing)
    }
}
