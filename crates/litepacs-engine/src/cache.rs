//! 已解析实例缓存
//!
//! 以公共标识符为键的有界LRU缓存；同一个键至多只有一次并发加载，
//! 其余调用方等待首个加载完成（single-flight）。

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use litepacs_core::dicom::ParsedDicomInstance;
use litepacs_core::Result;
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};

type Slot = Arc<OnceCell<Arc<ParsedDicomInstance>>>;

/// 有界实例缓存
pub struct InstanceCache {
    slots: Mutex<LruCache<String, Slot>>,
}

impl InstanceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 取出缓存值，未命中时用loader加载并写入
    ///
    /// 加载失败不会污染缓存，下次调用会重新加载。
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<Arc<ParsedDicomInstance>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ParsedDicomInstance>>,
    {
        let slot: Slot = {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(slot) => slot.clone(),
                None => {
                    let slot: Slot = Arc::new(OnceCell::new());
                    slots.put(key.to_string(), slot.clone());
                    slot
                }
            }
        };

        let value = slot
            .get_or_try_init(|| async { loader().await.map(Arc::new) })
            .await?;
        Ok(value.clone())
    }

    /// 移除某个键（资源被删除时调用）
    pub async fn invalidate(&self, key: &str) {
        self.slots.lock().await.pop(key);
    }

    /// 当前缓存条目数
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use litepacs_core::dicom::DicomMap;
    use litepacs_core::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance(data: &[u8]) -> ParsedDicomInstance {
        ParsedDicomInstance::new(DicomMap::new(), data.to_vec())
    }

    #[tokio::test]
    async fn test_load_once() {
        let cache = InstanceCache::new(4);
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_load("a", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(instance(b"payload"))
                })
                .await
                .unwrap();
            assert_eq!(value.data, b"payload");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let cache = InstanceCache::new(4);

        let first: Result<_> = cache
            .get_or_load("a", || async { Err(StoreError::Internal("boom".to_string())) })
            .await;
        assert!(first.is_err());

        // 失败后重新加载成功
        let second = cache
            .get_or_load("a", || async { Ok(instance(b"ok")) })
            .await
            .unwrap();
        assert_eq!(second.data, b"ok");
    }

    #[tokio::test]
    async fn test_capacity_bounded() {
        let cache = InstanceCache::new(2);
        for key in ["a", "b", "c"] {
            cache
                .get_or_load(key, || async { Ok(instance(key.as_bytes())) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = InstanceCache::new(4);
        cache
            .get_or_load("a", || async { Ok(instance(b"v1")) })
            .await
            .unwrap();
        cache.invalidate("a").await;

        let value = cache
            .get_or_load("a", || async { Ok(instance(b"v2")) })
            .await
            .unwrap();
        assert_eq!(value.data, b"v2");
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = Arc::new(InstanceCache::new(4));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("shared", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(instance(b"shared"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 并发请求只触发一次加载
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
