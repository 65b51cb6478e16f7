//! 变更分发
//!
//! 有界FIFO队列加单个后台任务：入队立即返回，
//! 监听器在索引写锁之外按注册顺序收到事件；
//! 单个监听器出错只记录日志，不影响其余监听器。

use std::sync::Arc;
use std::time::Duration;

use litepacs_core::ChangeEvent;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::listener::StoreListener;

/// 队列容量，正常运行下不会填满
const QUEUE_CAPACITY: usize = 1024;

/// 出队超时，保证后台任务能周期性检查关闭状态
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

type ListenerList = Arc<Mutex<Vec<Arc<dyn StoreListener>>>>;

/// 变更事件分发器
pub struct ChangeFanout {
    sender: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFanout {
    /// 启动后台分发任务
    pub fn new(listeners: ListenerList) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(Self::run_worker(receiver, listeners));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(mut receiver: mpsc::Receiver<ChangeEvent>, listeners: ListenerList) {
        loop {
            match tokio::time::timeout(DEQUEUE_TIMEOUT, receiver.recv()).await {
                Ok(Some(event)) => {
                    // 先拷贝快照再调用，监听器可以安全地回调核心
                    let snapshot = listeners.lock().await.clone();
                    for listener in snapshot {
                        if let Err(e) = listener.on_change(&event).await {
                            error!("Change listener failed on event {}: {}", event.seq, e);
                        }
                    }
                }
                // 发送端全部关闭且队列排空，正常退出
                Ok(None) => break,
                // 超时继续等待
                Err(_) => continue,
            }
        }
        debug!("Change fan-out worker stopped");
    }

    /// 入队一个变更事件，立即返回
    pub async fn signal_change(&self, event: ChangeEvent) {
        let guard = self.sender.lock().await;
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(event).await.is_err() {
                    warn!("Change fan-out worker is gone, event dropped");
                }
            }
            None => warn!("Change fan-out already shut down, event dropped"),
        }
    }

    /// 关闭：排空队列、停止后台任务并等待其退出
    pub async fn shutdown(&self) {
        // 丢弃发送端关闭通道，后台任务排空后自行退出
        self.sender.lock().await.take();

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Change fan-out worker join failed: {}", e);
            }
        }
        info!("Change fan-out stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use litepacs_core::{ChangeKind, ResourceLevel, Result, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl StoreListener for Recorder {
        async fn on_change(&self, event: &ChangeEvent) -> Result<()> {
            self.seen.lock().await.push(event.seq);
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StoreListener for Failing {
        async fn on_change(&self, _event: &ChangeEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Internal("listener failure".to_string()))
        }
    }

    fn event(seq: i64) -> ChangeEvent {
        ChangeEvent {
            seq,
            kind: ChangeKind::NewInstance,
            level: ResourceLevel::Instance,
            public_id: format!("id-{}", seq),
            date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let listeners: ListenerList =
            Arc::new(Mutex::new(vec![recorder.clone() as Arc<dyn StoreListener>]));
        let fanout = ChangeFanout::new(listeners);

        for seq in 1..=5 {
            fanout.signal_change(event(seq)).await;
        }
        fanout.shutdown().await;

        assert_eq!(*recorder.seen.lock().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let listeners: ListenerList = Arc::new(Mutex::new(vec![
            failing.clone() as Arc<dyn StoreListener>,
            recorder.clone() as Arc<dyn StoreListener>,
        ]));
        let fanout = ChangeFanout::new(listeners);

        fanout.signal_change(event(1)).await;
        fanout.shutdown().await;

        // 第一个监听器失败后第二个仍然收到事件
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.seen.lock().await, vec![1]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let listeners: ListenerList =
            Arc::new(Mutex::new(vec![recorder.clone() as Arc<dyn StoreListener>]));
        let fanout = ChangeFanout::new(listeners);

        for seq in 1..=50 {
            fanout.signal_change(event(seq)).await;
        }
        fanout.shutdown().await;
        assert_eq!(recorder.seen.lock().await.len(), 50);

        // 关闭后的事件被丢弃而不是阻塞
        fanout.signal_change(event(99)).await;
    }
}
