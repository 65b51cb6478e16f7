//! 监听器接口
//!
//! 变更通知、入库回调与准入过滤合并为一个能力集合，
//! 全部带有默认空实现；脚本或插件适配器在核心之外实现本接口。

use async_trait::async_trait;
use litepacs_core::dicom::ParsedDicomInstance;
use litepacs_core::{ChangeEvent, Result};

/// 存储事件监听器
#[async_trait]
pub trait StoreListener: Send + Sync {
    /// 层级发生变更后异步收到通知
    async fn on_change(&self, _event: &ChangeEvent) -> Result<()> {
        Ok(())
    }

    /// 实例成功入库后在提交之外被调用
    async fn on_stored(&self, _public_id: &str, _instance: &ParsedDicomInstance) -> Result<()> {
        Ok(())
    }

    /// 准入过滤，返回false拒绝该实例
    async fn filter_incoming(&self, _instance: &ParsedDicomInstance) -> Result<bool> {
        Ok(true)
    }
}
