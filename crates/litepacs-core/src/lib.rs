//! # LitePACS Core
//!
//! LitePACS系统的核心模块，提供基础数据结构、错误定义和通用工具。

pub mod config;
pub mod dicom;
pub mod error;
pub mod hasher;
pub mod models;
pub mod utils;

pub use error::{Result, StoreError};
pub use models::*;
