//! 共享库
//!
//! 规则编译与缓存服务共用的配置、错误处理、数据库连接、Redis 缓存和可观测性基础设施。

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;
