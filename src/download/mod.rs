//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`：请求、运行状态、结果与错误类型
//! - `progress`：进度通道与 CLI 进度条
//! - `orchestrator`：单本书的下载状态机

pub mod models;
pub mod orchestrator;
pub mod progress;
