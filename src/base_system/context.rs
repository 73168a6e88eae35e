//! 全局配置结构（Config）与默认值。
//!
//! 引擎本身不读取配置：`main` 在启动时把 `Config` 转换成显式的
//! `FetchSettings` / 输出目录 / 会话，再交给编排器与各来源策略。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};
use crate::network_parser::fetcher::{DEFAULT_USER_AGENT, FetchSettings};
use crate::sources::{SourceKind, TileOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 保存配置
    #[serde(default)]
    pub save_path: String,

    // 网络配置
    #[serde(default = "default_retry_bound")]
    pub retry_bound: u32,
    #[serde(default)]
    pub pause_ms: Option<u64>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 瓦片配置
    #[serde(default = "default_tile_zoom")]
    pub tile_zoom: usize,
    #[serde(default = "default_max_tile_num")]
    pub max_tile_num: usize,

    // 单文件来源
    #[serde(default = "default_download_poll_attempts")]
    pub download_poll_attempts: usize,

    // 会话：来源标签 -> Cookie 字符串
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            retry_bound: default_retry_bound(),
            pause_ms: None,
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            tile_zoom: default_tile_zoom(),
            max_tile_num: default_max_tile_num(),
            download_poll_attempts: default_download_poll_attempts(),
            cookies: BTreeMap::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 9] = [
            FieldMeta {
                name: "save_path",
                description: "书籍保存根目录（留空为当前目录）",
            },
            FieldMeta {
                name: "retry_bound",
                description: "遇到 429 限频时的最大尝试次数",
            },
            FieldMeta {
                name: "pause_ms",
                description: "请求之间的礼貌停顿（毫秒）；留空使用各来源默认值",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "tile_zoom",
                description: "瓦片来源使用的缩放级别",
            },
            FieldMeta {
                name: "max_tile_num",
                description: "单页最多尝试的瓦片数",
            },
            FieldMeta {
                name: "download_poll_attempts",
                description: "单文件下载状态的最大轮询次数",
            },
            FieldMeta {
                name: "cookies",
                description: "需要登录的来源使用的 Cookie，例如:\nLIBFL: \"session=...; token=...\"",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn pause_for(&self, source: SourceKind) -> Duration {
        self.pause_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| source.default_pause())
    }

    pub fn fetch_settings(&self, source: SourceKind) -> FetchSettings {
        FetchSettings {
            retry_bound: self.retry_bound.max(1),
            pause: self.pause_for(source),
            user_agent: self.user_agent.clone(),
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
        }
    }

    pub fn tile_options(&self) -> TileOptions {
        TileOptions {
            zoom: self.tile_zoom,
            max_tile_num: self.max_tile_num.max(1),
        }
    }

    pub fn cookie_for(&self, source: SourceKind) -> Option<String> {
        self.cookies
            .iter()
            .find(|(tag, _)| tag.eq_ignore_ascii_case(source.tag()))
            .map(|(_, raw)| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }
}

fn default_retry_bound() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_tile_zoom() -> usize {
    4
}

fn default_max_tile_num() -> usize {
    999
}

fn default_download_poll_attempts() -> usize {
    100
}
