//! 远程获取：有界重试 + 礼貌停顿。
//!
//! 只有 429（限频）会被重试；其它非成功状态立即失败。404 由调用方
//! 决定是否作为“序列结束”哨兵（见 [`ResilientFetcher::fetch_optional`]）。

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/102.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("error downloading {url}: {status}")]
    Status { url: String, status: u16 },
    #[error("error downloading {url}: still rate limited after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },
    #[error("error downloading {url}: {message}")]
    Transport { url: String, message: String },
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retry_bound: u32,
    pub pause: Duration,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retry_bound: 3,
            pause: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// 单次远程调用的结果分类。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Vec<u8>),
    RateLimited,
    NotFound,
    Fatal(u16),
}

impl From<RawResponse> for FetchOutcome {
    fn from(resp: RawResponse) -> Self {
        match resp.status {
            200..=299 => FetchOutcome::Success(resp.body),
            429 => FetchOutcome::RateLimited,
            404 => FetchOutcome::NotFound,
            status => FetchOutcome::Fatal(status),
        }
    }
}

/// 一次 GET 请求；HTTP 实现之外，测试中用脚本化实现替换。
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, headers: &HeaderMap) -> Result<RawResponse, FetchError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(settings: &FetchSettings) -> anyhow::Result<Self> {
        // reqwest 未启用 gzip 解码，请求 identity 编码以直接拿到原始字节
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, headers: &HeaderMap) -> Result<RawResponse, FetchError> {
        let transport_err = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };
        let resp = self
            .client
            .get(url)
            .headers(headers.clone())
            .send()
            .map_err(transport_err)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().map_err(transport_err)?.to_vec();
        Ok(RawResponse { status, body })
    }
}

pub struct ResilientFetcher {
    transport: Box<dyn Transport>,
    settings: FetchSettings,
}

impl ResilientFetcher {
    pub fn new(transport: Box<dyn Transport>, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// 两次远程调用之间的礼貌停顿。
    pub fn pause(&self) {
        if !self.settings.pause.is_zero() {
            std::thread::sleep(self.settings.pause);
        }
    }

    fn request_headers(&self, extra: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.settings.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        headers.extend(extra.clone());
        headers
    }

    /// 执行带重试的获取，返回 `Success` 或 `NotFound`。
    ///
    /// 429 消耗一次尝试并停顿后重试；尝试次数用尽仍为 429 时返回
    /// [`FetchError::RateLimited`]。其它非成功状态直接返回
    /// [`FetchError::Status`]。
    pub fn fetch_outcome(&self, url: &str, extra: &HeaderMap) -> Result<FetchOutcome, FetchError> {
        let headers = self.request_headers(extra);
        let bound = self.settings.retry_bound.max(1);

        for attempt in 1..=bound {
            debug!(attempt, "GET {url}");
            let outcome = FetchOutcome::from(self.transport.get(url, &headers)?);
            match outcome {
                FetchOutcome::RateLimited => {
                    warn!("Error 429 received when downloading {url} (attempt {attempt}/{bound})");
                    if attempt < bound {
                        self.pause();
                    }
                }
                FetchOutcome::Fatal(status) => {
                    error!("Error downloading {url}: {status}");
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status,
                    });
                }
                done => return Ok(done),
            }
        }

        Err(FetchError::RateLimited {
            url: url.to_string(),
            attempts: bound,
        })
    }

    /// 获取负载；404 视为致命错误。
    pub fn fetch(&self, url: &str, extra: &HeaderMap) -> Result<Vec<u8>, FetchError> {
        match self.fetch_outcome(url, extra)? {
            FetchOutcome::Success(body) => Ok(body),
            _ => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    /// 获取负载；404 返回 `None`，供以“不存在”作为结束哨兵的来源使用。
    pub fn fetch_optional(&self, url: &str, extra: &HeaderMap) -> Result<Option<Vec<u8>>, FetchError> {
        match self.fetch_outcome(url, extra)? {
            FetchOutcome::Success(body) => Ok(Some(body)),
            _ => Ok(None),
        }
    }

    pub fn fetch_text(&self, url: &str, extra: &HeaderMap) -> Result<String, FetchError> {
        let body = self.fetch(url, extra)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// 获取二进制负载并直接写入 `dest`。
    pub fn save_to(&self, url: &str, extra: &HeaderMap, dest: &Path) -> Result<u64, FetchError> {
        let body = self.fetch(url, extra)?;
        write_payload(dest, &body)
    }
}

/// 写入文件；任何返回路径上文件句柄都会随作用域关闭。
pub fn write_payload(dest: &Path, bytes: &[u8]) -> Result<u64, FetchError> {
    let io_err = |source| FetchError::Io {
        path: dest.to_path_buf(),
        source,
    };
    let mut file = File::create(dest).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// 按 URL 预置响应的传输层；队列只剩最后一个响应时重复返回它，
    /// 未登记的 URL 返回 404。
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        routes: Mutex<HashMap<String, VecDeque<RawResponse>>>,
        calls: Mutex<Vec<(String, HeaderMap)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn respond(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(RawResponse {
                    status,
                    body: body.into(),
                });
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(url, _)| url.clone())
                .collect()
        }

        pub(crate) fn call_count(&self, url: &str) -> usize {
            self.calls().iter().filter(|u| u.as_str() == url).count()
        }

        pub(crate) fn headers_for(&self, url: &str) -> Option<HeaderMap> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(u, _)| u == url)
                .map(|(_, h)| h.clone())
        }
    }

    impl Transport for Arc<ScriptedTransport> {
        fn get(&self, url: &str, headers: &HeaderMap) -> Result<RawResponse, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), headers.clone()));
            let mut routes = self.routes.lock().unwrap();
            let Some(queue) = routes.get_mut(url) else {
                return Ok(RawResponse {
                    status: 404,
                    body: Vec::new(),
                });
            };
            let resp = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            Ok(resp.unwrap_or(RawResponse {
                status: 404,
                body: Vec::new(),
            }))
        }
    }

    pub(crate) fn quiet_settings(retry_bound: u32) -> FetchSettings {
        FetchSettings {
            retry_bound,
            pause: Duration::ZERO,
            ..FetchSettings::default()
        }
    }

    pub(crate) fn scripted_fetcher(retry_bound: u32) -> (Arc<ScriptedTransport>, Arc<ResilientFetcher>) {
        let transport = ScriptedTransport::new();
        let fetcher = ResilientFetcher::new(
            Box::new(Arc::clone(&transport)),
            quiet_settings(retry_bound),
        );
        (transport, Arc::new(fetcher))
    }
}
