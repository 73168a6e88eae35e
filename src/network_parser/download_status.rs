//! 单文件下载的状态来源。
//!
//! 引擎只依赖 `start` / `current` 契约并按固定间隔轮询；
//! [`HttpDownloadStatus`] 在后台线程里流式下载并报告百分比。

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::ensure;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use tracing::{debug, error, info};

use crate::base_system::book_paths::safe_fs_name;
use crate::download::models::AcquireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadStatus {
    pub state: DownloadState,
    pub percent: i32,
    pub path: PathBuf,
}

impl DownloadStatus {
    /// 状态不再是进行中，或百分比越界，轮询即结束。
    pub fn is_settled(&self) -> bool {
        self.state != DownloadState::InProgress || self.percent >= 100 || self.percent < 0
    }
}

pub trait DownloadStatusProvider: Send {
    fn start(&mut self, url: &str) -> Result<(), AcquireError>;
    /// 当前下载的状态；没有任何下载记录时返回 `None`。
    fn current(&mut self) -> Option<DownloadStatus>;
}

pub struct HttpDownloadStatus {
    client: Client,
    target_dir: PathBuf,
    user_agent: String,
    status: Arc<Mutex<Option<DownloadStatus>>>,
    worker: Option<JoinHandle<()>>,
}

impl HttpDownloadStatus {
    pub fn new(target_dir: PathBuf, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            target_dir,
            user_agent: user_agent.to_string(),
            status: Arc::new(Mutex::new(None)),
            worker: None,
        })
    }
}

fn file_name_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segments: Vec<&str> = path
        .split("://")
        .last()
        .unwrap_or(path)
        .split('/')
        .skip(1)
        .filter(|s| !s.is_empty())
        .collect();
    let stem = if segments.is_empty() {
        "book".to_string()
    } else {
        segments.join("_")
    };
    let name = safe_fs_name(&stem, "_", 120);
    if name.to_ascii_lowercase().ends_with(".pdf") {
        name
    } else {
        format!("{name}.pdf")
    }
}

/// 阅读器页面 `…/read/{id}/{format}` 只是 pdf.js 查看器，
/// 文件本身由 `…/show/{id}/{format}` 提供；其它链接按文件地址处理。
pub fn asset_url(reader_url: &str) -> String {
    match reader_url.rsplit_once("/read/") {
        Some((base, rest)) if !rest.is_empty() => format!("{base}/show/{rest}"),
        _ => reader_url.to_string(),
    }
}

/// HTML 类型或缺少 `%PDF` 文件头的响应不是书籍文件。
fn looks_like_pdf(content_type: Option<&str>, head: &[u8]) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("html")) {
        return false;
    }
    let window = &head[..head.len().min(1024)];
    window.windows(4).any(|w| w == b"%PDF")
}

fn set_status(shared: &Mutex<Option<DownloadStatus>>, status: DownloadStatus) {
    if let Ok(mut slot) = shared.lock() {
        *slot = Some(status);
    }
}

fn stream_to_file(
    client: &Client,
    url: &str,
    user_agent: &str,
    dest: &Path,
    shared: &Mutex<Option<DownloadStatus>>,
) -> anyhow::Result<()> {
    let mut request = client.get(url);
    if let Ok(ua) = HeaderValue::from_str(user_agent) {
        request = request.header(USER_AGENT, ua);
    }
    let mut resp = request.send()?.error_for_status()?;
    let total = resp.content_length().filter(|n| *n > 0);
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut buf = vec![0u8; 64 * 1024];

    // 先读文件头，确认是 PDF 再落盘
    let mut head = Vec::new();
    while head.len() < 1024 {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    ensure!(
        looks_like_pdf(content_type.as_deref(), &head),
        "{url} did not return a PDF (content type {})",
        content_type.as_deref().unwrap_or("unknown")
    );

    let mut file = File::create(dest)?;
    file.write_all(&head)?;
    let mut done = head.len() as u64;

    loop {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        done += n as u64;
        let percent = total
            .map(|t| ((done * 100) / t).min(99) as i32)
            .unwrap_or(0);
        set_status(
            shared,
            DownloadStatus {
                state: DownloadState::InProgress,
                percent,
                path: dest.to_path_buf(),
            },
        );
    }
    file.flush()?;
    Ok(())
}

impl DownloadStatusProvider for HttpDownloadStatus {
    fn start(&mut self, url: &str) -> Result<(), AcquireError> {
        fs::create_dir_all(&self.target_dir).map_err(|source| AcquireError::Io {
            path: self.target_dir.clone(),
            source,
        })?;
        let dest = self.target_dir.join(file_name_for(url));
        info!("Start downloading book to {}", self.target_dir.display());

        set_status(
            &self.status,
            DownloadStatus {
                state: DownloadState::InProgress,
                percent: 0,
                path: dest.clone(),
            },
        );

        let client = self.client.clone();
        let shared = Arc::clone(&self.status);
        let url = asset_url(url);
        debug!("asset url {url}");
        let user_agent = self.user_agent.clone();
        let handle = thread::Builder::new()
            .name("asset-download".to_string())
            .spawn(move || {
                let (state, percent) =
                    match stream_to_file(&client, &url, &user_agent, &dest, &shared) {
                        Ok(()) => {
                            debug!("asset download finished: {}", dest.display());
                            (DownloadState::Complete, 100)
                        }
                        Err(e) => {
                            error!("asset download failed for {url}: {e}");
                            let _ = fs::remove_file(&dest);
                            (DownloadState::Interrupted, -1)
                        }
                    };
                set_status(
                    &shared,
                    DownloadStatus {
                        state,
                        percent,
                        path: dest,
                    },
                );
            })
            .map_err(|source| AcquireError::Io {
                path: self.target_dir.clone(),
                source,
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    fn current(&mut self) -> Option<DownloadStatus> {
        let status = self.status.lock().ok().and_then(|s| s.clone());
        if status.as_ref().is_some_and(DownloadStatus::is_settled) {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
        status
    }
}
