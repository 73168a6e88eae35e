//! 整本书只有一个文件的来源。
//!
//! NEBCHR 的阅读页内嵌 PDF 路径，直接下载；PDF 阅读器来源交给外部
//! 下载器，按固定间隔轮询其状态，完成后把文件移入书籍目录。

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, warn};

use super::models::{PageDescriptor, PageEnumeration, PagePayload, Step, Total};
use super::{SourceKind, SourceStrategy};
use crate::download::models::AcquireError;
use crate::download::progress::ProgressReporter;
use crate::network_parser::download_status::{DownloadState, DownloadStatusProvider};
use crate::network_parser::fetcher::ResilientFetcher;
use crate::network_parser::session::SessionContext;

const NEBCHR_HOST: &str = "https://neb-chr.ru";

static RE_FILE_NAME: OnceLock<Regex> = OnceLock::new();

fn re_file_name() -> &'static Regex {
    RE_FILE_NAME
        .get_or_init(|| Regex::new(r"(?s)const fileName = (.+?);").expect("compile RE_FILE_NAME"))
}

fn embedded_file_link(page: &str) -> Option<String> {
    let raw = re_file_name().captures(page)?.get(1)?.as_str();
    let link = raw.trim().trim_matches(['"', '\'']);
    (!link.is_empty()).then(|| format!("{NEBCHR_HOST}{link}"))
}

pub struct RemoteFileStrategy {
    book_id: String,
    fetcher: Arc<ResilientFetcher>,
    session: SessionContext,
}

impl RemoteFileStrategy {
    pub fn new(book_id: String, fetcher: Arc<ResilientFetcher>, session: SessionContext) -> Self {
        Self {
            book_id,
            fetcher,
            session,
        }
    }
}

impl SourceStrategy for RemoteFileStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::Nebchr
    }

    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn enumerate(&mut self, _start_index: usize) -> Result<PageEnumeration, AcquireError> {
        let reader_url = format!("{NEBCHR_HOST}/read/{}", self.book_id);
        let page = self.fetcher.fetch_text(&reader_url, &self.session.headers())?;
        let link = embedded_file_link(&page).ok_or_else(|| {
            AcquireError::MetadataMissing(format!("Could not start downloading {reader_url}"))
        })?;
        Ok(PageEnumeration::new(
            std::iter::once(PageDescriptor::new(0, link)),
            Total::External,
        ))
    }

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError> {
        progress.report(0.5);
        Ok(Step::Continue(PagePayload::Remote {
            url: page.locator.clone(),
            headers: self.session.headers(),
            file_name: format!("{}.pdf", self.book_id),
        }))
    }
}

/// 书籍 ID 取链接倒数第二段，例如 `.../read/88/pdf` 中的 `88`。
fn reader_book_id(book_url: &str) -> Option<String> {
    let path = book_url.split("://").last().unwrap_or(book_url);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() < 3 {
        return None;
    }
    segments
        .get(segments.len() - 2)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct PolledDownloadStrategy {
    book_url: String,
    book_id: String,
    fetcher: Arc<ResilientFetcher>,
    provider: Box<dyn DownloadStatusProvider>,
    poll_attempts: usize,
}

impl PolledDownloadStrategy {
    pub fn new(
        book_url: &str,
        fetcher: Arc<ResilientFetcher>,
        provider: Box<dyn DownloadStatusProvider>,
        poll_attempts: usize,
    ) -> Result<Self, AcquireError> {
        let book_id = reader_book_id(book_url)
            .ok_or_else(|| AcquireError::InvalidBook(book_url.to_string()))?;
        Ok(Self {
            book_url: book_url.to_string(),
            book_id,
            fetcher,
            provider,
            poll_attempts: poll_attempts.max(1),
        })
    }

    fn poll(&mut self, progress: &ProgressReporter) -> Result<PathBuf, AcquireError> {
        for attempt in 0..self.poll_attempts {
            self.fetcher.pause();
            let Some(status) = self.provider.current() else {
                warn!("download list is empty after {attempt} polls");
                break;
            };
            progress.report(f64::from(status.percent) / 100.0);
            if !status.is_settled() {
                continue;
            }
            if status.state == DownloadState::Interrupted || status.percent < 0 {
                return Err(AcquireError::Download(format!(
                    "download of {} was interrupted",
                    self.book_url
                )));
            }
            return Ok(status.path);
        }
        Err(AcquireError::Download("Could not download pages".to_string()))
    }
}

impl SourceStrategy for PolledDownloadStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::PdfReader
    }

    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn enumerate(&mut self, _start_index: usize) -> Result<PageEnumeration, AcquireError> {
        Ok(PageEnumeration::new(
            std::iter::once(PageDescriptor::new(0, self.book_url.clone())),
            Total::External,
        ))
    }

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError> {
        self.provider.start(&page.locator)?;
        let path = self.poll(progress)?;
        info!("download finished: {}", path.display());
        Ok(Step::Continue(PagePayload::Downloaded(path)))
    }
}
