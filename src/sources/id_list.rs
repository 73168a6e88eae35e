//! 一次元数据请求即可拿到完整页列表的来源。
//!
//! - SHPL：落地页脚本中 `(...)` 包裹的 JSON，`pages[].id`
//! - KAZNEB：脚本中的 `pages.push("/FileStore...")`
//! - PGPB：`.digitization-view-left[data-url]`，每页一个 PDF，收尾时合并
//! - LIBFL：查看器页面中的 `var exemplar = {...};`，需要会话

use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::models::{PageDescriptor, PageEnumeration, PagePayload, Step, Total};
use super::{SourceKind, SourceStrategy};
use crate::base_system::book_paths::MERGE_WORKSPACE;
use crate::book_parser::pdf_merge;
use crate::download::models::AcquireError;
use crate::download::progress::ProgressReporter;
use crate::network_parser::fetcher::ResilientFetcher;
use crate::network_parser::html::{self, selector};
use crate::network_parser::session::SessionContext;

const SHPL_BOOK_URL: &str = "http://elib.shpl.ru/ru/nodes/";
const SHPL_PAGE_URL: &str = "http://elib.shpl.ru/pages/";
const KAZNEB_BOOK_URL: &str = "https://kazneb.kz/ru/bookView/view";
const KAZNEB_HOST: &str = "https://kazneb.kz";
const PGPB_HOST: &str = "https://pgpb.ru";
const PGPB_BOOK_PATH: &str = "/digitization/document/";
const LIBFL_VIEWER_URL: &str = "https://catalog.libfl.ru/Bookreader/Viewer";
const LIBFL_CDN: &str = "https://cdn.libfl.ru/books/";
const LIBFL_REFERER: &str = "https://catalog.libfl.ru/";
const LIBFL_VIEWER_TRIES: usize = 3;

selector!(PGPB_PAGE_SELECTOR, ".digitization-view-left");

static RE_KAZNEB_PAGE: OnceLock<Regex> = OnceLock::new();
static RE_LIBFL_EXEMPLAR: OnceLock<Regex> = OnceLock::new();

fn re_kazneb_page() -> &'static Regex {
    RE_KAZNEB_PAGE.get_or_init(|| {
        Regex::new(r#"pages\.push\(\s*["'](/FileStore[^"']*)["']\s*\)"#)
            .expect("compile RE_KAZNEB_PAGE")
    })
}

fn re_libfl_exemplar() -> &'static Regex {
    RE_LIBFL_EXEMPLAR.get_or_init(|| {
        Regex::new(r"(?s)var exemplar = (\{.+?\});").expect("compile RE_LIBFL_EXEMPLAR")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdListSite {
    Shpl,
    Kazneb,
    Pgpb,
    Libfl,
}

impl IdListSite {
    fn kind(self) -> SourceKind {
        match self {
            IdListSite::Shpl => SourceKind::Shpl,
            IdListSite::Kazneb => SourceKind::Kazneb,
            IdListSite::Pgpb => SourceKind::Pgpb,
            IdListSite::Libfl => SourceKind::Libfl,
        }
    }

    /// 页序号起点：LIBFL 从 1 计，其它从 0 计。
    fn index_base(self) -> usize {
        match self {
            IdListSite::Libfl => 1,
            _ => 0,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            IdListSite::Shpl => "jpeg",
            IdListSite::Kazneb => "png",
            IdListSite::Pgpb => "pdf",
            IdListSite::Libfl => "jpg",
        }
    }

    fn landing_url(self, book_id: &str, start_index: usize) -> String {
        match self {
            IdListSite::Shpl => format!("{SHPL_BOOK_URL}{book_id}"),
            IdListSite::Kazneb => format!("{KAZNEB_BOOK_URL}?brId={book_id}&simple=true"),
            IdListSite::Pgpb => format!("{PGPB_HOST}{PGPB_BOOK_PATH}{book_id}"),
            IdListSite::Libfl => {
                format!("{LIBFL_VIEWER_URL}?{book_id}&view_mode=HQ#page/{start_index}/mode/1up")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShplPayload {
    pages: Vec<ShplPage>,
}

#[derive(Debug, Deserialize)]
struct ShplPage {
    id: Value,
}

fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// SHPL 的页列表藏在形如 `init({...})` 的脚本调用里。
fn shpl_page_urls(page: &str) -> Vec<String> {
    let doc = html::parse(page);
    for script in html::scripts(&doc) {
        let Some((_, args)) = script.rsplit_once('(') else {
            continue;
        };
        let payload = args.trim().trim_end_matches(';').trim_end_matches(')').trim();
        let Ok(parsed) = serde_json::from_str::<ShplPayload>(payload) else {
            continue;
        };
        let urls: Vec<String> = parsed
            .pages
            .iter()
            .filter_map(|p| json_id(&p.id))
            .map(|id| format!("{SHPL_PAGE_URL}{id}/zooms/8"))
            .collect();
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}

fn kazneb_page_urls(page: &str) -> Vec<String> {
    re_kazneb_page()
        .captures_iter(page)
        .filter_map(|caps| caps.get(1))
        .map(|m| format!("{KAZNEB_HOST}{}", html::unescape_entities(m.as_str())))
        .collect()
}

fn pgpb_page_urls(page: &str) -> Vec<String> {
    let doc = html::parse(page);
    html::attr_values(&doc, &PGPB_PAGE_SELECTOR, "data-url")
        .into_iter()
        .filter(|url| !url.is_empty())
        .map(|url| format!("{PGPB_HOST}{url}"))
        .collect()
}

#[derive(Debug, Deserialize)]
struct Exemplar {
    #[serde(rename = "Path_HQ")]
    path_hq: String,
    #[serde(rename = "JPGFiles")]
    jpg_files: Vec<String>,
}

fn libfl_exemplar(page: &str) -> Option<Exemplar> {
    let raw = re_libfl_exemplar().captures(page)?.get(1)?.as_str().trim();
    match serde_json::from_str(raw) {
        Ok(exemplar) => Some(exemplar),
        Err(e) => {
            warn!("exemplar JSON 解析失败: {e}");
            None
        }
    }
}

fn libfl_page_urls(exemplar: &Exemplar) -> Vec<String> {
    exemplar
        .jpg_files
        .iter()
        .map(|file| format!("{LIBFL_CDN}{}{file}", exemplar.path_hq))
        .collect()
}

pub struct IdListStrategy {
    site: IdListSite,
    book_id: String,
    fetcher: Arc<ResilientFetcher>,
    session: Option<SessionContext>,
}

impl IdListStrategy {
    pub fn new(
        site: IdListSite,
        book_id: String,
        fetcher: Arc<ResilientFetcher>,
        session: Option<SessionContext>,
    ) -> Self {
        Self {
            site,
            book_id,
            fetcher,
            session,
        }
    }

    fn session_headers(&self) -> HeaderMap {
        self.session
            .as_ref()
            .map(SessionContext::headers)
            .unwrap_or_default()
    }

    /// 查看器页面偶尔不带 exemplar，最多重试三次。
    fn libfl_urls(&self, landing: &str) -> Result<Vec<String>, AcquireError> {
        let headers = self.session_headers();
        for attempt in 1..=LIBFL_VIEWER_TRIES {
            let page = self.fetcher.fetch_text(landing, &headers)?;
            self.fetcher.pause();
            if let Some(exemplar) = libfl_exemplar(&page) {
                return Ok(libfl_page_urls(&exemplar));
            }
            debug!(attempt, "viewer page has no exemplar yet");
        }
        Err(AcquireError::MetadataMissing(format!(
            "Could not start downloading {landing}"
        )))
    }

    fn page_urls(&self, start_index: usize) -> Result<Vec<String>, AcquireError> {
        let landing = self.site.landing_url(&self.book_id, start_index);
        let urls = match self.site {
            IdListSite::Libfl => self.libfl_urls(&landing)?,
            site => {
                let page = self.fetcher.fetch_text(&landing, &HeaderMap::new())?;
                match site {
                    IdListSite::Shpl => shpl_page_urls(&page),
                    IdListSite::Kazneb => kazneb_page_urls(&page),
                    _ => pgpb_page_urls(&page),
                }
            }
        };
        if urls.is_empty() {
            return Err(AcquireError::MetadataMissing(format!("no page list at {landing}")));
        }
        Ok(urls)
    }

    fn page_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self.site == IdListSite::Libfl {
            headers.insert(REFERER, HeaderValue::from_static(LIBFL_REFERER));
        }
        headers
    }
}

impl SourceStrategy for IdListStrategy {
    fn kind(&self) -> SourceKind {
        self.site.kind()
    }

    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn enumerate(&mut self, start_index: usize) -> Result<PageEnumeration, AcquireError> {
        let urls = self.page_urls(start_index)?;
        let total = urls.len();
        info!("{} book {}: {total} pages", self.site.kind().tag(), self.book_id);

        let base = self.site.index_base();
        let skip = start_index.max(1) - 1;
        let pages = urls
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(move |(i, url)| PageDescriptor::new(i + base, url));
        Ok(PageEnumeration::new(pages, Total::Exact(total)))
    }

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        _progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError> {
        let bytes = self.fetcher.fetch(&page.locator, &self.page_headers())?;
        info!("Processed page {}", page.index);
        let extension = self.site.extension();
        let payload = match self.site {
            IdListSite::Pgpb => PagePayload::Part { bytes, extension },
            _ => PagePayload::Page { bytes, extension },
        };
        Ok(Step::Continue(payload))
    }

    fn finalize(&mut self, folder: &Path, _progress: &ProgressReporter) -> Result<(), AcquireError> {
        if self.site != IdListSite::Pgpb {
            return Ok(());
        }
        let workspace = folder.join(MERGE_WORKSPACE);
        let output = folder.join(format!("{}.pdf", self.book_id));
        pdf_merge::merge_workspace(&workspace, &output)?;
        info!("merged book into {}", output.display());
        Ok(())
    }
}
