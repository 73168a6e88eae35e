//! RGO：逐页请求，直到服务器返回 `Error` 或 404。
//!
//! 书籍链接的最后一段是 base64 编码的文件定位符（`/` 被替换为 `_`），
//! 第 i 页的地址是在解码后的定位符末尾追加 `/{i-1}` 再编码。

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::HeaderMap;
use tracing::{info, warn};

use super::models::{PageDescriptor, PageEnumeration, PagePayload, Step, Total};
use super::{SourceKind, SourceStrategy};
use crate::download::models::AcquireError;
use crate::download::progress::ProgressReporter;
use crate::network_parser::fetcher::ResilientFetcher;
use crate::network_parser::html::{self, selector};

const MAX_PAGE_NUM: usize = 9999;
const BOOK_URL_MARKER: &str = "safe-view/123456789/";

selector!(COUNTER_BLOCK_SELECTOR, "div.d-md-flex");
selector!(SPAN_SELECTOR, "span");

/// 解码后的页面定位符。
#[derive(Debug, Clone, PartialEq, Eq)]
struct PageLocator {
    base: String,
    file: String,
}

impl PageLocator {
    fn parse(book_url: &str) -> Result<Self, AcquireError> {
        let invalid = || AcquireError::InvalidBook(book_url.to_string());
        let (base, last) = book_url.trim_end_matches('/').rsplit_once('/').ok_or_else(invalid)?;
        let encoded = last.split('#').next().unwrap_or(last).replace('_', "/");
        let decoded = STANDARD.decode(encoded.as_bytes()).map_err(|_| invalid())?;
        let file = String::from_utf8(decoded).map_err(|_| invalid())?;
        Ok(Self {
            base: base.to_string(),
            file,
        })
    }

    /// 第 `page_num` 页（从 1 计）的请求地址。
    fn page_url(&self, page_num: usize) -> String {
        let target = format!("{}/{}", self.file, page_num.saturating_sub(1));
        let encoded = STANDARD.encode(target.as_bytes()).replace(['/', '\\'], "_");
        format!("{}/{}", self.base, encoded)
    }
}

fn folder_id(book_url: &str) -> Option<String> {
    let tail = book_url
        .rsplit_once(BOOK_URL_MARKER)
        .map(|(_, rest)| rest)
        .unwrap_or(book_url);
    tail.split('/')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 落地页第三个 `div.d-md-flex` 中最后一个 `span` 是页数。
fn page_count_estimate(page: &str) -> Option<usize> {
    let doc = html::parse(page);
    let block = doc.select(&COUNTER_BLOCK_SELECTOR).nth(2)?;
    let text = block.select(&SPAN_SELECTOR).last()?.text().collect::<String>();
    text.trim().parse().ok().filter(|n| *n > 0)
}

pub struct SequentialStrategy {
    book_url: String,
    book_id: String,
    locator: PageLocator,
    fetcher: Arc<ResilientFetcher>,
}

impl SequentialStrategy {
    pub fn new(book_url: &str, fetcher: Arc<ResilientFetcher>) -> Result<Self, AcquireError> {
        let book_id =
            folder_id(book_url).ok_or_else(|| AcquireError::InvalidBook(book_url.to_string()))?;
        Ok(Self {
            book_url: book_url.to_string(),
            book_id,
            locator: PageLocator::parse(book_url)?,
            fetcher,
        })
    }
}

impl SourceStrategy for SequentialStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::Rgo
    }

    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn enumerate(&mut self, start_index: usize) -> Result<PageEnumeration, AcquireError> {
        let landing = self.fetcher.fetch_text(&self.book_url, &HeaderMap::new())?;
        let estimate = page_count_estimate(&landing);
        match estimate {
            Some(n) => info!("RGO book {} has about {n} pages", self.book_id),
            None => warn!("未能从落地页读取页数，进度将按已下载页数估计"),
        }

        let locator = self.locator.clone();
        let pages = (start_index.max(1)..MAX_PAGE_NUM)
            .map(move |page_num| PageDescriptor::new(page_num, locator.page_url(page_num)));
        Ok(PageEnumeration::new(pages, Total::Estimate(estimate)))
    }

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        _progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError> {
        info!("Downloading page {}", page.index);
        let Some(bytes) = self.fetcher.fetch_optional(&page.locator, &HeaderMap::new())? else {
            return Ok(Step::EndOfSequence);
        };
        // 空响应与 `Error` 开头的正文都表示越过了末页
        if bytes.is_empty() || bytes.starts_with(b"Error") {
            return Ok(Step::EndOfSequence);
        }
        Ok(Step::Continue(PagePayload::Page {
            bytes,
            extension: "png",
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `"docs/book.pdf"` 的 base64。
    pub(crate) const BOOK_URL: &str =
        "https://elib.rgo.ru/safe-view/123456789/231378/1/ZG9jcy9ib29rLnBkZg==";

    pub(crate) fn page_url(page_num: usize) -> String {
        PageLocator::parse(BOOK_URL).unwrap().page_url(page_num)
    }

    #[test]
    fn page_urls_append_zero_based_page() {
        let locator = PageLocator::parse(BOOK_URL).unwrap();
        assert_eq!(locator.file, "docs/book.pdf");
        let url = locator.page_url(1);
        let encoded = url.rsplit('/').next().unwrap();
        assert_eq!(
            STANDARD.decode(encoded.replace('_', "/")).unwrap(),
            b"docs/book.pdf/0"
        );
        assert!(url.starts_with("https://elib.rgo.ru/safe-view/123456789/231378/1/"));
    }

    #[test]
    fn slashes_in_encoded_locator_become_underscores() {
        let locator = PageLocator {
            base: "https://host/x".to_string(),
            file: "???".to_string(),
        };
        // "???" 编码为 "Pz8/"
        let url = locator.page_url(3);
        assert!(!url["https://host/x/".len()..].contains('/'));
    }

    #[test]
    fn folder_id_follows_marker() {
        assert_eq!(folder_id(BOOK_URL).as_deref(), Some("231378"));
        assert_eq!(PageLocator::parse("https://elib.rgo.ru/x/!!!").ok(), None);
    }

    #[test]
    fn reads_page_counter_from_landing_page() {
        let page = r#"<div class="d-md-flex"><span>a</span></div>
            <div class="d-md-flex"><span>b</span></div>
            <div class="d-md-flex"><span>Страниц</span><span> 12 </span></div>"#;
        assert_eq!(page_count_estimate(page), Some(12));
        assert_eq!(page_count_estimate("<html></html>"), None);
    }
}
