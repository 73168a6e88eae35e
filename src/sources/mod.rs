//! 来源策略。
//!
//! 每个数字图书馆的分页方式不同，但都实现同一个 [`SourceStrategy`]：
//! - `sequential`：逐页请求，由响应本身判断是否到达末页（RGO）
//! - `id_list`：一次元数据请求拿到完整页列表（SHPL / KAZNEB / PGPB / LIBFL）
//! - `tiled`：每页由瓦片拼接而成（PRLIB）
//! - `single_asset`：整本书是一个文件（NEBCHR / PDF 阅读器）

pub mod id_list;
pub mod models;
pub mod sequential;
pub mod single_asset;
pub mod tiled;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;

use crate::base_system::book_id::parse_book_ref;
use crate::download::models::AcquireError;
use crate::download::progress::ProgressReporter;
use crate::network_parser::download_status::DownloadStatusProvider;
use crate::network_parser::fetcher::ResilientFetcher;
use crate::network_parser::session::SessionContext;

pub use models::{PageDescriptor, PageEnumeration, PagePayload, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum SourceKind {
    Rgo,
    Shpl,
    Kazneb,
    Pgpb,
    Libfl,
    Prlib,
    Nebchr,
    #[value(name = "pdfreader", alias = "pdf-reader")]
    PdfReader,
}

impl SourceKind {
    /// 输出目录前缀。
    pub fn tag(self) -> &'static str {
        match self {
            SourceKind::Rgo => "RGO",
            SourceKind::Shpl => "SHPL",
            SourceKind::Kazneb => "KAZNEB",
            SourceKind::Pgpb => "PGPB",
            SourceKind::Libfl => "LIBFL",
            SourceKind::Prlib => "PRLIB",
            SourceKind::Nebchr => "NEBCHR",
            SourceKind::PdfReader => "PDFReader",
        }
    }

    pub fn default_pause(self) -> Duration {
        match self {
            SourceKind::Rgo => Duration::from_secs(5),
            SourceKind::PdfReader => Duration::from_secs(20),
            _ => Duration::from_secs(1),
        }
    }

    pub fn needs_session(self) -> bool {
        matches!(self, SourceKind::Libfl | SourceKind::Nebchr)
    }

    pub fn requires_full_url(self) -> bool {
        matches!(self, SourceKind::Rgo | SourceKind::PdfReader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOptions {
    pub zoom: usize,
    pub max_tile_num: usize,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            zoom: 4,
            max_tile_num: 999,
        }
    }
}

/// 构造策略所需的外部协作方与参数。
pub struct StrategyEnv {
    pub session: Option<SessionContext>,
    pub tiles: TileOptions,
    pub poll_attempts: usize,
    pub download_provider: Option<Box<dyn DownloadStatusProvider>>,
}

impl Default for StrategyEnv {
    fn default() -> Self {
        Self {
            session: None,
            tiles: TileOptions::default(),
            poll_attempts: 100,
            download_provider: None,
        }
    }
}

pub trait SourceStrategy: Send {
    fn kind(&self) -> SourceKind;

    /// 用于命名输出目录的书籍 ID。
    fn book_id(&self) -> &str;

    /// 生成页描述符序列。`start_index` 从 1 开始；只能调用一次。
    fn enumerate(&mut self, start_index: usize) -> Result<PageEnumeration, AcquireError>;

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError>;

    /// 下载阶段在总进度中所占的比例，其余留给收尾阶段。
    fn download_share(&self) -> f64 {
        1.0
    }

    fn finalize(&mut self, _folder: &Path, _progress: &ProgressReporter) -> Result<(), AcquireError> {
        Ok(())
    }
}

pub fn build_strategy(
    kind: SourceKind,
    book: &str,
    fetcher: Arc<ResilientFetcher>,
    env: StrategyEnv,
) -> Result<Box<dyn SourceStrategy>, AcquireError> {
    let book_ref =
        parse_book_ref(kind, book).ok_or_else(|| AcquireError::InvalidBook(book.trim().to_string()))?;

    let session = match env.session {
        Some(session) if !session.is_empty() => Some(session),
        _ if kind.needs_session() => {
            return Err(AcquireError::SessionRequired(kind.tag().to_string()));
        }
        _ => None,
    };

    let strategy: Box<dyn SourceStrategy> = match kind {
        SourceKind::Rgo => Box::new(sequential::SequentialStrategy::new(&book_ref, fetcher)?),
        SourceKind::Shpl => Box::new(id_list::IdListStrategy::new(
            id_list::IdListSite::Shpl,
            book_ref,
            fetcher,
            None,
        )),
        SourceKind::Kazneb => Box::new(id_list::IdListStrategy::new(
            id_list::IdListSite::Kazneb,
            book_ref,
            fetcher,
            None,
        )),
        SourceKind::Pgpb => Box::new(id_list::IdListStrategy::new(
            id_list::IdListSite::Pgpb,
            book_ref,
            fetcher,
            None,
        )),
        SourceKind::Libfl => Box::new(id_list::IdListStrategy::new(
            id_list::IdListSite::Libfl,
            book_ref,
            fetcher,
            session,
        )),
        SourceKind::Prlib => Box::new(tiled::TiledStrategy::new(book_ref, fetcher, env.tiles)),
        SourceKind::Nebchr => Box::new(single_asset::RemoteFileStrategy::new(
            book_ref,
            fetcher,
            session.unwrap_or_default(),
        )),
        SourceKind::PdfReader => {
            let provider = env.download_provider.ok_or_else(|| {
                AcquireError::Download("no download status provider configured".to_string())
            })?;
            Box::new(single_asset::PolledDownloadStrategy::new(
                &book_ref,
                fetcher,
                provider,
                env.poll_attempts,
            )?)
        }
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_parser::fetcher::testing::scripted_fetcher;

    #[test]
    fn session_sources_refuse_to_start_without_cookies() {
        let (_, fetcher) = scripted_fetcher(1);
        let err = build_strategy(SourceKind::Libfl, "bok=1", fetcher, StrategyEnv::default())
            .err()
            .unwrap();
        assert!(matches!(err, AcquireError::SessionRequired(tag) if tag == "LIBFL"));
    }

    #[test]
    fn unparseable_book_is_rejected() {
        let (_, fetcher) = scripted_fetcher(1);
        let err = build_strategy(SourceKind::Prlib, "hello", fetcher, StrategyEnv::default())
            .err()
            .unwrap();
        assert!(matches!(err, AcquireError::InvalidBook(_)));
    }

    #[test]
    fn strategy_reports_normalized_book_id() {
        let (_, fetcher) = scripted_fetcher(1);
        let strategy = build_strategy(
            SourceKind::Prlib,
            "https://www.prlib.ru/item/680723",
            fetcher,
            StrategyEnv::default(),
        )
        .unwrap();
        assert_eq!(strategy.kind(), SourceKind::Prlib);
        assert_eq!(strategy.book_id(), "680723");
    }

    #[test]
    fn pauses_follow_source() {
        assert_eq!(SourceKind::Rgo.default_pause(), Duration::from_secs(5));
        assert_eq!(SourceKind::PdfReader.default_pause(), Duration::from_secs(20));
        assert_eq!(SourceKind::Kazneb.default_pause(), Duration::from_secs(1));
    }
}
