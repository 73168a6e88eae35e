//! 单本书的下载编排。
//!
//! 状态流转：`Init → FolderCreated → Enumerating → (Fetching ⇄ Persisting)*
//! → Finalizing → Done | Failed`。任何错误都会终止本次运行，
//! 已写入的页面保留在磁盘上，调用方总能拿到书籍目录的绝对路径。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info};

use super::models::{AcquireError, BookRequest, RunOutcome, RunState};
use super::progress::ProgressReporter;
use crate::base_system::book_paths::{
    MERGE_WORKSPACE, book_folder_path, page_file_name, tile_file_name, tile_workspace_name,
};
use crate::base_system::file_cleaner::{move_into, remove_workspace};
use crate::network_parser::fetcher::{ResilientFetcher, write_payload};
use crate::sources::{
    PageDescriptor, PagePayload, SourceStrategy, Step, StrategyEnv, build_strategy,
};

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

struct BookRun {
    folder: PathBuf,
    state: RunState,
    pages: usize,
}

impl BookRun {
    fn enter(&mut self, state: RunState) {
        if self.state != state {
            debug!(?state, "book run state");
            self.state = state;
        }
    }
}

pub struct BookAssembler {
    root: PathBuf,
    fetcher: Arc<ResilientFetcher>,
    cancel: Option<Arc<AtomicBool>>,
}

impl BookAssembler {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<ResilientFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            cancel: None,
        }
    }

    /// 每处理一页前检查一次，置位后本次运行以 `Canceled` 失败。
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// 构造来源策略并下载一本书。
    pub fn run(
        &self,
        request: &BookRequest,
        env: StrategyEnv,
        progress: &ProgressReporter,
    ) -> RunOutcome {
        info!("Using folder {}", absolute(&self.root).display());
        match build_strategy(request.source, &request.book, Arc::clone(&self.fetcher), env) {
            Ok(strategy) => self.run_strategy(strategy, request.start_index, progress),
            Err(e) => {
                error!("Exception occurred {e}");
                RunOutcome {
                    error: Some(e.to_string()),
                    folder: absolute(&self.root),
                    state: RunState::Failed,
                    pages: 0,
                }
            }
        }
    }

    pub fn run_strategy(
        &self,
        mut strategy: Box<dyn SourceStrategy>,
        start_index: usize,
        progress: &ProgressReporter,
    ) -> RunOutcome {
        let mut run = BookRun {
            folder: book_folder_path(&self.root, strategy.kind().tag(), strategy.book_id()),
            state: RunState::Init,
            pages: 0,
        };

        let error = match self.drive(strategy.as_mut(), start_index, progress, &mut run) {
            Ok(()) => {
                run.enter(RunState::Done);
                progress.report(1.0);
                info!(
                    "{} {}: saved {} pages to {}",
                    strategy.kind().tag(),
                    strategy.book_id(),
                    run.pages,
                    run.folder.display()
                );
                None
            }
            Err(e) => {
                run.enter(RunState::Failed);
                error!("Exception occurred {e}");
                Some(e.to_string())
            }
        };

        RunOutcome {
            error,
            folder: absolute(&run.folder),
            state: run.state,
            pages: run.pages,
        }
    }

    fn check_cancel(&self) -> Result<(), AcquireError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(AcquireError::Canceled),
            _ => Ok(()),
        }
    }

    fn drive(
        &self,
        strategy: &mut dyn SourceStrategy,
        start_index: usize,
        progress: &ProgressReporter,
        run: &mut BookRun,
    ) -> Result<(), AcquireError> {
        let start_index = start_index.max(1);
        fs::create_dir_all(&run.folder).map_err(|e| AcquireError::io(&run.folder, e))?;
        run.enter(RunState::FolderCreated);

        run.enter(RunState::Enumerating);
        let enumeration = strategy.enumerate(start_index)?;
        let total = enumeration.total;
        let share = strategy.download_share();

        for (processed, page) in enumeration.pages.enumerate() {
            self.check_cancel()?;
            run.enter(RunState::Fetching);
            if let Some(fraction) = total.fraction(start_index - 1 + processed, share) {
                progress.report(fraction);
            }
            self.fetcher.pause();
            match strategy.fetch(&page, progress)? {
                Step::EndOfSequence => {
                    info!("no more pages after {}", run.pages);
                    break;
                }
                Step::Continue(payload) => {
                    run.enter(RunState::Persisting);
                    self.persist(&run.folder, &page, payload)?;
                    run.pages += 1;
                }
            }
        }

        run.enter(RunState::Finalizing);
        strategy.finalize(&run.folder, progress)?;
        Ok(())
    }

    fn persist(
        &self,
        folder: &Path,
        page: &PageDescriptor,
        payload: PagePayload,
    ) -> Result<(), AcquireError> {
        match payload {
            PagePayload::Page { bytes, extension } => {
                write_payload(&folder.join(page_file_name(page.index, extension)), &bytes)?;
            }
            PagePayload::Part { bytes, extension } => {
                let workspace = folder.join(MERGE_WORKSPACE);
                fs::create_dir_all(&workspace).map_err(|e| AcquireError::io(&workspace, e))?;
                write_payload(&workspace.join(page_file_name(page.index, extension)), &bytes)?;
            }
            PagePayload::Tiles(set) => {
                let workspace = folder.join(tile_workspace_name(page.index));
                // 上次中断留下的瓦片可能多于本次
                remove_workspace(&workspace).map_err(|e| AcquireError::io(&workspace, e))?;
                fs::create_dir_all(&workspace).map_err(|e| AcquireError::io(&workspace, e))?;
                for tile in &set.tiles {
                    write_payload(
                        &workspace.join(tile_file_name(tile.index, set.extension)),
                        &tile.bytes,
                    )?;
                }
            }
            PagePayload::Remote {
                url,
                headers,
                file_name,
            } => {
                let dest = folder.join(file_name);
                let size = self.fetcher.save_to(&url, &headers, &dest)?;
                info!("Downloaded book ({size} bytes)");
            }
            PagePayload::Downloaded(path) => {
                let dest = move_into(&path, folder).map_err(|e| AcquireError::io(&path, e))?;
                debug!("moved {} to {}", path.display(), dest.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book_parser::pdf_merge::tests::one_page_pdf;
    use crate::download::progress::{ProgressMonitor, progress_channel};
    use crate::network_parser::download_status::DownloadState;
    use crate::network_parser::fetcher::testing::{ScriptedTransport, scripted_fetcher};
    use crate::network_parser::session::SessionContext;
    use crate::sources::single_asset::tests::{ScriptedDownloads, status};
    use crate::sources::{SourceKind, TileOptions, sequential, tiled};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    const SHPL_LANDING: &str = "http://elib.shpl.ru/ru/nodes/77";

    struct Harness {
        dir: TempDir,
        transport: Arc<ScriptedTransport>,
        assembler: BookAssembler,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let (transport, fetcher) = scripted_fetcher(3);
            let assembler = BookAssembler::new(dir.path(), fetcher);
            Self {
                dir,
                transport,
                assembler,
            }
        }

        fn run(&self, request: BookRequest, env: StrategyEnv) -> (RunOutcome, ProgressMonitor) {
            let (reporter, monitor) = progress_channel();
            let outcome = self.assembler.run(&request, env, &reporter);
            (outcome, monitor)
        }

        fn book_dir(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn script_shpl(transport: &ScriptedTransport, pages: usize) {
        let ids: Vec<String> = (0..pages).map(|i| format!(r#"{{"id": {}}}"#, 100 + i)).collect();
        transport.respond(
            SHPL_LANDING,
            200,
            format!(r#"<script>init({{"pages": [{}]}})</script>"#, ids.join(",")),
        );
        for i in 0..pages {
            transport.respond(
                &format!("http://elib.shpl.ru/pages/{}/zooms/8", 100 + i),
                200,
                format!("page-{i}"),
            );
        }
    }

    fn png_bytes(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut buf = Vec::new();
        RgbImage::from_pixel(w, h, Rgb(rgb))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn id_list_book_saves_every_page_with_exact_progress() {
        let h = Harness::new();
        script_shpl(&h.transport, 3);

        let (outcome, mut monitor) =
            h.run(BookRequest::new(SourceKind::Shpl, "77"), StrategyEnv::default());

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.state, RunState::Done);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.folder.is_absolute());
        assert!(outcome.folder.ends_with("SHPL_77"));
        for i in 0..3 {
            let page = fs::read(h.book_dir("SHPL_77").join(format!("{i:05}.jpeg"))).unwrap();
            assert_eq!(page, format!("page-{i}").into_bytes());
        }
        assert_eq!(monitor.drain(), [0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn start_index_skips_earlier_pages() {
        let h = Harness::new();
        script_shpl(&h.transport, 3);

        let (outcome, mut monitor) = h.run(
            BookRequest::new(SourceKind::Shpl, "77").starting_at(2),
            StrategyEnv::default(),
        );

        assert!(outcome.is_success());
        assert_eq!(outcome.pages, 2);
        assert!(!h.book_dir("SHPL_77").join("00000.jpeg").exists());
        assert!(h.book_dir("SHPL_77").join("00002.jpeg").exists());
        assert_eq!(monitor.drain(), [1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn fatal_status_fails_run_and_keeps_partial_output() {
        let h = Harness::new();
        h.transport.respond(
            SHPL_LANDING,
            200,
            r#"<script>init({"pages": [{"id": 100}, {"id": 101}]})</script>"#,
        );
        h.transport
            .respond("http://elib.shpl.ru/pages/100/zooms/8", 200, "page-0");
        h.transport
            .respond("http://elib.shpl.ru/pages/101/zooms/8", 500, "boom");

        let (outcome, _) = h.run(BookRequest::new(SourceKind::Shpl, "77"), StrategyEnv::default());

        assert_eq!(outcome.state, RunState::Failed);
        let message = outcome.error.unwrap();
        assert!(message.contains("500"), "{message}");
        assert!(message.contains("pages/101"), "{message}");
        assert_eq!(outcome.pages, 1);
        assert!(h.book_dir("SHPL_77").join("00000.jpeg").exists());
        assert_eq!(h.transport.call_count("http://elib.shpl.ru/pages/101/zooms/8"), 1);
    }

    fn script_rgo(transport: &ScriptedTransport, pages: usize) {
        transport.respond(sequential::tests::BOOK_URL, 200, "<html></html>");
        for i in 1..=pages {
            transport.respond(&sequential::tests::page_url(i), 200, format!("png-{i}"));
        }
    }

    #[test]
    fn sequential_book_ends_on_error_body() {
        let h = Harness::new();
        script_rgo(&h.transport, 2);
        h.transport
            .respond(&sequential::tests::page_url(3), 200, "Error: page not found");

        let (outcome, mut monitor) = h.run(
            BookRequest::new(SourceKind::Rgo, sequential::tests::BOOK_URL),
            StrategyEnv::default(),
        );

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.pages, 2);
        let folder = h.book_dir("RGO_231378");
        assert!(folder.join("00001.png").exists());
        assert!(folder.join("00002.png").exists());
        assert!(!folder.join("00003.png").exists());
        assert_eq!(h.transport.call_count(&sequential::tests::page_url(4)), 0);
        // 未知页数时分母随进度增长
        assert_eq!(monitor.drain(), [0.0, 0.5, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn sequential_book_ends_on_not_found() {
        let h = Harness::new();
        script_rgo(&h.transport, 4);

        let (outcome, _) = h.run(
            BookRequest::new(SourceKind::Rgo, sequential::tests::BOOK_URL).starting_at(2),
            StrategyEnv::default(),
        );

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.state, RunState::Done);
        // 从第 2 页开始，第 5 页 404：共 3 页
        assert_eq!(outcome.pages, 3);
        assert!(!h.book_dir("RGO_231378").join("00001.png").exists());
    }

    #[test]
    fn sequential_book_ends_on_empty_body() {
        let h = Harness::new();
        script_rgo(&h.transport, 1);
        h.transport.respond(&sequential::tests::page_url(2), 200, "");
        h.transport.respond(&sequential::tests::page_url(3), 200, "");

        let (outcome, _) = h.run(
            BookRequest::new(SourceKind::Rgo, sequential::tests::BOOK_URL),
            StrategyEnv::default(),
        );

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.pages, 1);
        let folder = h.book_dir("RGO_231378");
        assert!(folder.join("00001.png").exists());
        assert!(!folder.join("00002.png").exists());
        assert_eq!(h.transport.call_count(&sequential::tests::page_url(3)), 0);
    }

    fn tiled_env() -> StrategyEnv {
        StrategyEnv {
            tiles: TileOptions {
                zoom: 0,
                max_tile_num: 999,
            },
            ..StrategyEnv::default()
        }
    }

    #[test]
    fn tiled_page_is_reconstructed_from_tiles_until_not_found() {
        let h = Harness::new();
        h.transport
            .respond("https://www.prlib.ru/item/5", 200, tiled::tests::LANDING);
        h.transport.respond(
            tiled::tests::METADATA_URL,
            200,
            r#"{"pgs": [{"f": "p1.tif", "d": [{"w": 20, "h": 20}]}]}"#,
        );
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [0, 0, 0]];
        for (i, c) in colors.iter().enumerate() {
            h.transport
                .respond(&tiled::tests::tile_url("p1.tif", 0, i), 200, png_bytes(10, 10, *c));
        }

        let (outcome, mut monitor) = h.run(BookRequest::new(SourceKind::Prlib, "5"), tiled_env());

        assert!(outcome.is_success(), "{:?}", outcome.error);
        let folder = h.book_dir("PRLIB_5");
        assert!(!folder.join("00000").exists());
        let page = image::open(folder.join("00000.jpg")).unwrap();
        assert_eq!((page.width(), page.height()), (20, 20));
        // 第 5 块瓦片 404 即结束
        assert_eq!(
            h.transport
                .call_count(&tiled::tests::tile_url("p1.tif", 0, 4)),
            1
        );
        assert_eq!(
            h.transport
                .call_count(&tiled::tests::tile_url("p1.tif", 0, 5)),
            0
        );
        assert_eq!(monitor.drain(), [0.0, 0.5, 1.0]);
    }

    #[test]
    fn tiled_metadata_falls_back_to_image_dir() {
        let h = Harness::new();
        h.transport.respond(
            "https://www.prlib.ru/item/5",
            200,
            r#"<html><head>
            <meta property="og:image" content="https://content.prlib.ru/book_preview/abc_123/cover.jpg">
            </head><body><div class="diva-viewer" data-filegroup="FG1"></div>
            <script>jQuery.extend(Drupal.settings, {"diva":{"imageDir":"\/var\/data\/scans\/public\/XYZ_9\/FG2","x":1}});</script>
            </body></html>"#,
        );
        h.transport.respond(tiled::tests::METADATA_URL, 500, "");
        h.transport.respond(
            "https://content.prlib.ru/metadata/public/XYZ_9/FG2/XYZ_9.json",
            200,
            r#"{"pgs": [{"f": "p1.tif", "d": [{"w": 10}]}]}"#,
        );
        let tile = "https://content.prlib.ru/fcgi-bin/iipsrv.fcgi?FIF=/var/data/scans/public/XYZ_9/FG2/p1.tif&JTL=0,0&CVT=JPG";
        h.transport.respond(tile, 200, png_bytes(10, 10, [0, 0, 255]));

        let (outcome, _) = h.run(BookRequest::new(SourceKind::Prlib, "5"), tiled_env());

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.pages, 1);
        assert_eq!(h.transport.call_count(tiled::tests::METADATA_URL), 1);
        assert_eq!(h.transport.call_count(tile), 1);
        let page = image::open(h.book_dir("PRLIB_5").join("00000.jpg")).unwrap();
        assert_eq!((page.width(), page.height()), (10, 10));
    }

    #[test]
    fn missing_tiled_metadata_fails_the_book() {
        let h = Harness::new();
        h.transport
            .respond("https://www.prlib.ru/item/5", 200, "<html><body></body></html>");

        let (outcome, _) = h.run(BookRequest::new(SourceKind::Prlib, "5"), tiled_env());

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("metadata"));
        assert!(outcome.folder.ends_with("PRLIB_5"));
    }

    #[test]
    fn page_without_tiles_fails_the_book() {
        let h = Harness::new();
        h.transport
            .respond("https://www.prlib.ru/item/5", 200, tiled::tests::LANDING);
        h.transport.respond(
            tiled::tests::METADATA_URL,
            200,
            r#"{"pgs": [{"f": "p1.tif", "d": [{"w": 20}]}]}"#,
        );

        let (outcome, _) = h.run(BookRequest::new(SourceKind::Prlib, "5"), tiled_env());

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("no tiles"));
    }

    #[test]
    fn page_parts_are_merged_into_one_document() {
        let h = Harness::new();
        let scratch = TempDir::new().unwrap();
        h.transport.respond(
            "https://pgpb.ru/digitization/document/5",
            200,
            r#"<div class="digitization-view-left" data-url="/f/1.pdf"></div>
               <div class="digitization-view-left" data-url="/f/2.pdf"></div>"#,
        );
        for (i, width) in [(1, 100), (2, 200)] {
            let path = scratch.path().join(format!("{i}.pdf"));
            one_page_pdf(&path, width);
            h.transport
                .respond(&format!("https://pgpb.ru/f/{i}.pdf"), 200, fs::read(&path).unwrap());
        }

        let (outcome, _) = h.run(BookRequest::new(SourceKind::Pgpb, "5"), StrategyEnv::default());

        assert!(outcome.is_success(), "{:?}", outcome.error);
        let folder = h.book_dir("PGPB_5");
        assert!(!folder.join(MERGE_WORKSPACE).exists());
        let merged = lopdf::Document::load(folder.join("5.pdf")).unwrap();
        assert_eq!(merged.get_pages().len(), 2);
    }

    #[test]
    fn remote_asset_is_saved_with_session() {
        let h = Harness::new();
        h.transport.respond(
            "https://neb-chr.ru/read/42",
            200,
            r#"<script>const fileName = "/files/42.pdf";</script>"#,
        );
        h.transport
            .respond("https://neb-chr.ru/files/42.pdf", 200, "%PDF-1.5");
        let env = StrategyEnv {
            session: Some(SessionContext::from_cookie_header("sid=1")),
            ..StrategyEnv::default()
        };

        let (outcome, mut monitor) = h.run(BookRequest::new(SourceKind::Nebchr, "42"), env);

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(
            fs::read(h.book_dir("NEBCHR_42").join("42.pdf")).unwrap(),
            b"%PDF-1.5"
        );
        assert_eq!(monitor.drain(), [0.5, 1.0]);
    }

    #[test]
    fn polled_download_is_moved_into_book_folder() {
        let h = Harness::new();
        let downloads_dir = h.dir.path().join("PDFReader");
        fs::create_dir_all(&downloads_dir).unwrap();
        let downloaded = downloads_dir.join("book.pdf");
        fs::write(&downloaded, b"pdf").unwrap();
        let path = downloaded.to_str().unwrap();

        let env = StrategyEnv {
            download_provider: Some(Box::new(ScriptedDownloads::new([
                status(DownloadState::InProgress, 40, path),
                status(DownloadState::Complete, 100, path),
            ]))),
            ..StrategyEnv::default()
        };
        let (outcome, mut monitor) = h.run(
            BookRequest::new(SourceKind::PdfReader, "http://10.0.0.1:8083/read/88/pdf"),
            env,
        );

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert!(!downloaded.exists());
        assert!(h.book_dir("PDFReader_88").join("book.pdf").exists());
        assert_eq!(monitor.drain(), [0.4, 1.0, 1.0]);
    }

    #[test]
    fn cancel_flag_stops_before_next_page() {
        let dir = TempDir::new().unwrap();
        let (transport, fetcher) = scripted_fetcher(3);
        script_shpl(&transport, 3);
        let flag = Arc::new(AtomicBool::new(true));
        let assembler = BookAssembler::new(dir.path(), fetcher).with_cancel(flag);
        let (reporter, _monitor) = progress_channel();

        let outcome = assembler.run(
            &BookRequest::new(SourceKind::Shpl, "77"),
            StrategyEnv::default(),
            &reporter,
        );

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("canceled"));
        assert_eq!(outcome.pages, 0);
        assert_eq!(transport.call_count("http://elib.shpl.ru/pages/100/zooms/8"), 0);
    }

    #[test]
    fn session_source_without_cookies_fails_at_init() {
        let h = Harness::new();
        let (outcome, _) = h.run(
            BookRequest::new(SourceKind::Libfl, "bok=1"),
            StrategyEnv::default(),
        );
        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("LIBFL"));
        assert_eq!(outcome.folder, absolute(h.dir.path()));
        assert!(h.transport.calls().is_empty());
    }
}
