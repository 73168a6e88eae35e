//! 扫描版图书下载器。
//!
//! 从各数字图书馆抓取扫描页，整理为按页编号的图片或合并后的 PDF。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径等基础设施
//! - `network_parser`：带重试与停顿的抓取器、会话、页面解析
//! - `sources`：各来源的页面枚举与抓取策略
//! - `download`：单本书的下载流程编排与进度
//! - `book_parser`：瓦片拼接与 PDF 合并

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

mod base_system;
mod book_parser;
mod download;
mod network_parser;
mod sources;

use base_system::book_paths::section_folder_path;
use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use download::models::BookRequest;
use download::orchestrator::BookAssembler;
use download::progress::{CliProgressBar, progress_channel};
use network_parser::download_status::{DownloadStatusProvider, HttpDownloadStatus};
use network_parser::fetcher::{HttpTransport, ResilientFetcher};
use network_parser::session::{CookieSessionProvider, SessionProvider};
use sources::{SourceKind, StrategyEnv};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "scanbook-downloader")]
#[command(version = VERSION)]
#[command(about = "Download scanned books from digital libraries")]
struct Cli {
    /// 来源
    #[arg(value_enum)]
    source: SourceKind,

    /// 书籍 ID；RGO 与 PDFReader 需要完整链接
    book: String,

    /// 从第几页开始（从 1 开始）
    #[arg(long, default_value_t = 1)]
    start: usize,

    /// 保存根目录，缺省使用配置中的 save_path
    #[arg(long)]
    folder: Option<PathBuf>,

    /// 需要登录的来源使用的 Cookie 串，优先于配置文件
    #[arg(long)]
    cookie: Option<String>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录（配置与日志），缺省为当前目录
    #[arg(long)]
    data_dir: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref().map(Path::new);

    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "scanbook-downloader v{VERSION}");

    let config =
        load_or_create_with_base::<Config>(None, data_dir).map_err(|e| anyhow!(e.to_string()))?;

    let kind = cli.source;
    let root = cli.folder.unwrap_or_else(|| config.default_save_dir());
    let settings = config.fetch_settings(kind);
    let transport = HttpTransport::new(&settings)?;
    let fetcher = Arc::new(ResilientFetcher::new(Box::new(transport), settings));

    let cookie = cli.cookie.or_else(|| config.cookie_for(kind));
    let session = match CookieSessionProvider::new(kind.tag(), cookie).login() {
        Ok(session) => Some(session),
        Err(e) => {
            if kind.needs_session() {
                warn!("{e}");
            }
            None
        }
    };

    let download_provider: Option<Box<dyn DownloadStatusProvider>> =
        if kind == SourceKind::PdfReader {
            let provider = HttpDownloadStatus::new(
                section_folder_path(&root, kind.tag()),
                &config.user_agent,
                Duration::from_secs(config.request_timeout.max(1)),
            )?;
            Some(Box::new(provider))
        } else {
            None
        };

    let env = StrategyEnv {
        session,
        tiles: config.tile_options(),
        poll_attempts: config.download_poll_attempts,
        download_provider,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        log.on_interrupt(move || cancel.store(true, Ordering::SeqCst));
    }

    let request = BookRequest::new(kind, cli.book).starting_at(cli.start);
    let (reporter, mut monitor) = progress_channel();
    let assembler = BookAssembler::new(root, fetcher).with_cancel(cancel);
    let handle = thread::Builder::new()
        .name("book-run".to_string())
        .spawn(move || assembler.run(&request, env, &reporter))?;

    let bar = CliProgressBar::new(kind.tag());
    while !handle.is_finished() {
        bar.update(monitor.poll());
        thread::sleep(Duration::from_millis(100));
    }
    bar.update(monitor.poll());
    let outcome = handle
        .join()
        .map_err(|_| anyhow!("download thread panicked"))?;
    bar.finish();

    info!(
        "run ended in {:?} with {} pages written",
        outcome.state, outcome.pages
    );
    if outcome.is_success() {
        println!("Book saved to {}", outcome.folder.display());
        return Ok(());
    }
    let message = outcome.error.unwrap_or_default();
    eprintln!(
        "Error: {message} (partial output in {})",
        outcome.folder.display()
    );
    Err(anyhow!(message))
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
