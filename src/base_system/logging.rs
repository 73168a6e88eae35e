use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024; // 10MB
const ARCHIVE_WAIT_MS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            console: true,
        }
    }
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

pub struct LogSystem {
    runtime: Arc<LogRuntime>,
}

impl LogSystem {
    /// 初始化日志：控制台 + `logs/latest.log`（相对 `base_dir`，缺省为当前目录）。
    pub fn init_with_base(options: LogOptions, base_dir: Option<&Path>) -> Result<Self, LogError> {
        let logs_dir = base_dir
            .map(|b| b.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"));
        fs::create_dir_all(&logs_dir)?;
        let latest_log = logs_dir.join("latest.log");

        archive_if_large(&latest_log, &logs_dir)?;

        let file_appender = rolling::never(&logs_dir, "latest.log");
        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(file_appender);

        let console_level = if options.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };

        let console_writer: BoxMakeWriter = if options.console {
            BoxMakeWriter::new(io::stderr)
        } else {
            BoxMakeWriter::new(io::sink)
        };

        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(options.use_color)
            .with_writer(console_writer)
            .with_filter(console_level);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(LevelFilter::DEBUG);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("global subscriber") || msg.contains("already") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        let runtime = Arc::new(LogRuntime {
            logs_dir,
            latest_log,
            guard: Mutex::new(Some(guard)),
            interrupt_hook: Mutex::new(None),
            exit_called: AtomicBool::new(false),
            archive_on_exit: options.archive_on_exit,
        });

        runtime.install_signal_handler();
        runtime.install_panic_hook();

        Ok(Self { runtime })
    }

    /// 第一次 Ctrl-C 交给该回调（例如设置取消标志）；之后的 Ctrl-C 直接退出。
    pub fn on_interrupt<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut hook) = self.runtime.interrupt_hook.lock() {
            *hook = Some(Box::new(func));
        }
    }

}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.runtime.safe_exit();
    }
}

struct LogRuntime {
    logs_dir: PathBuf,
    latest_log: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    interrupt_hook: Mutex<Option<Hook>>,
    exit_called: AtomicBool,
    archive_on_exit: bool,
}

impl LogRuntime {
    fn install_signal_handler(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let _ = ctrlc::set_handler(move || {
            let pending = runtime
                .interrupt_hook
                .lock()
                .ok()
                .and_then(|mut hook| hook.take());
            if let Some(hook) = pending {
                warn!("收到中断信号，当前页完成后停止");
                hook();
                return;
            }

            runtime.safe_exit();
            std::process::exit(130);
        });
    }

    fn install_panic_hook(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                error!("panic at {}:{}: {}", location.file(), location.line(), info);
            } else {
                error!("panic: {info}");
            }
            runtime.safe_exit();
            previous(info);
        }));
    }

    fn safe_exit(&self) {
        if self.exit_called.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }

        thread::sleep(Duration::from_millis(ARCHIVE_WAIT_MS));

        if self.archive_on_exit {
            if let Err(err) = archive_log_file(&self.latest_log, &self.logs_dir) {
                eprintln!("failed to archive log: {err}");
            }
        }
    }
}

fn archive_if_large(latest_log: &Path, logs_dir: &Path) -> Result<(), LogError> {
    if let Ok(meta) = fs::metadata(latest_log) {
        if meta.len() >= MAX_LOG_BYTES {
            archive_log_file(latest_log, logs_dir)?;
        }
    }
    Ok(())
}

fn archive_log_file(latest_log: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    if !latest_log.exists() {
        return Ok(None);
    }
    let meta = fs::metadata(latest_log)?;
    if meta.len() == 0 {
        let _ = fs::remove_file(latest_log);
        return Ok(None);
    }

    let timestamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let archive_path = logs_dir.join(format!("log_{timestamp}.zip"));

    let file = File::create(&archive_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{timestamp}.log"), options)?;

    let mut log_file = File::open(latest_log)?;
    io::copy(&mut log_file, &mut zip)?;
    zip.finish()?;
    drop(log_file);

    let _ = fs::remove_file(latest_log);

    info!("log archived to {}", archive_path.display());
    Ok(Some(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn archive_zips_and_removes_latest_log() {
        let dir = TempDir::new().unwrap();
        let latest = dir.path().join("latest.log");
        fs::write(&latest, "line one\nline two\n").unwrap();

        let archive = archive_log_file(&latest, dir.path()).unwrap().unwrap();
        assert!(!latest.exists());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut entry = zip.by_index(0).unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        assert_eq!(text, "line one\nline two\n");
    }

    #[test]
    fn empty_log_is_dropped_without_archive() {
        let dir = TempDir::new().unwrap();
        let latest = dir.path().join("latest.log");
        fs::write(&latest, "").unwrap();

        assert!(archive_log_file(&latest, dir.path()).unwrap().is_none());
        assert!(!latest.exists());
    }

    #[test]
    fn small_log_is_not_archived_at_startup() {
        let dir = TempDir::new().unwrap();
        let latest = dir.path().join("latest.log");
        fs::write(&latest, "x").unwrap();

        archive_if_large(&latest, dir.path()).unwrap();
        assert!(latest.exists());
    }
}
