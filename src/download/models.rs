//! 书籍下载流程的数据模型与错误类型。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::book_parser::AssemblyError;
use crate::network_parser::fetcher::FetchError;
use crate::sources::SourceKind;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not get metadata: {0}")]
    MetadataMissing(String),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("no session configured for {0}")]
    SessionRequired(String),
    #[error("invalid book reference: {0}")]
    InvalidBook(String),
    #[error("could not download book: {0}")]
    Download(String),
    #[error("canceled")]
    Canceled,
}

impl AcquireError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AcquireError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookRequest {
    pub source: SourceKind,
    /// 用户输入的 ID 或链接，由来源自行规范化。
    pub book: String,
    /// 从 1 开始。
    pub start_index: usize,
}

impl BookRequest {
    pub fn new(source: SourceKind, book: impl Into<String>) -> Self {
        Self {
            source,
            book: book.into(),
            start_index: 1,
        }
    }

    pub fn starting_at(mut self, start_index: usize) -> Self {
        self.start_index = start_index.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    FolderCreated,
    Enumerating,
    Fetching,
    Persisting,
    Finalizing,
    Done,
    Failed,
}

/// 一次书籍下载的结果：错误信息（成功为 `None`）与输出目录绝对路径。
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub error: Option<String>,
    pub folder: PathBuf,
    pub state: RunState,
    pub pages: usize,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
