//! 下载后的收尾处理：瓦片拼接为整页图像，分页 PDF 合并为单个文档。

pub mod pdf_merge;
pub mod tile_reconstructor;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no tiles for page {0}")]
    EmptyTileSet(String),
    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("tile layout mismatch: {0}")]
    ShapeMismatch(String),
    #[error("pdf error at {path}: {message}")]
    Pdf { path: PathBuf, message: String },
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}
