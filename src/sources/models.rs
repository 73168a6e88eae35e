//! 来源策略之间共享的数据模型。

use std::path::PathBuf;

use reqwest::header::HeaderMap;

/// 瓦片页的缩放级别与整页像素宽度（来自书籍元数据）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiling {
    pub zoom: usize,
    pub full_width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub index: usize,
    /// 远程定位符：完整 URL 或站点内的不透明 ID。
    pub locator: String,
    pub tiling: Option<Tiling>,
}

impl PageDescriptor {
    pub fn new(index: usize, locator: impl Into<String>) -> Self {
        Self {
            index,
            locator: locator.into(),
            tiling: None,
        }
    }

    pub fn tiled(index: usize, locator: impl Into<String>, tiling: Tiling) -> Self {
        Self {
            index,
            locator: locator.into(),
            tiling: Some(tiling),
        }
    }
}

/// 一次获取的结果：继续，或来源明确给出的序列结束信号。
#[derive(Debug)]
pub enum Step<T> {
    Continue(T),
    EndOfSequence,
}

#[derive(Debug)]
pub struct Tile {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// 一页的全部瓦片，按行优先顺序排列。
#[derive(Debug)]
pub struct TileSet {
    pub extension: &'static str,
    pub tiles: Vec<Tile>,
}

/// 单页获取后交给编排器落盘的内容。
#[derive(Debug)]
pub enum PagePayload {
    /// 直接写入 `{index:05}.{ext}`。
    Page { bytes: Vec<u8>, extension: &'static str },
    /// 写入合并工作目录，收尾阶段合并为单个文档。
    Part { bytes: Vec<u8>, extension: &'static str },
    /// 写入该页的瓦片工作目录，收尾阶段拼接。
    Tiles(TileSet),
    /// 整本书的单个文件，由编排器直接下载到书籍目录。
    Remote {
        url: String,
        headers: HeaderMap,
        file_name: String,
    },
    /// 已由外部下载完成的文件，移动进书籍目录。
    Downloaded(PathBuf),
}

/// 页总数的可知程度，决定进度比例的算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Total {
    Exact(usize),
    /// 只有估计值（或完全未知），分母随进度增长。
    Estimate(Option<usize>),
    /// 进度由来源自行上报。
    External,
}

pub struct PageEnumeration {
    pub pages: Box<dyn Iterator<Item = PageDescriptor> + Send>,
    pub total: Total,
}

impl PageEnumeration {
    pub fn new(pages: impl Iterator<Item = PageDescriptor> + Send + 'static, total: Total) -> Self {
        Self {
            pages: Box::new(pages),
            total,
        }
    }
}

impl Total {
    /// 第 `ordinal` 个页面（从 0 计）开始处理时的进度比例。
    pub fn fraction(&self, ordinal: usize, share: f64) -> Option<f64> {
        let value = match *self {
            Total::Exact(0) => return None,
            Total::Exact(n) => ordinal as f64 / n as f64,
            Total::Estimate(Some(e)) => ordinal as f64 / e.max(ordinal + 1) as f64,
            Total::Estimate(None) => ordinal as f64 / (ordinal + 1) as f64,
            Total::External => return None,
        };
        Some((value * share).clamp(0.0, 1.0))
    }
}
