//! 瓦片拼接。
//!
//! 列数由元数据给出的整页宽度与第一块瓦片的宽度决定：
//! `columns = ceil(full_width / first_width)`，`rows = ceil(count / columns)`。
//! 瓦片按行优先排列，最后一行可以不满。
//! 行内瓦片必须等高；比最宽一行窄的行在右侧以白色补齐。

use std::fs;
use std::ops::Range;
use std::path::Path;

use image::{ImageReader, Rgb, RgbImage, imageops};
use tracing::debug;

use super::AssemblyError;
use crate::base_system::file_cleaner::{remove_workspace, sorted_files};

const PAD: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub columns: usize,
    pub rows: usize,
    pub count: usize,
}

impl TileGrid {
    pub fn for_page(full_width: u32, first_width: u32, count: usize) -> Result<Self, AssemblyError> {
        if count == 0 {
            return Err(AssemblyError::EmptyTileSet("grid".to_string()));
        }
        if full_width == 0 || first_width == 0 {
            return Err(AssemblyError::ShapeMismatch(format!(
                "zero width (page {full_width}, tile {first_width})"
            )));
        }
        let columns = full_width.div_ceil(first_width) as usize;
        let rows = count.div_ceil(columns);
        Ok(Self {
            columns,
            rows,
            count,
        })
    }

    /// 第 `row` 行包含的瓦片序号。
    pub fn row_range(&self, row: usize) -> Range<usize> {
        let start = (row * self.columns).min(self.count);
        let end = (start + self.columns).min(self.count);
        start..end
    }
}

fn concat_row(tiles: &[RgbImage], row: usize) -> Result<RgbImage, AssemblyError> {
    let height = tiles[0].height();
    if let Some((i, tile)) = tiles.iter().enumerate().find(|(_, t)| t.height() != height) {
        return Err(AssemblyError::ShapeMismatch(format!(
            "tile {i} of row {row} is {} px high, expected {height}",
            tile.height()
        )));
    }
    let width = tiles.iter().map(RgbImage::width).sum();
    let mut out = RgbImage::new(width, height);
    let mut x: i64 = 0;
    for tile in tiles {
        imageops::replace(&mut out, tile, x, 0);
        x += i64::from(tile.width());
    }
    Ok(out)
}

fn stack_rows(rows: &[RgbImage]) -> RgbImage {
    let width = rows.iter().map(RgbImage::width).max().unwrap_or(0);
    let height = rows.iter().map(RgbImage::height).sum();
    let mut out = RgbImage::from_pixel(width, height, PAD);
    let mut y: i64 = 0;
    for row in rows {
        imageops::replace(&mut out, row, 0, y);
        y += i64::from(row.height());
    }
    out
}

/// 按行优先顺序把瓦片拼成整页。
pub fn reconstruct(tiles: &[RgbImage], full_width: u32) -> Result<RgbImage, AssemblyError> {
    let first = tiles
        .first()
        .ok_or_else(|| AssemblyError::EmptyTileSet("page".to_string()))?;
    if tiles.len() == 1 {
        return Ok(first.clone());
    }
    let grid = TileGrid::for_page(full_width, first.width(), tiles.len())?;
    debug!(
        "reconstructing {} tiles as {}x{}",
        grid.count, grid.columns, grid.rows
    );

    let rows = (0..grid.rows)
        .map(|r| concat_row(&tiles[grid.row_range(r)], r))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stack_rows(&rows))
}

fn decode_tile(path: &Path) -> Result<RgbImage, AssemblyError> {
    let decode_err = |source| AssemblyError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let bytes = fs::read(path).map_err(|source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let image = ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|source| AssemblyError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .decode()
        .map_err(decode_err)?;
    Ok(image.to_rgb8())
}

/// 读取工作目录中按文件名排序的瓦片，拼接后写入 `output` 并删除工作目录。
pub fn reconstruct_workspace(
    workspace: &Path,
    output: &Path,
    full_width: u32,
) -> Result<(), AssemblyError> {
    let io_err = |source| AssemblyError::Io {
        path: workspace.to_path_buf(),
        source,
    };
    let files = sorted_files(workspace).map_err(io_err)?;
    if files.is_empty() {
        return Err(AssemblyError::EmptyTileSet(workspace.display().to_string()));
    }
    let tiles = files
        .iter()
        .map(|p| decode_tile(p))
        .collect::<Result<Vec<_>, _>>()?;

    let page = reconstruct(&tiles, full_width)?;
    page.save(output).map_err(|source| AssemblyError::Decode {
        path: output.to_path_buf(),
        source,
    })?;
    remove_workspace(workspace).map_err(io_err)?;
    Ok(())
}
