//! PRLIB：每页由 IIP 服务器的瓦片拼接而成。
//!
//! 落地页给出书名（`og:image`）与文件组（`div.diva-viewer`），
//! 元数据 JSON 给出每页的文件名及各缩放级别的整页宽度。
//! 瓦片按序号请求，第一个 404 即为该页瓦片集的终点。

use std::path::Path;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::models::{PageDescriptor, PageEnumeration, PagePayload, Step, Tile, TileSet, Tiling, Total};
use super::{SourceKind, SourceStrategy, TileOptions};
use crate::base_system::book_paths::{page_file_name, tile_workspace_name};
use crate::book_parser::AssemblyError;
use crate::book_parser::tile_reconstructor::reconstruct_workspace;
use crate::download::models::AcquireError;
use crate::download::progress::ProgressReporter;
use crate::network_parser::fetcher::ResilientFetcher;
use crate::network_parser::html::{self, selector};

const BOOK_URL: &str = "https://www.prlib.ru/item/";
const CONTENT_HOST: &str = "https://content.prlib.ru";
const TILE_EXTENSION: &str = "jpg";

selector!(OG_IMAGE_SELECTOR, r#"meta[property="og:image"]"#);
selector!(VIEWER_SELECTOR, "div.diva-viewer");

#[derive(Debug, Clone, PartialEq, Eq)]
struct BookLocation {
    name: String,
    file_group: String,
}

impl BookLocation {
    fn metadata_url(&self) -> String {
        format!(
            "{CONTENT_HOST}/metadata/public/{name}/{group}/{name}.json",
            name = self.name,
            group = self.file_group
        )
    }

    fn tile_url(&self, page_file: &str, zoom: usize, tile: usize) -> String {
        format!(
            "{CONTENT_HOST}/fcgi-bin/iipsrv.fcgi?FIF=/var/data/scans/public/{}/{}/{page_file}&JTL={zoom},{tile}&CVT=JPG",
            self.name, self.file_group
        )
    }
}

#[derive(Debug, Deserialize)]
struct BookMetadata {
    pgs: Vec<PageMetadata>,
}

#[derive(Debug, Deserialize)]
struct PageMetadata {
    f: String,
    #[serde(default)]
    d: Vec<ZoomDimensions>,
}

#[derive(Debug, Deserialize)]
struct ZoomDimensions {
    w: u32,
}

impl PageMetadata {
    fn width_at(&self, zoom: usize) -> Option<u32> {
        self.d.get(zoom).map(|d| d.w).filter(|w| *w > 0)
    }
}

/// 从落地页读取主位置：`og:image` 中 `book_preview/` 之后的书名（大写）
/// 与查看器的 `data-filegroup`。
fn primary_location(doc: &scraper::Html) -> Option<BookLocation> {
    let preview = html::first_attr(doc, &OG_IMAGE_SELECTOR, "content")?;
    let name = preview
        .rsplit("book_preview/")
        .next()?
        .split('/')
        .next()?
        .to_uppercase();
    let file_group = html::first_attr(doc, &VIEWER_SELECTOR, "data-filegroup")?;
    (!name.is_empty()).then_some(BookLocation { name, file_group })
}

/// 备用位置：`jQuery.extend(...)` 脚本中 `imageDir` 的最后两段。
fn fallback_location(doc: &scraper::Html) -> Option<BookLocation> {
    let script = html::scripts(doc)
        .into_iter()
        .find(|s| s.trim_start().starts_with("jQuery.extend"))?;
    let (_, tail) = script.rsplit_once("imageDir")?;
    let dir = tail.split(',').next()?;
    let mut parts = dir.rsplit('/');
    let file_group = parts.next()?.trim().trim_matches(['\\', '"']).to_string();
    let name = parts.next()?.trim().trim_matches(['\\', '"']).to_string();
    (!name.is_empty() && !file_group.is_empty()).then_some(BookLocation { name, file_group })
}

struct FetchedPage {
    index: usize,
    full_width: u32,
}

pub struct TiledStrategy {
    book_id: String,
    fetcher: Arc<ResilientFetcher>,
    options: TileOptions,
    location: Option<BookLocation>,
    page_total: usize,
    fetched: Vec<FetchedPage>,
}

impl TiledStrategy {
    pub fn new(book_id: String, fetcher: Arc<ResilientFetcher>, options: TileOptions) -> Self {
        Self {
            book_id,
            fetcher,
            options,
            location: None,
            page_total: 0,
            fetched: Vec::new(),
        }
    }

    fn load_metadata(&self, location: &BookLocation) -> Option<BookMetadata> {
        let url = location.metadata_url();
        let text = match self.fetcher.fetch_text(&url, &HeaderMap::new()) {
            Ok(text) => text,
            Err(e) => {
                info!("Error loading metadata, trying another method: {e}");
                return None;
            }
        };
        match serde_json::from_str::<BookMetadata>(&text) {
            Ok(meta) if !meta.pgs.is_empty() => Some(meta),
            Ok(_) => {
                warn!("metadata at {url} lists no pages");
                None
            }
            Err(e) => {
                info!("Error parsing metadata from {url}: {e}");
                None
            }
        }
    }

    fn locate(&self, book_url: &str) -> Result<(BookLocation, BookMetadata), AcquireError> {
        let landing = self.fetcher.fetch_text(book_url, &HeaderMap::new())?;
        let doc = html::parse(&landing);

        let primary = primary_location(&doc);
        if let Some(location) = primary.as_ref() {
            if let Some(meta) = self.load_metadata(location) {
                return Ok((location.clone(), meta));
            }
        }

        if let Some(location) = fallback_location(&doc).filter(|l| Some(l) != primary.as_ref()) {
            debug!("retrying metadata with {}/{}", location.name, location.file_group);
            if let Some(meta) = self.load_metadata(&location) {
                return Ok((location, meta));
            }
        }

        Err(AcquireError::MetadataMissing(format!(
            "Could not get metadata for {book_url}"
        )))
    }
}

impl SourceStrategy for TiledStrategy {
    fn kind(&self) -> SourceKind {
        SourceKind::Prlib
    }

    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn enumerate(&mut self, start_index: usize) -> Result<PageEnumeration, AcquireError> {
        let book_url = format!("{BOOK_URL}{}", self.book_id);
        let (location, meta) = self.locate(&book_url)?;

        let first = &meta.pgs[0];
        // 缩放级别超出元数据范围时取最高一级
        let zoom = self.options.zoom.min(first.d.len().saturating_sub(1));
        let default_width = first.width_at(zoom).ok_or_else(|| {
            AcquireError::MetadataMissing(format!("no page width at zoom {zoom} for {book_url}"))
        })?;

        let pages: Vec<PageDescriptor> = meta
            .pgs
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let full_width = page.width_at(zoom).unwrap_or(default_width);
                PageDescriptor::tiled(i, page.f.clone(), Tiling { zoom, full_width })
            })
            .collect();

        info!(
            "PRLIB book {}: {} pages, zoom {zoom}, width {default_width}",
            self.book_id,
            pages.len()
        );
        self.page_total = pages.len();
        self.location = Some(location);

        let skip = start_index.max(1) - 1;
        Ok(PageEnumeration::new(
            pages.into_iter().skip(skip),
            Total::Exact(self.page_total),
        ))
    }

    fn fetch(
        &mut self,
        page: &PageDescriptor,
        _progress: &ProgressReporter,
    ) -> Result<Step<PagePayload>, AcquireError> {
        let location = self
            .location
            .as_ref()
            .ok_or_else(|| AcquireError::MetadataMissing("book was not enumerated".to_string()))?;
        let tiling = page.tiling.ok_or_else(|| {
            AcquireError::MetadataMissing(format!("no tiling for page {}", page.index))
        })?;

        info!("Downloading page {}", page.index);
        let mut tiles = Vec::new();
        for tile in 0..self.options.max_tile_num {
            let url = location.tile_url(&page.locator, tiling.zoom, tile);
            match self.fetcher.fetch_optional(&url, &HeaderMap::new())? {
                Some(bytes) => tiles.push(Tile { index: tile, bytes }),
                None => break,
            }
        }
        debug!("page {} has {} tiles", page.index, tiles.len());

        if tiles.is_empty() {
            return Err(AssemblyError::EmptyTileSet(page.index.to_string()).into());
        }
        self.fetched.push(FetchedPage {
            index: page.index,
            full_width: tiling.full_width,
        });
        Ok(Step::Continue(PagePayload::Tiles(TileSet {
            extension: TILE_EXTENSION,
            tiles,
        })))
    }

    /// 下载与拼接各占一半进度。
    fn download_share(&self) -> f64 {
        0.5
    }

    fn finalize(&mut self, folder: &Path, progress: &ProgressReporter) -> Result<(), AcquireError> {
        let total = self.page_total.max(self.fetched.len()).max(1);
        let done_before = total - self.fetched.len();
        for (k, page) in self.fetched.iter().enumerate() {
            progress.report(0.5 + (done_before + k) as f64 / (2 * total) as f64);
            info!("Concatenating page {}", page.index);
            let workspace = folder.join(tile_workspace_name(page.index));
            let output = folder.join(page_file_name(page.index, TILE_EXTENSION));
            reconstruct_workspace(&workspace, &output, page.full_width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const LANDING: &str = r#"<html><head>
        <meta property="og:image" content="https://content.prlib.ru/book_preview/abc_123/cover.jpg">
        </head><body><div class="diva-viewer" data-filegroup="FG1"></div></body></html>"#;

    pub(crate) const METADATA_URL: &str =
        "https://content.prlib.ru/metadata/public/ABC_123/FG1/ABC_123.json";

    pub(crate) fn tile_url(page_file: &str, zoom: usize, tile: usize) -> String {
        BookLocation {
            name: "ABC_123".to_string(),
            file_group: "FG1".to_string(),
        }
        .tile_url(page_file, zoom, tile)
    }

    #[test]
    fn landing_page_gives_uppercased_name_and_group() {
        let doc = html::parse(LANDING);
        let location = primary_location(&doc).unwrap();
        assert_eq!(location.name, "ABC_123");
        assert_eq!(location.file_group, "FG1");
        assert_eq!(location.metadata_url(), METADATA_URL);
    }

    #[test]
    fn fallback_reads_image_dir() {
        let doc = html::parse(
            r#"<script>jQuery.extend(Drupal.settings, {"diva":{"imageDir":"\/var\/data\/scans\/public\/XYZ_9\/FG2","x":1}});</script>"#,
        );
        let location = fallback_location(&doc).unwrap();
        assert_eq!(location.name, "XYZ_9");
        assert_eq!(location.file_group, "FG2");
    }

    #[test]
    fn tile_url_addresses_iip_server() {
        assert_eq!(
            tile_url("p1.tif", 4, 7),
            "https://content.prlib.ru/fcgi-bin/iipsrv.fcgi?FIF=/var/data/scans/public/ABC_123/FG1/p1.tif&JTL=4,7&CVT=JPG"
        );
    }

    #[test]
    fn zoom_is_clamped_and_width_falls_back_to_first_page() {
        use crate::network_parser::fetcher::testing::scripted_fetcher;

        let (transport, fetcher) = scripted_fetcher(1);
        transport.respond("https://www.prlib.ru/item/5", 200, LANDING);
        transport.respond(
            METADATA_URL,
            200,
            r#"{"pgs": [{"f": "a.tif", "d": [{"w": 10}, {"w": 20}]}, {"f": "b.tif", "d": []}]}"#,
        );
        let mut strategy = TiledStrategy::new("5".into(), fetcher, TileOptions::default());
        let pages: Vec<PageDescriptor> = strategy.enumerate(1).unwrap().pages.collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].tiling, Some(Tiling { zoom: 1, full_width: 20 }));
        assert_eq!(pages[1].tiling, Some(Tiling { zoom: 1, full_width: 20 }));
        assert_eq!(pages[1].locator, "b.tif");
    }
}
