//! 书籍 ID/链接解析与规范化。
//!
//! 大部分来源只需要数字 ID；用户粘贴整条链接时从中提取。
//! RGO 与 PDF 阅读器来源必须保留完整链接。

use regex::Regex;
use std::sync::OnceLock;

use crate::sources::SourceKind;

static RE_URL: OnceLock<Regex> = OnceLock::new();
static RE_PATH_ID: OnceLock<Regex> = OnceLock::new();
static RE_QS_ID: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("compile RE_URL"))
}

fn re_path_id() -> &'static Regex {
    RE_PATH_ID.get_or_init(|| {
        Regex::new(r"/(?:item|document|pages|nodes|read|open)/(\d+)").expect("compile RE_PATH_ID")
    })
}

fn re_qs_id() -> &'static Regex {
    RE_QS_ID.get_or_init(|| Regex::new(r"(?i)\bbrId=(\d+)").expect("compile RE_QS_ID"))
}

pub fn parse_book_ref(source: SourceKind, input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if source.requires_full_url() {
        return re_url().find(trimmed).map(|m| m.as_str().to_string());
    }

    // LIBFL 的 ID 是查看器的查询串，原样保留
    if source == SourceKind::Libfl {
        return Some(
            trimmed
                .split_once("Viewer?")
                .map(|(_, rest)| rest.split(['&', '#']).next().unwrap_or(rest))
                .unwrap_or(trimmed)
                .to_string(),
        );
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }

    let target = re_url()
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    if let Some(caps) = re_qs_id().captures(target) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }

    if let Some(caps) = re_path_id().captures(target) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }

    None
}
