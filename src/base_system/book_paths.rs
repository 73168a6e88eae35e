//! 输出目录布局：`root/{source_tag}_{book_id}/{index:05}.{ext}`。

use std::path::{Path, PathBuf};

/// 多文件合并前的临时工作目录名（位于书籍目录下）。
pub const MERGE_WORKSPACE: &str = "_TEMP";

pub fn book_folder_name(source_tag: &str, book_id: &str) -> String {
    format!("{}_{}", source_tag, safe_fs_name(book_id, "_", 120))
}

pub fn book_folder_path(root: &Path, source_tag: &str, book_id: &str) -> PathBuf {
    root.join(book_folder_name(source_tag, book_id))
}

/// 单文件来源的公共下载目录：`root/{source_tag}`。
pub fn section_folder_path(root: &Path, source_tag: &str) -> PathBuf {
    root.join(source_tag)
}

pub fn page_file_name(index: usize, extension: &str) -> String {
    format!("{index:05}.{extension}")
}

pub fn tile_workspace_name(index: usize) -> String {
    format!("{index:05}")
}

pub fn tile_file_name(index: usize, extension: &str) -> String {
    format!("{index:05}.{extension}")
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let fallback = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => fallback,
            c if (c as u32) < 32 => fallback,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断
        let mut end = max_len;
        while end > 0 && !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}
