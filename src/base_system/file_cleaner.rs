//! 临时工作目录清理与文件搬运。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// 按文件名排序列出目录中的文件（忽略子目录）。
pub fn sorted_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn remove_workspace(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
        debug!("removed workspace {}", dir.display());
    }
    Ok(())
}

/// 把文件移动到目标目录，跨设备时退回复制 + 删除。
pub fn move_into(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", src.display()),
        )
    })?;
    let dest = dest_dir.join(name);
    if fs::rename(src, &dest).is_err() {
        fs::copy(src, &dest)?;
        fs::remove_file(src)?;
    }
    Ok(dest)
}
