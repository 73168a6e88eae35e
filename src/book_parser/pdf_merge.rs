//! 分页 PDF 合并。
//!
//! 各文件的对象编号先错开，再把所有页面挂到同一个 `Pages` 节点下。
//! 页面顺序即文件名顺序。

use std::path::Path;

use lopdf::{Document, Object, ObjectId};
use tracing::{debug, info};

use super::AssemblyError;
use crate::base_system::file_cleaner::{remove_workspace, sorted_files};

fn type_name(object: &Object) -> Option<&[u8]> {
    object
        .as_dict()
        .ok()?
        .get(b"Type")
        .and_then(Object::as_name)
        .ok()
}

fn pdf_err(path: &Path, e: impl ToString) -> AssemblyError {
    AssemblyError::Pdf {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// 按顺序合并 `inputs` 的全部页面，写入 `output`，返回页数。
pub fn merge_files(inputs: &[impl AsRef<Path>], output: &Path) -> Result<usize, AssemblyError> {
    let mut max_id = 1;
    let mut pages: Vec<(ObjectId, Object)> = Vec::new();
    let mut objects = Vec::new();

    for input in inputs {
        let path = input.as_ref();
        let mut doc = Document::load(path).map_err(|e| pdf_err(path, e))?;
        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        for (_, page_id) in doc.get_pages() {
            let page = doc.get_object(page_id).map_err(|e| pdf_err(path, e))?;
            pages.push((page_id, page.to_owned()));
        }
        objects.extend(doc.objects);
        debug!("loaded {}", path.display());
    }
    if pages.is_empty() {
        return Err(pdf_err(output, "no pages to merge"));
    }

    let mut merged = Document::with_version("1.5");
    let mut catalog: Option<(ObjectId, Object)> = None;
    let mut pages_root: Option<(ObjectId, Object)> = None;

    for (id, object) in objects {
        let kind = type_name(&object).map(<[u8]>::to_vec);
        match kind.as_deref() {
            Some(b"Catalog") => {
                catalog.get_or_insert((id, object));
            }
            Some(b"Pages") => {
                let Object::Dictionary(mut dict) = object else {
                    continue;
                };
                // 多个页树合并为一个，沿用第一个的编号
                let root_id = match pages_root.take() {
                    Some((root_id, Object::Dictionary(old))) => {
                        dict.extend(&old);
                        root_id
                    }
                    Some((root_id, _)) => root_id,
                    None => id,
                };
                pages_root = Some((root_id, Object::Dictionary(dict)));
            }
            Some(b"Page") | Some(b"Outlines") | Some(b"Outline") => {}
            _ => {
                merged.objects.insert(id, object);
            }
        }
    }

    let (pages_id, pages_object) = pages_root.ok_or_else(|| pdf_err(output, "no page tree"))?;
    let (catalog_id, catalog_object) = catalog.ok_or_else(|| pdf_err(output, "no catalog"))?;

    for (id, page) in &pages {
        if let Ok(dict) = page.as_dict() {
            let mut dict = dict.clone();
            dict.set("Parent", Object::Reference(pages_id));
            merged.objects.insert(*id, Object::Dictionary(dict));
        }
    }

    if let Ok(dict) = pages_object.as_dict() {
        let mut dict = dict.clone();
        dict.set("Count", Object::Integer(pages.len() as i64));
        dict.set(
            "Kids",
            pages
                .iter()
                .map(|(id, _)| Object::Reference(*id))
                .collect::<Vec<_>>(),
        );
        merged.objects.insert(pages_id, Object::Dictionary(dict));
    }

    if let Ok(dict) = catalog_object.as_dict() {
        let mut dict = dict.clone();
        dict.set("Pages", Object::Reference(pages_id));
        dict.remove(b"Outlines");
        merged.objects.insert(catalog_id, Object::Dictionary(dict));
    }

    merged.trailer.set("Root", Object::Reference(catalog_id));
    merged.max_id = merged.objects.len() as u32;
    merged.renumber_objects();
    merged.compress();
    merged.save(output).map_err(|e| pdf_err(output, e))?;
    Ok(pages.len())
}

/// 合并工作目录中的全部 `.pdf` 后删除工作目录。
pub fn merge_workspace(workspace: &Path, output: &Path) -> Result<usize, AssemblyError> {
    let io_err = |source| AssemblyError::Io {
        path: workspace.to_path_buf(),
        source,
    };
    let inputs: Vec<_> = sorted_files(workspace)
        .map_err(io_err)?
        .into_iter()
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    if inputs.is_empty() {
        return Err(pdf_err(workspace, "no PDF files to merge"));
    }

    let count = merge_files(&inputs, output)?;
    info!("merged {} files ({count} pages) into {}", inputs.len(), output.display());
    remove_workspace(workspace).map_err(io_err)?;
    Ok(count)
}
