//! 落地页 HTML 解析辅助。

use scraper::{Html, Selector};

macro_rules! selector {
    ($name:ident, $css:expr) => {
        pub(crate) static $name: std::sync::LazyLock<scraper::Selector> =
            std::sync::LazyLock::new(|| scraper::Selector::parse($css).unwrap());
    };
}
pub(crate) use selector;

selector!(SCRIPT_SELECTOR, "script");

pub fn parse(html: &str) -> Html {
    Html::parse_document(html)
}

/// 所有匹配元素的指定属性值（缺失属性的元素被跳过）。
pub fn attr_values(doc: &Html, selector: &Selector, attr: &str) -> Vec<String> {
    doc.select(selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .collect()
}

pub fn first_attr(doc: &Html, selector: &Selector, attr: &str) -> Option<String> {
    doc.select(selector)
        .find_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn texts(doc: &Html, selector: &Selector) -> Vec<String> {
    doc.select(selector)
        .map(|el| el.text().collect::<String>())
        .collect()
}

/// 页面中全部 `<script>` 的原始文本。
pub fn scripts(doc: &Html) -> Vec<String> {
    texts(doc, &SCRIPT_SELECTOR)
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// 脚本文本不做实体解码，这里只处理链接中常见的几种。
pub fn unescape_entities(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
