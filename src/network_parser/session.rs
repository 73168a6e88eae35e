//! 会话上下文。
//!
//! 登录（浏览器自动化等）不在本程序内完成：外部提供 Cookie，
//! 来源策略只把它当作不透明的请求头使用。

use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use tracing::debug;

use crate::download::models::AcquireError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    cookies: Vec<(String, String)>,
}

impl SessionContext {
    /// 解析 `name=value; name2=value2` 形式的 Cookie 串。
    pub fn from_cookie_header(raw: &str) -> Self {
        let cookies = raw
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// 生成带 Cookie 的请求头。
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self.is_empty() {
            return headers;
        }
        match HeaderValue::from_str(&self.cookie_header()) {
            Ok(v) => {
                headers.insert(COOKIE, v);
            }
            Err(e) => debug!("cookie 含非法字符，已忽略: {e}"),
        }
        headers
    }
}

/// 外部登录协作方：返回已认证的会话。
pub trait SessionProvider {
    fn login(&self) -> Result<SessionContext, AcquireError>;
}

/// 使用用户提供的 Cookie 串作为会话。
pub struct CookieSessionProvider {
    source_tag: &'static str,
    raw: Option<String>,
}

impl CookieSessionProvider {
    pub fn new(source_tag: &'static str, raw: Option<String>) -> Self {
        Self { source_tag, raw }
    }
}

impl SessionProvider for CookieSessionProvider {
    fn login(&self) -> Result<SessionContext, AcquireError> {
        let session = self
            .raw
            .as_deref()
            .map(SessionContext::from_cookie_header)
            .unwrap_or_default();
        if session.is_empty() {
            return Err(AcquireError::SessionRequired(self.source_tag.to_string()));
        }
        Ok(session)
    }
}
