use axum::http::{header, HeaderMap, HeaderValue};

use crate::config::SessionConfig;

/// Attributes of the session cookie.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub secure: bool,
    pub max_age_secs: i64,
}

impl SessionCookie {
    pub fn from_config(cfg: &SessionConfig) -> Self {
        Self {
            name: cfg.cookie_name.clone(),
            secure: cfg.cookie_secure,
            max_age_secs: cfg.ttl_minutes * 60,
        }
    }

    pub fn build(&self, value: &str) -> String {
        let mut cookie = format!(
            "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
            self.name, value, self.max_age_secs
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Instructs the client to drop the cookie.
    pub fn build_removal(&self) -> String {
        let mut cookie = format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", self.name);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn header(&self, value: &str) -> HeaderValue {
        HeaderValue::from_str(&self.build(value)).unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    pub fn removal_header(&self) -> HeaderValue {
        HeaderValue::from_str(&self.build_removal())
            .unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    pub fn extract(&self, headers: &HeaderMap) -> Option<String> {
        extract_cookie(headers, &self.name)
    }
}

/// Looks through every `Cookie` header for `name`.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
}
