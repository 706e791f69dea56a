//! Response blocking by MIME type or file extension.

use std::sync::RwLock;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};

use crate::body::ProxyBody;
use crate::pipeline::{RequestCtx, Responder, Toggle};

/// Canned block list for web fonts.
pub const TYPE_FILTER_FONTS: &[&str] = &[
    "application/x-font-ttf",
    "application/x-font-truetype",
    "application/x-font-opentype",
    "application/font-woff",
    "application/font-woff2",
    "application/vnd.ms-fontobject",
    "application/font-sfnt",
    "font/woff2",
    "font/opentype",
    // Extensions:
    "fon",
    "woff",
    "woff2",
    "otf",
    "ttf",
    "eot",
];

/// Blocks responses whose `Content-Type` or URL extension matches the
/// configured list. A block entry with a `/` is a MIME-type prefix; one
/// without is a file extension (matched case-insensitively, requiring a
/// literal `.` before it).
#[derive(Default)]
pub struct TypeFilterResponder {
    pub toggle: Toggle,
    blocklist: RwLock<Vec<String>>,
}

impl TypeFilterResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block<I, S>(&self, blocks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = self.blocklist.write().expect("blocklist lock poisoned");
        list.extend(blocks.into_iter().map(Into::into));
    }
}

#[async_trait]
impl Responder for TypeFilterResponder {
    async fn response(&self, ctx: &RequestCtx, resp: Response<ProxyBody>) -> Response<ProxyBody> {
        if !self.toggle.enabled() {
            return resp;
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let blocked = {
            let list = self.blocklist.read().expect("blocklist lock poisoned");
            in_type_filter(&content_type, ctx.uri.path(), &list)
        };
        if !blocked {
            return resp;
        }
        let (mut parts, mut body) = resp.into_parts();
        if let ProxyBody::Buffer(m) = &mut body {
            m.close();
        }
        parts.headers.clear();
        parts.status = StatusCode::from_u16(521).expect("521 is a valid status");
        Response::from_parts(parts, ProxyBody::empty())
    }
}

/// `path` is the URL path, such as `/foo.x`.
pub fn in_type_filter(content_type: &str, path: &str, filterlist: &[String]) -> bool {
    for x in filterlist {
        if x.contains('/') {
            // MIME type: exact, or continued by ';' or '+'.
            if x == content_type {
                return true;
            }
            if content_type.len() > x.len() && content_type.starts_with(x.as_str()) {
                let next = content_type.as_bytes()[x.len()];
                if next == b';' || next == b'+' {
                    return true;
                }
            }
        } else {
            // Extension, with a literal '.' separator before it.
            if path.len() > x.len() {
                let tail = &path[path.len() - x.len()..];
                if path.as_bytes()[path.len() - x.len() - 1] == b'.' && x.eq_ignore_ascii_case(tail)
                {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_filter() {
        let filter: Vec<String> = ["a/b", "c/d", "e", "f"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (content_type, path) in [
            ("a/b", "hello.a"),
            ("c/d", "asdf"),
            ("c/d+xml", "asdf"),
            ("c/d; charset=utf-8", "asdf"),
            ("x/y", "hello.e"),
            ("x/y", "hello.E"),
        ] {
            assert!(
                in_type_filter(content_type, path, &filter),
                "expected ({content_type}, {path}) to match"
            );
        }
        for (content_type, path) in [
            ("e/f", "hello.a"),
            ("a/bb", "hello.a"),
            ("aa/b", "hello.a"),
            ("a/d", "asdf"),
            ("x/y", "helloe"),
            ("x/y", "e"),
        ] {
            assert!(
                !in_type_filter(content_type, path, &filter),
                "expected ({content_type}, {path}) NOT to match"
            );
        }
    }

    #[test]
    fn test_font_preset_shape() {
        assert!(TYPE_FILTER_FONTS.contains(&"font/woff2"));
        assert!(TYPE_FILTER_FONTS.contains(&"woff2"));
        let filter: Vec<String> = TYPE_FILTER_FONTS.iter().map(|s| s.to_string()).collect();
        assert!(in_type_filter("font/woff2", "/x", &filter));
        assert!(in_type_filter("x/y", "/type.TTF", &filter));
        assert!(!in_type_filter("text/html", "/page.html", &filter));
    }
}
