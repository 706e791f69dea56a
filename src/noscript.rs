//! JavaScript removal.
//!
//! HTML responses are re-emitted without `<script>` subtrees, event-handler
//! attributes, or `javascript:` URLs; `<noscript>` content is unwrapped
//! into a marker `<div>`. Standalone JavaScript responses are blanked out
//! entirely.

use std::io::{self, Write};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response, StatusCode};
use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::body::{Mutable, ProxyBody};
use crate::headers::{mime_type, simple_mime};
use crate::html::{Lexer, Token};
use crate::pipeline::{RequestCtx, Responder, Toggle};

lazy_static! {
    static ref SCRIPT_TAG: Regex = Regex::new(r"(?si)^\s*<script$").unwrap();
    static ref SCRIPT_END_TAG: Regex = Regex::new(r"(?si)^\s*</\s*script\s*>").unwrap();
    static ref NOSCRIPT_TAG: Regex = Regex::new(r"(?si)^\s*<noscript$").unwrap();
    static ref NOSCRIPT_END_TAG: Regex = Regex::new(r"(?si)^\s*</\s*noscript\s*>").unwrap();
    static ref EVENT_ATTR: Regex = Regex::new(r"(?si)^\s*on\w").unwrap();
    static ref HREF_JS_ATTR: Regex = Regex::new(r"(?si)^\s*href\s*=.*javascript:").unwrap();
    static ref SRC_JS_ATTR: Regex = Regex::new(r"(?si)^\s*src\s*=.*javascript:").unwrap();
}

/// JavaScript MIME types (simple form, `+` suffix stripped) that are
/// blanked out instead of rewritten.
fn is_javascript_mime(simple: &str) -> bool {
    matches!(
        simple,
        "application/javascript"
            | "application/x-javascript"
            | "text/javascript"
            | "application/ecmascript"
            | "text/ecmascript"
    )
}

#[derive(Default)]
pub struct NoscriptResponder {
    pub toggle: Toggle,
}

impl NoscriptResponder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Responder for NoscriptResponder {
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
        let mime = mime_type(&content_type);
        if mime == "text/html" {
            let (parts, body) = resp.into_parts();
            let input = body.into_buffer(ctx.deadline).await;
            let mut outbuf = Mutable::new();
            // Writes into a Mutable cannot fail.
            let _ = noscript_stream(input.bytes(), &mut outbuf);
            return Response::from_parts(parts, ProxyBody::from(outbuf));
        }
        if is_javascript_mime(simple_mime(mime)) {
            let (mut parts, _body) = resp.into_parts();
            parts.status = StatusCode::from_u16(521).expect("521 is a valid status");
            parts
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            return Response::from_parts(parts, ProxyBody::from(Mutable::from("// noscript\n")));
        }
        resp
    }
}

/// Stream `input` to `w` with scripts removed. The first write error stops
/// further output; the tokenizer still drains its input.
pub fn noscript_stream(input: &[u8], w: &mut dyn Write) -> io::Result<()> {
    let mut in_script = false;
    let mut start_tag_is_script = false;
    let mut final_err: Option<io::Error> = None;

    fn emit(w: &mut dyn Write, err: &mut Option<io::Error>, in_script: bool, data: &[u8]) {
        if !in_script && err.is_none() {
            if let Err(e) = w.write_all(data) {
                *err = Some(e);
            }
        }
    }

    for tok in Lexer::new(input) {
        match tok {
            Token::StartTag(data) => {
                if !in_script && SCRIPT_TAG.is_match(data) {
                    in_script = true;
                    start_tag_is_script = true;
                } else if NOSCRIPT_TAG.is_match(data) {
                    emit(w, &mut final_err, in_script, b"<div data-from-noscript=true");
                } else {
                    start_tag_is_script = false;
                    emit(w, &mut final_err, in_script, data);
                }
            }
            Token::StartTagClose(data) => {
                start_tag_is_script = false;
                emit(w, &mut final_err, in_script, data);
            }
            Token::StartTagVoid(data) => {
                if start_tag_is_script {
                    in_script = false;
                    start_tag_is_script = false;
                } else {
                    emit(w, &mut final_err, in_script, data);
                }
            }
            Token::EndTag(data) => {
                if SCRIPT_END_TAG.is_match(data) {
                    in_script = false;
                    start_tag_is_script = false;
                } else if NOSCRIPT_END_TAG.is_match(data) {
                    emit(w, &mut final_err, in_script, b"</div>");
                } else {
                    emit(w, &mut final_err, in_script, data);
                }
            }
            Token::Attribute(data) => {
                if EVENT_ATTR.is_match(data) {
                    // Drop event handlers.
                } else if HREF_JS_ATTR.is_match(data) {
                    emit(w, &mut final_err, in_script, b" href=#noscript");
                } else if SRC_JS_ATTR.is_match(data) {
                    emit(w, &mut final_err, in_script, b" src=#noscript");
                } else {
                    emit(w, &mut final_err, in_script, data);
                }
            }
            Token::Literal(data) => {
                emit(w, &mut final_err, in_script, data);
            }
        }
    }
    match final_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(input: &str) -> String {
        let mut out = Vec::new();
        noscript_stream(input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_noscript_stream() {
        let cases: &[(&str, &str)] = &[
            (" foo  bar ", " foo  bar "),
            (" <b > bold </b > ", " <b > bold </b > "),
            (
                " <button onclick='stuff()'>foo</button> ",
                " <button>foo</button> ",
            ),
            (" <script/> foo ", "  foo "),
            (" <script>x</script> foo ", "  foo "),
            (" <script> <script/> x() </script> foo ", "  foo "),
            (
                " <script> a() <script> b() </script> x() </script> foo ",
                "  x()  foo ",
            ),
            (
                " foo <noscript>x</noscript> bar ",
                " foo <div data-from-noscript=true>x</div> bar ",
            ),
            (r#"<a href="/asdf">foo</a>"#, r#"<a href="/asdf">foo</a>"#),
            (r#"<a href="javascript:x()">foo</a>"#, "<a href=#noscript>foo</a>"),
        ];
        for (input, expect) in cases {
            assert_eq!(&rewrite(input), expect, "input: `{input}`");
        }
    }

    #[test]
    fn test_noscript_stream_src_and_case() {
        assert_eq!(
            rewrite(r#"<img src="JavaScript:bad()">"#),
            "<img src=#noscript>"
        );
        assert_eq!(rewrite("<p ONCLICK=x>hi</p>"), "<p>hi</p>");
        assert_eq!(rewrite("<P>HI</P>"), "<P>HI</P>");
    }

    #[test]
    fn test_script_attributes_dropped_with_tag() {
        assert_eq!(rewrite(r#"<script src="/app.js"></script>after"#), "after");
    }

    #[test]
    fn test_is_javascript_mime() {
        assert!(is_javascript_mime("application/javascript"));
        assert!(is_javascript_mime("text/ecmascript"));
        assert!(!is_javascript_mime("text/html"));
        assert!(!is_javascript_mime("application/json"));
    }
}
