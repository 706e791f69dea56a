//! Header value helpers shared by the responders.
//!
//! HTTP list-valued headers (`Accept`, `Accept-Encoding`) are matched with
//! an exact-token scan rather than a full parser: a token matches when it
//! is bounded by start/end/comma/semicolon, with a single space tolerated
//! after a comma.

use http::header::{GetAll, HeaderValue};

/// Returns true if `value` occurs as a complete element of the
/// comma-separated header value `x`.
pub fn has_header_value_part(x: &str, value: &str) -> bool {
    let bytes = x.as_bytes();
    let mut start = 0;
    while let Some(off) = x[start..].find(value) {
        let pos = start + off;
        let boundary_before = pos == 0
            || bytes[pos - 1] == b','
            || (pos >= 2 && bytes[pos - 1] == b' ' && bytes[pos - 2] == b',');
        if boundary_before {
            let end = pos + value.len();
            if end == bytes.len() || bytes[end] == b',' || bytes[end] == b';' {
                return true;
            }
        }
        start += off + 1;
    }
    false
}

/// Like [`has_header_value_part`], across every value of a repeated header.
pub fn has_any_header_value_part(values: GetAll<'_, HeaderValue>, value: &str) -> bool {
    values
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| has_header_value_part(v, value))
}

/// Case-insensitive membership test.
pub fn has_any_fold(all: &[String], s: &str) -> bool {
    all.iter().any(|x| x.eq_ignore_ascii_case(s))
}

/// The MIME type of a `Content-Type` value, with any `;`-delimited
/// parameters stripped.
pub fn mime_type(content_type: &str) -> &str {
    match content_type.find(';') {
        Some(i) => &content_type[..i],
        None => content_type,
    }
}

/// The MIME type with any structured-syntax suffix stripped at `+`
/// (`application/ld+json` -> `application/ld`).
pub fn simple_mime(mime: &str) -> &str {
    match mime.find('+') {
        Some(i) => &mime[..i],
        None => mime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_header_value_part() {
        let cases: &[(&str, &str, bool)] = &[
            ("dog", "dog", true),
            ("dogg", "dog", false),
            ("dogg,dog", "dog", true),
            ("dogg,dog,dogg", "dog", true),
            ("dogg, dog", "dog", true),
            ("dogg, dog, dogg", "dog", true),
            ("cat,dog", "dog", true),
            ("cat,dogg", "dog", false),
            ("cat,dogg,dog", "dog", true),
            ("cat,dogg,dog,dogg", "dog", true),
            ("cat, dogg, dog", "dog", true),
            ("cat, dogg, dog, dogg", "dog", true),
            ("", "dog", false),
            ("do", "dog", false),
            ("do,g", "dog", false),
            (", doggo", "dog", false),
            (",doggo", "dog", false),
            (" doggo", "dog", false),
        ];
        for (header, value, expect) in cases {
            assert_eq!(
                has_header_value_part(header, value),
                *expect,
                "({header:?}, {value:?})"
            );
        }
    }

    #[test]
    fn test_has_header_value_part_semicolon_bound() {
        assert!(has_header_value_part("gzip;q=0.8", "gzip"));
        assert!(has_header_value_part("br;q=1.0, gzip", "br"));
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type("text/html; charset=utf-8"), "text/html");
        assert_eq!(mime_type("text/html"), "text/html");
        assert_eq!(simple_mime("application/ld+json"), "application/ld");
        assert_eq!(simple_mime("text/javascript"), "text/javascript");
    }

    #[test]
    fn test_has_any_fold() {
        let hosts = vec!["Foo".to_string(), "bar.example".to_string()];
        assert!(has_any_fold(&hosts, "foo"));
        assert!(has_any_fold(&hosts, "BAR.EXAMPLE"));
        assert!(!has_any_fold(&hosts, "baz"));
    }
}
