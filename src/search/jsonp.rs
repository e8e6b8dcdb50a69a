//! JSONP response unwrapping for the SSE endpoints

use crate::error::{Error, Result};
use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static JSONP_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)jsonpCallback\d+\((.*)\)").expect("jsonp pattern should compile")
});

/// Random callback name in the form the SSE front end generates
pub fn callback_name(digits: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..digits.max(1))
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    format!("jsonpCallback{}", suffix)
}

/// Extract the JSON payload from a `jsonpCallbackNNN(...)` body
///
/// Bare JSON bodies are accepted as well, since the endpoints fall back to
/// plain JSON when the callback parameter is dropped by a proxy.
pub fn parse_jsonp(body: &str) -> Result<serde_json::Value> {
    let trimmed = body.trim();
    let payload = match JSONP_CALL.captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None if trimmed.starts_with('{') || trimmed.starts_with('[') => trimmed,
        None => {
            let preview: String = trimmed.chars().take(80).collect();
            return Err(Error::Search(format!("unexpected JSONP body: {}", preview)));
        }
    };
    Ok(serde_json::from_str(payload)?)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_callback() {
        let value = parse_jsonp("jsonpCallback123456({\"a\": 1, \"b\": \"x)y\"});").unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], "x)y");
    }

    #[test]
    fn accepts_multiline_payload() {
        let value = parse_jsonp("jsonpCallback9(\n{\"result\": []}\n)").unwrap();
        assert!(value["result"].as_array().unwrap().is_empty());
    }

    #[test]
    fn accepts_plain_json() {
        assert_eq!(parse_jsonp(" {\"ok\": true} ").unwrap()["ok"], true);
    }

    #[test]
    fn rejects_html() {
        let err = parse_jsonp("<html><body>blocked</body></html>").unwrap_err();
        assert_eq!(err.error_code(), "search_failed");
    }

    #[test]
    fn callback_name_shape() {
        let name = callback_name(6);
        assert!(name.starts_with("jsonpCallback"));
        assert_eq!(name.len(), "jsonpCallback".len() + 6);
    }
}
