//! Content digests as S3-compatible services compute them

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Lowercase hex md5 of `bytes`
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Base64 md5 of `bytes`, the `Content-MD5` header value
pub fn content_md5(bytes: &[u8]) -> String {
    STANDARD.encode(md5::compute(bytes).0)
}

/// ETag a single-part upload of `bytes` receives (quoted hex md5)
pub fn etag_for(bytes: &[u8]) -> String {
    format!("\"{}\"", md5_hex(bytes))
}

/// Whether the backend-reported `etag` matches the md5 of `bytes`.
///
/// Quotes and hex case are ignored. Multipart ETags (`<hex>-<parts>`) never match.
pub fn etag_matches(etag: &str, bytes: &[u8]) -> bool {
    etag.trim_matches('"').eq_ignore_ascii_case(&md5_hex(bytes))
}

/// Content type recorded on upload
pub fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".json") {
        "application/json"
    } else if key.ends_with(".gz") || key.ends_with(".tgz") {
        "application/gzip"
    } else if key.ends_with(".log") || key.ends_with(".txt") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(etag_for(b"{}"), "\"99914b932bd37a50b983c5e7c90ae93b\"");
    }

    #[test]
    fn test_etag_comparison() {
        let body = b"{\"jobs\":[]}";
        assert!(etag_matches(&etag_for(body), body));
        assert!(etag_matches(&md5_hex(body).to_uppercase(), body));
        assert!(!etag_matches(&etag_for(b"stale"), body));
        assert!(!etag_matches(&format!("\"{}-2\"", md5_hex(body)), body));
    }
}
