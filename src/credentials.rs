//! API key extraction from inbound requests.
//!
//! Accepted locations, highest precedence first: `Authorization: Bearer <key>`,
//! the `x-goog-api-key` header, the `key` query parameter.

use axum::http::HeaderMap;

pub const GOOG_API_KEY_HEADER: &str = "x-goog-api-key";
pub const KEY_QUERY_PARAM: &str = "key";

pub fn extract_api_key(headers: &HeaderMap, query: &[(String, String)]) -> Option<String> {
    bearer_token(headers)
        .or_else(|| header_value(headers, GOOG_API_KEY_HEADER))
        .or_else(|| {
            query
                .iter()
                .find(|(k, v)| k == KEY_QUERY_PARAM && !v.is_empty())
                .map(|(_, v)| v.clone())
        })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "authorization")?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_bearer_beats_goog_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        headers.insert(GOOG_API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_api_key(&headers, &query(&[("key", "from-query")])),
            Some("from-bearer".to_string())
        );
    }

    #[test]
    fn test_goog_header_beats_query() {
        let mut headers = HeaderMap::new();
        headers.insert(GOOG_API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_api_key(&headers, &query(&[("key", "from-query")])),
            Some("from-header".to_string())
        );
    }

    #[test]
    fn test_query_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, &query(&[("alt", "sse"), ("key", "from-query")])),
            Some("from-query".to_string())
        );
    }

    #[test]
    fn test_non_bearer_authorization_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(extract_api_key(&headers, &[]), None);
    }

    #[test]
    fn test_missing_everywhere() {
        assert_eq!(extract_api_key(&HeaderMap::new(), &query(&[("key", "")])), None);
    }
}
