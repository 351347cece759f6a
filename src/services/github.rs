// src/services/github.rs

//! GitHub code search client.
//!
//! [`SearchApi`] is the seam between the harvest and the network: the worker
//! only ever sees parsed [`SearchPage`]s and classified [`SearchError`]s.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{ACCEPT, HeaderMap, LINK, RETRY_AFTER};
use serde::Deserialize;
use url::Url;

use crate::error::{AppError, Result, SearchError};
use crate::models::{CodeMatch, GithubConfig, RateLimitHeaders, SearchPage, SearchQuery};
use crate::throttle::Credential;

/// The API never returns results past this many hits.
pub const MAX_SEARCH_RESULTS: u64 = 1000;

const TEXT_MATCH_MEDIA_TYPE: &str = "application/vnd.github.text-match+json";

/// Paginated code search boundary.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Fetch one page of code search results.
    async fn search_code(
        &self,
        credential: &Credential,
        query: &SearchQuery,
    ) -> std::result::Result<SearchPage, SearchError>;

    /// Current search budget for a credential.
    async fn rate_limit(
        &self,
        credential: &Credential,
    ) -> std::result::Result<RateLimitHeaders, SearchError>;
}

/// REST implementation of [`SearchApi`].
#[derive(Clone)]
pub struct GithubSearchClient {
    client: reqwest::Client,
    api_url: Url,
    per_page: u32,
}

impl GithubSearchClient {
    /// Create a configured asynchronous client.
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let mut base = config.api_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_url = Url::parse(&base)
            .map_err(|e| AppError::config(format!("invalid github.api_url '{base}': {e}")))?;

        Ok(Self {
            client,
            api_url,
            per_page: config.effective_per_page(),
        })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, SearchError> {
        self.api_url.join(path).map_err(|e| SearchError::Permanent {
            status: 0,
            message: format!("invalid endpoint {path}: {e}"),
        })
    }
}

#[async_trait]
impl SearchApi for GithubSearchClient {
    async fn search_code(
        &self,
        credential: &Credential,
        query: &SearchQuery,
    ) -> std::result::Result<SearchPage, SearchError> {
        let url = self.endpoint("search/code")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(credential.token())
            .header(ACCEPT, TEXT_MATCH_MEDIA_TYPE)
            .query(&[
                ("q", query.to_query_string()),
                ("page", query.page_cursor.to_string()),
                ("per_page", self.per_page.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SearchError::from_transport(&e))?;

        let status = response.status().as_u16();
        let rate = parse_rate_headers(response.headers(), Utc::now());
        let next_link = parse_next_page(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| SearchError::from_transport(&e))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &rate, &body));
        }

        let parsed: CodeSearchResponse = serde_json::from_str(&body)
            .map_err(|e| SearchError::Transient(format!("undecodable search response: {e}")))?;

        let has_next = match next_link {
            Some(next) => next.is_some(),
            None => {
                let seen = u64::from(query.page_cursor) * u64::from(self.per_page);
                seen < parsed.total_count.min(MAX_SEARCH_RESULTS)
            }
        };

        Ok(SearchPage {
            total_count: parsed.total_count,
            incomplete_results: parsed.incomplete_results,
            items: parsed.items.into_iter().map(CodeMatch::from).collect(),
            has_next,
            rate,
        })
    }

    async fn rate_limit(
        &self,
        credential: &Credential,
    ) -> std::result::Result<RateLimitHeaders, SearchError> {
        let url = self.endpoint("rate_limit")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(credential.token())
            .send()
            .await
            .map_err(|e| SearchError::from_transport(&e))?;

        let status = response.status().as_u16();
        let headers = parse_rate_headers(response.headers(), Utc::now());
        let body = response
            .text()
            .await
            .map_err(|e| SearchError::from_transport(&e))?;
        if !(200..300).contains(&status) {
            return Err(classify_status(status, &headers, &body));
        }

        let parsed: RateLimitResponse = serde_json::from_str(&body)
            .map_err(|e| SearchError::Transient(format!("undecodable rate limit response: {e}")))?;
        let resource = parsed
            .resources
            .code_search
            .or(parsed.resources.search)
            .ok_or_else(|| SearchError::Transient("rate limit response has no search resource".into()))?;

        Ok(RateLimitHeaders {
            limit: Some(resource.limit),
            remaining: Some(resource.remaining),
            reset_at: Utc.timestamp_opt(resource.reset, 0).single(),
            retry_after: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CodeSearchResponse {
    total_count: u64,
    #[serde(default)]
    incomplete_results: bool,
    #[serde(default)]
    items: Vec<CodeSearchItem>,
}

#[derive(Debug, Deserialize)]
struct CodeSearchItem {
    path: String,
    repository: RepositoryRef,
    #[serde(default)]
    text_matches: Vec<TextMatch>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct TextMatch {
    #[serde(default)]
    fragment: String,
}

impl From<CodeSearchItem> for CodeMatch {
    fn from(item: CodeSearchItem) -> Self {
        CodeMatch {
            repository: item.repository.full_name,
            path: item.path,
            fragments: item.text_matches.into_iter().map(|m| m.fragment).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    #[serde(default)]
    search: Option<RateLimitResource>,
    #[serde(default)]
    code_search: Option<RateLimitResource>,
}

#[derive(Debug, Deserialize)]
struct RateLimitResource {
    limit: u32,
    remaining: u32,
    reset: i64,
}

/// Read `x-ratelimit-*` and `retry-after` headers.
pub fn parse_rate_headers(headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitHeaders {
    let number = |name: &str| -> Option<i64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now));

    RateLimitHeaders {
        limit: number("x-ratelimit-limit").and_then(|v| u32::try_from(v).ok()),
        remaining: number("x-ratelimit-remaining").and_then(|v| u32::try_from(v).ok()),
        reset_at: number("x-ratelimit-reset").and_then(|v| Utc.timestamp_opt(v, 0).single()),
        retry_after,
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Page number of the `rel="next"` link.
///
/// `None` when the response has no `Link` header at all, `Some(None)` when
/// it has one without a next relation.
pub fn parse_next_page(headers: &HeaderMap) -> Option<Option<u32>> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let next = link.split(',').find_map(|part| {
        let mut sections = part.split(';');
        let target = sections.next()?.trim().trim_start_matches('<').trim_end_matches('>');
        let is_next = sections.any(|s| {
            let s = s.trim();
            s == "rel=\"next\"" || s == "rel=next"
        });
        if !is_next {
            return None;
        }
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse::<u32>().ok())
    });
    Some(next)
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: u16, rate: &RateLimitHeaders, body: &str) -> SearchError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    let lowered = message.to_lowercase();

    let limited_by_body = lowered.contains("rate limit") || lowered.contains("abuse");
    let limited_by_headers = rate.remaining == Some(0) || rate.retry_after.is_some();

    match status {
        429 => SearchError::RateLimited {
            reset_at: rate.reset_at,
            retry_after: rate.retry_after,
        },
        403 if limited_by_body || limited_by_headers => SearchError::RateLimited {
            reset_at: rate.reset_at,
            retry_after: rate.retry_after,
        },
        408 | 500..=599 => SearchError::Transient(format!("{status}: {message}")),
        _ => SearchError::Permanent { status, message },
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_rate_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("30"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1760000000"));

        let rate = parse_rate_headers(&headers, Utc::now());
        assert_eq!(rate.limit, Some(30));
        assert_eq!(rate.remaining, Some(12));
        assert_eq!(rate.reset_at.unwrap().timestamp(), 1_760_000_000);
        assert_eq!(rate.retry_after, None);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("60"));
        let rate = parse_rate_headers(&headers, Utc::now());
        assert_eq!(rate.retry_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_next_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.github.com/search/code?q=numpy&page=3>; rel=\"next\", \
                 <https://api.github.com/search/code?q=numpy&page=10>; rel=\"last\"",
            ),
        );
        assert_eq!(parse_next_page(&headers), Some(Some(3)));

        let mut last_page = HeaderMap::new();
        last_page.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.github.com/search/code?q=numpy&page=1>; rel=\"first\"",
            ),
        );
        assert_eq!(parse_next_page(&last_page), Some(None));
        assert_eq!(parse_next_page(&HeaderMap::new()), None);
    }

    #[test]
    fn test_classify_rate_limit() {
        let rate = RateLimitHeaders {
            remaining: Some(0),
            ..RateLimitHeaders::default()
        };
        let err = classify_status(403, &rate, r#"{"message":"API rate limit exceeded"}"#);
        assert!(matches!(err, SearchError::RateLimited { .. }));

        let abuse = classify_status(
            403,
            &RateLimitHeaders::default(),
            r#"{"message":"You have triggered an abuse detection mechanism."}"#,
        );
        assert!(matches!(abuse, SearchError::RateLimited { .. }));
    }

    #[test]
    fn test_classify_bare_429_is_rate_limit() {
        let err = classify_status(429, &RateLimitHeaders::default(), "Too Many Requests");
        assert_eq!(
            err,
            SearchError::RateLimited {
                reset_at: None,
                retry_after: None
            }
        );
    }

    #[test]
    fn test_classify_request_timeout_is_transient() {
        let err = classify_status(408, &RateLimitHeaders::default(), "Request Timeout");
        assert_eq!(err, SearchError::Transient("408: Request Timeout".into()));
    }

    #[test]
    fn test_classify_permanent_and_transient() {
        let err = classify_status(
            422,
            &RateLimitHeaders::default(),
            r#"{"message":"Validation Failed"}"#,
        );
        assert_eq!(
            err,
            SearchError::Permanent {
                status: 422,
                message: "Validation Failed".into()
            }
        );

        let forbidden = classify_status(403, &RateLimitHeaders::default(), "Forbidden");
        assert!(!forbidden.is_retryable());

        assert!(matches!(
            classify_status(502, &RateLimitHeaders::default(), "Bad Gateway"),
            SearchError::Transient(_)
        ));
    }

    #[test]
    fn test_code_search_response_decoding() {
        let body = r#"{
            "total_count": 2,
            "incomplete_results": false,
            "items": [
                {
                    "name": "app.py",
                    "path": "src/app.py",
                    "repository": { "full_name": "octo/app" },
                    "text_matches": [ { "fragment": "import numpy as np" } ]
                }
            ]
        }"#;
        let parsed: CodeSearchResponse = serde_json::from_str(body).unwrap();
        let item = CodeMatch::from(parsed.items.into_iter().next().unwrap());
        assert_eq!(item.repository, "octo/app");
        assert_eq!(item.fragments, ["import numpy as np"]);
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let config = GithubConfig {
            api_url: "not a url".into(),
            ..GithubConfig::default()
        };
        assert!(GithubSearchClient::new(&config).is_err());
    }
}
