//! Deadline-bounded conditional feed fetching.
//!
//! One fetch is a conditional GET (ETag / Last-Modified validators)
//! with manual redirect following, parsed into [`RawEntry`] values by
//! `feed-rs`. The whole network phase runs under
//! `tokio::time::timeout`, so a hung server costs at most the
//! configured deadline and the cancelled future is dropped with it;
//! nothing keeps running in the background after the deadline.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Redirect hop limit for one fetch.
const MAX_REDIRECTS: usize = 5;

const USER_AGENT: &str = concat!("feedmail/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching or parsing one feed. All of
/// them are per-feed and non-fatal to the run as a whole.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response outside the acceptable status set
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Fetch exceeded the per-feed deadline
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// Redirect chain too long or missing a usable Location header
    #[error("bad redirect: {0}")]
    Redirect(String),
    /// Payload could not be parsed as RSS or Atom
    #[error("parse error: {0}")]
    Parse(String),
    /// Invalid proxy or feed URL
    #[error("invalid URL: {0}")]
    Url(String),
}

/// One parsed entry, reduced to the fields the engine cares about.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    /// Native entry id, if the feed carries one.
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    /// Best available body: full content if present, else the summary.
    pub body: Option<String>,
    /// Author email address, if the feed carries one.
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Result of one fetch: response metadata plus the parsed entries in
/// feed order (typically newest first).
#[derive(Debug)]
pub struct FetchedFeed {
    pub status: u16,
    /// Final URL of a 301/308 chain, if the feed moved permanently.
    pub permanent_redirect: Option<String>,
    /// Validators for the next conditional fetch.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub entries: Vec<RawEntry>,
}

impl FetchedFeed {
    pub fn not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// Build the HTTP client used for feed fetches.
///
/// Redirects are disabled on the client because [`fetch_feed`] follows
/// them by hand: a 301 must be distinguishable from a 302 so the caller
/// can rewrite its configured URL only for permanent moves.
pub fn build_client(proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(FetchError::Network)?);
    }
    builder.build().map_err(FetchError::Network)
}

/// Fetch and parse one feed with a hard wall-clock deadline.
///
/// `etag` and `modified` are the validators remembered from the last
/// successful fetch; a 304 comes back as a [`FetchedFeed`] with no
/// entries rather than an error.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
    modified: Option<&str>,
    timeout: Duration,
) -> Result<FetchedFeed, FetchError> {
    tracing::debug!(url = %url, "fetching feed");
    tokio::time::timeout(timeout, fetch_once(client, url, etag, modified))
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    etag: Option<&str>,
    modified: Option<&str>,
) -> Result<FetchedFeed, FetchError> {
    let mut current = url.to_string();
    let mut permanent_redirect: Option<String> = None;

    for _hop in 0..=MAX_REDIRECTS {
        let mut request = client.get(&current);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(modified) = modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, modified);
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::Redirect("missing Location header".into()))?;
            // Location may be relative; resolve it against the current URL.
            let base = url::Url::parse(&current).map_err(|e| FetchError::Url(e.to_string()))?;
            let next = base
                .join(location)
                .map_err(|e| FetchError::Redirect(e.to_string()))?
                .to_string();
            if matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
            ) {
                tracing::info!(from = %current, to = %next, "feed moved permanently");
                permanent_redirect = Some(next.clone());
            }
            current = next;
            continue;
        }

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchedFeed {
                status: status.as_u16(),
                permanent_redirect,
                etag: None,
                last_modified: None,
                entries: Vec::new(),
            });
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let response_etag = header_string(&response, reqwest::header::ETAG);
        let response_modified = header_string(&response, reqwest::header::LAST_MODIFIED);
        let bytes = response.bytes().await?;
        let entries = parse_entries(&bytes)?;
        return Ok(FetchedFeed {
            status: status.as_u16(),
            permanent_redirect,
            etag: response_etag,
            last_modified: response_modified,
            entries,
        });
    }

    Err(FetchError::Redirect(format!(
        "more than {MAX_REDIRECTS} redirects"
    )))
}

fn header_string(
    response: &reqwest::Response,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_entries(bytes: &[u8]) -> Result<Vec<RawEntry>, FetchError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let id = Some(entry.id.trim().to_string()).filter(|s| !s.is_empty());
            let link = entry.links.first().map(|l| l.href.clone());
            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));
            let author = entry
                .authors
                .iter()
                .find_map(|a| a.email.clone());
            RawEntry {
                id,
                title: entry.title.map(|t| t.content),
                link,
                body,
                author,
                published: entry.published.or(entry.updated),
            }
        })
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, headers, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
    <item><guid>e1</guid><title>First</title><link>https://example.com/1</link>
      <description>body one</description></item>
    <item><guid>e2</guid><title>Second</title></item>
</channel></rss>"#;

    fn deadline() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_fetch_parses_entries_and_captures_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
            )
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let fetched = fetch_feed(
            &client,
            &format!("{}/feed", server.uri()),
            None,
            None,
            deadline(),
        )
        .await
        .unwrap();

        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.entries.len(), 2);
        assert_eq!(fetched.entries[0].id.as_deref(), Some("e1"));
        assert_eq!(fetched.entries[0].body.as_deref(), Some("body one"));
        assert_eq!(fetched.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            fetched.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
        assert!(fetched.permanent_redirect.is_none());
    }

    #[tokio::test]
    async fn test_conditional_fetch_sends_validators_and_accepts_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            // wiremock splits header values on commas, so a date header
            // must be matched as the comma-separated pieces.
            .and(headers(
                "If-Modified-Since",
                vec!["Mon", "01 Jan 2024 00:00:00 GMT"],
            ))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let fetched = fetch_feed(
            &client,
            &format!("{}/feed", server.uri()),
            Some("\"v1\""),
            Some("Mon, 01 Jan 2024 00:00:00 GMT"),
            deadline(),
        )
        .await
        .unwrap();

        assert!(fetched.not_modified());
        assert!(fetched.entries.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_redirect_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let fetched = fetch_feed(
            &client,
            &format!("{}/old", server.uri()),
            None,
            None,
            deadline(),
        )
        .await
        .unwrap();

        assert_eq!(
            fetched.permanent_redirect.as_deref(),
            Some(format!("{}/new", server.uri()).as_str())
        );
        assert_eq!(fetched.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_temporary_redirect_is_followed_silently() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let fetched = fetch_feed(
            &client,
            &format!("{}/old", server.uri()),
            None,
            None,
            deadline(),
        )
        .await
        .unwrap();

        assert!(fetched.permanent_redirect.is_none());
        assert_eq!(fetched.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let err = fetch_feed(
            &client,
            &format!("{}/feed", server.uri()),
            None,
            None,
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not a feed"))
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let err = fetch_feed(
            &client,
            &format!("{}/feed", server.uri()),
            None,
            None,
            deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[tokio::test]
    async fn test_slow_server_hits_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = build_client(None).unwrap();
        let err = fetch_feed(
            &client,
            &format!("{}/feed", server.uri()),
            None,
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }
}
