//! Diagnostic navigation behind the `navigate_page` tool.
//!
//! Fetches a page, records the request in a network log, inspects security headers,
//! and produces a bug report the model can act on.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

const MAX_LOG_ENTRIES: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static TITLE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());

/// Navigation errors.
#[derive(Debug, Error)]
pub enum NavigatorError {
    /// URL is not http(s).
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Request could not be completed.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct NetworkEntry {
    pub method: String,
    pub url: String,
    /// HTTP status, absent when the request never completed.
    pub status: Option<u16>,
    pub duration_ms: u64,
    /// Ms since epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkEntry {
    /// Whether the request failed outright or returned 4xx/5xx.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.status.is_some_and(|s| s >= 400)
    }
}

/// Security observations for the current page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct SecurityInfo {
    pub https: bool,
    /// `Content-Security-Policy` header, if sent.
    pub csp: Option<String>,
    /// Headers that leak server details.
    pub sensitive_headers: Vec<String>,
}

/// Result of a navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct PageVisit {
    pub url: String,
    pub status: u16,
    pub title: Option<String>,
    pub bytes: usize,
    pub duration_ms: u64,
}

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One reported issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

/// Diagnostic summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct BugReport {
    pub current_url: Option<String>,
    pub issues: Vec<Issue>,
    pub suggestions: Vec<String>,
}

impl std::fmt::Display for BugReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.issues.is_empty() {
            return write!(f, "No issues detected.");
        }
        writeln!(f, "Issues:")?;
        for issue in &self.issues {
            writeln!(f, "- [{:?}] {}", issue.severity, issue.message)?;
        }
        write!(f, "Suggestions:")?;
        for suggestion in &self.suggestions {
            write!(f, "\n- {suggestion}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NavigatorState {
    current_url: Option<String>,
    network: Vec<NetworkEntry>,
    security: SecurityInfo,
}

/// Page navigator with a bounded network log.
#[derive(Debug)]
pub struct Navigator {
    http: reqwest::Client,
    state: Mutex<NavigatorState>,
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new()
    }
}

impl Navigator {
    /// Create a navigator with an empty log.
    #[must_use]
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            state: Mutex::new(NavigatorState::default()),
        }
    }

    /// Load `url`, recording the request whether or not it succeeds.
    pub async fn navigate(&self, url: &str) -> Result<PageVisit, NavigatorError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NavigatorError::InvalidUrl(url.to_string()));
        }

        self.state.lock().current_url = Some(url.to_string());
        tracing::info!(url = %url, "navigating");

        let started = Instant::now();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let result = self.http.get(url).send().await;
        let elapsed = |start: Instant| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                self.record(NetworkEntry {
                    method: "GET".to_string(),
                    url: url.to_string(),
                    status: None,
                    duration_ms: elapsed(started),
                    timestamp,
                    error: Some(source.to_string()),
                });
                return Err(NavigatorError::Request {
                    url: url.to_string(),
                    source,
                });
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let security = inspect_headers(&final_url, response.headers());
        let body = response.text().await.unwrap_or_default();
        let duration_ms = elapsed(started);

        self.record(NetworkEntry {
            method: "GET".to_string(),
            url: url.to_string(),
            status: Some(status),
            duration_ms,
            timestamp,
            error: None,
        });
        {
            let mut state = self.state.lock();
            state.current_url = Some(final_url.clone());
            state.security = security;
        }

        Ok(PageVisit {
            url: final_url,
            status,
            title: extract_title(&body),
            bytes: body.len(),
            duration_ms,
        })
    }

    fn record(&self, entry: NetworkEntry) {
        let mut state = self.state.lock();
        if state.network.len() >= MAX_LOG_ENTRIES {
            state.network.remove(0);
        }
        state.network.push(entry);
    }

    /// URL of the last navigation.
    #[must_use]
    pub fn current_url(&self) -> Option<String> {
        self.state.lock().current_url.clone()
    }

    /// Every recorded request, oldest first.
    #[must_use]
    pub fn network_log(&self) -> Vec<NetworkEntry> {
        self.state.lock().network.clone()
    }

    /// Requests that failed or returned an error status.
    #[must_use]
    pub fn failed_requests(&self) -> Vec<NetworkEntry> {
        self.state
            .lock()
            .network
            .iter()
            .filter(|e| e.failed())
            .cloned()
            .collect()
    }

    /// Summarize issues seen so far.
    #[must_use]
    pub fn bug_report(&self) -> BugReport {
        let state = self.state.lock();
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();

        if state.current_url.is_some() && !state.security.https {
            issues.push(Issue {
                severity: Severity::Medium,
                message: "Insecure connection (HTTP)".to_string(),
            });
            suggestions.push("Enable HTTPS for production deployments.".to_string());
        }

        let failed = state.network.iter().filter(|e| e.failed()).count();
        if failed > 0 {
            issues.push(Issue {
                severity: Severity::High,
                message: format!("{failed} network requests failed."),
            });
            suggestions.push("Check API endpoints and CORS configuration.".to_string());
        }

        if !state.security.sensitive_headers.is_empty() {
            issues.push(Issue {
                severity: Severity::Low,
                message: format!(
                    "Response exposes server details: {}",
                    state.security.sensitive_headers.join(", ")
                ),
            });
            suggestions.push("Strip identifying headers from production responses.".to_string());
        }

        BugReport {
            current_url: state.current_url.clone(),
            issues,
            suggestions,
        }
    }

    /// Forget the current page and the network log.
    pub fn reset(&self) {
        *self.state.lock() = NavigatorState::default();
    }
}

fn inspect_headers(url: &str, headers: &reqwest::header::HeaderMap) -> SecurityInfo {
    let csp = headers
        .get("content-security-policy")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let sensitive_headers = ["server", "x-powered-by", "x-aspnet-version"]
        .into_iter()
        .filter(|h| headers.contains_key(*h))
        .map(str::to_string)
        .collect();
    SecurityInfo {
        https: url.starts_with("https://"),
        csp,
        sensitive_headers,
    }
}

fn extract_title(html: &str) -> Option<String> {
    let re = TITLE_RE.as_ref()?;
    let title = re.captures(html)?.get(1)?.as_str().trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extraction() {
        assert_eq!(
            extract_title("<html><head><TITLE> Onyx App </TITLE></head></html>"),
            Some("Onyx App".to_string())
        );
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let nav = Navigator::new();
        assert!(matches!(
            nav.navigate("file:///etc/passwd").await,
            Err(NavigatorError::InvalidUrl(_))
        ));
        assert!(nav.network_log().is_empty());
    }

    #[tokio::test]
    async fn failed_request_is_logged_and_reported() {
        let nav = Navigator::new();
        // Port 9 (discard) is closed on test machines
        let result = nav.navigate("http://127.0.0.1:9/").await;
        assert!(result.is_err());

        let log = nav.network_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].failed());

        let report = nav.bug_report();
        assert_eq!(report.issues.len(), 2);
        assert!(report.to_string().contains("network requests failed"));
    }

    #[test]
    fn empty_report() {
        let nav = Navigator::new();
        let report = nav.bug_report();
        assert!(report.issues.is_empty());
        assert_eq!(report.to_string(), "No issues detected.");
    }

    #[test]
    fn header_inspection() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("server", "nginx".parse().unwrap());
        headers.insert("content-security-policy", "default-src 'self'".parse().unwrap());
        let info = inspect_headers("https://example.com", &headers);
        assert!(info.https);
        assert_eq!(info.csp.as_deref(), Some("default-src 'self'"));
        assert_eq!(info.sensitive_headers, vec!["server"]);
    }
}
