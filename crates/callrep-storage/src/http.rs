use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Why a report page request did not produce a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFailure {
    /// Overloaded or briefly unreachable portal; worth asking again.
    Transient,
    /// Credentials were refused. Retrying only risks locking the account.
    Unauthorized,
    Rejected,
}

pub fn classify_page_status(status: StatusCode) -> PageFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PageFailure::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => PageFailure::Transient,
        s if s.is_server_error() => PageFailure::Transient,
        _ => PageFailure::Rejected,
    }
}

fn transport_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Seconds form of `Retry-After`; the portal never sends HTTP dates.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Attempts per report page and the pause between them. The pause grows by `pause`
/// with every failure unless the portal names its own wait, and never exceeds `max_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRetry {
    pub attempts: u32,
    pub pause: Duration,
    pub max_wait: Duration,
}

impl Default for PageRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl PageRetry {
    /// Wait before the next attempt after `failures` failed ones, or `None` once
    /// every attempt is spent.
    pub fn wait_after(&self, failures: u32, requested: Option<Duration>) -> Option<Duration> {
        if failures >= self.attempts.max(1) {
            return None;
        }
        let wait = requested.unwrap_or_else(|| self.pause.saturating_mul(failures));
        Some(wait.min(self.max_wait))
    }
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: PageRetry,
    pub basic_auth: Option<BasicAuth>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: PageRetry::default(),
            basic_auth: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: String,
    /// Attempts it took, counting the successful one.
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("report portal refused the credentials ({status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("report page {url} answered {status} after {attempts} attempt(s)")]
    Status { status: u16, url: String, attempts: u32 },
    #[error("report page request failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Fetches report pages one at a time, retrying transient portal failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: PageRetry,
    basic_auth: Option<BasicAuth>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building report page client")?,
            retry: config.retry,
            basic_auth: config.basic_auth,
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedPage, FetchError> {
        let span = info_span!("report_page", run_id, url);
        self.fetch_with_retry(url, query).instrument(span).await
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedPage, FetchError> {
        let mut failures = 0u32;
        loop {
            let mut request = self.client.get(url).query(query);
            if let Some(auth) = &self.basic_auth {
                request = request.basic_auth(&auth.username, auth.password.as_ref());
            }

            let (requested_wait, error) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    let body = match resp.text().await {
                        Ok(body) => body,
                        Err(source) => {
                            return Err(FetchError::Transport {
                                attempts: failures + 1,
                                source,
                            })
                        }
                    };
                    debug!(bytes = body.len(), attempts = failures + 1, "fetched report page");
                    return Ok(FetchedPage {
                        final_url,
                        body,
                        attempts: failures + 1,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match classify_page_status(status) {
                        PageFailure::Unauthorized => {
                            return Err(FetchError::Unauthorized {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        PageFailure::Rejected => {
                            return Err(FetchError::Status {
                                status: status.as_u16(),
                                url: final_url,
                                attempts: failures + 1,
                            })
                        }
                        PageFailure::Transient => (
                            retry_after(resp.headers()),
                            FetchError::Status {
                                status: status.as_u16(),
                                url: final_url,
                                attempts: failures + 1,
                            },
                        ),
                    }
                }
                Err(source) if transport_is_transient(&source) => (
                    None,
                    FetchError::Transport {
                        attempts: failures + 1,
                        source,
                    },
                ),
                Err(source) => {
                    return Err(FetchError::Transport {
                        attempts: failures + 1,
                        source,
                    })
                }
            };

            failures += 1;
            let Some(wait) = self.retry.wait_after(failures, requested_wait) else {
                return Err(error);
            };
            warn!(attempt = failures, wait_ms = wait.as_millis() as u64, error = %error, "retrying report page");
            tokio::time::sleep(wait).await;
        }
    }
}
