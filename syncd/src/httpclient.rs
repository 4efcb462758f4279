use reqwest::{Method, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Wraps `reqwest` with bounded exponential backoff and `Retry-After` honoring.
/// Retryable statuses are returned (not raised) once retries are exhausted;
/// retryable transport errors are re-raised once retries are exhausted.
#[derive(Clone)]
pub struct RetryingHttpClient {
    inner: reqwest::Client,
    config: RetryConfig,
}

impl RetryingHttpClient {
    pub fn new(inner: reqwest::Client) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(inner: reqwest::Client, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        build: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<Response, HttpError> {
        let mut attempt = 0u32;
        loop {
            let req = build(self.inner.request(method.clone(), url));
            match req.send().await {
                Ok(resp) => {
                    if is_retryable_status(resp.status()) && attempt < self.config.max_retries {
                        let delay = delay_for(&resp, attempt, &self.config);
                        attempt += 1;
                        warn!(url, status = %resp.status(), attempt, "retrying request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if is_retryable_transport_error(&err) && attempt < self.config.max_retries {
                        let delay = std::cmp::min(
                            self.config.base_delay * 2u32.pow(attempt),
                            self.config.max_delay,
                        );
                        attempt += 1;
                        warn!(url, error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn delay_for(resp: &Response, attempt: u32, config: &RetryConfig) -> Duration {
    if let Some(retry_after) = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return std::cmp::min(Duration::from_secs(retry_after), config.max_delay);
    }
    std::cmp::min(config.base_delay * 2u32.pow(attempt), config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec_set() {
        for code in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn backoff_doubles_and_clamps_to_max_delay() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        let delay = |attempt: u32| std::cmp::min(config.base_delay * 2u32.pow(attempt), config.max_delay);
        assert_eq!(delay(0), Duration::from_secs(1));
        assert_eq!(delay(1), Duration::from_secs(2));
        assert_eq!(delay(2), Duration::from_secs(4));
        assert_eq!(delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_a_503_then_succeeds() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        });

        let client = RetryingHttpClient::with_config(
            reqwest::Client::new(),
            RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        );
        let resp = client
            .request(Method::GET, &server.url("/flaky"), |b| b)
            .await
            .expect("request should eventually return the 503");

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        first.assert_hits(2);
    }

    #[tokio::test]
    async fn honors_retry_after_header() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/throttled");
            then.status(429).header("Retry-After", "0");
        });

        let client = RetryingHttpClient::with_config(
            reqwest::Client::new(),
            RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(60),
            },
        );
        let resp = client
            .request(Method::GET, &server.url("/throttled"), |b| b)
            .await
            .expect("request should return the 429 after honoring Retry-After: 0");

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        mock.assert_hits(2);
    }
}
