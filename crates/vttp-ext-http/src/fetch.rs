//! Retrieval of the remote resource backing a table.

use std::fmt;
use std::io::Read;
use std::time::Instant;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use tracing::{info, warn};
use vttp_error::{FetchError, Result, VttpError};
use vttp_types::cx::Cx;

use crate::config::FetchConfig;

/// Source of raw response bytes for a URL.
///
/// Implementations perform one attempt per call; retry policy, if any,
/// belongs to the caller.
pub trait ResourceFetcher: Send + Sync + fmt::Debug {
    /// Fetch the body at `url`.
    ///
    /// Transport failures surface as [`VttpError::Fetch`]; a cancelled or
    /// `cx` cancelled before or during the request surfaces as [`VttpError::Interrupted`].
    fn fetch(&self, cx: &Cx, url: &str, config: &FetchConfig) -> Result<Vec<u8>>;
}

/// [`ResourceFetcher`] over HTTP(S) with a blocking `reqwest` client.
///
/// Sends a single `GET` per fetch and follows redirects with the client's
/// default policy.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| VttpError::internal(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

impl ResourceFetcher for HttpFetcher {
    fn fetch(&self, cx: &Cx, url: &str, config: &FetchConfig) -> Result<Vec<u8>> {
        cx.checkpoint()?;
        let started = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(config.timeout)
            .header(USER_AGENT, config.user_agent.as_str())
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|err| transport_error(url, &err))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "remote resource returned an error status");
            return Err(FetchError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            }
            .into());
        }

        let too_large = || FetchError::TooLarge {
            url: url.to_owned(),
            limit: config.max_bytes,
        };
        let limit = u64::try_from(config.max_bytes).unwrap_or(u64::MAX);
        if response.content_length().is_some_and(|len| len > limit) {
            warn!(url, limit = config.max_bytes, "declared body length over limit");
            return Err(too_large().into());
        }

        let mut body = Vec::new();
        Read::take(response, limit.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut {
                    FetchError::Timeout {
                        url: url.to_owned(),
                    }
                } else {
                    FetchError::Unreachable {
                        url: url.to_owned(),
                        detail: err.to_string(),
                    }
                }
            })?;
        if body.len() > config.max_bytes {
            warn!(url, limit = config.max_bytes, "body over limit");
            return Err(too_large().into());
        }
        // Cancelled while the request was in flight: drop the body.
        cx.checkpoint()?;

        info!(
            url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "fetched remote resource"
        );
        Ok(body)
    }
}

fn transport_error(url: &str, err: &reqwest::Error) -> VttpError {
    let fetch = if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_owned(),
        }
    } else {
        FetchError::Unreachable {
            url: url.to_owned(),
            detail: err.to_string(),
        }
    };
    warn!(url, error = %fetch, "remote fetch failed");
    fetch.into()
}
