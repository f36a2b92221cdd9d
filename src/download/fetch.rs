// src/download/fetch.rs

//! HTTP transport for the download pipeline
//!
//! Issues plain GET requests with redirects handled here rather than by
//! reqwest, so the redirect budget and conditional requests stay under our
//! control. A `304 Not Modified` answer to a conditional request is
//! reported as [`Fetched::NotModified`]; anything but `200` otherwise fails.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::{IF_MODIFIED_SINCE, LOCATION};
use reqwest::StatusCode;
use std::io::{self, Read};
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of redirects followed per fetch
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Result of a fetch
pub enum Fetched {
    /// Conditional request answered with 304; keep the local copy
    NotModified,
    /// Response body to stream
    Content(Content),
}

/// A successful response body
pub struct Content {
    response: Response,
    content_length: Option<u64>,
    url: Url,
}

impl Content {
    /// Declared body length, if the server sent one
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// URL the content was finally served from, after redirects
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Read for Content {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}

/// Format a timestamp as an HTTP date
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// HTTP client with a bounded redirect budget
pub struct HttpFetcher {
    client: Client,
    max_redirects: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_redirects: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("debsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_redirects,
        })
    }

    /// GET `url`, conditional on `modified_since` when given
    pub fn fetch(&self, url: &str, modified_since: Option<SystemTime>) -> Result<Fetched> {
        let mut current =
            Url::parse(url).map_err(|e| Error::DownloadError(format!("Invalid URL {url}: {e}")))?;
        let mut redirects = 0;

        loop {
            match current.scheme() {
                "http" | "https" => {}
                other => return Err(Error::UnsupportedScheme(other.to_string())),
            }

            let mut request = self.client.get(current.clone());
            if let Some(time) = modified_since {
                request = request.header(IF_MODIFIED_SINCE, http_date(time));
            }
            let response = request
                .send()
                .map_err(|e| Error::DownloadError(format!("GET {current} failed: {e}")))?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED && modified_since.is_some() {
                debug!("{} not modified", current);
                return Ok(Fetched::NotModified);
            }

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                if redirects >= self.max_redirects {
                    return Err(Error::RedirectLimitExceeded(url.to_string()));
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| Error::UnexpectedStatus {
                        url: current.to_string(),
                        status: status.as_u16(),
                    })?;
                let next = current.join(location).map_err(|e| {
                    Error::DownloadError(format!("Invalid redirect to {location}: {e}"))
                })?;
                debug!("{} redirected to {}", current, next);
                current = next;
                redirects += 1;
                continue;
            }

            if status != StatusCode::OK {
                return Err(Error::UnexpectedStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            let content_length = response.content_length();
            return Ok(Fetched::Content(Content {
                response,
                content_length,
                url: current,
            }));
        }
    }
}
