// ==============================================================================
// fetch/http.rs - HTTP Range Request Transport
// ==============================================================================
// Description: Range reads over HTTP(S) with whole-resource fallback
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-17
// Version: 1.1.1
// ==============================================================================
// Status handling:
//   206 Partial Content -> range honoured
//   200 OK              -> server ignored Range; body cached and sliced
//   416 Not Satisfiable -> read past the end, returns empty
// ==============================================================================

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::{slice_range, FetchError, FileStat, RangeFetch};

/// HTTP transport settings
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Per-request timeout
    pub timeout: Duration,
    /// Attempts per request (network failures only, not HTTP statuses)
    pub max_retries: u32,
    /// First backoff delay, doubled after each failed attempt
    pub retry_backoff: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// A remote resource read with HTTP range requests
#[derive(Debug)]
pub struct HttpFile {
    url: String,
    client: Client,
    options: HttpOptions,
    /// Full body, populated once a server answers a range request with 200
    full_body: Mutex<Option<Bytes>>,
}

impl HttpFile {
    pub fn new(url: impl Into<String>, options: HttpOptions) -> Result<Self, FetchError> {
        let url = url.into();
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            url,
            client,
            options,
            full_body: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn cached_body(&self) -> Option<Bytes> {
        self.full_body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache_body(&self, body: Bytes) {
        *self.full_body.lock().unwrap_or_else(PoisonError::into_inner) = Some(body);
    }

    fn network_error(&self, e: reqwest::Error) -> FetchError {
        FetchError::Network {
            url: self.url.clone(),
            message: e.to_string(),
        }
    }

    /// Send a GET (optionally ranged) with retry and exponential backoff
    async fn get(&self, range: Option<(u64, u64)>) -> Result<Response, FetchError> {
        let mut attempts = 0;
        let mut backoff = self.options.retry_backoff;

        loop {
            let mut request = self.client.get(&self.url);
            if let Some((start, end)) = range {
                request = request.header(RANGE, format!("bytes={}-{}", start, end));
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.options.max_retries.max(1) {
                        return Err(self.network_error(e));
                    }
                    debug!(
                        "Request to {} failed (attempt {}/{}): {}",
                        self.url, attempts, self.options.max_retries, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

/// Total size from a `Content-Range: bytes 0-0/12345` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl RangeFetch for HttpFile {
    async fn read(&self, length: u64, offset: u64) -> Result<Bytes, FetchError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        if let Some(body) = self.cached_body() {
            return Ok(slice_range(&body, length, offset));
        }

        let end = offset.saturating_add(length) - 1;
        let response = self.get(Some((offset, end))).await?;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let mut bytes = response.bytes().await.map_err(|e| self.network_error(e))?;
                // Some servers pad the final range; never hand back more than asked
                bytes.truncate(length as usize);
                Ok(bytes)
            }
            StatusCode::OK => {
                warn!(
                    "Server ignored range request for {} (200 instead of 206), falling back to full read",
                    self.url
                );
                let body = response.bytes().await.map_err(|e| self.network_error(e))?;
                self.cache_body(body.clone());
                Ok(slice_range(&body, length, offset))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(Bytes::new()),
            _ => Err(FetchError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            }),
        }
    }

    async fn read_file(&self) -> Result<Bytes, FetchError> {
        if let Some(body) = self.cached_body() {
            return Ok(body);
        }

        let response = self.get(None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.network_error(e))?;
        self.cache_body(body.clone());
        Ok(body)
    }

    async fn stat(&self) -> Result<FileStat, FetchError> {
        if let Some(body) = self.cached_body() {
            return Ok(FileStat { size: body.len() as u64 });
        }

        let head = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        if head.status().is_success() {
            let size = head
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(size) = size {
                return Ok(FileStat { size });
            }
        }

        // HEAD unsupported or no Content-Length: ask for one byte and read the total
        let probe = self.get(Some((0, 0))).await?;
        if probe.status() == StatusCode::PARTIAL_CONTENT {
            let total = probe
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            if let Some(size) = total {
                return Ok(FileStat { size });
            }
        }

        debug!("Size of {} is not exposed by the server", self.url);
        Ok(FileStat::unknown())
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.full_body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
