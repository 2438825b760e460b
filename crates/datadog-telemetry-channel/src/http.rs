// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The network seam of the channel.
//!
//! The transmitter only talks to an [`HttpSender`]. [`ReqwestSender`] is the
//! production implementation; tests plug in scripted senders.

use crate::credential::CredentialFactory;
use crate::transmission::{HttpResponse, SendOutcome, Transmission};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[async_trait]
pub trait HttpSender: Send + Sync {
    /// POSTs the transmission. Never fails: every failure is an outcome.
    async fn post(&self, transmission: &Transmission) -> SendOutcome;
}

/// Creates a reqwest client builder with rustls TLS.
pub fn create_reqwest_client_builder() -> Result<reqwest::ClientBuilder, Box<dyn Error>> {
    Ok(reqwest::Client::builder().use_rustls_tls())
}

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = create_reqwest_client_builder()?
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Like [`build_client`], but falls back to a direct connection when the proxy
/// configuration is unusable.
#[must_use]
pub fn get_client(proxy_url: Option<&str>, timeout: Duration) -> reqwest::Client {
    match build_client(proxy_url, timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(None, timeout) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

/// Parses a `Retry-After` value, either delta-seconds or an HTTP date.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delay = date.with_timezone(&Utc) - now;
    Some(delay.to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
    credential: Option<Arc<CredentialFactory>>,
}

impl ReqwestSender {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            credential: None,
        }
    }

    /// Adds `Authorization: Bearer <token>` to every request.
    #[must_use]
    pub fn with_credential(mut self, credential: Arc<CredentialFactory>) -> Self {
        self.credential = Some(credential);
        self
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post(&self, transmission: &Transmission) -> SendOutcome {
        let mut request = self
            .client
            .post(transmission.endpoint().clone())
            .timeout(transmission.timeout())
            .header(CONTENT_TYPE, transmission.content_type())
            .body(transmission.content().clone());

        if let Some(encoding) = transmission.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        if let Some(credential) = &self.credential {
            let Some(token) = credential.get_token().await else {
                return SendOutcome::LocalFailure("failed to resolve credential".to_string());
            };
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => return SendOutcome::LocalFailure(e.to_string()),
            Err(e) => {
                debug!("Transmission {} failed: {}", transmission.id(), e);
                return SendOutcome::TransportFailure(e.to_string());
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));

        let content = if status == StatusCode::PARTIAL_CONTENT {
            match response.bytes().await {
                Ok(body) => Some(body),
                Err(e) => {
                    debug!("Failed to read partial content body: {}", e);
                    None
                }
            }
        } else {
            None
        };

        SendOutcome::Response(HttpResponse {
            status,
            retry_after,
            content,
        })
    }
}
