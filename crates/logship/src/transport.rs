// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of assembled batches to the collector.

use crate::config::SenderConfig;
use crate::errors::SenderError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::debug;

/// Collector response to one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status: StatusCode,
    /// Response body. Left empty for accepted deliveries.
    pub body: String,
}

impl Delivery {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status.is_success()
    }
}

/// The request never produced a response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, payload: Bytes) -> Result<Delivery, TransportError>;
}

/// POSTs batches as `text/plain` to the configured URL, authenticating
/// with a `token` query parameter.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: reqwest::Url,
    token: String,
}

impl HttpTransport {
    pub fn new(config: &SenderConfig) -> Result<Self, SenderError> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| SenderError::InvalidConfig(format!("invalid url {}: {e}", config.url)))?;
        let client = build_client(config)?;
        Ok(HttpTransport {
            client,
            url,
            token: config.token.clone(),
        })
    }
}

fn build_client(config: &SenderConfig) -> Result<reqwest::Client, SenderError> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(proxy) = config.https_proxy.as_deref() {
        let proxy = reqwest::Proxy::https(proxy)
            .map_err(|e| SenderError::HttpClient(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| SenderError::HttpClient(e.to_string()))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, payload: Bytes) -> Result<Delivery, TransportError> {
        let size = payload.len();
        let response = self
            .client
            .post(self.url.clone())
            .query(&[("token", self.token.as_str())])
            .header(CONTENT_TYPE, "text/plain")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        debug!("Delivered {size} bytes, collector answered {status}");
        if status.is_success() {
            return Ok(Delivery {
                status,
                body: String::new(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Ok(Delivery { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    fn config_for(url: String) -> SenderConfig {
        SenderConfig {
            token: "fake-token".to_string(),
            url,
            timeout: Duration::from_secs(2),
            ..SenderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_deliver_posts_plain_text_with_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_query(Matcher::UrlEncoded("token".into(), "fake-token".into()))
            .match_header("content-type", "text/plain")
            .match_body("blah\nblah\n")
            .with_status(200)
            .create_async()
            .await;

        let transport = HttpTransport::new(&config_for(server.url())).unwrap();
        let delivery = transport
            .deliver(Bytes::from_static(b"blah\nblah\n"))
            .await
            .unwrap();

        assert!(delivery.is_accepted());
        assert!(delivery.body.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deliver_reads_body_on_rejection() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("unauthorized token")
            .create_async()
            .await;

        let transport = HttpTransport::new(&config_for(server.url())).unwrap();
        let delivery = transport.deliver(Bytes::from_static(b"x\n")).await.unwrap();

        assert_eq!(delivery.status, StatusCode::UNAUTHORIZED);
        assert!(!delivery.is_accepted());
        assert_eq!(delivery.body, "unauthorized token");
    }

    #[tokio::test]
    async fn test_deliver_to_closed_port_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(&config_for(format!("http://127.0.0.1:{port}"))).unwrap();
        let result = transport.deliver(Bytes::from_static(b"x\n")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_new_rejects_bad_proxy() {
        let config = SenderConfig {
            https_proxy: Some("::not a proxy::".to_string()),
            ..config_for("http://127.0.0.1:1".to_string())
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(SenderError::HttpClient(_))
        ));
    }

    #[test]
    fn test_any_2xx_is_accepted() {
        for status in [StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT] {
            let delivery = Delivery {
                status,
                body: String::new(),
            };
            assert!(delivery.is_accepted());
        }
    }
}
