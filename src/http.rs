//! HTTP transport with timeouts
//!
//! The digest session drives requests through the [`Transport`] trait so the
//! wire can be swapped for a scripted appliance in tests.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, Method};
use std::time::Duration;

/// A fully prepared request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// A response with its body already read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// All values of a repeatable header such as `Set-Cookie`
    pub fn headers_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Sends one request; HTTP error statuses are returned, not raised
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    pub fn with_timeouts(timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("enginectl/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        // Cookies are tracked by the digest session, not by reqwest
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EngineError::Validation(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self { inner: client })
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| EngineError::Validation(format!("bad header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Validation(format!("bad header value for {}: {}", name.as_str(), e)))?;
            headers.append(name, value);
        }

        let mut builder = self
            .inner
            .request(request.method.clone(), &request.url)
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(n, v)| Some((n.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.text().await?;

        tracing::debug!("{} {} -> {}", request.method, request.url, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_headers_are_case_insensitive() {
        let resp = HttpResponse {
            status: 200,
            headers: vec![
                ("set-cookie".into(), "a=1".into()),
                ("Content-Type".into(), "text/html".into()),
                ("Set-Cookie".into(), "b=2".into()),
            ],
            body: String::new(),
        };

        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert_eq!(resp.headers_all("SET-COOKIE").collect::<Vec<_>>(), ["a=1", "b=2"]);
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_refused_connection_is_connectivity() {
        // Bind then release a port so nothing is listening on it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = HttpClient::with_timeouts(Duration::from_secs(2), Duration::from_secs(1)).unwrap();
        let err = client
            .send(HttpRequest {
                method: Method::GET,
                url: format!("http://127.0.0.1:{}/", port),
                headers: Vec::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connectivity(_)), "{:?}", err);
    }
}
