use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;

use crate::error::PixyStreamError;
use crate::source::ByteSource;

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchResponse, PixyStreamError>> + Send>>;

/// The request-sending capability the backoff executor drives.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

impl<F> Fetch for F
where
    F: Fn(FetchRequest) -> FetchFuture + Send + Sync,
{
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        self(request)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl FetchRequest {
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteSource,
}

impl FetchResponse {
    pub fn new(status: u16, body: ByteSource) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Buffers the body and decodes it as JSON.
    pub async fn json(self) -> Result<Value, PixyStreamError> {
        let bytes = self.body.read_to_end().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn into_body(self) -> ByteSource {
        self.body
    }
}

/// `Fetch` over a reqwest client. The body is streamed, never buffered.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    client: Client,
}

impl HttpFetch {
    pub fn new() -> Self {
        Self {
            client: shared_http_client(false).clone(),
        }
    }

    pub fn for_url(url: &str) -> Self {
        Self {
            client: shared_http_client(is_loopback_url(url)).clone(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch for HttpFetch {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let client = self.client.clone();
        Box::pin(async move {
            let method = Method::from_bytes(request.method.as_bytes()).map_err(|error| {
                PixyStreamError::Config(format!("invalid HTTP method '{}': {error}", request.method))
            })?;
            let mut builder = client.request(method, request.url.as_str());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(serde_json::to_vec(body)?);
            }

            debug!(url = %request.url, "sending request");
            let response = builder.send().await.map_err(|error| {
                PixyStreamError::Transport(format!("request to {} failed: {error}", request.url))
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            Ok(FetchResponse {
                status,
                headers,
                body: ByteSource::from_response(response),
            })
        })
    }
}

fn shared_http_client(loopback: bool) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if loopback {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "[::1]"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_json_sets_content_type_and_extra_headers() {
        let request = FetchRequest::post_json("https://api.example.com/v1/chat", json!({"a": 1}))
            .header("Authorization", "Bearer token");

        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.headers[1].0, "Authorization");
    }

    #[test]
    fn response_status_and_header_lookup() {
        let mut response = FetchResponse::new(204, ByteSource::empty());
        response
            .headers
            .push(("Content-Type".to_string(), "text/event-stream".to_string()));

        assert!(response.is_ok());
        assert_eq!(response.header("content-type"), Some("text/event-stream"));
        assert!(!FetchResponse::new(429, ByteSource::empty()).is_ok());
    }

    #[tokio::test]
    async fn response_json_buffers_chunked_body() {
        let response = FetchResponse::new(
            400,
            ByteSource::from_chunks(["{\"error\":", "{\"code\":\"429\"}}"]),
        );
        let body = response.json().await.expect("json body");
        assert_eq!(body["error"]["code"], "429");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_url("http://127.0.0.1:8080/v1"));
        assert!(is_loopback_url("http://localhost/v1"));
        assert!(!is_loopback_url("https://api.openai.com/v1"));
        assert!(!is_loopback_url("not a url"));
    }

    #[test]
    fn http_client_is_reused_across_fetchers() {
        let first = shared_http_client(false);
        let second = shared_http_client(false);
        assert!(std::ptr::eq(first, second));
    }
}
