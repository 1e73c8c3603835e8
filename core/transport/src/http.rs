//! HTTP transport backed by reqwest.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use lectern_common::{Error, Result};

use crate::request::{ApiRequest, FormPart, Method, RequestBody};
use crate::transport::Transport;

/// Default user agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "Lectern/0.1";

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Backend origin, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Hard timeout applied by the HTTP client to every request.
    pub timeout: Duration,
    /// User agent header.
    pub user_agent: String,
    /// Headers added to every request (e.g. authorization).
    pub default_headers: Vec<(String, String)>,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_headers: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}

/// Transport talking JSON over HTTP.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    default_headers: Vec<(String, String)>,
}

impl HttpTransport {
    /// Create a transport with default settings.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config(HttpConfig::new(base_url))
    }

    /// Create a transport from explicit configuration.
    ///
    /// # Errors
    /// - `base_url` is not an absolute http(s) URL
    /// - The HTTP client cannot be constructed
    pub fn with_config(config: HttpConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", config.base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Unsupported URL scheme '{}'",
                base_url.scheme()
            )));
        }

        let http = Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            default_headers: config.default_headers,
        })
    }

    /// Backend origin.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build the absolute URL of a request, query string included.
    pub fn url_for(&self, request: &ApiRequest) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = request.resolve_path()?;
        let mut url = Url::parse(&format!("{}{}", base, path))
            .map_err(|e| Error::InvalidInput(format!("Invalid request URL: {}", e)))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    fn multipart_form(parts: Vec<FormPart>) -> Result<Form> {
        let mut form = Form::new();
        for part in parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    filename,
                    content_type,
                    data,
                } => {
                    let mut file = Part::bytes(data).file_name(filename);
                    if let Some(content_type) = content_type {
                        file = file.mime_str(&content_type).map_err(|e| {
                            Error::InvalidInput(format!("Invalid content type: {}", e))
                        })?;
                    }
                    form.part(name, file)
                }
            };
        }
        Ok(form)
    }

    /// Map the response status and decode the body.
    async fn handle_response(response: reqwest::Response) -> Result<Value> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let body = Self::body_of(response).await?;
        decode_body(&body)
    }

    /// Raw body of a successful response; an error for any other status.
    async fn body_of(response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;
            Ok(body.to_vec())
        } else {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body
            };
            Err(Error::from_status(status.as_u16(), message))
        }
    }

    async fn send(&self, request: ApiRequest) -> Result<reqwest::Response> {
        let url = self.url_for(&request)?;
        debug!(method = %request.method, %url, "Sending request");

        let mut builder = match request.method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
            Method::Put => self.http.put(url),
            Method::Patch => self.http.patch(url),
            Method::Delete => self.http.delete(url),
        };

        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Multipart(parts) => builder.multipart(Self::multipart_form(parts)?),
        };

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network("Request timed out".to_string())
            } else {
                Error::Network(format!("Request failed: {}", e))
            }
        })
    }
}

/// Decode a response body, treating an empty body as `null`.
pub fn decode_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::Parse(format!("Failed to parse response: {}", e)))
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn perform(&self, request: ApiRequest) -> Result<Value> {
        let response = self.send(request).await?;
        Self::handle_response(response).await
    }

    async fn download(&self, request: ApiRequest) -> Result<Vec<u8>> {
        let response = self.send(request).await?;
        Self::body_of(response).await
    }
}
