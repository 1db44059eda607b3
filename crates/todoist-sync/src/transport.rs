//! HTTP transport for the Todoist API.
//!
//! The core only talks to [`Transport`]; [`HttpTransport`] is the reqwest
//! implementation, and `fake::FakeTransport` the in-memory one used in tests.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Result, SyncError};

/// Authenticated request/response access to the remote service.
///
/// Paths are relative to the configured base URL (e.g. `/tasks`). Successful
/// responses are returned decoded; an empty body decodes to `Value::Null`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value>;

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value>;

    /// Form-encoded POST, used by the batch sync endpoint.
    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value>;

    async fn delete(&self, path: &str) -> Result<()>;
}

pub struct HttpTransport {
    base_url: String,
    default_headers: HeaderMap,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        if config.token.is_empty() {
            return Err(SyncError::Config("API token is empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {}", config.token)
                .parse()
                .map_err(|_| SyncError::Config("Invalid API token format".to_string()))?,
        );

        let mut builder = reqwest::Client::builder();
        #[cfg(not(target_arch = "wasm32"))]
        {
            builder = builder.timeout(std::time::Duration::from_secs(config.timeout_secs));
        }
        let client = builder.build().map_err(|e| {
            SyncError::Config(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            default_headers: headers,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Default headers plus the current span's trace context
    fn headers(&self) -> HeaderMap {
        #[allow(unused_mut)]
        let mut headers = self.default_headers.clone();
        #[cfg(not(target_arch = "wasm32"))]
        {
            use opentelemetry::global;
            use tracing_opentelemetry::OpenTelemetrySpanExt;

            struct HeaderInjector<'a> {
                headers: &'a mut HeaderMap,
            }
            impl opentelemetry::propagation::Injector for HeaderInjector<'_> {
                fn set(&mut self, key: &str, value: String) {
                    if let Ok(name) = reqwest::header::HeaderName::from_bytes(key.as_bytes()) {
                        if let Ok(value) = reqwest::header::HeaderValue::from_str(&value) {
                            self.headers.insert(name, value);
                        }
                    }
                }
            }

            let context = tracing::Span::current().context();
            let mut injector = HeaderInjector {
                headers: &mut headers,
            };
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&context, &mut injector);
            });
        }
        headers
    }

    fn transport_error(e: reqwest::Error, url: &str, operation: &str) -> SyncError {
        let message = if e.is_timeout() {
            "timeout - request took too long (check network or increase timeout)".to_string()
        } else if {
            #[cfg(not(target_arch = "wasm32"))]
            {
                e.is_connect()
            }
            #[cfg(target_arch = "wasm32")]
            {
                false
            }
        } {
            format!(
                "connection error - check network connectivity and DNS resolution. Error: {}",
                e
            )
        } else if e.is_request() {
            format!("request error - invalid URL or malformed request. Error: {}", e)
        } else if e.is_decode() {
            format!("decode error - unexpected response format from server. Error: {}", e)
        } else {
            format!("{}. Debug details: {:?}", e, e)
        };
        error!("[HttpTransport] Failed to {} for {}: {}", operation, url, message);
        SyncError::Transport {
            operation: operation.to_string(),
            url: url.to_string(),
            message,
        }
    }

    async fn handle_response(response: reqwest::Response, url: &str) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::transport_error(e, url, "read response body"))?;

        if !status.is_success() {
            error!("[HttpTransport] HTTP {} from {}", status.as_u16(), url);
            return Err(SyncError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate(&text, 500),
            });
        }

        debug!(
            "[HttpTransport] Response received from {}: length={}",
            url,
            text.len()
        );

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            SyncError::Decode(format!(
                "{} - Response (first 200): {}",
                e,
                truncate(&text, 200)
            ))
        })?;

        // The sync endpoint reports some failures with a 200 and an error object
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            let tag = value
                .get("error_tag")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            error!("[HttpTransport] API error from {}: {} - {}", url, tag, message);
            return Err(SyncError::Api {
                tag: tag.to_string(),
                message: message.to_string(),
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = self.url(path);
        debug!("[HttpTransport] GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .query(query)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, &url, "send GET request"))?;
        Self::handle_response(response, &url).await
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url(path);
        debug!("[HttpTransport] POST {}", url);
        let mut request = self.client.post(&url).headers(self.headers());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(e, &url, "send POST request"))?;
        Self::handle_response(response, &url).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        let url = self.url(path);
        debug!("[HttpTransport] POST (form) {}", url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .form(form)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, &url, "send form request"))?;
        Self::handle_response(response, &url).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!("[HttpTransport] DELETE {}", url);
        let response = self
            .client
            .delete(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| Self::transport_error(e, &url, "send DELETE request"))?;
        Self::handle_response(response, &url).await.map(|_| ())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}... (truncated)", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
