use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Outbound proxy URL for this dial, if the account has one.
    pub proxy: Option<String>,
    /// Ask for a streamed body on 2xx; error bodies are always buffered.
    pub want_stream: bool,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            UpstreamBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DialError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid proxy: {0}")]
    Proxy(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl DialError {
    /// Proxy misconfiguration won't heal on retry; everything else might.
    pub fn retryable(&self) -> bool {
        !matches!(self, DialError::Proxy(_))
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, DialError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub stream_total_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(60),
            stream_total_timeout: Duration::from_secs(600),
        }
    }
}

/// reqwest-backed upstream client with one cached connection pool per
/// distinct outbound proxy.
pub struct HttpUpstreamClient {
    config: HttpClientConfig,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl HttpUpstreamClient {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for_proxy(&self, proxy: Option<&str>) -> Result<reqwest::Client, DialError> {
        let key = proxy.map(|p| p.to_string());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| DialError::Transport("client cache poisoned".to_string()))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_max_idle_per_host(16);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| DialError::Proxy(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| DialError::Transport(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, DialError> {
        let client = self.client_for_proxy(req.proxy.as_deref())?;
        let mut builder = client.request(req.method.clone(), &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body.clone() {
            builder = builder.body(body);
        }

        let response = tokio::time::timeout(self.config.request_timeout, builder.send())
            .await
            .map_err(|_| DialError::Timeout("awaiting response headers".to_string()))?
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = headers_to_vec(response.headers());

        let stream_body = req.want_stream && (200..300).contains(&status);
        if !stream_body {
            let bytes = tokio::time::timeout(self.config.request_timeout, response.bytes())
                .await
                .map_err(|_| DialError::Timeout("reading response body".to_string()))?
                .map_err(map_reqwest_error)?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(bytes),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let idle = self.config.stream_idle_timeout;
        let deadline = Instant::now() + self.config.stream_total_timeout;
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                if Instant::now() >= deadline {
                    break;
                }
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else {
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                if tx.send(chunk).await.is_err() {
                    // Receiver dropped: downstream is gone, stop reading.
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

fn headers_to_vec(map: &reqwest::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

fn map_reqwest_error(err: reqwest::Error) -> DialError {
    if err.is_timeout() {
        DialError::Timeout(err.to_string())
    } else if err.is_connect() {
        DialError::Connect(err.to_string())
    } else {
        DialError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_errors_are_not_retryable() {
        assert!(!DialError::Proxy("bad scheme".to_string()).retryable());
        assert!(DialError::Connect("refused".to_string()).retryable());
        assert!(DialError::Timeout("idle".to_string()).retryable());
    }
}
