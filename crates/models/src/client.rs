use crate::{DownloadError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Body chunks as they arrive from the network.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

pub struct HttpResponse {
    pub status: u16,
    /// Reason phrase for `status`, used in error messages.
    pub message: String,
    pub content_length: Option<u64>,
    /// `None` when the server sent no body at all.
    pub body: Option<ByteStream>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("content_length", &self.content_length)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Network capability used by the downloader.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue a GET, sending `Authorization: Bearer <token>` whenever a token
    /// is given, even a blank one.
    async fn get(&self, url: &str, bearer_token: Option<&str>) -> Result<HttpResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, bearer_token: Option<&str>) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        let content_length = response.content_length();
        let body = if content_length == Some(0) {
            None
        } else {
            Some(
                response
                    .bytes_stream()
                    .map(|chunk| {
                        chunk
                            .map(|bytes| bytes.to_vec())
                            .map_err(|e| DownloadError::Network(e.to_string()))
                    })
                    .boxed(),
            )
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or_default().to_string(),
            content_length,
            body,
        })
    }
}
