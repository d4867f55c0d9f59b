use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

use super::config::Settings;
use super::error::{PipelineError, Result};

/// Network primitives consumed by the pipeline.
pub trait Transport: Send + Sync {
    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;

    fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = build_client(
            &settings.user_agent,
            settings.http_timeout(),
            settings.max_redirects,
        )?;
        Ok(HttpTransport { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

fn build_client(user_agent: &str, timeout: Duration, max_redirects: usize) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(max_redirects))
        .build()
        .map_err(|e| PipelineError::Protocol(format!("failed to build HTTP client: {e}")))
}

fn classify(url: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(url.to_string())
    } else if err.is_connect() {
        PipelineError::Unreachable(url.to_string())
    } else if let Some(status) = err.status() {
        PipelineError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    } else if err.is_redirect() {
        PipelineError::Protocol(format!("too many redirects for {url}"))
    } else {
        PipelineError::Protocol(format!("{url}: {err}"))
    }
}

impl Transport for HttpTransport {
    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let response = self.get(url).await?;
            response.bytes().await.map_err(|e| classify(url, e))
        })
    }

    fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let response = self.get(url).await?;
            response.text().await.map_err(|e| classify(url, e))
        })
    }
}
