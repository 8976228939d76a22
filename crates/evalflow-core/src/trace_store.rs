use anyhow::{Context, Result};
use async_trait::async_trait;

use evalflow_types::{SpanQuery, SpanQueryResponse};

/// Remote (possibly lagging) store of recorded spans.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn query(&self, query: &SpanQuery) -> Result<SpanQueryResponse>;
}

/// Posts a [`SpanQuery`] as JSON and expects a [`SpanQueryResponse`] back.
pub struct HttpTraceStore {
    client: reqwest::Client,
    url: String,
}

impl HttpTraceStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TraceStore for HttpTraceStore {
    async fn query(&self, query: &SpanQuery) -> Result<SpanQueryResponse> {
        let resp = self
            .client
            .post(&self.url)
            .json(query)
            .send()
            .await
            .with_context(|| format!("trace query to {} failed", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("trace query returned HTTP {}: {}", status.as_u16(), body);
        }
        resp.json::<SpanQueryResponse>()
            .await
            .context("trace query returned an unexpected body")
    }
}
