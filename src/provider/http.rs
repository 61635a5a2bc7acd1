/// JSON-over-HTTP provider adapter
///
/// POST {endpoint}/hits    body {spec, batches}  -> {handles: [...]}
/// POST {endpoint}/results body {handles}        -> {votes: [...]}

use super::{HitBatch, HitSpec, ProviderAdapter, ProviderError, ProviderHandle, ProviderVote};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    spec: &'a HitSpec,
    batches: &'a [HitBatch],
}

#[derive(Deserialize)]
struct PublishResponse {
    handles: Vec<ProviderHandle>,
}

#[derive(Serialize)]
struct PollRequest<'a> {
    handles: &'a [ProviderHandle],
}

#[derive(Deserialize)]
struct PollResponse {
    votes: Vec<ProviderVote>,
}

impl HttpProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let url = format!("{}/{}", self.endpoint, path);
        tracing::debug!("🌍 Provider request: POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    async fn publish(&self, batches: &[HitBatch], spec: &HitSpec) -> Result<Vec<ProviderHandle>, ProviderError> {
        let response: PublishResponse = self.post("hits", &PublishRequest { spec, batches }).await?;
        if response.handles.len() != batches.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "published {} batches, got {} handles",
                batches.len(),
                response.handles.len()
            )));
        }
        tracing::info!("📤 Published {} HITs for job {}", response.handles.len(), spec.job_id);
        Ok(response.handles)
    }

    async fn poll(&self, handles: &[ProviderHandle]) -> Result<Vec<ProviderVote>, ProviderError> {
        let response: PollResponse = self.post("results", &PollRequest { handles }).await?;
        tracing::debug!("📥 Polled {} provider votes", response.votes.len());
        Ok(response.votes)
    }
}
