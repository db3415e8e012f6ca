//! HTTP client for the remote attribution scoring service.
//!
//! One call scores one chunk. Transient failures (timeouts, 5xx, rate
//! limits) are retried under the [`RetryPolicy`]; anything else fails the
//! chunk immediately. A 2xx response that does not cover every submitted
//! journey comes back as a partial result with the uncovered journeys
//! listed, so the orchestrator can resubmit just those.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::chunk::ScoringRequestChunk;
use crate::config::ApiConfig;
use crate::error::ScoringError;
use crate::model::{ChunkResult, ChunkStatus, TouchpointScore};
use crate::scoring::retry::{RateGate, RetryDecision, RetryPolicy};

/// Request wire shape: one chunk of journeys.
#[derive(Debug, Serialize)]
struct ScoreRequest {
    chunk_id: String,
    journeys: Vec<WireJourney>,
}

#[derive(Debug, Serialize)]
struct WireJourney {
    customer_id: String,
    touchpoints: Vec<WireTouchpoint>,
}

#[derive(Debug, Serialize)]
struct WireTouchpoint {
    channel: String,
    timestamp: DateTime<Utc>,
    event_type: crate::model::EventType,
}

/// Response wire shape.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    chunk_id: String,
    results: Vec<WireResult>,
    #[serde(default)]
    partial: bool,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    customer_id: String,
    channel: String,
    timestamp: DateTime<Utc>,
    credit: f64,
}

/// Client for the scoring service.
#[derive(Clone)]
pub struct ScoringClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    gate: Arc<RateGate>,
}

impl ScoringClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            policy: RetryPolicy::from_config(config),
            gate: Arc::new(RateGate::new()),
        })
    }

    /// Submit one chunk, retrying transient failures, and report the outcome
    /// as a [`ChunkResult`]. Never panics or returns early; every failure
    /// mode ends up typed inside the result.
    pub async fn score_chunk(&self, chunk: &ScoringRequestChunk) -> ChunkResult {
        let request = build_request(chunk);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.gate.acquire().await;

            match self.submit_once(&request).await {
                Ok(response) => return resolve_response(chunk, response),
                Err(error) => {
                    if error.is_rate_limit() {
                        // Throttle every worker, not just this one.
                        self.gate.hold_for(self.policy.backoff(attempt)).await;
                    }
                    match self.policy.decide(attempt, &error) {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                "Chunk {} attempt {} failed: {}, retrying in {}ms",
                                chunk.chunk_id,
                                attempt,
                                error,
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Fail => {
                            tracing::error!(
                                "Chunk {} failed after {} attempt(s): {}",
                                chunk.chunk_id,
                                attempt,
                                error
                            );
                            return ChunkResult::failed(chunk.chunk_id.clone(), error);
                        }
                    }
                }
            }
        }
    }

    async fn submit_once(&self, request: &ScoreRequest) -> Result<ScoreResponse, ScoringError> {
        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<ScoreResponse>()
                .await
                .map_err(|e| ScoringError::MalformedResponse(e.to_string()));
        }

        if status.as_u16() == 429 {
            return Err(ScoringError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ScoringError::ServiceUnavailable(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(ScoringError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn build_request(chunk: &ScoringRequestChunk) -> ScoreRequest {
    ScoreRequest {
        chunk_id: chunk.chunk_id.clone(),
        journeys: chunk
            .journeys
            .iter()
            .map(|journey| WireJourney {
                customer_id: journey.customer_id.clone(),
                touchpoints: journey
                    .events
                    .iter()
                    .map(|event| WireTouchpoint {
                        channel: event.channel.clone(),
                        timestamp: event.timestamp,
                        event_type: event.event_type,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Turn a 2xx response into a chunk result, checking that every submitted
/// journey is fully covered by the returned scores.
fn resolve_response(chunk: &ScoringRequestChunk, response: ScoreResponse) -> ChunkResult {
    if response.chunk_id != chunk.chunk_id {
        return ChunkResult::failed(
            chunk.chunk_id.clone(),
            ScoringError::ChunkIdMismatch {
                expected: chunk.chunk_id.clone(),
                got: response.chunk_id,
            },
        );
    }

    let scores: Vec<TouchpointScore> = response
        .results
        .into_iter()
        .map(|r| TouchpointScore {
            customer_id: r.customer_id,
            channel: r.channel,
            timestamp: r.timestamp,
            credit: r.credit,
        })
        .collect();

    let covered: HashSet<(&str, DateTime<Utc>)> = scores
        .iter()
        .map(|s| (s.customer_id.as_str(), s.timestamp))
        .collect();

    // A journey counts as scored only when every touchpoint came back.
    let unscored: Vec<usize> = chunk
        .journeys
        .iter()
        .enumerate()
        .filter(|(_, journey)| {
            !journey
                .events
                .iter()
                .all(|e| covered.contains(&(journey.customer_id.as_str(), e.timestamp)))
        })
        .map(|(idx, _)| idx)
        .collect();

    if unscored.is_empty() {
        if response.partial {
            tracing::debug!(
                "Chunk {} flagged partial but every journey is covered",
                chunk.chunk_id
            );
        }
        ChunkResult {
            chunk_id: chunk.chunk_id.clone(),
            status: ChunkStatus::Success,
            scores,
            unscored,
            error: None,
        }
    } else {
        tracing::warn!(
            "Chunk {}: {} of {} journeys unscored in response",
            chunk.chunk_id,
            unscored.len(),
            chunk.journeys.len()
        );
        ChunkResult {
            chunk_id: chunk.chunk_id.clone(),
            status: ChunkStatus::Partial,
            scores,
            unscored,
            error: None,
        }
    }
}
