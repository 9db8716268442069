//! Answer engine client.
//!
//! The answer engine (retrieval + language model) is an external service with
//! a single call: question in, answer text out. It is assumed to be warmed up
//! before the first request.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[async_trait]
pub trait AnswerEngine: Send + Sync {
    async fn query(&self, question: &str) -> PipelineResult<String>;
}

/// `POST {url}` with `{"question": ...}`, expecting `{"answer": ...}`
/// (or `{"text_answer": ...}`).
pub struct HttpAnswerEngine {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct AnswerRequest<'a> {
    question: &'a str,
}

#[derive(Deserialize)]
struct AnswerResponse {
    #[serde(alias = "text_answer")]
    answer: String,
}

impl HttpAnswerEngine {
    pub fn new(url: String, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::AnswerEngine(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn query(&self, question: &str) -> PipelineResult<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&AnswerRequest { question })
            .send()
            .await
            .map_err(|e| PipelineError::AnswerEngine(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::AnswerEngine(format!("{status}: {body}")));
        }

        let answer: AnswerResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::AnswerEngine(format!("invalid response: {}", e)))?;
        Ok(answer.answer)
    }
}
