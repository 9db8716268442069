//! # Dispatch Pipeline
//!
//! Turns a finalized utterance into a [`Reply`]:
//!
//! 1. `answer`: ask the answer engine (seconds)
//! 2. normalize the answer into speakable words
//! 3. synthesize it with the fixed voice
//! 4. purge the slot's previous artifact and write the new one
//!
//! Any failure aborts the whole dispatch for that utterance. Nothing is
//! written unless synthesis succeeded.

use crate::config::{AppConfig, VoiceParams};
use crate::dispatch::answer::AnswerEngine;
use crate::dispatch::artifact::{ArtifactStore, AudioRef};
use crate::dispatch::normalize::normalize;
use crate::dispatch::synthesis::SynthesisEngine;
use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Artifact slot shared by the direct-ask HTTP path.
pub const DIRECT_SLOT: &str = "direct";

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub text_answer: String,
    pub audio: AudioRef,
}

pub struct DispatchPipeline {
    answer: Arc<dyn AnswerEngine>,
    synthesis: Arc<dyn SynthesisEngine>,
    store: ArtifactStore,
    voice: VoiceParams,
    sample_rate: u32,
    fallback_phrase: String,
}

impl DispatchPipeline {
    pub fn new(answer: Arc<dyn AnswerEngine>, synthesis: Arc<dyn SynthesisEngine>, config: &AppConfig) -> Self {
        let dispatch = &config.dispatch;
        Self {
            answer,
            synthesis,
            store: ArtifactStore::new(
                dispatch.output_dir.clone(),
                &dispatch.audio_url_prefix,
                dispatch.sample_rate,
                dispatch.trailing_silence_ms,
            ),
            voice: config.voice.clone(),
            sample_rate: dispatch.sample_rate,
            fallback_phrase: dispatch.fallback_phrase.clone(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn answer(&self, question: &str) -> PipelineResult<String> {
        let started = Instant::now();
        let answer = self.answer.query(question).await?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Answer engine replied");
        Ok(answer)
    }

    /// Speak `text` into a new artifact in `slot`.
    pub async fn synthesize(&self, slot: &str, text: &str) -> PipelineResult<AudioRef> {
        let spoken = normalize(text, &self.fallback_phrase);
        debug!(slot, spoken = %spoken, "Synthesizing reply");

        let started = Instant::now();
        let waveform = self.synthesis.synthesize(&spoken, &self.voice).await?;
        if waveform.sample_rate != self.sample_rate {
            return Err(PipelineError::Synthesis(format!(
                "engine returned {} Hz audio, expected {} Hz",
                waveform.sample_rate, self.sample_rate
            )));
        }
        debug!(
            slot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            samples = waveform.samples.len(),
            "Synthesis finished"
        );

        self.store.purge(slot)?;
        self.store.write(slot, &waveform.samples)
    }

    /// Answer, then speak, `question`.
    pub async fn run(&self, slot: &str, question: &str) -> PipelineResult<Reply> {
        let text_answer = self.answer(question).await?;
        let audio = self.synthesize(slot, &text_answer).await?;
        info!(slot, audio_url = %audio.url, duration_secs = audio.duration_secs, "Reply ready");
        Ok(Reply { text_answer, audio })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pipeline_in, FakeAnswerEngine, FakeSynthesisEngine};

    #[tokio::test]
    async fn test_run_produces_reply_and_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynthesisEngine::ok());
        let pipeline = pipeline_in(tmp.path(), Arc::new(FakeAnswerEngine::ok("2 + 2 = 4")), synth.clone());

        let reply = pipeline.run("s1", "what is two plus two").await.unwrap();
        assert_eq!(reply.text_answer, "2 + 2 = 4");
        assert!(reply.audio.path.exists());
        assert_eq!(synth.last_text().as_deref(), Some("two plus two equals four"));
    }

    #[tokio::test]
    async fn test_each_reply_replaces_the_previous_one() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("hello")),
            Arc::new(FakeSynthesisEngine::ok()),
        );

        let first = pipeline.run("s1", "hi").await.unwrap();
        let second = pipeline.run("s1", "hi again").await.unwrap();
        assert!(!first.audio.path.exists());
        assert!(second.audio.path.exists());
        assert_eq!(std::fs::read_dir(tmp.path().join("s1")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_synthesis_failure_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("hello")),
            Arc::new(FakeSynthesisEngine::failing()),
        );

        let result = pipeline.run("s1", "hi").await;
        assert!(matches!(result, Err(PipelineError::Synthesis(_))));
        assert!(!tmp.path().join("s1").exists());
    }

    #[tokio::test]
    async fn test_answer_failure_skips_synthesis() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynthesisEngine::ok());
        let pipeline = pipeline_in(tmp.path(), Arc::new(FakeAnswerEngine::failing()), synth.clone());

        let result = pipeline.run("s1", "hi").await;
        assert!(matches!(result, Err(PipelineError::AnswerEngine(_))));
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_sample_rate_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(
            tmp.path(),
            Arc::new(FakeAnswerEngine::ok("hello")),
            Arc::new(FakeSynthesisEngine::with_rate(22_050)),
        );

        let result = pipeline.synthesize("s1", "hello").await;
        assert!(matches!(result, Err(PipelineError::Synthesis(_))));
    }

    #[tokio::test]
    async fn test_empty_answer_speaks_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynthesisEngine::ok());
        let pipeline = pipeline_in(tmp.path(), Arc::new(FakeAnswerEngine::ok("🤷")), synth.clone());

        pipeline.run(DIRECT_SLOT, "?").await.unwrap();
        assert_eq!(synth.last_text().as_deref(), Some("Let's try again."));
    }
}
