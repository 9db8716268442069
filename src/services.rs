//! # Process-wide Services
//!
//! The recognition model and the answer/synthesis clients are built exactly
//! once at startup and handed to the session registry and HTTP handlers.
//! Any failure here is fatal: a server that can't recognize speech or write
//! replies has nothing useful to offer.

use crate::config::AppConfig;
use crate::dispatch::{DispatchPipeline, HttpAnswerEngine, HttpSynthesisEngine};
use crate::recognition::{ModelSize, SpeechRecognizer, WhisperRecognizer};
use crate::session::{SessionContext, SessionRegistry};
use crate::state::{AppState, PipelineMetrics};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Services;

impl Services {
    /// Load the recognizer, connect the engine clients and prepare the
    /// output directory, returning the shared application state.
    pub async fn initialize(config: AppConfig) -> Result<AppState> {
        let size: ModelSize = config.recognition.whisper_model.parse()?;
        let recognizer = WhisperRecognizer::load(size, config.recognition.language.as_deref())
            .await
            .context("Failed to load the speech recognition model")?;
        let recognizer: Arc<dyn SpeechRecognizer> = Arc::new(recognizer);

        Self::with_recognizer(config, recognizer)
    }

    /// Build the rest of the services around an already loaded recognizer.
    pub fn with_recognizer(config: AppConfig, recognizer: Arc<dyn SpeechRecognizer>) -> Result<AppState> {
        let answer = HttpAnswerEngine::new(
            config.dispatch.answer_url.clone(),
            Duration::from_secs(config.dispatch.answer_timeout_secs),
        )?;
        let synthesis = HttpSynthesisEngine::new(
            config.dispatch.synthesis_url.clone(),
            Duration::from_secs(config.dispatch.synthesis_timeout_secs),
        )?;
        info!(
            answer_url = %config.dispatch.answer_url,
            synthesis_url = %config.dispatch.synthesis_url,
            "Engine clients ready"
        );

        std::fs::create_dir_all(&config.dispatch.output_dir).with_context(|| {
            format!(
                "Failed to create audio output directory {}",
                config.dispatch.output_dir.display()
            )
        })?;

        let config = Arc::new(config);
        let metrics = Arc::new(PipelineMetrics::new());
        let dispatch = Arc::new(DispatchPipeline::new(Arc::new(answer), Arc::new(synthesis), &config));
        let model_name = recognizer.name();
        let sessions = Arc::new(SessionRegistry::new(SessionContext {
            config: config.clone(),
            recognizer,
            dispatch: dispatch.clone(),
            metrics: metrics.clone(),
        }));

        Ok(AppState::new(config, metrics, sessions, dispatch, model_name))
    }
}
