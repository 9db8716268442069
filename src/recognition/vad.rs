//! Energy-based voice activity segmentation.
//!
//! Splits a continuous 16 kHz PCM stream into utterances: a run of speech
//! frames long enough to count, terminated by a stretch of silence (or by the
//! maximum utterance length). A short pre-roll of audio from before the first
//! speech frame is kept so word onsets are not clipped.

use crate::audio::buffer::PCM_SAMPLE_RATE;
use crate::config::RecognitionConfig;
use std::collections::VecDeque;

/// Analysis frame length (20 ms at 16 kHz)
const FRAME_SAMPLES: usize = 320;

/// Audio kept from before speech onset (200 ms)
const PRE_ROLL_SAMPLES: usize = 3200;

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub energy_threshold: f32,
    pub min_speech_samples: usize,
    pub end_silence_samples: usize,
    pub max_utterance_samples: usize,
    pub pre_roll_samples: usize,
}

impl From<&RecognitionConfig> for SegmenterConfig {
    fn from(config: &RecognitionConfig) -> Self {
        let per_ms = PCM_SAMPLE_RATE as usize / 1000;
        Self {
            energy_threshold: config.energy_threshold,
            min_speech_samples: config.min_speech_ms as usize * per_ms,
            end_silence_samples: config.end_silence_ms as usize * per_ms,
            max_utterance_samples: (config.max_utterance_secs * PCM_SAMPLE_RATE as f32) as usize,
            pre_roll_samples: PRE_ROLL_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// Enough consecutive speech to treat this as an utterance in progress
    SpeechStarted,
    /// Utterance complete; carries its samples (pre-roll included)
    SpeechEnded(Vec<f32>),
}

pub struct VoiceSegmenter {
    config: SegmenterConfig,
    /// Samples waiting to fill the next analysis frame
    partial: Vec<f32>,
    pre_roll: VecDeque<f32>,
    utterance: Vec<f32>,
    in_speech: bool,
    started: bool,
    speech_samples: usize,
    silence_samples: usize,
}

impl VoiceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            pre_roll: VecDeque::with_capacity(config.pre_roll_samples),
            config,
            partial: Vec::with_capacity(FRAME_SAMPLES),
            utterance: Vec::new(),
            in_speech: false,
            started: false,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    /// Feed samples and collect any segment boundaries they complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<SegmentEvent> {
        let mut events = Vec::new();

        for &sample in samples {
            self.partial.push(sample);
            if self.partial.len() == FRAME_SAMPLES {
                let frame = std::mem::take(&mut self.partial);
                self.process_frame(&frame, &mut events);
                self.partial = frame;
                self.partial.clear();
            }
        }

        events
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.pre_roll.clear();
        self.end_segment();
    }

    fn process_frame(&mut self, frame: &[f32], events: &mut Vec<SegmentEvent>) {
        let is_speech = rms(frame) > self.config.energy_threshold;

        if !self.in_speech {
            if is_speech {
                self.in_speech = true;
                self.utterance.extend(self.pre_roll.drain(..));
                self.utterance.extend_from_slice(frame);
                self.speech_samples = frame.len();
                self.silence_samples = 0;
                self.maybe_start(events);
            } else {
                self.pre_roll.extend(frame.iter().copied());
                while self.pre_roll.len() > self.config.pre_roll_samples {
                    self.pre_roll.pop_front();
                }
            }
            return;
        }

        self.utterance.extend_from_slice(frame);
        if is_speech {
            self.speech_samples += frame.len();
            self.silence_samples = 0;
        } else {
            self.silence_samples += frame.len();
        }
        self.maybe_start(events);

        let silence_ended = self.silence_samples >= self.config.end_silence_samples;
        let too_long = self.utterance.len() >= self.config.max_utterance_samples;

        if silence_ended || too_long {
            if self.started {
                tracing::trace!(
                    samples = self.utterance.len(),
                    too_long,
                    "speech segment complete"
                );
                events.push(SegmentEvent::SpeechEnded(std::mem::take(&mut self.utterance)));
            } else {
                tracing::trace!("discarding speech blip");
            }
            self.end_segment();
        }
    }

    fn maybe_start(&mut self, events: &mut Vec<SegmentEvent>) {
        if !self.started && self.speech_samples >= self.config.min_speech_samples {
            self.started = true;
            events.push(SegmentEvent::SpeechStarted);
        }
    }

    fn end_segment(&mut self) {
        self.utterance.clear();
        self.in_speech = false;
        self.started = false;
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}

/// RMS energy of a frame
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
