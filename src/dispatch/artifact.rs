//! # Audio Artifact Store
//!
//! Synthesized replies are written as 16-bit mono WAV files under
//! `output_dir/<slot>/<uuid>.wav` and served from `url_prefix/<slot>/<uuid>.wav`.
//!
//! A slot is one session's output directory (the direct-ask path shares the
//! `direct` slot). Before a new reply is written, the slot's previous
//! artifacts are purged, so a slot never holds more than one live artifact.
//! Random file names keep concurrent writers from colliding without locking
//! and stop clients from playing a cached stale reply.

use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// Location of a freshly written reply.
#[derive(Debug, Clone, Serialize)]
pub struct AudioRef {
    pub path: PathBuf,
    pub url: String,
    pub duration_secs: f64,
}

pub struct ArtifactStore {
    output_dir: PathBuf,
    url_prefix: String,
    sample_rate: u32,
    trailing_silence_ms: u64,
}

impl ArtifactStore {
    pub fn new(output_dir: PathBuf, url_prefix: &str, sample_rate: u32, trailing_silence_ms: u64) -> Self {
        Self {
            output_dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
            sample_rate,
            trailing_silence_ms,
        }
    }

    /// Delete every WAV file in `slot`. Missing directories are fine.
    pub fn purge(&self, slot: &str) -> PipelineResult<usize> {
        let dir = self.slot_dir(slot)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "wav") {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    // Another writer on the same slot may have raced us to it
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if removed > 0 {
            debug!(slot, removed, "Purged previous artifacts");
        }
        Ok(removed)
    }

    /// Write `samples` plus the trailing silence as a new artifact in `slot`.
    pub fn write(&self, slot: &str, samples: &[f32]) -> PipelineResult<AudioRef> {
        let dir = self.slot_dir(slot)?;
        fs::create_dir_all(&dir)?;

        let silence = (self.sample_rate as u64 * self.trailing_silence_ms / 1000) as usize;
        let mut pcm: Vec<i16> = Vec::with_capacity(samples.len() + silence);
        pcm.extend(samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
        pcm.resize(samples.len() + silence, 0);
        let frames = pcm.len();

        let file_name = format!("{}.wav", Uuid::new_v4());
        let path = dir.join(&file_name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).map_err(std::io::Error::other)?;
        for sample in pcm {
            writer.write_sample(sample).map_err(std::io::Error::other)?;
        }
        writer.finalize().map_err(std::io::Error::other)?;

        Ok(AudioRef {
            url: format!("{}/{}/{}", self.url_prefix, slot, file_name),
            path,
            duration_secs: frames as f64 / self.sample_rate as f64,
        })
    }

    /// Drop a slot entirely, used when its session goes away.
    pub fn remove_slot(&self, slot: &str) {
        let Ok(dir) = self.slot_dir(slot) else {
            return;
        };
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(slot, "Failed to remove artifact directory: {}", e);
            }
        }
    }

    /// Resolve a served file, rejecting anything that could escape `output_dir`.
    pub fn resolve(&self, slot: &str, file_name: &str) -> Option<PathBuf> {
        if !is_safe_component(file_name) || !file_name.ends_with(".wav") {
            return None;
        }
        let path = self.slot_dir(slot).ok()?.join(file_name);
        path.is_file().then_some(path)
    }

    fn slot_dir(&self, slot: &str) -> PipelineResult<PathBuf> {
        if !is_safe_component(slot) {
            return Err(PipelineError::Artifact(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid artifact slot {:?}", slot),
            )));
        }
        Ok(self.output_dir.join(slot))
    }
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::new(dir.to_path_buf(), "/static/audio/", 24_000, 500)
    }

    fn wav_files(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn test_write_appends_trailing_silence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let audio = store.write("s1", &vec![0.5; 24_000]).unwrap();
        assert!(audio.url.starts_with("/static/audio/s1/"));
        assert!(audio.url.ends_with(".wav"));
        assert!((audio.duration_secs - 1.5).abs() < 1e-9);

        let mut reader = hound::WavReader::open(&audio.path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 36_000);
        assert!(samples[..24_000].iter().all(|&s| s > 16_000));
        assert!(samples[24_000..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_purge_keeps_slots_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let first = store.write("s1", &[0.1; 100]).unwrap();
        store.write("s2", &[0.1; 100]).unwrap();
        assert_eq!(store.purge("s1").unwrap(), 1);
        assert!(!first.path.exists());
        assert_eq!(wav_files(&tmp.path().join("s1")), 0);
        assert_eq!(wav_files(&tmp.path().join("s2")), 1);

        assert_eq!(store.purge("never-written").unwrap(), 0);
    }

    #[test]
    fn test_names_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let a = store.write("s1", &[0.0; 10]).unwrap();
        let b = store.write("s1", &[0.0; 10]).unwrap();
        assert_ne!(a.url, b.url);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        assert!(store.write("../escape", &[0.0; 10]).is_err());
        assert!(store.resolve("s1", "../../etc/passwd").is_none());
        assert!(store.resolve("..", "x.wav").is_none());

        let audio = store.write("s1", &[0.0; 10]).unwrap();
        let name = audio.path.file_name().unwrap().to_str().unwrap();
        assert_eq!(store.resolve("s1", name), Some(audio.path.clone()));
    }

    #[test]
    fn test_remove_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.write("s1", &[0.0; 10]).unwrap();
        store.remove_slot("s1");
        assert!(!tmp.path().join("s1").exists());
        store.remove_slot("s1");
    }
}
