//! Session states and the transition table.
//!
//! ```text
//!            wake word / voice activity
//!   Idle ─────────────────────────────▶ Listening
//!    ▲  ▲                                 │    │
//!    │  └──── trivial transcript ─────────┘    │ utterance (≥ min chars)
//!    │  └──── listen timeout ─────────────┘    ▼
//!    │                                       Thinking
//!    │◀──────────── dispatch failed ────────── │
//!    │                                         │ reply ready
//!    └──────────── playback finished ────── Speaking
//! ```
//!
//! The table is a pure function so it can be checked exhaustively; the
//! session driver owns timers, side effects and notifications.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    WakeWord,
    VoiceActivity,
    Utterance(String),
    ReplyReady,
    DispatchFailed,
    PlaybackFinished,
    ListenTimeout,
}

/// What the driver must do after entering the new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Start a dispatch for this (trimmed) question
    Dispatch(String),
    /// The transcript was too short and has been dropped
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: SessionState,
    pub effect: Effect,
}

impl Transition {
    fn to(to: SessionState) -> Option<Self> {
        Some(Self { to, effect: Effect::None })
    }
}

/// Apply `trigger` in `state`. `None` means the trigger is ignored and no
/// notification is due.
pub fn transition(state: SessionState, trigger: &Trigger, min_transcript_chars: usize) -> Option<Transition> {
    use SessionState::*;

    match (state, trigger) {
        (Idle, Trigger::WakeWord | Trigger::VoiceActivity) => Transition::to(Listening),

        (Listening, Trigger::Utterance(text)) => {
            let question = text.trim();
            if question.chars().count() >= min_transcript_chars {
                Some(Transition {
                    to: Thinking,
                    effect: Effect::Dispatch(question.to_string()),
                })
            } else {
                Some(Transition {
                    to: Idle,
                    effect: Effect::Discarded,
                })
            }
        }
        (Listening, Trigger::ListenTimeout) => Transition::to(Idle),

        (Thinking, Trigger::ReplyReady) => Transition::to(Speaking),
        (Thinking, Trigger::DispatchFailed) => Transition::to(Idle),

        (Speaking, Trigger::PlaybackFinished) => Transition::to(Idle),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    fn utterance(text: &str) -> Trigger {
        Trigger::Utterance(text.to_string())
    }

    #[test]
    fn test_full_cycle() {
        let mut state = Idle;
        for trigger in [
            Trigger::WakeWord,
            utterance("what is two plus two"),
            Trigger::ReplyReady,
            Trigger::PlaybackFinished,
        ] {
            state = transition(state, &trigger, 3).unwrap().to;
        }
        assert_eq!(state, Idle);
    }

    #[test]
    fn test_both_entry_points_reach_listening() {
        assert_eq!(transition(Idle, &Trigger::WakeWord, 3).unwrap().to, Listening);
        assert_eq!(transition(Idle, &Trigger::VoiceActivity, 3).unwrap().to, Listening);
    }

    #[test]
    fn test_short_transcripts_never_reach_thinking() {
        for text in ["", "  ", "a", "ok", "  hi  ", "\tno\n", "é!"] {
            let t = transition(Listening, &utterance(text), 3).unwrap();
            assert_eq!(t.to, Idle, "{:?}", text);
            assert_eq!(t.effect, Effect::Discarded);
        }
    }

    #[test]
    fn test_dispatch_carries_trimmed_question() {
        let t = transition(Listening, &utterance("  yes  "), 3).unwrap();
        assert_eq!(t.to, Thinking);
        assert_eq!(t.effect, Effect::Dispatch("yes".to_string()));
    }

    #[test]
    fn test_failure_and_timeout_return_to_idle() {
        assert_eq!(transition(Thinking, &Trigger::DispatchFailed, 3).unwrap().to, Idle);
        assert_eq!(transition(Listening, &Trigger::ListenTimeout, 3).unwrap().to, Idle);
    }

    #[test]
    fn test_busy_states_ignore_new_input() {
        for state in [Thinking, Speaking] {
            assert!(transition(state, &Trigger::WakeWord, 3).is_none());
            assert!(transition(state, &Trigger::VoiceActivity, 3).is_none());
            assert!(transition(state, &utterance("another question"), 3).is_none());
        }
        // Only one dispatch may be in flight
        assert!(transition(Thinking, &utterance("what about now"), 3).is_none());
        assert!(transition(Speaking, &Trigger::ReplyReady, 3).is_none());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Thinking).unwrap(), "\"thinking\"");
        assert_eq!(Speaking.to_string(), "speaking");
    }
}
