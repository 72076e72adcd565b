//! Transcription Module
//!
//! Speech-to-text through interchangeable cloud providers, with selection,
//! reliability guards and speaker diarization.

mod cancel;
mod deepgram;
mod diarization;
mod factory;
mod http;
mod provider;
pub mod reliability;
mod selector;
mod whisper;

pub use cancel::*;
pub use deepgram::*;
pub use diarization::*;
pub use factory::*;
pub use provider::*;
pub use reliability::*;
pub use selector::*;
pub use whisper::*;
