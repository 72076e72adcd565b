//! VoxRelay Library
//!
//! Provider orchestration for speech-to-text: one contract over several
//! cloud backends, per-provider reliability guards, metrics-driven
//! selection and speaker-attributed transcripts.

pub mod config;
pub mod transcription;
pub mod utils;

pub use config::{ConfigUpdate, FileSettingsStore, MemorySettingsStore, Settings, SettingsStore};
pub use transcription::{
    ProviderId, ProviderPreference, TranscriberFactory, TranscriptionError,
    TranscriptionOptions, TranscriptionProvider, TranscriptionResponse,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber.
///
/// Honors `RUST_LOG`, falling back to `voxrelay=debug`. Does nothing if the
/// host application already installed a global subscriber.
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting VoxRelay {}", env!("CARGO_PKG_VERSION"));
    }
}
