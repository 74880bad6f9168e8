//! Streaming playback pipeline.
//!
//! Wires sample streams through the audio building blocks into the device
//! graph and exposes the speaking state to observers.
//!
//! # Architecture
//!
//! ```text
//! AudioEngine (handle) ──Command──▶ ┌──────────────────────────┐
//!                                   │ EngineRunner             │
//! Ingestion task ──Converted──────▶ │  PlaybackQueue           │──▶ AudioGraph
//!   (per session)  StreamFinished   │  LifecycleState          │
//!                  StreamFailed     │  mute gate, delegate     │
//! device threads ──Captured───────▶ │                          │
//!                  BufferCompleted  └──────────────────────────┘
//!                  Reconfigured              │
//!                                            ▼
//!                              watch<bool> speaking, EngineDelegate
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use voice_stream::audio::CpalGraph;
//! use voice_stream::config::AppConfig;
//! use voice_stream::pipeline::{AudioEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let engine = AudioEngine::new(Box::new(CpalGraph::new()?), EngineConfig::from(&config));
//!     engine.setup().await?;
//!     engine.start().await?;
//!
//!     let mut speaking = engine.speaking_changes();
//!     engine.speak(vec![0.0_f32; 24_000]).await?;
//!     speaking.wait_for(|s| *s).await?;
//!     speaking.wait_for(|s| !*s).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod runner;
pub mod scheduler;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use engine::{AudioEngine, EngineConfig, EngineDelegate, SessionOutcome};
pub use runner::EngineError;
pub use scheduler::SampleStream;
pub use state::{LifecycleState, PlaybackQueue, SessionId, SessionSnapshot};
