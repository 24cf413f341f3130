//! Realtime Voice - duplex speech conversation over a streaming WebSocket
//!
//! This library provides the pieces of a live voice session with a remote
//! speech model:
//! - Microphone capture, resampling and framing to the wire profile
//! - Gapless playback of streamed speech with generation-tagged buffers
//! - A turn-taking state machine with barge-in
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames   ┌──────────────┐  JSON   ┌──────────────┐
//! │   Capture    ├──────────►│  Connection  │◄───────►│   Realtime   │
//! │  (callback)  │           │ writer/reader│         │   service    │
//! └──────▲───────┘           └──────┬───────┘         └──────────────┘
//!        │ mute                     │ envelopes
//! ┌──────┴──────────────────────────▼───────┐
//! │          VoiceEngine (control)          │
//! │  dispatch │ conversation │ interruption │
//! └──────────────────┬──────────────────────┘
//!                    │ buffers       ▲ drained
//!             ┌──────▼───────────────┴──┐
//!             │   Playback (callback)   │
//!             └─────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod realtime;

pub use audio::{AudioDevices, CpalDevices};
pub use config::Config;
pub use engine::{ConversationState, EngineCommand, EngineEvent, VoiceEngine};
pub use error::{Error, Result};
pub use realtime::{Connector, WsConnector};
