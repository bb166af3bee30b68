//! Wiring of transport, session and audio into a running voice client

pub mod config;
pub mod connection;
pub mod orchestrator;

pub use config::VoiceConfig;
pub use connection::ConnectionManager;
pub use orchestrator::{VoiceClient, VoiceClientBuilder, VoiceHandle};
