pub mod cache;
pub mod captions;
pub mod cmd;
pub mod config;
pub mod downloader;
pub mod drift;
pub mod engine;
mod error;
pub mod ffmpeg;
pub mod jobs;
pub mod media_url;
pub mod paths;
pub mod playback;
pub mod soundboard;
pub mod state;
pub mod subtitles;

pub use engine::Engine;
pub use error::{EngineError, FailureKind, Result};
