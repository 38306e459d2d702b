//! Sonal: gapless buffer-queue playback and 3D positional audio on top of an
//! audio graph that can only "start this buffer at time T".
//!
//! A [`SonalDevice`] owns decoded buffers. Each [`SonalContext`] owns sources
//! and a listener over one [`AudioGraph`] backend. Call
//! [`SonalContext::tick`] on a fixed cadence (or let a [`ContextTicker`] do
//! it) to keep every playing source's node chain ahead of the audio clock.

pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
#[cfg(feature = "cpal")]
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod math;
pub mod source;
pub mod spatial;
pub mod ticker;

pub use buffer::{BufferData, BufferFormat, BufferId};
pub use config::SonalContextDesc;
pub use context::{ListenerVector, OffsetUnit, SonalContext, SourceVector};
pub use device::{BufferInfo, SonalDevice};
#[cfg(feature = "cpal")]
pub use engine::SonalEngine;
pub use error::{ErrorCode, SonalError};
pub use events::SonalEvent;
pub use graph::{AudioGraph, NullGraph, PannerSettings, SoftwareGraph};
pub use source::{SourceId, SourceState, SourceType};
pub use spatial::Listener;
pub use ticker::ContextTicker;
