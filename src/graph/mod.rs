//! Native audio-graph seam.
//!
//! The scheduler only relies on the primitives a browser-style audio graph
//! offers: read a monotonic clock, and start a buffer playing at an absolute
//! time with an offset and a rate. There is no "finished" callback; the
//! scheduler derives completion from clock arithmetic alone.
//!
//! - [`NullGraph`]: manually clocked graph that records nodes, for headless use and tests
//! - [`SoftwareGraph`]: in-process mixer with equal-power panning and linear distance gain

mod null;
pub mod panner;
mod software;

pub use null::{NodeRecord, NullGraph};
pub use software::SoftwareGraph;

use crate::buffer::BufferData;
use crate::error::Result;
use crate::math::Vec3;
use crate::source::SourceId;
use crate::spatial::Listener;

/// Opaque handle of one committed native play node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

/// Request to play one buffer segment.
#[derive(Debug, Clone)]
pub struct PlayNode {
    pub source: SourceId,
    pub buffer: BufferData,
    /// Absolute audio-clock time at which playback starts
    pub when: f64,
    /// Seconds into the buffer to start from
    pub offset: f64,
    pub rate: f64,
}

/// Distance and cone parameters of a source's panner.
///
/// The model is fixed: linear distance attenuation and equal-power panning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PannerSettings {
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub cone_inner_angle: f32,
    pub cone_outer_angle: f32,
    pub cone_outer_gain: f32,
}

impl Default for PannerSettings {
    fn default() -> Self {
        Self {
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
        }
    }
}

/// The operations a native audio backend must provide.
///
/// Node creation is fire-and-forget: the backend owns real-time playback
/// once `start_node` returns.
pub trait AudioGraph {
    /// Current audio-clock time in seconds.
    fn current_time(&self) -> f64;

    fn start_node(&mut self, node: PlayNode) -> Result<NodeHandle>;

    /// Halts a node immediately. Unknown or finished handles are ignored.
    fn stop_node(&mut self, handle: NodeHandle);

    /// Changes the rate of a node that may already be playing.
    fn set_node_rate(&mut self, handle: NodeHandle, rate: f64);

    fn set_source_gain(&mut self, source: SourceId, gain: f32);

    fn set_master_gain(&mut self, gain: f32);

    /// Routes a source through a panner (`Some`) or straight to the output (`None`).
    fn set_panner(&mut self, source: SourceId, settings: Option<PannerSettings>);

    /// World-space position and orientation of a source's panner.
    fn set_panner_pose(&mut self, source: SourceId, position: Vec3, orientation: Vec3);

    fn set_listener(&mut self, listener: &Listener);

    /// Drops every per-source resource held by the backend.
    fn release_source(&mut self, source: SourceId);
}
