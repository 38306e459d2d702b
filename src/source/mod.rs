//! Sources and the playback core.
//!
//! A [`Source`] owns its buffer queue, its logical playback cursor and the
//! chain of native play nodes it has committed to the graph. The
//! [`SourceDriver`] bundles what the core needs from its surroundings (the
//! graph, the event channel and the lookahead window) and hosts the core
//! operations, split across:
//!
//! - `tracker`: advances the logical cursor from the audio clock
//! - `scheduler`: keeps the node chain covering the lookahead window
//! - `state`: the four-state playback machine
//! - `position`: length, tell and seek

mod position;
mod scheduler;
mod state;
mod tracker;

use crate::buffer::QueuedBuffer;
use crate::events::SonalEvent;
use crate::graph::{AudioGraph, NodeHandle, PannerSettings};
use crate::math::Vec3;
use crossbeam_channel::Sender;

/// Stable handle for a source within its context. Ids start at 1 and are never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

/// Playback state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// How the buffer queue of a source is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Undetermined,
    /// Exactly one bound buffer
    Static,
    /// Buffers appended and popped through queue operations
    Streaming,
}

/// Bookkeeping for one committed native play node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledNode {
    pub handle: NodeHandle,
    /// Resolved clock time the node starts at
    pub start_time: f64,
    /// Clock seconds the node plays for, already divided by the playback rate
    pub duration: f64,
    /// Seconds into the buffer the node starts from
    pub start_offset: f64,
}

impl ScheduledNode {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// A playback unit: buffer queue, logical cursor, scheduled nodes and parameters.
#[derive(Debug, Clone)]
pub struct Source {
    pub(crate) id: SourceId,
    pub(crate) source_type: SourceType,
    pub(crate) state: SourceState,
    pub(crate) buf_queue: Vec<QueuedBuffer>,
    pub(crate) audio_queue: Vec<ScheduledNode>,

    pub(crate) bufs_processed: usize,
    pub(crate) buf_offset: f64,
    /// `f64::NEG_INFINITY` while the cursor is not anchored to the clock
    pub(crate) buf_start_time: f64,
    /// Offset set by a seek while INITIAL/STOPPED, honoured by the next play
    pub(crate) seek_pending: bool,

    pub(crate) looping: bool,
    pub(crate) playback_rate: f64,
    pub(crate) gain: f32,
    pub(crate) min_gain: f32,
    pub(crate) max_gain: f32,

    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    pub(crate) direction: Vec3,
    pub(crate) relative: bool,
    pub(crate) panner: PannerSettings,
    /// Whether the source is currently routed through a panner
    pub(crate) spatialized: bool,
}

impl Source {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            source_type: SourceType::Undetermined,
            state: SourceState::Initial,
            buf_queue: Vec::new(),
            audio_queue: Vec::new(),
            bufs_processed: 0,
            buf_offset: 0.0,
            buf_start_time: f64::NEG_INFINITY,
            seek_pending: false,
            looping: false,
            playback_rate: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            relative: false,
            panner: PannerSettings::default(),
            spatialized: false,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn queue(&self) -> &[QueuedBuffer] {
        &self.buf_queue
    }

    pub fn scheduled(&self) -> &[ScheduledNode] {
        &self.audio_queue
    }

    pub fn bufs_processed(&self) -> usize {
        self.bufs_processed
    }

    pub fn buf_offset(&self) -> f64 {
        self.buf_offset
    }

    pub fn buf_start_time(&self) -> f64 {
        self.buf_start_time
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn min_gain(&self) -> f32 {
        self.min_gain
    }

    pub fn max_gain(&self) -> f32 {
        self.max_gain
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn panner_settings(&self) -> PannerSettings {
        self.panner
    }

    pub fn is_spatialized(&self) -> bool {
        self.spatialized
    }
}

/// Everything the playback core needs besides the source itself.
pub struct SourceDriver<'a, G: AudioGraph + ?Sized> {
    pub(crate) graph: &'a mut G,
    pub(crate) events: &'a Sender<SonalEvent>,
    /// Lookahead window in seconds
    pub(crate) lookahead: f64,
    /// Whether the host may currently produce audio
    pub(crate) eligible: bool,
}

impl<'a, G: AudioGraph + ?Sized> SourceDriver<'a, G> {
    pub fn new(graph: &'a mut G, events: &'a Sender<SonalEvent>, lookahead: f64) -> Self {
        Self {
            graph,
            events,
            lookahead,
            eligible: true,
        }
    }

    pub fn with_eligibility(mut self, eligible: bool) -> Self {
        self.eligible = eligible;
        self
    }

    pub(crate) fn emit(&self, event: SonalEvent) {
        // The receiver lives as long as the context; a closed channel only means nobody listens.
        let _ = self.events.send(event);
    }

    /// Stops and forgets every scheduled node of the source.
    pub fn stop_source_audio(&mut self, src: &mut Source) {
        for node in src.audio_queue.drain(..) {
            self.graph.stop_node(node.handle);
        }
    }

    /// Stops every scheduled node except the one currently playing.
    pub fn cancel_pending_source_audio(&mut self, src: &mut Source) {
        self.update_source_time(src);
        if src.audio_queue.len() > 1 {
            for node in src.audio_queue.drain(1..) {
                self.graph.stop_node(node.handle);
            }
        }
    }
}
