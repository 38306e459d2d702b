//! Listener pose and the listener-space to world-space transform for sources.
//!
//! The graph's panners take world-space coordinates. A listener-relative
//! source stores its pose in the listener's frame, so whenever the listener
//! or such a source moves, its pose is pushed through a change of basis
//! built from the listener orientation and then translated by the listener
//! position. Velocity is tracked but not used (no Doppler).

use crate::graph::AudioGraph;
use crate::math::{Basis, Orientation, Vec3};
use crate::source::{Source, SourceDriver, SourceType};

/// The context-global listener ("the ears").
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Listener {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orientation: Orientation,
}

impl Listener {
    pub fn new(position: Vec3, orientation: Orientation) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            orientation,
        }
    }
}

/// World-space `(position, direction)` of a source.
///
/// Absolute sources pass through unchanged. Relative sources are rotated
/// into the listener basis (Right, Up, Back) and their position translated
/// by the listener position.
pub fn world_pose(src: &Source, listener: &Listener) -> (Vec3, Vec3) {
    if !src.is_relative() {
        return (src.position(), src.direction());
    }
    let basis = Basis::from_orientation(&listener.orientation);
    let direction = basis.rotate(src.direction());
    let position = basis.rotate(src.position()) + listener.position;
    (position, direction)
}

impl<G: AudioGraph + ?Sized> SourceDriver<'_, G> {
    /// Pushes the source's world-space pose to its panner, if it has one.
    pub fn update_source_space(&mut self, src: &Source, listener: &Listener) {
        if !src.spatialized {
            return;
        }
        let (position, direction) = world_pose(src, listener);
        self.graph.set_panner_pose(src.id, position, direction);
    }

    /// Pushes the listener to the graph and refreshes every relative source.
    pub fn update_listener_space<'s>(
        &mut self,
        listener: &Listener,
        sources: impl IntoIterator<Item = &'s Source>,
    ) {
        self.graph.set_listener(listener);
        for src in sources {
            if src.relative {
                self.update_source_space(src, listener);
            }
        }
    }

    /// Routes mono sources through a panner and everything else straight out.
    ///
    /// The decision follows the channel count of the first queued buffer.
    pub fn init_source_panner(&mut self, src: &mut Source, listener: &Listener) {
        if src.source_type == SourceType::Undetermined {
            return;
        }
        let Some(first) = src.buf_queue.first() else {
            return;
        };

        if first.data.channels() == 1 {
            if src.spatialized {
                return;
            }
            self.graph.set_panner(src.id, Some(src.panner));
            src.spatialized = true;
            log::debug!("Source {} routed through a panner", src.id);
            self.update_source_space(src, listener);
        } else if src.spatialized {
            self.graph.set_panner(src.id, None);
            src.spatialized = false;
            log::debug!("Source {} routed directly to the output", src.id);
        }
    }
}
