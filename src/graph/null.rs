use super::{AudioGraph, NodeHandle, PannerSettings, PlayNode};
use crate::error::{Result, SonalError};
use crate::math::Vec3;
use crate::source::SourceId;
use crate::spatial::Listener;
use std::collections::HashMap;

/// A node as seen by [`NullGraph`].
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub handle: NodeHandle,
    pub source: SourceId,
    pub when: f64,
    pub offset: f64,
    pub rate: f64,
    /// Buffer duration in seconds
    pub buffer_duration: f64,
    pub stopped: bool,
}

impl NodeRecord {
    /// Clock time at which the node runs off the end of its buffer.
    pub fn end_time(&self) -> f64 {
        self.when + (self.buffer_duration - self.offset) / self.rate
    }
}

/// Silent graph with a manually advanced clock.
///
/// Records every node it is asked to start together with the spatial state
/// pushed to it, which makes it the backend of choice for headless hosts and
/// for exercising the scheduler deterministically.
#[derive(Debug, Default)]
pub struct NullGraph {
    time: f64,
    next_handle: u64,
    nodes: Vec<NodeRecord>,
    source_gains: HashMap<SourceId, f32>,
    panners: HashMap<SourceId, PannerSettings>,
    panner_poses: HashMap<SourceId, (Vec3, Vec3)>,
    master_gain: f32,
    listener: Listener,
    fail_starts: bool,
}

impl NullGraph {
    pub fn new() -> Self {
        Self {
            master_gain: 1.0,
            ..Default::default()
        }
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn advance(&mut self, seconds: f64) {
        self.time += seconds;
    }

    /// Makes every subsequent `start_node` fail, to simulate a backend refusing nodes.
    pub fn set_fail_starts(&mut self, fail: bool) {
        self.fail_starts = fail;
    }

    /// Every node ever started, in creation order.
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Nodes of a source that were neither stopped nor have played out.
    pub fn live_nodes(&self, source: SourceId) -> Vec<&NodeRecord> {
        self.nodes
            .iter()
            .filter(|n| n.source == source && !n.stopped && n.end_time() > self.time)
            .collect()
    }

    pub fn source_gain(&self, source: SourceId) -> Option<f32> {
        self.source_gains.get(&source).copied()
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn panner(&self, source: SourceId) -> Option<&PannerSettings> {
        self.panners.get(&source)
    }

    pub fn panner_pose(&self, source: SourceId) -> Option<(Vec3, Vec3)> {
        self.panner_poses.get(&source).copied()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }
}

impl AudioGraph for NullGraph {
    fn current_time(&self) -> f64 {
        self.time
    }

    fn start_node(&mut self, node: PlayNode) -> Result<NodeHandle> {
        if self.fail_starts {
            return Err(SonalError::Backend("node creation refused".into()));
        }
        self.next_handle += 1;
        let handle = NodeHandle(self.next_handle);
        self.nodes.push(NodeRecord {
            handle,
            source: node.source,
            when: node.when,
            offset: node.offset,
            rate: node.rate,
            buffer_duration: node.buffer.duration(),
            stopped: false,
        });
        Ok(handle)
    }

    fn stop_node(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.handle == handle) {
            node.stopped = true;
        }
    }

    fn set_node_rate(&mut self, handle: NodeHandle, rate: f64) {
        let now = self.time;
        if let Some(node) = self.nodes.iter_mut().find(|n| n.handle == handle) {
            if now > node.when {
                node.offset += (now - node.when) * node.rate;
                node.when = now;
            }
            node.rate = rate;
        }
    }

    fn set_source_gain(&mut self, source: SourceId, gain: f32) {
        self.source_gains.insert(source, gain);
    }

    fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    fn set_panner(&mut self, source: SourceId, settings: Option<PannerSettings>) {
        match settings {
            Some(settings) => {
                self.panners.insert(source, settings);
            }
            None => {
                self.panners.remove(&source);
                self.panner_poses.remove(&source);
            }
        }
    }

    fn set_panner_pose(&mut self, source: SourceId, position: Vec3, orientation: Vec3) {
        self.panner_poses.insert(source, (position, orientation));
    }

    fn set_listener(&mut self, listener: &Listener) {
        self.listener = *listener;
    }

    fn release_source(&mut self, source: SourceId) {
        self.source_gains.remove(&source);
        self.panners.remove(&source);
        self.panner_poses.remove(&source);
        for node in self.nodes.iter_mut().filter(|n| n.source == source) {
            node.stopped = true;
        }
    }
}
