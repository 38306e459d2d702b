//! Software mixer: an in-process audio graph driven by `render()`.
//!
//! The clock is the number of frames rendered so far divided by the output
//! rate. It lives outside the voice mutex so a render that finds the mutex
//! busy still advances time.

use super::panner::{azimuth, cone_gain, equal_power_gains, linear_distance_gain};
use super::{AudioGraph, NodeHandle, PannerSettings, PlayNode};
use crate::buffer::BufferData;
use crate::error::{Result, SonalError};
use crate::math::Vec3;
use crate::source::SourceId;
use crate::spatial::Listener;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

#[derive(Debug)]
struct Voice {
    handle: NodeHandle,
    source: SourceId,
    buffer: BufferData,
    start_time: f64,
    offset: f64,
    rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Strip {
    gain: f32,
    panner: Option<PannerSettings>,
    position: Vec3,
    orientation: Vec3,
}

impl Default for Strip {
    fn default() -> Self {
        Self {
            gain: 1.0,
            panner: None,
            position: Vec3::ZERO,
            orientation: Vec3::ZERO,
        }
    }
}

#[derive(Debug)]
struct MixerState {
    next_handle: u64,
    voices: Vec<Voice>,
    strips: HashMap<SourceId, Strip>,
    listener: Listener,
    master_gain: f32,
}

/// In-process mixer implementing [`AudioGraph`].
///
/// Cloning yields another handle to the same mixer, so one clone can be owned
/// by a context while another is rendered from a device callback.
#[derive(Debug, Clone)]
pub struct SoftwareGraph {
    sample_rate: u32,
    channels: u16,
    frames_rendered: Arc<AtomicU64>,
    state: Arc<Mutex<MixerState>>,
}

impl SoftwareGraph {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(SonalError::Configuration(format!(
                "invalid mixer format: {} Hz, {} channel(s)",
                sample_rate, channels
            )));
        }
        log::info!(
            "Software graph created ({} Hz, {} channel(s))",
            sample_rate,
            channels
        );
        Ok(Self {
            sample_rate,
            channels,
            frames_rendered: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(MixerState {
                next_handle: 0,
                voices: Vec::new(),
                strips: HashMap::new(),
                listener: Listener::default(),
                master_gain: 1.0,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> f64 {
        self.frames_rendered() as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Number of voices that are started or waiting for their start time.
    pub fn active_voices(&self) -> usize {
        self.lock().voices.len()
    }

    /// Mixes the next `buffer.len() / channels` frames into `buffer` (overwriting it)
    /// and advances the clock. Returns the number of frames rendered.
    ///
    /// Never blocks: if a scheduler call holds the mixer, the block is silent
    /// but the clock still moves on.
    pub fn render(&self, buffer: &mut [f32]) -> usize {
        let channels = self.channels as usize;
        let frame_count = buffer.len() / channels;
        buffer.fill(0.0);

        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                log::warn!("Mixer busy, rendering {} frames of silence", frame_count);
                self.frames_rendered
                    .fetch_add(frame_count as u64, Ordering::AcqRel);
                return frame_count;
            }
        };

        let out_rate = self.sample_rate as f64;
        let block_start = self.now();
        let listener = state.listener;
        let master_gain = state.master_gain;

        let MixerState { voices, strips, .. } = &mut *state;
        voices.retain(|voice| {
            let strip = strips.get(&voice.source).copied().unwrap_or_default();
            let (left_gain, right_gain, spatial) = strip_gains(&strip, &listener);
            let left = voice.buffer.channel(0).unwrap_or(&[]);
            let right = voice.buffer.channel(1).unwrap_or(left);
            let buffer_rate = voice.buffer.sample_rate() as f64;
            let frames = voice.buffer.frames();

            for frame_idx in 0..frame_count {
                let t = block_start + frame_idx as f64 / out_rate;
                if t < voice.start_time {
                    continue;
                }
                let position = (voice.offset + (t - voice.start_time) * voice.rate) * buffer_rate;
                if position >= frames as f64 {
                    return false;
                }

                let l = interpolate(left, position);
                let r = interpolate(right, position);
                let (out_l, out_r) = if spatial {
                    // Panned sources are mono; the right channel mirrors the left.
                    (l * left_gain, l * right_gain)
                } else {
                    (l * left_gain, r * right_gain)
                };

                let base = frame_idx * channels;
                if channels == 1 {
                    buffer[base] += (out_l + out_r) * 0.5 * master_gain;
                } else {
                    buffer[base] += out_l * master_gain;
                    buffer[base + 1] += out_r * master_gain;
                }
            }

            let block_end = block_start + frame_count as f64 / out_rate;
            let end_position = (voice.offset + (block_end - voice.start_time) * voice.rate) * buffer_rate;
            end_position < frames as f64
        });

        drop(state);
        self.frames_rendered
            .fetch_add(frame_count as u64, Ordering::AcqRel);
        frame_count
    }
}

fn strip_gains(strip: &Strip, listener: &Listener) -> (f32, f32, bool) {
    match &strip.panner {
        Some(settings) => {
            let distance = strip.position.distance(listener.position);
            let gain = strip.gain
                * linear_distance_gain(distance, settings)
                * cone_gain(strip.position, strip.orientation, listener.position, settings);
            let (l, r) = equal_power_gains(azimuth(
                strip.position,
                listener.position,
                &listener.orientation,
            ));
            (gain * l, gain * r, true)
        }
        None => (strip.gain, strip.gain, false),
    }
}

fn interpolate(samples: &[f32], position: f64) -> f32 {
    let index = position.floor() as usize;
    let Some(&a) = samples.get(index) else {
        return 0.0;
    };
    let b = samples.get(index + 1).copied().unwrap_or(a);
    let frac = (position - index as f64) as f32;
    a + (b - a) * frac
}

impl AudioGraph for SoftwareGraph {
    fn current_time(&self) -> f64 {
        self.now()
    }

    fn start_node(&mut self, node: PlayNode) -> Result<NodeHandle> {
        if !(node.rate > 0.0) {
            return Err(SonalError::Backend(format!(
                "cannot start node with rate {}",
                node.rate
            )));
        }
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = NodeHandle(state.next_handle);
        state.voices.push(Voice {
            handle,
            source: node.source,
            buffer: node.buffer,
            start_time: node.when,
            offset: node.offset,
            rate: node.rate,
        });
        Ok(handle)
    }

    fn stop_node(&mut self, handle: NodeHandle) {
        self.lock().voices.retain(|voice| voice.handle != handle);
    }

    fn set_node_rate(&mut self, handle: NodeHandle, rate: f64) {
        if !(rate > 0.0) {
            return;
        }
        let now = self.now();
        let mut state = self.lock();
        if let Some(voice) = state.voices.iter_mut().find(|v| v.handle == handle) {
            if now > voice.start_time {
                voice.offset += (now - voice.start_time) * voice.rate;
                voice.start_time = now;
            }
            voice.rate = rate;
        }
    }

    fn set_source_gain(&mut self, source: SourceId, gain: f32) {
        self.lock().strips.entry(source).or_default().gain = gain;
    }

    fn set_master_gain(&mut self, gain: f32) {
        self.lock().master_gain = gain;
    }

    fn set_panner(&mut self, source: SourceId, settings: Option<PannerSettings>) {
        self.lock().strips.entry(source).or_default().panner = settings;
    }

    fn set_panner_pose(&mut self, source: SourceId, position: Vec3, orientation: Vec3) {
        let mut state = self.lock();
        let strip = state.strips.entry(source).or_default();
        strip.position = position;
        strip.orientation = orientation;
    }

    fn set_listener(&mut self, listener: &Listener) {
        self.lock().listener = *listener;
    }

    fn release_source(&mut self, source: SourceId) {
        let mut state = self.lock();
        state.strips.remove(&source);
        state.voices.retain(|voice| voice.source != source);
    }
}
