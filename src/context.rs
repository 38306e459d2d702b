use crate::buffer::{BufferData, BufferId, BufferRegistry, QueuedBuffer};
use crate::config::SonalContextDesc;
use crate::error::{ErrorCode, ErrorLatch, Result, SonalError};
use crate::events::SonalEvent;
use crate::graph::{AudioGraph, PannerSettings};
use crate::math::{Orientation, Vec3, vec3_from_slice};
use crate::source::{Source, SourceDriver, SourceId, SourceState, SourceType};
use crate::spatial::Listener;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Unit of a source playback offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    Seconds,
    /// Sample frames at the rate of the first queued buffer
    Samples,
    /// Bytes of the first queued buffer's PCM layout (frames × channels × bytes per sample)
    Bytes,
}

impl OffsetUnit {
    fn to_seconds(self, value: f64, format: &BufferData) -> f64 {
        let rate = format.sample_rate() as f64;
        match self {
            Self::Seconds => value,
            Self::Samples => value / rate,
            Self::Bytes => value / frame_bytes(format) / rate,
        }
    }

    fn scale_seconds(self, seconds: f64, format: &BufferData) -> f64 {
        let rate = format.sample_rate() as f64;
        match self {
            Self::Seconds => seconds,
            Self::Samples => seconds * rate,
            Self::Bytes => seconds * rate * frame_bytes(format),
        }
    }
}

fn frame_bytes(format: &BufferData) -> f64 {
    format.channels() as f64 * format.bytes_per_sample() as f64
}

/// Three-component source vectors settable from raw slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceVector {
    Position,
    Velocity,
    Direction,
}

/// Listener vectors settable from raw slices. Orientation takes six
/// components: forward followed by up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerVector {
    Position,
    Velocity,
    Orientation,
}

pub(crate) fn lock_registry(buffers: &Mutex<BufferRegistry>) -> MutexGuard<'_, BufferRegistry> {
    buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Looks up and format-checks a whole batch before taking any reference.
fn retain_batch(
    registry: &mut BufferRegistry,
    ids: &[BufferId],
    mut reference: Option<BufferData>,
) -> Result<Vec<QueuedBuffer>> {
    for &id in ids {
        let data = registry
            .get(id)
            .ok_or_else(|| SonalError::InvalidName(format!("{} does not exist", id)))?;
        let first = reference.get_or_insert_with(|| data.clone());
        if !first.same_format(data) {
            return Err(SonalError::InvalidOperation(format!(
                "{} ({} Hz, {} ch, {} bytes) does not match the queue ({} Hz, {} ch, {} bytes)",
                id,
                data.sample_rate(),
                data.channels(),
                data.bytes_per_sample(),
                first.sample_rate(),
                first.channels(),
                first.bytes_per_sample()
            )));
        }
    }
    ids.iter().map(|&id| registry.retain(id)).collect()
}

/// Number of fully consumed buffers a caller may unqueue.
fn processed_count(src: &Source) -> usize {
    if src.looping {
        0
    } else {
        src.bufs_processed.min(src.buf_queue.len())
    }
}

fn effective_gain(src: &Source) -> f32 {
    src.gain.max(src.min_gain).min(src.max_gain)
}

/// An audio context: sources, the listener and the periodic scheduler over one graph.
///
/// `SonalContext` is the validated entry point to the playback core. Every
/// call checks its handles and values, latches the first failure in the
/// context's error register (see [`get_error`](Self::get_error)) and returns
/// it as `Err`. All methods are synchronous; wrap the context in a mutex when
/// a [`ContextTicker`](crate::ContextTicker) drives [`tick`](Self::tick) from
/// another thread.
pub struct SonalContext<G: AudioGraph> {
    desc: SonalContextDesc,
    graph: G,
    buffers: Arc<Mutex<BufferRegistry>>,
    sources: BTreeMap<SourceId, Source>,
    next_source_id: u32,
    listener: Listener,
    master_gain: f32,
    error: ErrorLatch,
    eligible: bool,
    event_sender: Sender<SonalEvent>,
    event_receiver: Receiver<SonalEvent>,
}

impl<G: AudioGraph> SonalContext<G> {
    pub(crate) fn new(
        desc: SonalContextDesc,
        mut graph: G,
        buffers: Arc<Mutex<BufferRegistry>>,
    ) -> Result<Self> {
        desc.validate()?;
        let listener = Listener::default();
        graph.set_listener(&listener);
        graph.set_master_gain(1.0);
        let (event_sender, event_receiver) = unbounded();

        log::info!(
            "Context created (lookahead {:?}, tick {:?})",
            desc.lookahead,
            desc.tick_interval
        );

        Ok(Self {
            desc,
            graph,
            buffers,
            sources: BTreeMap::new(),
            next_source_id: 1,
            listener,
            master_gain: 1.0,
            error: ErrorLatch::new(),
            eligible: true,
            event_sender,
            event_receiver,
        })
    }

    pub fn desc(&self) -> &SonalContextDesc {
        &self.desc
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut G {
        &mut self.graph
    }

    /// Current audio-clock time of the underlying graph, in seconds.
    pub fn current_time(&self) -> f64 {
        self.graph.current_time()
    }

    /// Returns the first error latched since the last call and clears it.
    pub fn get_error(&mut self) -> ErrorCode {
        self.error.take()
    }

    /// Drains every pending event.
    pub fn poll_events(&self) -> Vec<SonalEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// Marks whether the host may currently produce audio.
    ///
    /// While ineligible, [`tick`](Self::tick) and on-demand scheduling create
    /// and retire nothing, so playback resumes cleanly instead of catching up.
    pub fn set_eligible(&mut self, eligible: bool) {
        if self.eligible != eligible {
            log::info!("Context eligibility changed to {}", eligible);
        }
        self.eligible = eligible;
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    /// Extends the node chain of every source to cover the lookahead window.
    ///
    /// Called by the host on a fixed cadence ([`SonalContextDesc::tick_interval`]).
    pub fn tick(&mut self) {
        if !self.eligible {
            return;
        }
        let mut driver = SourceDriver::new(
            &mut self.graph,
            &self.event_sender,
            self.desc.lookahead_secs(),
        );
        for src in self.sources.values_mut() {
            driver.schedule_source_audio(src);
        }
    }

    fn fail(&mut self, err: SonalError) -> SonalError {
        log::warn!("{}", err);
        self.error.latch(err.code());
        err
    }

    fn check_source(&mut self, id: SourceId) -> Result<()> {
        if self.sources.contains_key(&id) {
            Ok(())
        } else {
            Err(self.fail(SonalError::InvalidName(format!("{} does not exist", id))))
        }
    }

    fn check_value(&mut self, valid: bool, describe: impl FnOnce() -> String) -> Result<()> {
        if valid {
            Ok(())
        } else {
            Err(self.fail(SonalError::InvalidValue(describe())))
        }
    }

    /// Runs `f` with a driver over this context's graph and the given source.
    fn with_source<R>(
        &mut self,
        id: SourceId,
        f: impl FnOnce(&mut SourceDriver<'_, G>, &mut Source, &Listener) -> R,
    ) -> Result<R> {
        let Some(src) = self.sources.get_mut(&id) else {
            return Err(self.fail(SonalError::InvalidName(format!("{} does not exist", id))));
        };
        let mut driver = SourceDriver::new(
            &mut self.graph,
            &self.event_sender,
            self.desc.lookahead_secs(),
        )
        .with_eligibility(self.eligible);
        Ok(f(&mut driver, src, &self.listener))
    }

    /// Read access to a source.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if the source does not exist.
    pub fn source(&mut self, id: SourceId) -> Result<&Source> {
        self.check_source(id)?;
        Ok(&self.sources[&id])
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.keys().copied().collect()
    }

    // Sources

    /// Creates a source in the `Initial` state. Ids are never reused.
    ///
    /// # Errors
    /// `OutOfMemory` once the id space is used up.
    pub fn create_source(&mut self) -> Result<SourceId> {
        let Some(next) = self.next_source_id.checked_add(1) else {
            return Err(self.fail(SonalError::OutOfMemory("source ids exhausted".into())));
        };
        let id = SourceId(self.next_source_id);
        self.next_source_id = next;
        self.sources.insert(id, Source::new(id));
        log::debug!("Created {}", id);
        Ok(id)
    }

    /// Deletes a source, stopping its nodes and releasing its buffers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if the source does not exist.
    pub fn delete_source(&mut self, id: SourceId) -> Result<()> {
        let Some(mut src) = self.sources.remove(&id) else {
            return Err(self.fail(SonalError::InvalidName(format!("{} does not exist", id))));
        };
        SourceDriver::new(&mut self.graph, &self.event_sender, self.desc.lookahead_secs())
            .stop_source_audio(&mut src);
        self.graph.release_source(id);

        let mut registry = lock_registry(&self.buffers);
        for queued in &src.buf_queue {
            registry.release(queued.id);
        }
        log::debug!("Deleted {}", id);
        Ok(())
    }

    /// Deletes a batch of sources. Nothing is deleted unless every id exists.
    pub fn delete_sources(&mut self, ids: &[SourceId]) -> Result<()> {
        for &id in ids {
            self.check_source(id)?;
        }
        for &id in ids {
            // Duplicates in the batch were removed by an earlier iteration
            if self.sources.contains_key(&id) {
                self.delete_source(id)?;
            }
        }
        Ok(())
    }

    /// Binds a single buffer to a source, making it static, or unbinds with `None`.
    ///
    /// The previous queue is released and the position reset.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the source or buffer does not exist
    /// - `InvalidOperation` if the source is playing or paused
    pub fn bind_buffer(&mut self, id: SourceId, buffer: Option<BufferId>) -> Result<()> {
        self.check_source(id)?;
        let state = self.sources[&id].state;
        if matches!(state, SourceState::Playing | SourceState::Paused) {
            return Err(self.fail(SonalError::InvalidOperation(format!(
                "cannot bind a buffer to {} while {:?}",
                id, state
            ))));
        }

        let retained = buffer
            .map(|buffer| lock_registry(&self.buffers).retain(buffer))
            .transpose();
        let bound = match retained {
            Ok(bound) => bound,
            Err(e) => return Err(self.fail(e)),
        };

        let released = self.with_source(id, |driver, src, listener| {
            driver.stop_source_audio(src);
            let released: Vec<BufferId> = src.buf_queue.drain(..).map(|b| b.id).collect();
            src.bufs_processed = 0;
            src.buf_offset = 0.0;
            src.buf_start_time = f64::NEG_INFINITY;
            src.seek_pending = false;
            match bound {
                Some(queued) => {
                    log::debug!("{} bound to {}", queued.id, src.id);
                    src.buf_queue.push(queued);
                    src.source_type = SourceType::Static;
                    driver.init_source_panner(src, listener);
                }
                None => src.source_type = SourceType::Undetermined,
            }
            released
        })?;

        let mut registry = lock_registry(&self.buffers);
        for buffer in released {
            registry.release(buffer);
        }
        Ok(())
    }

    /// Appends buffers to a streaming source's queue.
    ///
    /// Every buffer must share the sample rate, channel count and sample size
    /// of the first buffer in the queue. Queueing onto a looping source
    /// reschedules everything after the in-flight node so the new buffers
    /// join the loop in order.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the source or any buffer does not exist
    /// - `InvalidOperation` if the source is static or a format differs
    pub fn queue_buffers(&mut self, id: SourceId, buffers: &[BufferId]) -> Result<()> {
        self.check_source(id)?;
        if buffers.is_empty() {
            return Ok(());
        }
        let src = &self.sources[&id];
        if src.source_type == SourceType::Static {
            return Err(self.fail(SonalError::InvalidOperation(format!(
                "cannot queue onto static {}",
                id
            ))));
        }
        let reference = src.buf_queue.first().map(|b| b.data.clone());

        let retained = retain_batch(&mut lock_registry(&self.buffers), buffers, reference);
        let queued = match retained {
            Ok(queued) => queued,
            Err(e) => return Err(self.fail(e)),
        };

        self.with_source(id, |driver, src, listener| {
            let was_empty = src.buf_queue.is_empty();
            log::debug!("Queued {} buffer(s) on {}", queued.len(), src.id);
            src.buf_queue.extend(queued);
            src.source_type = SourceType::Streaming;
            if was_empty {
                driver.init_source_panner(src, listener);
            }
            if src.looping {
                driver.cancel_pending_source_audio(src);
            }
            driver.schedule_source_audio(src);
        })
    }

    /// Removes `count` processed buffers from the front of the queue and
    /// returns their ids.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the source does not exist
    /// - `InvalidOperation` if the source is static
    /// - `InvalidValue` if fewer than `count` buffers have been processed
    pub fn unqueue_buffers(&mut self, id: SourceId, count: usize) -> Result<Vec<BufferId>> {
        let (source_type, processed) = self.with_source(id, |driver, src, _| {
            driver.update_source_time(src);
            (src.source_type, processed_count(src))
        })?;
        if source_type == SourceType::Static {
            return Err(self.fail(SonalError::InvalidOperation(format!(
                "cannot unqueue from static {}",
                id
            ))));
        }
        self.check_value(count <= processed, || {
            format!(
                "cannot unqueue {} buffer(s) from {}, only {} processed",
                count, id, processed
            )
        })?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let removed = self.with_source(id, |_, src, _| {
            let removed: Vec<BufferId> = src.buf_queue.drain(..count).map(|b| b.id).collect();
            src.bufs_processed -= count;
            if src.buf_queue.is_empty() {
                src.source_type = SourceType::Undetermined;
            }
            log::debug!("Unqueued {} buffer(s) from {}", count, src.id);
            removed
        })?;

        let mut registry = lock_registry(&self.buffers);
        for &buffer in &removed {
            registry.release(buffer);
        }
        Ok(removed)
    }

    pub fn buffers_queued(&mut self, id: SourceId) -> Result<usize> {
        self.source(id).map(|src| src.buf_queue.len())
    }

    /// Buffers fully played so far. Always 0 for a looping source.
    pub fn buffers_processed(&mut self, id: SourceId) -> Result<usize> {
        self.with_source(id, |driver, src, _| {
            driver.update_source_time(src);
            processed_count(src)
        })
    }

    pub fn source_type(&mut self, id: SourceId) -> Result<SourceType> {
        self.source(id).map(Source::source_type)
    }

    // Playback

    pub fn play(&mut self, id: SourceId) -> Result<()> {
        self.set_state(id, SourceState::Playing)
    }

    pub fn pause(&mut self, id: SourceId) -> Result<()> {
        self.set_state(id, SourceState::Paused)
    }

    pub fn stop(&mut self, id: SourceId) -> Result<()> {
        self.set_state(id, SourceState::Stopped)
    }

    pub fn rewind(&mut self, id: SourceId) -> Result<()> {
        self.set_state(id, SourceState::Initial)
    }

    /// Applies a state change to several sources. Nothing changes unless every id exists.
    pub fn set_states(&mut self, ids: &[SourceId], state: SourceState) -> Result<()> {
        for &id in ids {
            self.check_source(id)?;
        }
        for &id in ids {
            self.set_state(id, state)?;
        }
        Ok(())
    }

    fn set_state(&mut self, id: SourceId, state: SourceState) -> Result<()> {
        self.with_source(id, |driver, src, _| driver.set_source_state(src, state))
    }

    /// Current state, resynchronised with the audio clock.
    pub fn source_state(&mut self, id: SourceId) -> Result<SourceState> {
        self.with_source(id, |driver, src, _| {
            driver.update_source_time(src);
            src.state
        })
    }

    /// Playback position from the start of the queue.
    ///
    /// Samples and bytes are expressed in the format of the first queued
    /// buffer; a source without buffers reports 0.
    pub fn offset(&mut self, id: SourceId, unit: OffsetUnit) -> Result<f64> {
        self.with_source(id, |driver, src, _| {
            let seconds = driver.tell(src);
            match src.buf_queue.first() {
                Some(first) => unit.scale_seconds(seconds, &first.data),
                None => 0.0,
            }
        })
    }

    /// Seeks a source. A playing source keeps playing from the new offset.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the source does not exist
    /// - `InvalidOperation` if the source has no buffers
    /// - `InvalidValue` if the offset is negative or past the end of the queue
    pub fn set_offset(&mut self, id: SourceId, unit: OffsetUnit, value: f64) -> Result<()> {
        self.check_source(id)?;
        let src = &self.sources[&id];
        let Some(first) = src.buf_queue.first() else {
            return Err(self.fail(SonalError::InvalidOperation(format!(
                "{} has no buffers to seek in",
                id
            ))));
        };
        let seconds = unit.to_seconds(value, &first.data);
        let length = src.length();
        self.check_value(value.is_finite() && seconds >= 0.0 && seconds <= length, || {
            format!("offset {} {:?} outside [0, {}] s", value, unit, length)
        })?;
        self.with_source(id, |driver, src, _| driver.seek(src, seconds))
    }

    // Parameters

    /// Sets the playback rate (pitch). Scheduled audio is rescaled in place.
    pub fn set_playback_rate(&mut self, id: SourceId, rate: f64) -> Result<()> {
        self.check_source(id)?;
        self.check_value(rate.is_finite() && rate > 0.0, || {
            format!("playback rate {} must be positive", rate)
        })?;
        self.with_source(id, |driver, src, _| driver.set_playback_rate(src, rate))
    }

    pub fn playback_rate(&mut self, id: SourceId) -> Result<f64> {
        self.source(id).map(Source::playback_rate)
    }

    /// Toggles looping; a playing source reschedules everything after its in-flight node.
    pub fn set_looping(&mut self, id: SourceId, looping: bool) -> Result<()> {
        self.with_source(id, |driver, src, _| {
            if src.looping == looping {
                return;
            }
            src.looping = looping;
            if src.state == SourceState::Playing {
                driver.cancel_pending_source_audio(src);
                driver.schedule_source_audio(src);
            }
        })
    }

    pub fn is_looping(&mut self, id: SourceId) -> Result<bool> {
        self.source(id).map(Source::is_looping)
    }

    pub fn set_gain(&mut self, id: SourceId, gain: f32) -> Result<()> {
        self.check_source(id)?;
        self.check_value(gain.is_finite() && gain >= 0.0, || {
            format!("gain {} must be non-negative", gain)
        })?;
        self.with_source(id, |driver, src, _| {
            src.gain = gain;
            driver.graph.set_source_gain(src.id, effective_gain(src));
        })
    }

    pub fn gain(&mut self, id: SourceId) -> Result<f32> {
        self.source(id).map(Source::gain)
    }

    pub fn set_min_gain(&mut self, id: SourceId, min_gain: f32) -> Result<()> {
        self.check_source(id)?;
        let max_gain = self.sources[&id].max_gain;
        self.check_value((0.0..=max_gain).contains(&min_gain), || {
            format!("min gain {} outside [0, {}]", min_gain, max_gain)
        })?;
        self.with_source(id, |driver, src, _| {
            src.min_gain = min_gain;
            driver.graph.set_source_gain(src.id, effective_gain(src));
        })
    }

    pub fn min_gain(&mut self, id: SourceId) -> Result<f32> {
        self.source(id).map(Source::min_gain)
    }

    pub fn set_max_gain(&mut self, id: SourceId, max_gain: f32) -> Result<()> {
        self.check_source(id)?;
        let min_gain = self.sources[&id].min_gain;
        self.check_value((min_gain..=1.0).contains(&max_gain), || {
            format!("max gain {} outside [{}, 1]", max_gain, min_gain)
        })?;
        self.with_source(id, |driver, src, _| {
            src.max_gain = max_gain;
            driver.graph.set_source_gain(src.id, effective_gain(src));
        })
    }

    pub fn max_gain(&mut self, id: SourceId) -> Result<f32> {
        self.source(id).map(Source::max_gain)
    }

    /// Moves a source; its panner is updated immediately.
    pub fn set_position(&mut self, id: SourceId, position: Vec3) -> Result<()> {
        self.check_source(id)?;
        self.check_value(position.is_finite(), || {
            format!("position {} is not finite", position)
        })?;
        self.with_source(id, |driver, src, listener| {
            src.position = position;
            driver.update_source_space(src, listener);
        })
    }

    pub fn position(&mut self, id: SourceId) -> Result<Vec3> {
        self.source(id).map(Source::position)
    }

    /// Stores the velocity. No Doppler shift is derived from it.
    pub fn set_velocity(&mut self, id: SourceId, velocity: Vec3) -> Result<()> {
        self.check_source(id)?;
        self.check_value(velocity.is_finite(), || {
            format!("velocity {} is not finite", velocity)
        })?;
        self.with_source(id, |_, src, _| src.velocity = velocity)
    }

    pub fn velocity(&mut self, id: SourceId) -> Result<Vec3> {
        self.source(id).map(Source::velocity)
    }

    pub fn set_direction(&mut self, id: SourceId, direction: Vec3) -> Result<()> {
        self.check_source(id)?;
        self.check_value(direction.is_finite(), || {
            format!("direction {} is not finite", direction)
        })?;
        self.with_source(id, |driver, src, listener| {
            src.direction = direction;
            driver.update_source_space(src, listener);
        })
    }

    pub fn direction(&mut self, id: SourceId) -> Result<Vec3> {
        self.source(id).map(Source::direction)
    }

    /// Sets a source vector from raw components.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` unless `values` holds exactly three components.
    pub fn set_source_vector(
        &mut self,
        id: SourceId,
        which: SourceVector,
        values: &[f32],
    ) -> Result<()> {
        self.check_source(id)?;
        let Some(value) = vec3_from_slice(values) else {
            return Err(self.fail(SonalError::InvalidValue(format!(
                "{:?} needs 3 components, got {}",
                which,
                values.len()
            ))));
        };
        match which {
            SourceVector::Position => self.set_position(id, value),
            SourceVector::Velocity => self.set_velocity(id, value),
            SourceVector::Direction => self.set_direction(id, value),
        }
    }

    /// Switches between world-space and listener-relative pose.
    pub fn set_relative(&mut self, id: SourceId, relative: bool) -> Result<()> {
        self.with_source(id, |driver, src, listener| {
            src.relative = relative;
            driver.update_source_space(src, listener);
        })
    }

    pub fn is_relative(&mut self, id: SourceId) -> Result<bool> {
        self.source(id).map(Source::is_relative)
    }

    pub fn panner_settings(&mut self, id: SourceId) -> Result<PannerSettings> {
        self.source(id).map(Source::panner_settings)
    }

    fn update_panner(
        &mut self,
        id: SourceId,
        name: &str,
        value: f32,
        range: std::ops::RangeInclusive<f32>,
        apply: impl FnOnce(&mut PannerSettings),
    ) -> Result<()> {
        self.check_source(id)?;
        self.check_value(range.contains(&value), || {
            format!("{} {} outside [{}, {}]", name, value, range.start(), range.end())
        })?;
        self.with_source(id, |driver, src, _| {
            apply(&mut src.panner);
            if src.spatialized {
                driver.graph.set_panner(src.id, Some(src.panner));
            }
        })
    }

    pub fn set_reference_distance(&mut self, id: SourceId, distance: f32) -> Result<()> {
        self.update_panner(id, "reference distance", distance, 0.0..=f32::MAX, |p| {
            p.ref_distance = distance
        })
    }

    pub fn set_max_distance(&mut self, id: SourceId, distance: f32) -> Result<()> {
        self.update_panner(id, "max distance", distance, 0.0..=f32::MAX, |p| {
            p.max_distance = distance
        })
    }

    pub fn set_rolloff_factor(&mut self, id: SourceId, factor: f32) -> Result<()> {
        self.update_panner(id, "rolloff factor", factor, 0.0..=f32::MAX, |p| {
            p.rolloff_factor = factor
        })
    }

    /// Cone angles are in degrees.
    pub fn set_cone_inner_angle(&mut self, id: SourceId, angle: f32) -> Result<()> {
        self.update_panner(id, "cone inner angle", angle, 0.0..=360.0, |p| {
            p.cone_inner_angle = angle
        })
    }

    pub fn set_cone_outer_angle(&mut self, id: SourceId, angle: f32) -> Result<()> {
        self.update_panner(id, "cone outer angle", angle, 0.0..=360.0, |p| {
            p.cone_outer_angle = angle
        })
    }

    pub fn set_cone_outer_gain(&mut self, id: SourceId, gain: f32) -> Result<()> {
        self.update_panner(id, "cone outer gain", gain, 0.0..=1.0, |p| {
            p.cone_outer_gain = gain
        })
    }

    // Listener and master output

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn set_listener_position(&mut self, position: Vec3) -> Result<()> {
        self.check_value(position.is_finite(), || {
            format!("listener position {} is not finite", position)
        })?;
        self.listener.position = position;
        self.update_listener();
        Ok(())
    }

    pub fn set_listener_velocity(&mut self, velocity: Vec3) -> Result<()> {
        self.check_value(velocity.is_finite(), || {
            format!("listener velocity {} is not finite", velocity)
        })?;
        self.listener.velocity = velocity;
        Ok(())
    }

    pub fn set_listener_orientation(&mut self, orientation: Orientation) -> Result<()> {
        self.check_value(
            orientation.forward.is_finite() && orientation.up.is_finite(),
            || format!("listener orientation {:?} is not finite", orientation),
        )?;
        self.listener.orientation = orientation;
        self.update_listener();
        Ok(())
    }

    /// Sets a listener vector from raw components (3, or 6 for orientation).
    pub fn set_listener_vector(&mut self, which: ListenerVector, values: &[f32]) -> Result<()> {
        let parsed = match which {
            ListenerVector::Orientation if values.len() == 6 => {
                vec3_from_slice(&values[..3]).zip(vec3_from_slice(&values[3..]))
            }
            ListenerVector::Orientation => None,
            _ => vec3_from_slice(values).map(|v| (v, Vec3::ZERO)),
        };
        let Some((first, second)) = parsed else {
            return Err(self.fail(SonalError::InvalidValue(format!(
                "listener {:?} got {} components",
                which,
                values.len()
            ))));
        };
        match which {
            ListenerVector::Position => self.set_listener_position(first),
            ListenerVector::Velocity => self.set_listener_velocity(first),
            ListenerVector::Orientation => {
                self.set_listener_orientation(Orientation::new(first, second))
            }
        }
    }

    fn update_listener(&mut self) {
        let mut driver = SourceDriver::new(
            &mut self.graph,
            &self.event_sender,
            self.desc.lookahead_secs(),
        );
        driver.update_listener_space(&self.listener, self.sources.values());
        driver.emit(SonalEvent::ListenerChanged);
    }

    pub fn set_master_gain(&mut self, gain: f32) -> Result<()> {
        self.check_value(gain.is_finite() && gain >= 0.0, || {
            format!("master gain {} must be non-negative", gain)
        })?;
        self.master_gain = gain;
        self.graph.set_master_gain(gain);
        Ok(())
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }
}

impl<G: AudioGraph> Drop for SonalContext<G> {
    fn drop(&mut self) {
        let mut registry = lock_registry(&self.buffers);
        for src in self.sources.values() {
            for queued in &src.buf_queue {
                registry.release(queued.id);
            }
        }
        log::info!("Context dropped with {} source(s)", self.sources.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SonalDevice;
    use crate::graph::NullGraph;

    fn mono(seconds: f64) -> BufferData {
        let frames = (seconds * 1000.0).round() as usize;
        BufferData::from_channels(vec![vec![0.0; frames]], 1000, 2).unwrap()
    }

    fn stereo(seconds: f64) -> BufferData {
        let frames = (seconds * 1000.0).round() as usize;
        BufferData::from_channels(vec![vec![0.0; frames]; 2], 1000, 2).unwrap()
    }

    fn setup() -> (SonalDevice, SonalContext<NullGraph>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = SonalDevice::new();
        let context = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();
        (device, context)
    }

    fn stop_events(events: &[SonalEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SonalEvent::SourceStopped { .. }))
            .count()
    }

    #[test]
    fn test_two_buffer_scenario() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let b = device.create_buffer(mono(2.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a, b]).unwrap();
        ctx.play(src).unwrap();

        for step in 1..=20 {
            ctx.graph_mut().set_time(step as f64 * 0.025);
            ctx.tick();
        }
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 0.5).abs() < 1e-9);

        ctx.graph_mut().set_time(1.2);
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 1.2).abs() < 1e-9);
        assert_eq!(ctx.buffers_processed(src).unwrap(), 1);

        ctx.graph_mut().set_time(3.0);
        ctx.tick();
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(ctx.source_state(src).unwrap(), SourceState::Stopped);

        ctx.graph_mut().set_time(4.0);
        ctx.tick();
        assert_eq!(stop_events(&ctx.poll_events()), 1);
    }

    #[test]
    fn test_static_binding_rules() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let b = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();

        ctx.bind_buffer(src, Some(a)).unwrap();
        assert_eq!(ctx.source_type(src).unwrap(), SourceType::Static);
        assert!(matches!(
            ctx.queue_buffers(src, &[b]),
            Err(SonalError::InvalidOperation(_))
        ));
        assert!(matches!(
            ctx.unqueue_buffers(src, 0),
            Err(SonalError::InvalidOperation(_))
        ));

        ctx.play(src).unwrap();
        assert!(matches!(
            ctx.bind_buffer(src, Some(b)),
            Err(SonalError::InvalidOperation(_))
        ));

        ctx.stop(src).unwrap();
        ctx.bind_buffer(src, None).unwrap();
        assert_eq!(ctx.source_type(src).unwrap(), SourceType::Undetermined);
        assert_eq!(device.buffer_ref_count(a), Some(0));
        device.delete_buffers(&[a, b]).unwrap();
    }

    #[test]
    fn test_unqueue_only_processed() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(0.5)).unwrap();
        let b = device.create_buffer(mono(0.5)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a, b]).unwrap();

        assert!(matches!(
            ctx.unqueue_buffers(src, 1),
            Err(SonalError::InvalidValue(_))
        ));

        ctx.play(src).unwrap();
        ctx.graph_mut().set_time(0.6);
        assert_eq!(ctx.unqueue_buffers(src, 1).unwrap(), vec![a]);
        assert_eq!(ctx.buffers_queued(src).unwrap(), 1);
        assert_eq!(ctx.buffers_processed(src).unwrap(), 0);
        // Position within the remaining buffer survives the unqueue
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 0.1).abs() < 1e-9);

        ctx.stop(src).unwrap();
        assert_eq!(ctx.unqueue_buffers(src, 1).unwrap(), vec![b]);
        assert_eq!(ctx.source_type(src).unwrap(), SourceType::Undetermined);
        device.delete_buffers(&[a, b]).unwrap();
    }

    #[test]
    fn test_looping_reports_nothing_processed() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(0.5)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        ctx.set_looping(src, true).unwrap();
        ctx.play(src).unwrap();
        ctx.graph_mut().set_time(1.7);
        assert_eq!(ctx.buffers_processed(src).unwrap(), 0);
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 0.2).abs() < 1e-9);
        assert!(
            ctx.poll_events()
                .iter()
                .any(|e| matches!(e, SonalEvent::SourceLooped { .. }))
        );
    }

    #[test]
    fn test_queued_buffers_cannot_be_deleted() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        assert_eq!(device.buffer_ref_count(a), Some(1));
        assert!(matches!(
            device.delete_buffer(a),
            Err(SonalError::InvalidOperation(_))
        ));

        ctx.delete_source(src).unwrap();
        assert_eq!(device.buffer_ref_count(a), Some(0));
        device.delete_buffer(a).unwrap();
    }

    #[test]
    fn test_dropping_context_releases_buffers() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        drop(ctx);
        device.delete_buffer(a).unwrap();
    }

    #[test]
    fn test_mixed_formats_rejected() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let b = device.create_buffer(stereo(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        assert!(matches!(
            ctx.queue_buffers(src, &[a, b]),
            Err(SonalError::InvalidOperation(_))
        ));
        // Nothing from the failed batch was retained
        assert_eq!(device.buffer_ref_count(a), Some(0));
        assert_eq!(ctx.buffers_queued(src).unwrap(), 0);

        ctx.queue_buffers(src, &[b]).unwrap();
        assert!(ctx.queue_buffers(src, &[a]).is_err());
    }

    #[test]
    fn test_error_latch_keeps_first() {
        let (_device, mut ctx) = setup();
        let src = ctx.create_source().unwrap();
        assert!(ctx.set_gain(src, -1.0).is_err());
        assert!(ctx.play(SourceId(99)).is_err());
        assert_eq!(ctx.get_error(), ErrorCode::InvalidValue);
        assert_eq!(ctx.get_error(), ErrorCode::NoError);

        assert!(ctx.set_source_vector(src, SourceVector::Position, &[1.0, 2.0]).is_err());
        assert_eq!(ctx.get_error(), ErrorCode::InvalidValue);
        assert!(ctx.delete_source(SourceId(42)).is_err());
        assert_eq!(ctx.get_error(), ErrorCode::InvalidName);
    }

    #[test]
    fn test_value_validation() {
        let (_device, mut ctx) = setup();
        let src = ctx.create_source().unwrap();
        assert!(ctx.set_playback_rate(src, 0.0).is_err());
        assert!(ctx.set_playback_rate(src, f64::NAN).is_err());
        ctx.set_max_gain(src, 0.5).unwrap();
        assert!(ctx.set_min_gain(src, 0.8).is_err());
        ctx.set_min_gain(src, 0.2).unwrap();
        assert!(ctx.set_max_gain(src, 0.1).is_err());
        assert!(ctx.set_cone_outer_angle(src, 400.0).is_err());
        assert!(ctx.set_cone_outer_gain(src, 1.5).is_err());
        assert!(ctx.set_rolloff_factor(src, -0.1).is_err());
        ctx.set_reference_distance(src, 2.0).unwrap();
        assert_eq!(ctx.panner_settings(src).unwrap().ref_distance, 2.0);
        assert!(ctx.set_master_gain(-1.0).is_err());
    }

    #[test]
    fn test_gain_is_clamped_for_the_graph() {
        let (_device, mut ctx) = setup();
        let src = ctx.create_source().unwrap();
        ctx.set_max_gain(src, 0.5).unwrap();
        ctx.set_gain(src, 0.9).unwrap();
        assert_eq!(ctx.gain(src).unwrap(), 0.9);
        assert_eq!(ctx.graph().source_gain(src), Some(0.5));
        ctx.set_master_gain(0.25).unwrap();
        assert_eq!(ctx.graph().master_gain(), 0.25);
    }

    #[test]
    fn test_source_ids_not_reused() {
        let (_device, mut ctx) = setup();
        let first = ctx.create_source().unwrap();
        ctx.delete_source(first).unwrap();
        let second = ctx.create_source().unwrap();
        assert_ne!(first, second);
        assert_eq!(second.raw(), 2);
        assert!(ctx.source(first).is_err());
    }

    #[test]
    fn test_source_id_exhaustion_latches_out_of_memory() {
        let (_device, mut ctx) = setup();
        ctx.next_source_id = u32::MAX - 1;
        let last = ctx.create_source().unwrap();
        assert_eq!(last.raw(), u32::MAX - 1);
        assert!(matches!(
            ctx.create_source(),
            Err(SonalError::OutOfMemory(_))
        ));
        assert_eq!(ctx.get_error(), ErrorCode::OutOfMemory);
        assert_eq!(ctx.source_ids(), vec![last]);
    }

    #[test]
    fn test_ineligible_tick_is_silent() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();

        ctx.set_eligible(false);
        ctx.play(src).unwrap();
        ctx.graph_mut().set_time(0.5);
        ctx.tick();
        assert!(ctx.graph().nodes().is_empty());

        ctx.set_eligible(true);
        ctx.tick();
        let node = &ctx.graph().nodes()[0];
        assert_eq!(node.when, 0.5);
        assert_eq!(node.offset, 0.0);
    }

    #[test]
    fn test_offset_units() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let b = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        assert!(matches!(
            ctx.set_offset(src, OffsetUnit::Seconds, 0.0),
            Err(SonalError::InvalidOperation(_))
        ));
        ctx.queue_buffers(src, &[a, b]).unwrap();

        ctx.set_offset(src, OffsetUnit::Samples, 1500.0).unwrap();
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 1.5).abs() < 1e-9);
        // Mono 16-bit: two bytes per frame
        ctx.set_offset(src, OffsetUnit::Bytes, 1000.0).unwrap();
        assert!((ctx.offset(src, OffsetUnit::Samples).unwrap() - 500.0).abs() < 1e-6);
        assert!((ctx.offset(src, OffsetUnit::Bytes).unwrap() - 1000.0).abs() < 1e-6);

        assert!(matches!(
            ctx.set_offset(src, OffsetUnit::Seconds, 2.5),
            Err(SonalError::InvalidValue(_))
        ));
        assert!(ctx.set_offset(src, OffsetUnit::Seconds, -0.1).is_err());

        // A seek before play is honoured by play
        ctx.set_offset(src, OffsetUnit::Seconds, 1.25).unwrap();
        ctx.play(src).unwrap();
        let node = &ctx.graph().nodes()[0];
        assert!((node.offset - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_pause_resume_through_context() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(2.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        ctx.play(src).unwrap();

        ctx.graph_mut().set_time(0.8);
        ctx.pause(src).unwrap();
        ctx.graph_mut().set_time(3.0);
        ctx.tick();
        assert_eq!(ctx.source_state(src).unwrap(), SourceState::Paused);
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 0.8).abs() < 1e-9);

        ctx.play(src).unwrap();
        ctx.graph_mut().set_time(3.5);
        assert!((ctx.offset(src, OffsetUnit::Seconds).unwrap() - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_queue_onto_looping_source_reschedules() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(0.04)).unwrap();
        let b = device.create_buffer(mono(0.03)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        ctx.set_looping(src, true).unwrap();
        ctx.play(src).unwrap();
        // a, a, a cover the 0.1 s window
        assert_eq!(ctx.graph().live_nodes(src).len(), 3);

        ctx.queue_buffers(src, &[b]).unwrap();
        // After the in-flight `a` the loop continues with `b`, then `a` again
        let durations: Vec<f64> = ctx
            .graph()
            .live_nodes(src)
            .iter()
            .map(|n| n.buffer_duration)
            .collect();
        assert_eq!(durations.len(), 3);
        for (got, expected) in durations.iter().zip([0.04, 0.03, 0.04]) {
            assert!((got - expected).abs() < 1e-12);
        }
        assert_eq!(ctx.source(src).unwrap().scheduled().len(), 3);
    }

    #[test]
    fn test_listener_moves_relative_sources() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(mono(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        ctx.set_relative(src, true).unwrap();
        ctx.set_source_vector(src, SourceVector::Position, &[0.0, 0.0, -1.0])
            .unwrap();

        ctx.set_listener_vector(ListenerVector::Orientation, &[0.0, 0.0, -1.0, 0.0, 1.0, 0.0])
            .unwrap();
        ctx.set_listener_position(Vec3::new(5.0, 0.0, 0.0)).unwrap();

        let (position, _) = ctx.graph().panner_pose(src).unwrap();
        assert!((position - Vec3::new(5.0, 0.0, -1.0)).length() < 1e-6);
        assert!(ctx.poll_events().contains(&SonalEvent::ListenerChanged));
        assert!(ctx.set_listener_vector(ListenerVector::Orientation, &[0.0; 3]).is_err());
    }

    #[test]
    fn test_stereo_source_is_not_spatialized() {
        let (device, mut ctx) = setup();
        let a = device.create_buffer(stereo(1.0)).unwrap();
        let src = ctx.create_source().unwrap();
        ctx.queue_buffers(src, &[a]).unwrap();
        assert!(!ctx.source(src).unwrap().is_spatialized());
        ctx.set_position(src, Vec3::new(1.0, 0.0, 0.0)).unwrap();
        assert!(ctx.graph().panner_pose(src).is_none());
    }
}
