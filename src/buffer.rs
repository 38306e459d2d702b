//! Decoded audio buffers and the buffer registry.
//!
//! Buffers are immutable once created. Sources reference them through
//! [`BufferData`] clones (cheap, `Arc`-backed) while the [`BufferRegistry`]
//! keeps the authoritative table and the per-buffer reference count that
//! guards deletion.

use crate::error::{Result, SonalError};
use std::collections::HashMap;
use std::sync::Arc;

/// Stable handle for a buffer. Ids start at 1 and are never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

/// Raw PCM layouts accepted by [`BufferData::from_pcm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    /// Unsigned 8-bit
    Mono8,
    /// Signed 16-bit little endian
    Mono16,
    Stereo8,
    Stereo16,
    /// 32-bit float little endian
    MonoFloat32,
    StereoFloat32,
}

impl BufferFormat {
    pub fn channels(self) -> u16 {
        match self {
            Self::Mono8 | Self::Mono16 | Self::MonoFloat32 => 1,
            Self::Stereo8 | Self::Stereo16 | Self::StereoFloat32 => 2,
        }
    }

    pub fn bytes_per_sample(self) -> u16 {
        match self {
            Self::Mono8 | Self::Stereo8 => 1,
            Self::Mono16 | Self::Stereo16 => 2,
            Self::MonoFloat32 | Self::StereoFloat32 => 4,
        }
    }

    /// Size of one interleaved frame in bytes.
    pub fn frame_size(self) -> usize {
        self.channels() as usize * self.bytes_per_sample() as usize
    }
}

/// Immutable decoded audio, shared between the registry, sources and the graph.
#[derive(Debug, Clone)]
pub struct BufferData {
    inner: Arc<BufferDataInner>,
}

#[derive(Debug)]
struct BufferDataInner {
    /// One vector per channel
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
    bytes_per_sample: u16,
    frames: usize,
}

impl BufferData {
    /// Builds a buffer from already decoded per-channel samples.
    pub fn from_channels(
        channels: Vec<Vec<f32>>,
        sample_rate: u32,
        bytes_per_sample: u16,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SonalError::AudioFormat("sample rate must be non-zero".into()));
        }
        if channels.is_empty() {
            return Err(SonalError::AudioFormat(
                "buffer needs at least one channel".into(),
            ));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(SonalError::AudioFormat(
                "all channels must have the same length".into(),
            ));
        }

        Ok(Self {
            inner: Arc::new(BufferDataInner {
                channels,
                sample_rate,
                bytes_per_sample,
                frames,
            }),
        })
    }

    /// Decodes interleaved PCM bytes into per-channel f32 samples.
    pub fn from_pcm(format: BufferFormat, bytes: &[u8], sample_rate: u32) -> Result<Self> {
        let frame_size = format.frame_size();
        if bytes.len() % frame_size != 0 {
            return Err(SonalError::AudioFormat(format!(
                "payload of {} bytes is not a multiple of the {}-byte frame",
                bytes.len(),
                frame_size
            )));
        }

        let channel_count = format.channels() as usize;
        let bps = format.bytes_per_sample() as usize;
        let frames = bytes.len() / frame_size;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];

        for frame in bytes.chunks_exact(frame_size) {
            for (channel, sample) in channels.iter_mut().zip(frame.chunks_exact(bps)) {
                let value = match bps {
                    1 => sample[0] as f32 * (1.0 / 128.0) - 1.0,
                    2 => i16::from_le_bytes([sample[0], sample[1]]) as f32 * (1.0 / 32768.0),
                    _ => f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]),
                };
                channel.push(value);
            }
        }

        log::debug!(
            "Decoded {:?} buffer: {} frames at {} Hz",
            format,
            frames,
            sample_rate
        );

        Self::from_channels(channels, sample_rate, format.bytes_per_sample())
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels.len() as u16
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.inner.bytes_per_sample
    }

    pub fn frames(&self) -> usize {
        self.inner.frames
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.inner.frames as f64 / self.inner.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.inner.channels.get(index).map(Vec::as_slice)
    }

    /// Whether two buffers may share one source queue.
    pub fn same_format(&self, other: &BufferData) -> bool {
        self.sample_rate() == other.sample_rate()
            && self.channels() == other.channels()
            && self.bytes_per_sample() == other.bytes_per_sample()
    }
}

/// A buffer reference held in a source queue.
#[derive(Debug, Clone)]
pub struct QueuedBuffer {
    pub id: BufferId,
    pub data: BufferData,
}

impl QueuedBuffer {
    pub fn duration(&self) -> f64 {
        self.data.duration()
    }
}

#[derive(Debug)]
struct RegistryEntry {
    data: BufferData,
    ref_count: u32,
}

/// Table of live buffers with reference counts.
///
/// Deleted ids are dropped from the table and never handed out again.
#[derive(Debug)]
pub struct BufferRegistry {
    buffers: HashMap<BufferId, RegistryEntry>,
    next_id: u32,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Stores `data` under a fresh id.
    ///
    /// # Errors
    /// `OutOfMemory` once the id space is used up.
    pub fn create(&mut self, data: BufferData) -> Result<BufferId> {
        let next = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| SonalError::OutOfMemory("buffer ids exhausted".into()))?;
        let id = BufferId(self.next_id);
        self.next_id = next;
        self.buffers.insert(
            id,
            RegistryEntry {
                data,
                ref_count: 0,
            },
        );
        log::debug!("Created {}", id);
        Ok(id)
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferData> {
        self.buffers.get(&id).map(|entry| &entry.data)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn ref_count(&self, id: BufferId) -> Option<u32> {
        self.buffers.get(&id).map(|entry| entry.ref_count)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Looks up a buffer and takes a queue reference on it.
    pub fn retain(&mut self, id: BufferId) -> Result<QueuedBuffer> {
        let entry = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| SonalError::InvalidName(format!("{} does not exist", id)))?;
        entry.ref_count += 1;
        Ok(QueuedBuffer {
            id,
            data: entry.data.clone(),
        })
    }

    /// Drops a queue reference. Unknown ids are ignored.
    pub fn release(&mut self, id: BufferId) {
        if let Some(entry) = self.buffers.get_mut(&id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Deletes a batch of buffers; the batch is validated as a whole first.
    ///
    /// Id 0 is accepted and ignored.
    pub fn delete(&mut self, ids: &[BufferId]) -> Result<()> {
        for &id in ids {
            if id.0 == 0 {
                continue;
            }
            match self.buffers.get(&id) {
                None => {
                    return Err(SonalError::InvalidName(format!("{} does not exist", id)));
                }
                Some(entry) if entry.ref_count > 0 => {
                    return Err(SonalError::InvalidOperation(format!(
                        "{} is still queued on {} source(s)",
                        id, entry.ref_count
                    )));
                }
                Some(_) => {}
            }
        }

        for id in ids {
            if self.buffers.remove(id).is_some() {
                log::debug!("Deleted {}", id);
            }
        }
        Ok(())
    }
}
