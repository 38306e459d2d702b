use crate::buffer::{BufferData, BufferFormat, BufferId, BufferRegistry};
use crate::config::SonalContextDesc;
use crate::context::{SonalContext, lock_registry};
use crate::error::Result;
use crate::graph::AudioGraph;
use std::sync::{Arc, Mutex};

/// Properties of a stored buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per sample of the source PCM
    pub bits: u16,
    /// Size of the source PCM in bytes
    pub size: usize,
    pub frames: usize,
    pub duration: f64,
}

impl BufferInfo {
    fn of(data: &BufferData) -> Self {
        Self {
            sample_rate: data.sample_rate(),
            channels: data.channels(),
            bits: data.bytes_per_sample() * 8,
            size: data.frames() * data.channels() as usize * data.bytes_per_sample() as usize,
            frames: data.frames(),
            duration: data.duration(),
        }
    }
}

/// An output device: owns the buffers shared by all of its contexts.
///
/// Buffer operations take `&self`; the registry is shared with every context
/// created from the device so queue references and deletion stay consistent.
#[derive(Debug)]
pub struct SonalDevice {
    name: String,
    buffers: Arc<Mutex<BufferRegistry>>,
}

impl Default for SonalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SonalDevice {
    pub fn new() -> Self {
        Self::with_name("Sonal Default")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        let name = name.into();
        log::info!("Opened device '{}'", name);
        Self {
            name,
            buffers: Arc::new(Mutex::new(BufferRegistry::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a context rendering through `graph`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `desc` does not validate.
    pub fn create_context<G: AudioGraph>(
        &self,
        desc: SonalContextDesc,
        graph: G,
    ) -> Result<SonalContext<G>> {
        SonalContext::new(desc, graph, Arc::clone(&self.buffers))
    }

    pub fn create_buffer(&self, data: BufferData) -> Result<BufferId> {
        lock_registry(&self.buffers).create(data)
    }

    /// Decodes interleaved PCM and stores it as a new buffer.
    pub fn create_buffer_from_pcm(
        &self,
        format: BufferFormat,
        bytes: &[u8],
        sample_rate: u32,
    ) -> Result<BufferId> {
        let data = BufferData::from_pcm(format, bytes, sample_rate)?;
        self.create_buffer(data)
    }

    pub fn delete_buffer(&self, id: BufferId) -> Result<()> {
        self.delete_buffers(&[id])
    }

    /// Deletes buffers; nothing is deleted if any id is unknown or still queued.
    pub fn delete_buffers(&self, ids: &[BufferId]) -> Result<()> {
        lock_registry(&self.buffers).delete(ids)
    }

    pub fn buffer_info(&self, id: BufferId) -> Option<BufferInfo> {
        lock_registry(&self.buffers).get(id).map(BufferInfo::of)
    }

    pub fn buffer_data(&self, id: BufferId) -> Option<BufferData> {
        lock_registry(&self.buffers).get(id).cloned()
    }

    /// Number of sources currently queueing the buffer.
    pub fn buffer_ref_count(&self, id: BufferId) -> Option<u32> {
        lock_registry(&self.buffers).ref_count(id)
    }

    pub fn buffer_count(&self) -> usize {
        lock_registry(&self.buffers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SonalError;
    use crate::graph::NullGraph;

    #[test]
    fn test_buffer_info_from_pcm() {
        let device = SonalDevice::new();
        let id = device
            .create_buffer_from_pcm(BufferFormat::Stereo16, &[0u8; 400], 100)
            .unwrap();
        let info = device.buffer_info(id).unwrap();
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits, 16);
        assert_eq!(info.frames, 100);
        assert_eq!(info.size, 400);
        assert_eq!(info.duration, 1.0);
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn test_malformed_pcm_rejected() {
        let device = SonalDevice::new();
        assert!(matches!(
            device.create_buffer_from_pcm(BufferFormat::Mono16, &[0u8; 3], 8000),
            Err(SonalError::AudioFormat(_))
        ));
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_contexts_share_buffers() {
        let device = SonalDevice::new();
        let id = device.create_buffer(BufferData::from_channels(vec![vec![0.0; 8]], 8, 1).unwrap())
            .unwrap();
        let mut first = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();
        let mut second = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();

        let a = first.create_source().unwrap();
        let b = second.create_source().unwrap();
        first.queue_buffers(a, &[id]).unwrap();
        second.queue_buffers(b, &[id]).unwrap();
        assert_eq!(device.buffer_ref_count(id), Some(2));

        drop(first);
        assert!(device.delete_buffer(id).is_err());
        drop(second);
        device.delete_buffer(id).unwrap();
        assert!(device.buffer_info(id).is_none());
    }

    #[test]
    fn test_invalid_desc_rejected() {
        let device = SonalDevice::new();
        let desc = SonalContextDesc::default().sample_rate(0);
        assert!(matches!(
            device.create_context(desc, NullGraph::new()),
            Err(SonalError::Configuration(_))
        ));
    }
}
