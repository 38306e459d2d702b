use crate::config::SonalContextDesc;
use crate::error::{Result, SonalError};
use crate::graph::SoftwareGraph;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Plays a [`SoftwareGraph`] on the default output device.
///
/// The device callback renders the graph directly, which also advances the
/// graph's audio clock. Hand a clone of the same graph to
/// [`SonalDevice::create_context`](crate::SonalDevice::create_context) so the
/// scheduler reads the clock the device is consuming.
pub struct SonalEngine {
    desc: SonalContextDesc,
    graph: SoftwareGraph,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_rendered: Arc<AtomicU64>,
}

impl SonalEngine {
    /// Create an engine for `graph`; its format must match `desc`.
    pub fn new(desc: SonalContextDesc, graph: SoftwareGraph) -> Result<Self> {
        desc.validate()?;
        if graph.sample_rate() != desc.sample_rate || graph.channels() != desc.channels {
            return Err(SonalError::Configuration(format!(
                "graph format {} Hz / {} ch does not match {} Hz / {} ch",
                graph.sample_rate(),
                graph.channels(),
                desc.sample_rate,
                desc.channels
            )));
        }
        Ok(Self {
            desc,
            graph,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
            frames_rendered: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Open the default output device and start rendering
    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            SonalError::AudioDevice("No default output device available".into())
        })?;

        let config = cpal::StreamConfig {
            channels: self.desc.channels,
            sample_rate: cpal::SampleRate(self.desc.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.desc.block_size as u32),
        };

        let default_config = device.default_output_config().map_err(|e| {
            SonalError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&device, &config)?,
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&device, &config)?,
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&device, &config)?,
            format => {
                return Err(SonalError::AudioFormat(format!(
                    "Unsupported sample format {:?}",
                    format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| SonalError::AudioDevice(format!("Failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);
        log::info!(
            "Engine started on {} Hz / {} ch, block {}",
            self.desc.sample_rate,
            self.desc.channels,
            self.desc.block_size
        );
        Ok(())
    }

    /// Stop the stream. The graph keeps its clock and voices.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            drop(stream);
            log::info!("Engine stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Frames rendered by the device callback since the engine was created.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn graph(&self) -> &SoftwareGraph {
        &self.graph
    }

    pub fn desc(&self) -> &SonalContextDesc {
        &self.desc
    }

    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let graph = self.graph.clone();
        let is_running = Arc::clone(&self.is_running);
        let frames_rendered = Arc::clone(&self.frames_rendered);
        let mut scratch: Vec<f32> = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if !is_running.load(Ordering::Relaxed) {
                        data.fill(T::from_sample(0.0f32));
                        return;
                    }

                    scratch.resize(data.len(), 0.0);
                    let frames = graph.render(&mut scratch);

                    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(*sample);
                    }
                    frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SonalError::AudioDevice(format!("Failed to build stream: {}", e)))
    }
}

impl Drop for SonalEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mismatch_rejected() {
        let graph = SoftwareGraph::new(44100, 2).unwrap();
        let desc = SonalContextDesc::default().sample_rate(48000);
        assert!(matches!(
            SonalEngine::new(desc, graph),
            Err(SonalError::Configuration(_))
        ));
    }

    #[test]
    fn test_new_engine_is_idle() {
        let graph = SoftwareGraph::new(48000, 2).unwrap();
        let engine = SonalEngine::new(SonalContextDesc::default(), graph).unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.frames_rendered(), 0);
    }
}
