//! Configuration for Sonal contexts

use crate::error::{Result, SonalError};
use std::time::Duration;

/// Configuration descriptor for a Sonal context
#[derive(Debug, Clone)]
pub struct SonalContextDesc {
    /// Time span ahead of the audio clock that scheduled play nodes must cover
    pub lookahead: Duration,
    /// Cadence at which the host drives [`SonalContext::tick`](crate::SonalContext::tick)
    pub tick_interval: Duration,
    /// Output sample rate of the audio graph
    pub sample_rate: u32,
    /// Number of output channels (typically 2 for stereo)
    pub channels: u16,
    /// Frames per device callback when driving a device
    pub block_size: usize,
}

impl Default for SonalContextDesc {
    fn default() -> Self {
        Self {
            lookahead: Duration::from_millis(100),
            tick_interval: Duration::from_millis(25),
            sample_rate: 48000,
            channels: 2,
            block_size: 512,
        }
    }
}

impl SonalContextDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Lookahead window in seconds of audio-clock time.
    pub fn lookahead_secs(&self) -> f64 {
        self.lookahead.as_secs_f64()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SonalError::Configuration(
                "sample rate must be non-zero".into(),
            ));
        }
        if self.channels == 0 {
            return Err(SonalError::Configuration(
                "channel count must be non-zero".into(),
            ));
        }
        if self.lookahead.is_zero() {
            return Err(SonalError::Configuration(
                "lookahead must be non-zero".into(),
            ));
        }
        // A tick slower than the window would let the schedule run dry between ticks.
        if self.tick_interval >= self.lookahead {
            return Err(SonalError::Configuration(format!(
                "tick interval {:?} must be shorter than lookahead {:?}",
                self.tick_interval, self.lookahead
            )));
        }
        Ok(())
    }
}
