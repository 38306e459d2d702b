//! Background thread that drives [`SonalContext::tick`] on a fixed cadence.

use crate::context::SonalContext;
use crate::error::{Result, SonalError};
use crate::graph::AudioGraph;
use crossbeam_channel::{Sender, bounded, select, tick};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs the context scheduler every `interval` until stopped or dropped.
///
/// Each tick holds the context mutex for its whole pass, so ticks never
/// interleave with API calls made through the same mutex.
pub struct ContextTicker {
    stop_sender: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl ContextTicker {
    pub fn spawn<G>(context: Arc<Mutex<SonalContext<G>>>, interval: Duration) -> Result<Self>
    where
        G: AudioGraph + Send + 'static,
    {
        if interval.is_zero() {
            return Err(SonalError::Configuration(
                "tick interval must be non-zero".into(),
            ));
        }

        let (stop_sender, stop_receiver) = bounded::<()>(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let tick_count = Arc::clone(&ticks);

        let thread = thread::Builder::new()
            .name("sonal-ticker".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        // A message or a dropped sender both mean stop
                        recv(stop_receiver) -> _ => break,
                        recv(ticker) -> _ => {
                            let mut context = context
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            context.tick();
                            tick_count.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                log::debug!("Ticker thread exiting");
            })
            .map_err(|e| SonalError::Backend(format!("Failed to spawn ticker thread: {}", e)))?;

        log::info!("Ticker started ({:?} interval)", interval);
        Ok(Self {
            stop_sender: Some(stop_sender),
            thread: Some(thread),
            ticks,
        })
    }

    /// Number of ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stops the thread and waits for the tick in progress to finish.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        if thread.join().is_err() {
            log::error!("Ticker thread panicked");
        }
        log::info!("Ticker stopped after {} tick(s)", self.ticks());
    }
}

impl Drop for ContextTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferData;
    use crate::config::SonalContextDesc;
    use crate::device::SonalDevice;
    use crate::graph::NullGraph;
    use std::time::Instant;

    fn wait_for_ticks(ticker: &ContextTicker, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticker.ticks() < count {
            assert!(Instant::now() < deadline, "ticker stalled");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_ticker_extends_schedule() {
        let device = SonalDevice::new();
        let buffer = device.create_buffer(
            BufferData::from_channels(vec![vec![0.0; 500]], 1000, 2).unwrap(),
        )
        .unwrap();
        let context = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();
        let context = Arc::new(Mutex::new(context));

        let src = {
            let mut ctx = context.lock().unwrap();
            let src = ctx.create_source().unwrap();
            ctx.queue_buffers(src, &[buffer, buffer]).unwrap();
            ctx.play(src).unwrap();
            assert_eq!(ctx.graph().nodes().len(), 1);
            ctx.graph_mut().set_time(0.45);
            src
        };

        let mut ticker = ContextTicker::spawn(Arc::clone(&context), Duration::from_millis(2)).unwrap();
        wait_for_ticks(&ticker, 2);
        ticker.stop();
        assert!(!ticker.is_running());

        let ctx = context.lock().unwrap();
        let nodes = ctx.graph().nodes();
        assert_eq!(nodes.len(), 2);
        assert!((nodes[1].when - 0.5).abs() < 1e-9);
        assert_eq!(ctx.source_ids(), vec![src]);
    }

    #[test]
    fn test_stop_halts_ticks() {
        let device = SonalDevice::new();
        let context = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();
        let context = Arc::new(Mutex::new(context));
        let mut ticker = ContextTicker::spawn(Arc::clone(&context), Duration::from_millis(1)).unwrap();
        wait_for_ticks(&ticker, 1);
        ticker.stop();
        let ticks = ticker.ticks();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticker.ticks(), ticks);
        // Stopping twice is harmless
        ticker.stop();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let device = SonalDevice::new();
        let context = device
            .create_context(SonalContextDesc::default(), NullGraph::new())
            .unwrap();
        assert!(ContextTicker::spawn(Arc::new(Mutex::new(context)), Duration::ZERO).is_err());
    }
}
