use super::{Source, SourceDriver, SourceState};
use crate::events::SonalEvent;
use crate::graph::AudioGraph;

impl<G: AudioGraph + ?Sized> SourceDriver<'_, G> {
    /// Moves a source into `state`, cancelling and rescheduling nodes as needed.
    ///
    /// - `Playing`: restarts from the top when coming from `Stopped`/`Initial`
    ///   or when already playing (unless a seek placed the cursor while the
    ///   source was idle), and resumes the stored offset when coming from `Paused`.
    /// - `Paused`: only from `Playing`; snapshots the cursor, then stops all nodes.
    /// - `Stopped`: marks the whole queue as processed. A source still in
    ///   `Initial` stays there.
    /// - `Initial`: rewinds to the start.
    pub fn set_source_state(&mut self, src: &mut Source, state: SourceState) {
        match state {
            SourceState::Playing => self.play(src),
            SourceState::Paused => {
                if src.state != SourceState::Playing {
                    return;
                }
                self.update_source_time(src);
                if src.state != SourceState::Playing {
                    // Ran out of buffers while catching up
                    return;
                }
                self.stop_source_audio(src);
                src.state = SourceState::Paused;
                src.seek_pending = false;
                log::debug!("Source {} paused at {:.4}", src.id, src.buf_offset);
                self.emit(SonalEvent::SourcePaused {
                    source_id: src.id,
                    offset: src.tell_unsynced(),
                });
            }
            SourceState::Stopped => {
                if src.state == SourceState::Initial {
                    return;
                }
                let previous = src.state;
                src.state = SourceState::Stopped;
                src.bufs_processed = src.buf_queue.len();
                src.buf_start_time = f64::NEG_INFINITY;
                src.buf_offset = 0.0;
                src.seek_pending = false;
                self.stop_source_audio(src);
                if previous != SourceState::Stopped {
                    log::debug!("Source {} stopped", src.id);
                    self.emit(SonalEvent::SourceStopped { source_id: src.id });
                }
            }
            SourceState::Initial => {
                if src.state == SourceState::Initial {
                    return;
                }
                src.state = SourceState::Initial;
                src.bufs_processed = 0;
                src.buf_start_time = f64::NEG_INFINITY;
                src.buf_offset = 0.0;
                src.seek_pending = false;
                self.stop_source_audio(src);
                log::debug!("Source {} rewound", src.id);
                self.emit(SonalEvent::SourceRewound { source_id: src.id });
            }
        }
    }

    fn play(&mut self, src: &mut Source) {
        let previous = src.state;
        if previous != SourceState::Paused && !src.seek_pending {
            src.bufs_processed = 0;
            src.buf_offset = 0.0;
            log::debug!("Source {} playing from the start", src.id);
        } else {
            log::debug!(
                "Source {} playing from buffer {} at {:.4}",
                src.id,
                src.bufs_processed,
                src.buf_offset
            );
        }

        self.stop_source_audio(src);
        src.state = SourceState::Playing;
        src.seek_pending = false;
        src.buf_start_time = f64::NEG_INFINITY;
        if previous != SourceState::Playing {
            self.emit(SonalEvent::SourceStarted { source_id: src.id });
        }
        self.schedule_source_audio(src);
    }
}
