use super::{Source, SourceDriver, SourceState};
use crate::events::SonalEvent;
use crate::graph::AudioGraph;

impl<G: AudioGraph + ?Sized> SourceDriver<'_, G> {
    /// Advances the logical cursor of a playing source to the current audio-clock time.
    ///
    /// Nodes whose end time has passed are retired. While nodes remain the offset is
    /// read off the head node; past the scheduled window the cursor is walked through
    /// the buffer queue analytically, wrapping when looping and stopping the source
    /// once a non-looping queue is exhausted.
    pub fn update_source_time(&mut self, src: &mut Source) {
        if src.state != SourceState::Playing {
            return;
        }
        if !(src.playback_rate > 0.0) {
            log::warn!(
                "Source {} has non-positive rate {}, not advancing",
                src.id,
                src.playback_rate
            );
            return;
        }
        if src.buf_queue.is_empty() || (src.looping && src.length() <= 0.0) {
            log::warn!("Source {} has nothing to play, stopping", src.id);
            self.set_source_state(src, SourceState::Stopped);
            return;
        }

        let current_time = self.graph.current_time();
        let rate = src.playback_rate;

        if !src.buf_start_time.is_finite() {
            src.buf_start_time = current_time - src.buf_offset / rate;
            src.buf_offset = 0.0;
        }

        while let Some(node) = src.audio_queue.first().copied() {
            let end_time = node.end_time();
            if current_time < end_time {
                break;
            }
            src.audio_queue.remove(0);
            src.buf_start_time = end_time;
            src.buf_offset = 0.0;
            self.advance_buffer(src);
        }

        if let Some(node) = src.audio_queue.first() {
            let elapsed = (current_time - node.start_time).max(0.0);
            src.buf_offset = node.start_offset + elapsed * rate;
            return;
        }

        loop {
            if src.bufs_processed >= src.buf_queue.len() {
                if src.looping {
                    self.wrap(src);
                } else {
                    log::debug!("Source {} ran out of queued buffers", src.id);
                    self.set_source_state(src, SourceState::Stopped);
                    break;
                }
            }

            let duration = src.buf_queue[src.bufs_processed].duration();
            let next_start_time = src.buf_start_time + duration / rate;
            if current_time < next_start_time {
                src.buf_offset = (current_time - src.buf_start_time) * rate;
                break;
            }

            src.buf_start_time = next_start_time;
            src.buf_offset = 0.0;
            src.bufs_processed += 1;
        }
    }

    fn advance_buffer(&mut self, src: &mut Source) {
        src.bufs_processed += 1;
        if src.looping && src.bufs_processed >= src.buf_queue.len() {
            self.wrap(src);
        }
    }

    fn wrap(&mut self, src: &mut Source) {
        src.bufs_processed %= src.buf_queue.len();
        log::debug!("Source {} looped", src.id);
        self.emit(SonalEvent::SourceLooped { source_id: src.id });
    }
}
