use super::{ScheduledNode, Source, SourceDriver, SourceState};
use crate::events::SonalEvent;
use crate::graph::{AudioGraph, PlayNode};

impl<G: AudioGraph + ?Sized> SourceDriver<'_, G> {
    /// Extends the source's node chain so it covers `[now, now + lookahead]`.
    ///
    /// Each node starts exactly where the previous one ends. Calling this again
    /// before the window has advanced creates nothing. A node the graph refuses
    /// ends the pass without touching the logical cursor; the next call retries.
    pub fn schedule_source_audio(&mut self, src: &mut Source) {
        if !self.eligible || src.state != SourceState::Playing {
            return;
        }

        self.update_source_time(src);
        if src.state != SourceState::Playing {
            return;
        }

        let rate = src.playback_rate;
        let queue_len = src.buf_queue.len();
        if queue_len == 0 || !(rate > 0.0) {
            return;
        }

        let current_time = self.graph.current_time();
        let (mut start_time, mut start_offset, mut buf_cursor) = match src.audio_queue.last() {
            Some(last) => (
                last.end_time(),
                0.0,
                src.bufs_processed + src.audio_queue.len(),
            ),
            None => (
                src.buf_start_time + src.buf_offset / rate,
                src.buf_offset,
                src.bufs_processed,
            ),
        };

        let lookahead_time = current_time + self.lookahead;
        while start_time < lookahead_time {
            if buf_cursor >= queue_len {
                if src.looping {
                    buf_cursor %= queue_len;
                } else {
                    break;
                }
            }

            let buffer = &src.buf_queue[buf_cursor];
            let duration = (buffer.duration() - start_offset) / rate;
            let when = start_time.max(current_time);

            let node = PlayNode {
                source: src.id,
                buffer: buffer.data.clone(),
                when,
                offset: start_offset,
                rate,
            };
            let handle = match self.graph.start_node(node) {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("Source {} failed to schedule {}: {}", src.id, buffer.id, e);
                    self.emit(SonalEvent::NodeScheduleFailed {
                        source_id: src.id,
                        error: e.to_string(),
                    });
                    break;
                }
            };

            log::debug!(
                "Source {} queued {} at {:.4} (offset {:.4}, duration {:.4})",
                src.id,
                buffer.id,
                when,
                start_offset,
                duration
            );

            src.audio_queue.push(ScheduledNode {
                handle,
                start_time: when,
                duration,
                start_offset,
            });

            start_time = when + duration;
            start_offset = 0.0;
            buf_cursor += 1;
        }
    }
}
