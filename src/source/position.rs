use super::{Source, SourceDriver, SourceState};
use crate::graph::AudioGraph;

impl Source {
    /// Total duration of the queue in seconds, ignoring the playback rate.
    pub fn length(&self) -> f64 {
        self.buf_queue.iter().map(|b| b.duration()).sum()
    }

    /// Cumulative processed duration plus the live offset, without resynchronising.
    pub(crate) fn tell_unsynced(&self) -> f64 {
        let processed = self.bufs_processed.min(self.buf_queue.len());
        let consumed: f64 = self.buf_queue[..processed]
            .iter()
            .map(|b| b.duration())
            .sum();
        consumed + self.buf_offset
    }
}

impl<G: AudioGraph + ?Sized> SourceDriver<'_, G> {
    /// Playback position in seconds from the start of the queue.
    pub fn tell(&mut self, src: &mut Source) -> f64 {
        self.update_source_time(src);
        src.tell_unsynced()
    }

    /// Moves the cursor to `offset` seconds from the start of the queue.
    ///
    /// A playing source keeps playing from the new position and a paused one
    /// stays paused there. On an initial or stopped source the position is
    /// kept for the next play.
    pub fn seek(&mut self, src: &mut Source, offset: f64) {
        if src.buf_queue.is_empty() {
            log::warn!("Source {} has no buffers to seek in", src.id);
            return;
        }
        let mut remaining = offset.clamp(0.0, src.length());

        let playing = src.state == SourceState::Playing;
        if playing {
            self.stop_source_audio(src);
        }

        let last = src.buf_queue.len() - 1;
        src.bufs_processed = 0;
        while src.bufs_processed < last {
            let duration = src.buf_queue[src.bufs_processed].duration();
            if remaining <= duration {
                break;
            }
            remaining -= duration;
            src.bufs_processed += 1;
        }
        src.buf_offset = remaining;
        src.buf_start_time = f64::NEG_INFINITY;

        log::debug!(
            "Source {} seeked to {:.4} (buffer {}, offset {:.4})",
            src.id,
            offset,
            src.bufs_processed,
            src.buf_offset
        );

        match src.state {
            SourceState::Playing => self.schedule_source_audio(src),
            SourceState::Initial | SourceState::Stopped => src.seek_pending = true,
            SourceState::Paused => {}
        }
    }

    /// Changes the playback rate without losing elapsed position.
    ///
    /// The in-flight node keeps playing; its remaining duration is rescaled by
    /// `old / new` and every later node is rescheduled at the new rate.
    pub fn set_playback_rate(&mut self, src: &mut Source, rate: f64) {
        if !(rate > 0.0) {
            log::warn!("Source {} ignoring non-positive rate {}", src.id, rate);
            return;
        }
        if src.playback_rate == rate {
            return;
        }
        if src.state != SourceState::Playing {
            src.playback_rate = rate;
            return;
        }

        self.cancel_pending_source_audio(src);
        let old_rate = src.playback_rate;
        src.playback_rate = rate;
        if src.state != SourceState::Playing {
            return;
        }

        let current_time = self.graph.current_time();
        if let Some(head) = src.audio_queue.first_mut() {
            if current_time > head.start_time {
                let remaining = (head.end_time() - current_time).max(0.0);
                head.start_offset += (current_time - head.start_time) * old_rate;
                head.start_time = current_time;
                head.duration = remaining * old_rate / rate;
            } else {
                head.duration = head.duration * old_rate / rate;
            }
            self.graph.set_node_rate(head.handle, rate);
        }
        src.buf_start_time = current_time - src.buf_offset / rate;

        log::debug!(
            "Source {} rate changed {} -> {}",
            src.id,
            old_rate,
            rate
        );
        self.schedule_source_audio(src);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::events::SonalEvent;

    #[test]
    fn test_scenario_two_buffers() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0, 2.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);

        h.graph.set_time(0.5);
        assert!((h.driver().tell(&mut src) - 0.5).abs() < 1e-9);

        h.graph.set_time(1.2);
        assert!((h.driver().tell(&mut src) - 1.2).abs() < 1e-9);
        assert_eq!(src.bufs_processed, 1);

        h.graph.set_time(3.0);
        assert!((h.driver().tell(&mut src) - 3.0).abs() < 1e-9);
        assert_eq!(src.state, SourceState::Stopped);
    }

    #[test]
    fn test_tell_monotonic_while_playing_with_ticks() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[0.3, 0.2, 0.5]);
        h.driver().set_source_state(&mut src, SourceState::Playing);

        let mut last = 0.0;
        for step in 1..40 {
            h.graph.set_time(step as f64 * 0.025);
            h.driver().schedule_source_audio(&mut src);
            assert_gapless(&src);
            let now = h.driver().tell(&mut src);
            assert!(now + 1e-9 >= last, "position went back: {} -> {}", last, now);
            last = now;
        }
    }

    #[test]
    fn test_tell_frozen_while_paused() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);
        h.graph.set_time(0.4);
        h.driver().set_source_state(&mut src, SourceState::Paused);
        h.graph.set_time(0.9);
        assert!((h.driver().tell(&mut src) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_seek_round_trip() {
        let mut h = Harness::new();
        for &offset in &[0.0, 0.5, 1.0, 1.7, 2.9] {
            let mut src = streaming_source(&[1.0, 2.0]);
            h.driver().set_source_state(&mut src, SourceState::Playing);
            h.driver().seek(&mut src, offset);
            assert_eq!(src.state, SourceState::Playing);
            assert!((h.driver().tell(&mut src) - offset).abs() < 1e-9);
        }
    }

    #[test]
    fn test_seek_to_end_of_playing_queue_stops() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0, 2.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);
        h.drain();

        h.driver().seek(&mut src, 3.0);
        // Nothing is left to play, so the source finishes on the spot
        assert_eq!(src.state, SourceState::Stopped);
        assert!((h.driver().tell(&mut src) - 3.0).abs() < 1e-9);
        assert!(h.graph.live_nodes(src.id()).is_empty());
        assert_eq!(
            h.drain(),
            vec![SonalEvent::SourceStopped {
                source_id: src.id()
            }]
        );
    }

    #[test]
    fn test_seek_to_end_of_paused_queue() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0, 2.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);
        h.graph.set_time(0.2);
        h.driver().set_source_state(&mut src, SourceState::Paused);

        h.driver().seek(&mut src, 3.0);
        assert_eq!(src.state, SourceState::Paused);
        assert!((h.driver().tell(&mut src) - 3.0).abs() < 1e-9);

        // Resuming at the very end stops at once and keeps the position
        h.driver().set_source_state(&mut src, SourceState::Playing);
        assert_eq!(src.state, SourceState::Stopped);
        assert!((h.driver().tell(&mut src) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_on_looping_source_wraps() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[0.5, 0.25]);
        src.looping = true;
        h.driver().set_source_state(&mut src, SourceState::Playing);

        h.graph.set_time(0.3);
        h.driver().seek(&mut src, 0.6);
        assert_eq!(src.state, SourceState::Playing);
        assert_eq!(src.bufs_processed, 1);
        assert!((h.driver().tell(&mut src) - 0.6).abs() < 1e-9);
        h.drain();

        for step in 13..=30 {
            let t = step as f64 * 0.025;
            h.graph.set_time(t);
            h.driver().schedule_source_audio(&mut src);
            assert_gapless(&src);
            let expected = (0.6 + (t - 0.3)) % 0.75;
            let got = h.driver().tell(&mut src);
            let diff = (got - expected).abs();
            assert!(
                diff < 1e-6 || (diff - 0.75).abs() < 1e-6,
                "t={} expected {} got {}",
                t,
                expected,
                got
            );
        }
        assert_eq!(src.state, SourceState::Playing);
        assert!(h.drain().contains(&SonalEvent::SourceLooped {
            source_id: src.id()
        }));
    }

    #[test]
    fn test_seek_keeps_pause() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0, 2.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);
        h.graph.set_time(0.2);
        h.driver().set_source_state(&mut src, SourceState::Paused);
        h.driver().seek(&mut src, 1.5);
        assert_eq!(src.state, SourceState::Paused);
        assert!(src.scheduled().is_empty());
        assert!((h.driver().tell(&mut src) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_seek_before_play_is_honoured() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0, 2.0]);
        h.driver().seek(&mut src, 1.25);
        assert_eq!(src.state, SourceState::Initial);
        assert!((h.driver().tell(&mut src) - 1.25).abs() < 1e-9);

        h.driver().set_source_state(&mut src, SourceState::Playing);
        assert_eq!(src.bufs_processed, 1);
        assert!((src.scheduled()[0].start_offset - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_loop_position_wraps() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[0.5, 0.25]);
        src.looping = true;
        h.driver().set_source_state(&mut src, SourceState::Playing);

        for step in 1..200 {
            let t = step as f64 * 0.025;
            h.graph.set_time(t);
            h.driver().schedule_source_audio(&mut src);
            assert_gapless(&src);
            let expected = t % 0.75;
            let got = h.driver().tell(&mut src);
            // At an exact wrap boundary either end of the loop is the same position
            let diff = (got - expected).abs();
            assert!(
                diff < 1e-6 || (diff - 0.75).abs() < 1e-6,
                "t={} expected {} got {}",
                t,
                expected,
                got
            );
        }
        assert_eq!(src.state, SourceState::Playing);
    }

    #[test]
    fn test_rate_change_keeps_position() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[10.0]);
        h.driver().set_source_state(&mut src, SourceState::Playing);

        h.graph.set_time(1.0);
        h.driver().set_playback_rate(&mut src, 2.0);
        assert!((h.driver().tell(&mut src) - 1.0).abs() < 1e-9);

        let head = src.scheduled()[0];
        // 9 s left at rate 1 become 4.5 s at rate 2
        assert!((head.duration - 4.5).abs() < 1e-9);
        assert_eq!(h.graph.nodes()[0].rate, 2.0);
        assert_eq!(h.graph.nodes().len(), 1);

        h.graph.set_time(2.0);
        assert!((h.driver().tell(&mut src) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_change_while_stopped_just_stores() {
        let mut h = Harness::new();
        let mut src = streaming_source(&[1.0]);
        h.driver().set_playback_rate(&mut src, 0.5);
        assert_eq!(src.playback_rate(), 0.5);
        h.driver().set_playback_rate(&mut src, -1.0);
        assert_eq!(src.playback_rate(), 0.5);
    }
}
