//! Gapless scheduler
//!
//! Places decoded buffers on an output clock so each one starts exactly
//! where the previous one ends, or immediately when nothing is queued.
//! Every scheduled buffer is tracked until it finishes so it can be
//! silenced on cancellation.

use crate::audio::{AudioError, AudioOutput, PlaybackHandle};
use crate::codec::AudioBuffer;
use tracing::debug;

/// Earliest output-clock time at which the next buffer may start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    next_start_time: f64,
}

impl PlaybackCursor {
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Pick the start for a buffer of `duration` seconds and advance.
    fn claim(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start_time);
        self.next_start_time = start + duration;
        start
    }
}

/// Cursor plus the set of buffers currently queued on an output.
#[derive(Default)]
pub struct GaplessScheduler {
    cursor: PlaybackCursor,
    active: Vec<Box<dyn PlaybackHandle>>,
}

impl GaplessScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    /// Move the cursor to `now`. Done once, when playback begins.
    pub fn reset_to(&mut self, now: f64) {
        self.cursor.next_start_time = now;
    }

    /// Stop everything and return the cursor to zero.
    pub fn reset(&mut self) {
        self.stop_all();
        self.cursor = PlaybackCursor::default();
    }

    /// Schedule `buffer` on `output` and return its start time.
    pub fn schedule(
        &mut self,
        output: &mut dyn AudioOutput,
        buffer: AudioBuffer,
    ) -> Result<f64, AudioError> {
        if output.is_closed() {
            return Err(AudioError::Closed);
        }
        self.prune();

        let duration = buffer.duration();
        let previous = self.cursor;
        let start = self.cursor.claim(output.now(), duration);
        match output.play_at(buffer, start) {
            Ok(handle) => {
                debug!("Scheduled {:.3}s of audio at {:.3}", duration, start);
                self.active.push(handle);
                Ok(start)
            }
            Err(e) => {
                self.cursor = previous;
                Err(e)
            }
        }
    }

    /// Silence every tracked buffer immediately and forget them.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            debug!("Stopping {} scheduled buffers", self.active.len());
        }
        for mut handle in self.active.drain(..) {
            handle.stop();
        }
    }

    /// Number of buffers still queued or playing.
    pub fn active_count(&mut self) -> usize {
        self.prune();
        self.active.len()
    }

    fn prune(&mut self) {
        self.active.retain(|handle| !handle.is_finished());
    }
}
