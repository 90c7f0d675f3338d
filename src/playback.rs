/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Component J: the boundary between a session's jitter queue and whatever
//! audio engine actually renders sound. [`HostSink`] is the capability the
//! host must provide; [`PlaybackAdapter`] is the glue this receiver drives it
//! through.

use crate::jitter_queue::{JitterQueue, PushOutcome};
use tracing::warn;

/// What a session needs from the host's audio mixing engine. Implemented by
/// the host once per physical output; this receiver never assumes a
/// particular backend.
pub trait HostSink: Send {
    /// Current output latency in microseconds, as measured by the host.
    fn get_latency_us(&self) -> u64;

    /// Requests the host hold at least this much latency before playback,
    /// giving the jitter queue room to absorb network jitter. Returns the
    /// actual latency the host settled on, which may differ from the
    /// request (device buffer granularity, hardware minimums).
    fn set_requested_latency_us(&mut self, latency_us: u64) -> u64;

    /// Retunes the resampler feeding this sink to `rate` input samples per
    /// second, compensating for clock drift against the sender.
    fn set_input_rate(&mut self, rate: u32);

    /// Asks the host to roll playback back by `bytes` (0 for "don't move the
    /// cursor, just re-render"), optionally nudging its reported latency,
    /// re-rendering before the next output period, and/or flushing pending
    /// output entirely.
    fn request_rewind(&mut self, bytes: usize, adjust_latency: bool, request_render: bool, flush: bool);

    /// Fixed hardware/driver delay downstream of the jitter queue, in
    /// microseconds; used together with [`HostSink::get_latency_us`] to
    /// compute true end-to-end latency.
    fn render_delay_us(&self) -> u64;

    /// Number of underrun events the sink has observed since the session
    /// started, used to decide when a rewind is warranted.
    fn underrun_count(&self) -> u64;
}

/// Drives a [`HostSink`] from a session's jitter queue: pulls bytes for
/// playback, forwards rewinds, and tracks the max-rewind budget the queue
/// should honor.
pub struct PlaybackAdapter<S: HostSink> {
    sink: S,
}

impl<S: HostSink> PlaybackAdapter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Pulls `len` bytes of playback data out of `queue`, consuming them.
    /// Silence is returned (via the queue's own pre-fill/seek behavior) if
    /// not enough real data has arrived yet.
    pub fn pop(&mut self, queue: &mut JitterQueue, len: usize) -> Vec<u8> {
        let data = queue.peek(len);
        queue.drop_front(data.len());
        data
    }

    /// Rewinds the jitter queue by up to `bytes` and tells the host to
    /// replay the same span. Called by the host itself (the `rewind`
    /// callback of section 6), not by the ingest path.
    pub fn rewind(&mut self, queue: &mut JitterQueue, bytes: usize) -> usize {
        let rewound = queue.rewind(bytes);
        if rewound > 0 {
            self.sink.request_rewind(rewound, false, false, false);
        }
        rewound
    }

    pub fn set_max_rewind(&mut self, queue: &mut JitterQueue, bytes: usize) {
        queue.set_max_rewind(bytes);
    }

    /// Attaches to the host sink at the given requested latency, returning
    /// the actual sink latency the host reports back (section 3,
    /// `sink_latency_us`).
    pub fn attach(&mut self, requested_latency_us: u64) -> u64 {
        self.sink.set_requested_latency_us(requested_latency_us)
    }

    pub fn set_input_rate(&mut self, rate: u32) {
        self.sink.set_input_rate(rate);
    }

    pub fn get_latency_us(&self) -> u64 {
        self.sink.get_latency_us()
    }

    pub fn render_delay_us(&self) -> u64 {
        self.sink.render_delay_us()
    }

    pub fn underrun_count(&self) -> u64 {
        self.sink.underrun_count()
    }

    /// Applies a [`PushOutcome`] produced by pushing newly arrived RTP
    /// payload into the jitter queue, logging overruns (they represent data
    /// loss, which the host can't be told about beyond this).
    pub fn note_push_outcome(&self, outcome: PushOutcome) {
        if let PushOutcome::Overrun { dropped } = outcome {
            warn!(dropped, "jitter queue overrun, oldest audio discarded");
        }
    }

    /// Underrun handling (section 4.F): asks the host to re-render without
    /// moving its playback cursor, so freshly arrived audio overwrites the
    /// silence rendered during the gap instead of being appended after it.
    pub fn request_render(&mut self) {
        self.sink.request_rewind(0, false, true, false);
    }
}

impl HostSink for Box<dyn HostSink> {
    fn get_latency_us(&self) -> u64 {
        (**self).get_latency_us()
    }

    fn set_requested_latency_us(&mut self, latency_us: u64) -> u64 {
        (**self).set_requested_latency_us(latency_us)
    }

    fn set_input_rate(&mut self, rate: u32) {
        (**self).set_input_rate(rate);
    }

    fn request_rewind(&mut self, bytes: usize, adjust_latency: bool, request_render: bool, flush: bool) {
        (**self).request_rewind(bytes, adjust_latency, request_render, flush);
    }

    fn render_delay_us(&self) -> u64 {
        (**self).render_delay_us()
    }

    fn underrun_count(&self) -> u64 {
        (**self).underrun_count()
    }
}

/// A [`HostSink`] that discards everything. Used by tests and by the
/// standalone binary when no real audio backend is wired up.
pub struct NullSink {
    requested_latency_us: u64,
    input_rate: u32,
    underruns: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            requested_latency_us: 0,
            input_rate: 0,
            underruns: 0,
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSink for NullSink {
    fn get_latency_us(&self) -> u64 {
        self.requested_latency_us
    }

    fn set_requested_latency_us(&mut self, latency_us: u64) -> u64 {
        self.requested_latency_us = latency_us;
        latency_us
    }

    fn set_input_rate(&mut self, rate: u32) {
        self.input_rate = rate;
    }

    fn request_rewind(&mut self, _bytes: usize, _adjust_latency: bool, _request_render: bool, _flush: bool) {
        self.underruns += 1;
    }

    fn render_delay_us(&self) -> u64 {
        0
    }

    fn underrun_count(&self) -> u64 {
        self.underruns
    }
}
