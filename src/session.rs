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

//! Component F: one RTP stream's lifetime, from socket to sink. Each session
//! gets its own realtime OS thread running a single-threaded tokio runtime,
//! matching how a dedicated receiver thread is spun up per stream. The main
//! context only ever touches a session through its [`SessionHandle`].

use crate::{
    config::{self, RATE_FIX_CAP_FRACTION, RATE_UPDATE_INTERVAL},
    error::{SessionError, SessionResult},
    jitter_queue::JitterQueue,
    multicast::create_multicast_socket,
    playback::{HostSink, PlaybackAdapter},
    rtp,
    sap::{Announcement, SampleSpec},
    time_smoother::TimeSmoother,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::{
    runtime, select,
    sync::{mpsc, oneshot},
    time::interval,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::{debug, info, instrument, warn};

/// Messages the main context can send to a running session's thread.
enum SessionApiMessage {
    Stop,
}

/// The main context's view of a running session: enough to identify it
/// (for SAP refresh/goodbye matching), check liveness, and tear it down.
pub struct SessionHandle {
    pub origin_key: String,
    pub session_name: String,
    pub group_addr: SocketAddr,
    last_activity_sec: Arc<AtomicU32>,
    api_tx: mpsc::Sender<SessionApiMessage>,
}

impl SessionHandle {
    /// Seconds since the Unix epoch at which this session last received RTP
    /// payload or a SAP refresh. Read by the reaper (section 4.I) to decide
    /// staleness.
    pub fn last_activity_sec(&self) -> u32 {
        self.last_activity_sec.load(Ordering::Relaxed)
    }

    /// Records activity as of now. Called from the main context on a SAP
    /// refresh for this origin, since only RTP ingest otherwise touches this
    /// field (from the session's own I/O thread).
    pub fn touch(&self) {
        self.last_activity_sec.store(now_unix_sec(), Ordering::Relaxed);
    }

    /// Requests the session's thread stop. Asynchronous: the thread tears
    /// down its socket and runtime on its own schedule.
    pub fn stop(&self) {
        let _ = self.api_tx.try_send(SessionApiMessage::Stop);
    }
}

/// Spawns a session's realtime thread and returns once the thread has either
/// started successfully or failed to build its runtime/socket.
#[instrument(skip(announcement, sink))]
pub fn start_session(
    announcement: Announcement,
    intended_latency_us: u64,
    sink: Box<dyn HostSink>,
    local_cookie: u32,
) -> SessionResult<SessionHandle> {
    let id = announcement.origin_key.clone();
    let (result_tx, result_rx) = oneshot::channel();
    let (api_tx, api_rx) = mpsc::channel(16);
    let last_activity_sec = Arc::new(AtomicU32::new(now_unix_sec()));

    let group_addr = announcement.group_addr;
    let session_name = announcement.session_name.clone();
    let sample_spec = announcement.sample_spec;
    let payload_type = announcement.payload_type;
    let activity = Arc::clone(&last_activity_sec);
    let thread_id = id.clone();

    thread::Builder::new()
        .name(format!("rtp-session-{id}"))
        .spawn(move || {
            let socket = match create_multicast_socket(group_addr.ip(), group_addr.port()) {
                Ok(it) => it,
                Err(e) => {
                    let _ = result_tx.send(Err(SessionError::from(e)));
                    return;
                }
            };

            let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(it) => it,
                Err(e) => {
                    let _ = result_tx.send(Err(SessionError::Runtime(e)));
                    return;
                }
            };

            crate::utils::set_realtime_priority();

            let worker = SessionWorker::new(
                thread_id,
                sample_spec,
                payload_type,
                intended_latency_us,
                socket,
                sink,
                api_rx,
                activity,
                local_cookie,
            );

            let _ = result_tx.send(Ok(()));
            rt.block_on(worker.run_to_completion());
        })
        .map_err(SessionError::Spawn)?;

    result_rx
        .blocking_recv()
        .map_err(|_| SessionError::Spawn(std::io::Error::other("session thread did not report back")))??;

    Ok(SessionHandle {
        origin_key: id,
        session_name,
        group_addr,
        last_activity_sec,
        api_tx,
    })
}

#[cfg(test)]
impl SessionHandle {
    /// Builds a handle with no backing thread, for exercising the registry
    /// (component G) without real sockets or realtime threads.
    pub(crate) fn new_for_test(origin_key: &str, group_addr: SocketAddr, last_activity_sec: u32) -> Self {
        let (api_tx, _api_rx) = mpsc::channel(1);
        Self {
            origin_key: origin_key.to_owned(),
            session_name: "test".to_owned(),
            group_addr,
            last_activity_sec: Arc::new(AtomicU32::new(last_activity_sec)),
            api_tx,
        }
    }
}

fn now_unix_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

struct SessionWorker {
    id: String,
    sample_spec: SampleSpec,
    payload_type: u8,
    ssrc: Option<u32>,
    expected_timestamp: u32,
    first_packet_seen: bool,
    local_cookie: u32,
    jitter_queue: JitterQueue,
    smoother: TimeSmoother,
    adapter: PlaybackAdapter<Box<dyn HostSink>>,
    intended_latency_us: u64,
    started_at: Instant,
    last_rate_update: Instant,
    socket: tokio::net::UdpSocket,
    api_rx: mpsc::Receiver<SessionApiMessage>,
    last_activity_sec: Arc<AtomicU32>,
}

impl SessionWorker {
    fn new(
        id: String,
        sample_spec: SampleSpec,
        payload_type: u8,
        intended_latency_us: u64,
        socket: tokio::net::UdpSocket,
        sink: Box<dyn HostSink>,
        api_rx: mpsc::Receiver<SessionApiMessage>,
        last_activity_sec: Arc<AtomicU32>,
        local_cookie: u32,
    ) -> Self {
        let mut adapter = PlaybackAdapter::new(sink);
        let sink_latency_us = adapter.attach(intended_latency_us);
        // Section 3: intended latency must leave the sink at least two sink
        // periods of headroom, or the jitter queue drains into an underrun
        // the moment the sink reports its true (possibly larger) latency.
        let intended_latency_us = intended_latency_us.max(sink_latency_us.saturating_mul(2));

        let mut jitter_queue = JitterQueue::new(config::JITTER_QUEUE_CAPACITY);
        let max_rewind = sample_spec.bytes_per_frame() * sample_spec.sample_rate as usize;
        jitter_queue.set_max_rewind(max_rewind.min(config::JITTER_QUEUE_CAPACITY / 2));
        let prefill_us = (intended_latency_us as f64 - sink_latency_us as f64).max(0.0);
        let prefill_bytes = (sample_spec.bytes_per_us() * prefill_us) as i64;
        jitter_queue.seek(prefill_bytes, true);

        let now = Instant::now();

        Self {
            id,
            sample_spec,
            payload_type,
            ssrc: None,
            expected_timestamp: 0,
            first_packet_seen: false,
            local_cookie,
            jitter_queue,
            smoother: TimeSmoother::new(0),
            adapter,
            intended_latency_us,
            started_at: now,
            last_rate_update: now,
            socket,
            api_rx,
            last_activity_sec,
        }
    }

    async fn run_to_completion(self) {
        let id = self.id.clone();
        let subsystem_name = id.clone();
        let subsystem = move |s: SubsystemHandle| async move { self.run(s).await };

        if let Err(e) = Toplevel::new(|s| async move {
            s.start(SubsystemBuilder::new(subsystem_name, subsystem));
        })
        .handle_shutdown_requests(Duration::from_secs(1))
        .await
        {
            warn!("session '{id}' subsystem failed to shut down cleanly: {e}");
        }
    }

    async fn run(mut self, subsys: SubsystemHandle) -> SessionResult<()> {
        let mut receive_buf = [0u8; 65_535];
        let mut retune_tick = interval(RATE_UPDATE_INTERVAL);
        retune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("session '{}' started", self.id);

        loop {
            select! {
                Some(msg) = self.api_rx.recv() => {
                    match msg {
                        SessionApiMessage::Stop => subsys.request_shutdown(),
                    }
                }
                Ok((len, _addr)) = self.socket.recv_from(&mut receive_buf) => {
                    self.on_datagram(&receive_buf[..len]);
                }
                _ = retune_tick.tick() => {
                    self.retune();
                }
                _ = subsys.on_shutdown_requested() => break,
                else => break,
            }
        }

        info!("session '{}' stopped", self.id);
        Ok(())
    }

    fn on_datagram(&mut self, data: &[u8]) {
        let packet = match rtp::decode(data) {
            Ok(it) => it,
            Err(e) => {
                debug!("session '{}' dropped malformed RTP packet: {e}", self.id);
                return;
            }
        };

        if packet.payload_type != self.payload_type {
            debug!(
                "session '{}' dropped packet with unexpected payload type {}",
                self.id, packet.payload_type
            );
            return;
        }

        if !self.first_packet_seen {
            self.ssrc = Some(packet.ssrc);
            self.expected_timestamp = packet.timestamp;
            self.first_packet_seen = true;
            if packet.ssrc == self.local_cookie {
                warn!(
                    "session '{}' loop detected: received SSRC matches this process's own cookie ({:08x})",
                    self.id, self.local_cookie
                );
            }
        } else if self.ssrc != Some(packet.ssrc) {
            debug!(
                "session '{}' dropped packet from unexpected SSRC {:08x}",
                self.id, packet.ssrc
            );
            return;
        }

        // Wraparound-safe: interpreting the wrapping difference of two u32
        // RTP timestamps as a signed i32 gives the correct short delta
        // whether or not the timestamp has wrapped since the last packet.
        let delta = packet.timestamp.wrapping_sub(self.expected_timestamp) as i32 as i64;
        let byte_delta = delta * self.sample_spec.bytes_per_frame() as i64;
        self.jitter_queue.seek(byte_delta, true);

        let now_us = self.started_at.elapsed().as_micros() as i64;
        self.smoother.put(now_us, self.jitter_queue.write_index() as f64);

        let outcome = self.jitter_queue.push(packet.payload);
        self.adapter.note_push_outcome(outcome);

        let frames = packet.payload.len() / self.sample_spec.bytes_per_frame().max(1);
        self.expected_timestamp = packet.timestamp.wrapping_add(frames as u32);

        self.last_activity_sec.store(now_unix_sec(), Ordering::Relaxed);

        // Underrun handling (section 4.F): a non-zero underrun count means
        // the sink has already rendered silence for this gap; asking it to
        // re-render (without moving its cursor) lets the audio that just
        // arrived overwrite that silence instead of queuing up behind it.
        if !self.jitter_queue.is_empty() && self.adapter.underrun_count() > 0 {
            self.adapter.request_render();
        }
    }

    /// Compares the drift-compensator's estimate of the true playback
    /// frontier against the target latency and nudges the input sample rate
    /// to close the gap. A fix larger than [`RATE_FIX_CAP_FRACTION`] of the
    /// sample rate is rejected rather than clamped, and deliberately does
    /// not advance `last_rate_update`, so a persistently bad deviation gets
    /// retried on the very next tick instead of being silently ignored for
    /// a full interval.
    fn retune(&mut self) {
        let elapsed = self.last_rate_update.elapsed();
        if elapsed < RATE_UPDATE_INTERVAL {
            return;
        }

        let now_us = self.started_at.elapsed().as_micros() as i64;
        let wi_us = self.sample_spec.bytes_to_us(self.smoother.estimate(now_us));

        let render_delay_us = self.adapter.render_delay_us();
        let sink_delay_us = self.adapter.get_latency_us();
        let ri_us_raw = self.sample_spec.bytes_to_us(self.jitter_queue.read_index() as f64);
        let ri_us = (ri_us_raw - (render_delay_us + sink_delay_us) as f64).max(0.0);

        let latency_us = (wi_us - ri_us).max(0.0);
        let signed_deviation_us = latency_us - self.intended_latency_us as f64;

        let sample_rate = self.sample_spec.sample_rate as f64;
        let interval_us = RATE_UPDATE_INTERVAL.as_micros() as f64;
        let fix_samples_per_sec = signed_deviation_us * sample_rate / interval_us;
        let cap = sample_rate * RATE_FIX_CAP_FRACTION;

        if fix_samples_per_sec.abs() > cap {
            warn!(
                "session '{}' rejected implausible rate fix of {fix_samples_per_sec:.1} sps (deviation {signed_deviation_us}us)",
                self.id
            );
            return;
        }

        let new_rate = (sample_rate + fix_samples_per_sec).round() as u32;
        self.adapter.set_input_rate(new_rate);
        self.last_rate_update = Instant::now();

        debug!(
            "session '{}' retuned input rate to {new_rate} (deviation {signed_deviation_us}us)",
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sap::SampleFormat;

    /// A [`HostSink`] that reports a fixed latency no matter what is
    /// requested, used to exercise the section 3 `intended_latency ≥
    /// 2·sink_latency` clamp.
    struct FixedLatencySink {
        latency_us: u64,
        underruns: u64,
    }

    impl HostSink for FixedLatencySink {
        fn get_latency_us(&self) -> u64 {
            self.latency_us
        }

        fn set_requested_latency_us(&mut self, _latency_us: u64) -> u64 {
            self.latency_us
        }

        fn set_input_rate(&mut self, _rate: u32) {}

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

    fn mono_l16(rate: u32) -> SampleSpec {
        SampleSpec {
            sample_rate: rate,
            channels: 1,
            format: SampleFormat::L16,
        }
    }

    async fn test_socket() -> tokio::net::UdpSocket {
        tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind ephemeral socket")
    }

    fn build_rtp(pt: u8, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 12 + payload.len()];
        buf[0] = 0x80;
        buf[1] = pt & 0x7f;
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf[12..].copy_from_slice(payload);
        buf
    }

    async fn worker_with_sink(sink: Box<dyn HostSink>, intended_latency_us: u64, local_cookie: u32) -> SessionWorker {
        let (_api_tx, api_rx) = mpsc::channel(1);
        SessionWorker::new(
            "test".to_owned(),
            mono_l16(48_000),
            97,
            intended_latency_us,
            test_socket().await,
            sink,
            api_rx,
            Arc::new(AtomicU32::new(0)),
            local_cookie,
        )
    }

    #[tokio::test]
    async fn intended_latency_is_clamped_to_twice_sink_latency() {
        let sink = FixedLatencySink {
            latency_us: 400_000,
            underruns: 0,
        };
        let worker = worker_with_sink(Box::new(sink), 100_000, 0).await;
        assert_eq!(worker.intended_latency_us, 800_000);
    }

    #[tokio::test]
    async fn intended_latency_is_left_alone_when_sink_latency_is_small() {
        let sink = FixedLatencySink {
            latency_us: 10_000,
            underruns: 0,
        };
        let worker = worker_with_sink(Box::new(sink), 100_000, 0).await;
        assert_eq!(worker.intended_latency_us, 100_000);
    }

    #[tokio::test]
    async fn first_packet_matching_local_cookie_is_still_accepted() {
        let cookie = 0xDEAD_BEEF;
        let mut worker = worker_with_sink(Box::new(crate::playback::NullSink::new()), 100_000, cookie).await;
        let base = worker.jitter_queue.write_index();
        let packet = build_rtp(97, 0, cookie, &[1, 2, 3, 4]);
        worker.on_datagram(&packet);
        assert_eq!(worker.ssrc, Some(cookie));
        assert!(worker.first_packet_seen);
        assert_eq!(worker.jitter_queue.write_index(), base + 4);
    }

    #[tokio::test]
    async fn timestamp_wrap_picks_the_nearer_delta() {
        let mut worker = worker_with_sink(Box::new(crate::playback::NullSink::new()), 100_000, 0).await;
        let base = worker.jitter_queue.write_index();

        // First packet establishes expected_timestamp = 0xFFFFFF00 with no
        // payload, so the baseline isn't shifted by a frame count.
        worker.on_datagram(&build_rtp(97, 0xFFFF_FF00, 1, &[]));
        assert_eq!(worker.expected_timestamp, 0xFFFF_FF00);

        // Second packet wraps past 2^32; the naive difference is a huge
        // negative number, but the wrap-complement interpretation (+512) is
        // nearer to zero and must be the one applied.
        let payload = [0u8; 4];
        worker.on_datagram(&build_rtp(97, 0x0000_0100, 1, &payload));

        let bytes_per_frame = mono_l16(48_000).bytes_per_frame() as i64;
        assert_eq!(
            worker.jitter_queue.write_index(),
            base + 512 * bytes_per_frame + payload.len() as i64
        );
    }

    #[tokio::test]
    async fn mismatched_ssrc_is_dropped() {
        let mut worker = worker_with_sink(Box::new(crate::playback::NullSink::new()), 100_000, 0).await;
        let base = worker.jitter_queue.write_index();
        worker.on_datagram(&build_rtp(97, 0, 1, &[1, 2]));
        worker.on_datagram(&build_rtp(97, 0, 2, &[3, 4]));
        assert_eq!(worker.ssrc, Some(1));
        assert_eq!(worker.jitter_queue.write_index(), base + 2);
    }

    #[tokio::test]
    async fn mismatched_payload_type_is_dropped() {
        let mut worker = worker_with_sink(Box::new(crate::playback::NullSink::new()), 100_000, 0).await;
        let base = worker.jitter_queue.write_index();
        worker.on_datagram(&build_rtp(98, 0, 1, &[1, 2]));
        assert!(worker.ssrc.is_none());
        assert_eq!(worker.jitter_queue.write_index(), base);
    }
}
