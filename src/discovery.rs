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

//! Component H: the main context's SAP discovery loop. Runs on the single
//! event-loop thread, never blocks on audio I/O, and is the only writer to
//! the [`SessionRegistry`].

use crate::{
    error::{DecodeError, DecodeResult, SessionError, SessionResult},
    playback::HostSink,
    registry::SessionRegistry,
    sap::{self, Announcement},
    session::SessionHandle,
};
use tracing::{debug, info, warn};

/// Decodes one raw SAP datagram into its goodbye bit and announcement body.
pub fn decode_datagram(data: &[u8]) -> DecodeResult<(bool, Announcement)> {
    let frame = sap::decode_frame(data)?;
    let announcement = sap::parse_sdp(frame.sdp_body)?;
    Ok((frame.goodbye, announcement))
}

/// A goodbye announcement deletes its session; a fresh announcement for an
/// origin already in the registry is a no-op refresh (the origin key
/// already ignores the SDP session-version field, so a version bump alone
/// never looks like a new session); anything else creates a session via
/// `starter`.
pub fn dispatch(
    goodbye: bool,
    announcement: Announcement,
    registry: &mut SessionRegistry,
    intended_latency_us: u64,
    sink_factory: &mut dyn FnMut(&Announcement) -> Box<dyn HostSink>,
    starter: &mut dyn FnMut(Announcement, u64, Box<dyn HostSink>) -> SessionResult<SessionHandle>,
) {
    if goodbye {
        if registry.remove(&announcement.origin_key).is_some() {
            info!("session '{}' removed via SAP goodbye", announcement.origin_key);
        } else {
            debug!(
                "received goodbye for unknown session '{}'",
                announcement.origin_key
            );
        }
        return;
    }

    if let Some(handle) = registry.get(&announcement.origin_key) {
        handle.touch();
        debug!("refreshed known session '{}'", announcement.origin_key);
        return;
    }

    let sink = sink_factory(&announcement);
    let origin_key = announcement.origin_key.clone();
    match starter(announcement, intended_latency_us, sink) {
        Ok(handle) => match registry.insert(handle) {
            Ok(()) => info!("session '{origin_key}' created"),
            Err(SessionError::CapacityExceeded(max)) => {
                warn!("dropping session '{origin_key}': registry is at capacity ({max})");
            }
            Err(e) => warn!("failed to register session '{origin_key}': {e}"),
        },
        Err(e) => warn!("failed to start session '{origin_key}': {e}"),
    }
}

/// One pass over a received datagram: decode then dispatch, logging and
/// swallowing decode failures (malformed SAP traffic on the wire is
/// expected background noise, not a reason to stop discovery).
pub fn handle_datagram(
    data: &[u8],
    registry: &mut SessionRegistry,
    intended_latency_us: u64,
    sink_factory: &mut dyn FnMut(&Announcement) -> Box<dyn HostSink>,
    starter: &mut dyn FnMut(Announcement, u64, Box<dyn HostSink>) -> SessionResult<SessionHandle>,
) {
    match decode_datagram(data) {
        Ok((goodbye, announcement)) => dispatch(
            goodbye,
            announcement,
            registry,
            intended_latency_us,
            sink_factory,
            starter,
        ),
        Err(DecodeError::SapUnsupportedEncoding) => {
            debug!("ignoring encrypted/compressed SAP announcement");
        }
        Err(e) => debug!("ignoring malformed SAP datagram: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        playback::NullSink,
        sap::{SampleFormat, SampleSpec},
    };

    fn announcement(origin: &str) -> Announcement {
        Announcement {
            origin_key: origin.to_owned(),
            session_name: "test".to_owned(),
            payload_type: 97,
            sample_spec: SampleSpec {
                sample_rate: 48_000,
                channels: 2,
                format: SampleFormat::L16,
            },
            group_addr: "239.1.1.1:6000".parse().expect("literal"),
        }
    }

    fn fake_starter() -> impl FnMut(Announcement, u64, Box<dyn HostSink>) -> SessionResult<SessionHandle> {
        |announcement, _latency, _sink| {
            Ok(SessionHandle::new_for_test(
                &announcement.origin_key,
                announcement.group_addr,
                0,
            ))
        }
    }

    #[test]
    fn new_announcement_creates_a_session() {
        let mut registry = SessionRegistry::new();
        let mut starter = fake_starter();
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert!(registry.contains("a"));
    }

    #[test]
    fn repeat_announcement_is_a_no_op_refresh() {
        let mut registry = SessionRegistry::new();
        let mut starter = fake_starter();
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn repeat_announcement_touches_last_activity() {
        let mut registry = SessionRegistry::new();
        let mut starter = fake_starter();
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert_eq!(registry.get("a").expect("inserted").last_activity_sec(), 0);
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert!(registry.get("a").expect("still present").last_activity_sec() > 0);
    }

    #[test]
    fn goodbye_removes_known_session() {
        let mut registry = SessionRegistry::new();
        let mut starter = fake_starter();
        dispatch(
            false,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        dispatch(
            true,
            announcement("a"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert!(!registry.contains("a"));
    }

    #[test]
    fn goodbye_for_unknown_session_is_ignored() {
        let mut registry = SessionRegistry::new();
        let mut starter = fake_starter();
        dispatch(
            true,
            announcement("ghost"),
            &mut registry,
            100_000,
            &mut |_| Box::new(NullSink::new()),
            &mut starter,
        );
        assert!(registry.is_empty());
    }
}
