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

//! Component C: SAP framing (RFC 2974) and the SDP fields this module cares
//! about. The SAP header is decoded by hand — it is four fixed fields plus an
//! address, well within what's reasonable to parse without a dependency —
//! and the body is handed to the `sdp` crate.

use crate::error::{DecodeError, DecodeResult};
use lazy_static::lazy_static;
use regex::Regex;
use sdp::SessionDescription;
use std::{
    io::Cursor,
    net::{IpAddr, SocketAddr},
};

lazy_static! {
    static ref RTPMAP_REGEX: Regex =
        Regex::new(r"^(\d+)\s+([A-Za-z][A-Za-z0-9-]*)/(\d+)(?:/(\d+))?$")
            .expect("static pattern is valid");
}

/// One SAP frame, split into its goodbye bit and (unparsed) SDP body.
pub struct SapFrame<'a> {
    pub goodbye: bool,
    pub sdp_body: &'a [u8],
}

/// Decodes a raw SAP datagram per RFC 2974. Authentication data is skipped,
/// not validated (out of this module's scope — see SPEC_FULL.md 4.C).
/// Encrypted or compressed payloads are rejected as undecodable.
pub fn decode_frame(data: &[u8]) -> DecodeResult<SapFrame<'_>> {
    if data.len() < 4 {
        return Err(DecodeError::SapTooShort(data.len()));
    }

    let flags = data[0];
    let version = flags >> 5;
    let is_ipv6 = flags & 0b0001_0000 != 0;
    let goodbye = flags & 0b0000_0100 != 0;
    let encrypted = flags & 0b0000_0010 != 0;
    let compressed = flags & 0b0000_0001 != 0;

    if version != 1 {
        // Unknown versions could still be structurally compatible, but we
        // have no way to know; be conservative.
        return Err(DecodeError::SapTooShort(data.len()));
    }

    if encrypted || compressed {
        return Err(DecodeError::SapUnsupportedEncoding);
    }

    let auth_len_words = data[1] as usize;
    let origin_len = if is_ipv6 { 16 } else { 4 };
    let header_len = 4 + origin_len;

    if data.len() < header_len {
        return Err(DecodeError::SapTooShort(data.len()));
    }

    let after_auth = header_len + auth_len_words * 4;
    if data.len() < after_auth {
        return Err(DecodeError::SapTooShort(data.len()));
    }

    let rest = &data[after_auth..];

    // No explicit payload-type string: SDP bodies always start with "v=".
    let sdp_body = if rest.starts_with(b"v=") {
        rest
    } else {
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::SapTooShort(data.len()))?;
        let payload_type = &rest[..nul];
        if payload_type != b"application/sdp" {
            return Err(DecodeError::SapUnsupportedPayloadType(
                String::from_utf8_lossy(payload_type).into_owned(),
            ));
        }
        &rest[nul + 1..]
    };

    Ok(SapFrame { goodbye, sdp_body })
}

/// The subset of a parsed SDP announcement this receiver needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub origin_key: String,
    pub session_name: String,
    pub payload_type: u8,
    pub sample_spec: SampleSpec,
    pub group_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    L16,
    L24,
    Pcmu,
    Pcma,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::L16 => 2,
            SampleFormat::L24 => 3,
            SampleFormat::Pcmu | SampleFormat::Pcma => 1,
        }
    }

    fn from_encoding(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "L16" => Some(SampleFormat::L16),
            "L24" => Some(SampleFormat::L24),
            "PCMU" => Some(SampleFormat::Pcmu),
            "PCMA" => Some(SampleFormat::Pcma),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub sample_rate: u32,
    pub channels: usize,
    pub format: SampleFormat,
}

impl SampleSpec {
    pub fn bytes_per_frame(self) -> usize {
        self.format.bytes_per_sample() * self.channels
    }

    /// Bytes produced per microsecond at this sample spec's rate, used to
    /// convert between the jitter queue's byte-indexed positions and the
    /// time-indexed values the drift compensator reasons about.
    pub fn bytes_per_us(self) -> f64 {
        self.bytes_per_frame() as f64 * self.sample_rate as f64 / 1_000_000.0
    }

    /// Converts a byte count at this sample spec into microseconds.
    pub fn bytes_to_us(self, bytes: f64) -> f64 {
        let bpus = self.bytes_per_us();
        if bpus <= 0.0 { 0.0 } else { bytes / bpus }
    }
}

/// Parses an SDP body and extracts everything this receiver needs to create
/// a session. Only the first media description is supported (redundant
/// streams are out of scope).
pub fn parse_sdp(body: &[u8]) -> DecodeResult<Announcement> {
    let mut reader = Cursor::new(body);
    let sd = SessionDescription::unmarshal(&mut reader)?;
    announcement_from_sdp(&sd)
}

fn announcement_from_sdp(sd: &SessionDescription) -> DecodeResult<Announcement> {
    let origin_key = origin_key(sd);
    let session_name = sd.session_name.clone();

    if sd.media_descriptions.len() > 1 {
        return Err(DecodeError::SdpUnsupportedMedia(
            "redundant media descriptions are not supported".to_owned(),
        ));
    }

    let media = sd
        .media_descriptions
        .first()
        .ok_or(DecodeError::SdpMissingField("media description"))?;

    if media.media_name.media != "audio" {
        return Err(DecodeError::SdpUnsupportedMedia(format!(
            "unsupported media type: {}",
            media.media_name.media
        )));
    }

    if !media
        .media_name
        .protos
        .iter()
        .any(|p| p.eq_ignore_ascii_case("RTP"))
        || !media
            .media_name
            .protos
            .iter()
            .any(|p| p.eq_ignore_ascii_case("AVP"))
    {
        return Err(DecodeError::SdpUnsupportedMedia(format!(
            "unsupported media protocol: {:?}",
            media.media_name.protos
        )));
    }

    let fmt = media
        .media_name
        .formats
        .first()
        .ok_or(DecodeError::SdpMissingField("media format"))?;
    let payload_type: u8 = fmt
        .parse()
        .map_err(|_| DecodeError::MalformedRtpmap(fmt.clone()))?;

    let rtpmap = media
        .attribute("rtpmap")
        .flatten()
        .ok_or(DecodeError::SdpMissingField("rtpmap"))?;
    let sample_spec = parse_rtpmap(&rtpmap, payload_type)?;

    let conn = media
        .connection_information
        .as_ref()
        .or(sd.connection_information.as_ref())
        .ok_or(DecodeError::SdpMissingField("connection information"))?;
    let address = conn
        .address
        .as_ref()
        .ok_or(DecodeError::SdpMissingField("connection address"))?;
    let ip_text = address.address.split('/').next().unwrap_or(&address.address);
    let ip: IpAddr = ip_text
        .parse()
        .map_err(|_| DecodeError::SdpMissingField("valid connection address"))?;

    let port = media.media_name.port.value as u16;
    let group_addr = SocketAddr::new(ip, port);

    Ok(Announcement {
        origin_key,
        session_name,
        payload_type,
        sample_spec,
        group_addr,
    })
}

/// Builds the origin identity key from the `o=` line, deliberately omitting
/// `session_version` (see SPEC_FULL.md section 9, resolved open question).
fn origin_key(sd: &SessionDescription) -> String {
    format!(
        "{} {} {} {} {}",
        sd.origin.username,
        sd.origin.session_id,
        sd.origin.network_type,
        sd.origin.address_type,
        sd.origin.unicast_address
    )
}

fn parse_rtpmap(rtpmap: &str, expected_payload_type: u8) -> DecodeResult<SampleSpec> {
    let caps = RTPMAP_REGEX
        .captures(rtpmap)
        .ok_or_else(|| DecodeError::MalformedRtpmap(rtpmap.to_owned()))?;

    let pt: u8 = caps[1]
        .parse()
        .map_err(|_| DecodeError::MalformedRtpmap(rtpmap.to_owned()))?;
    if pt != expected_payload_type {
        return Err(DecodeError::MalformedRtpmap(format!(
            "rtpmap payload type {pt} does not match media format {expected_payload_type}"
        )));
    }

    let encoding = &caps[2];
    let format = SampleFormat::from_encoding(encoding)
        .ok_or_else(|| DecodeError::UnsupportedEncoding(encoding.to_owned()))?;

    let sample_rate: u32 = caps[3]
        .parse()
        .map_err(|_| DecodeError::MalformedRtpmap(rtpmap.to_owned()))?;
    let channels: usize = caps
        .get(4)
        .map(|m| m.as_str().parse())
        .transpose()
        .map_err(|_| DecodeError::MalformedRtpmap(rtpmap.to_owned()))?
        .unwrap_or(1);

    Ok(SampleSpec {
        sample_rate,
        channels,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sdp() -> Vec<u8> {
        concat!(
            "v=0\r\n",
            "o=alice 1 1 IN IP4 192.0.2.1\r\n",
            "s=Test Stream\r\n",
            "c=IN IP4 239.1.1.1/15\r\n",
            "t=0 0\r\n",
            "m=audio 5004 RTP/AVP 97\r\n",
            "a=rtpmap:97 L16/44100/2\r\n",
            "a=ptime:26\r\n",
        )
        .as_bytes()
        .to_vec()
    }

    fn sap_frame(goodbye: bool, body: &[u8]) -> Vec<u8> {
        let flags = if goodbye { 0x24u8 } else { 0x20u8 };
        let mut buf = vec![flags, 0, 0, 0]; // version 1, IPv4, no auth, msg id 0
        buf.extend_from_slice(&[127, 0, 0, 1]); // originating source
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn decodes_announcement_frame() {
        let body = sample_sdp();
        let raw = sap_frame(false, &body);
        let frame = decode_frame(&raw).expect("should decode frame");
        assert!(!frame.goodbye);
        assert_eq!(frame.sdp_body, body.as_slice());
    }

    #[test]
    fn decodes_goodbye_bit() {
        let raw = sap_frame(true, &sample_sdp());
        let frame = decode_frame(&raw).expect("should decode frame");
        assert!(frame.goodbye);
    }

    #[test]
    fn rejects_encrypted_frames() {
        let mut raw = sap_frame(false, &sample_sdp());
        raw[0] |= 0b0000_0010;
        let err = decode_frame(&raw).unwrap_err();
        assert!(matches!(err, DecodeError::SapUnsupportedEncoding));
    }

    #[test]
    fn parses_full_announcement() {
        let frame = decode_frame(&sap_frame(false, &sample_sdp())).expect("frame");
        let announcement = parse_sdp(frame.sdp_body).expect("sdp");
        assert_eq!(announcement.origin_key, "alice 1 IN IP4 192.0.2.1");
        assert_eq!(announcement.session_name, "Test Stream");
        assert_eq!(announcement.payload_type, 97);
        assert_eq!(announcement.sample_spec.sample_rate, 44_100);
        assert_eq!(announcement.sample_spec.channels, 2);
        assert_eq!(announcement.sample_spec.format, SampleFormat::L16);
        assert_eq!(
            announcement.group_addr,
            "239.1.1.1:5004".parse::<SocketAddr>().expect("literal")
        );
    }

    #[test]
    fn bytes_to_us_round_trips_through_bytes_per_us() {
        let spec = SampleSpec {
            sample_rate: 48_000,
            channels: 2,
            format: SampleFormat::L16,
        };
        // 4 bytes/frame * 48000 frames/sec = 192000 bytes/sec = 192 bytes/ms.
        assert_eq!(spec.bytes_to_us(192_000.0), 1_000_000.0);
    }

    #[test]
    fn origin_key_ignores_session_version() {
        let mut body_v2 = sample_sdp();
        let body_str = String::from_utf8(body_v2.clone()).expect("utf8");
        body_v2 = body_str.replace("o=alice 1 1 IN", "o=alice 1 2 IN").into_bytes();

        let a1 = parse_sdp(&sample_sdp()).expect("sdp1");
        let a2 = parse_sdp(&body_v2).expect("sdp2");
        assert_eq!(a1.origin_key, a2.origin_key);
    }
}
