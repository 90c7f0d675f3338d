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

//! Component B: RTP packet decoding. A thin wrapper over `rtp_rs::RtpReader`
//! that exposes only the fields the ingest path (section 4.F) needs.

use crate::error::DecodeError;
use rtp_rs::RtpReader;

/// The fields of one RTP datagram relevant to ingest; the payload is a
/// borrow of the caller's receive buffer.
pub struct RtpPacket<'a> {
    pub ssrc: u32,
    pub payload_type: u8,
    pub timestamp: u32,
    pub payload: &'a [u8],
}

/// Parses one UDP datagram as an RTP packet. Rejects datagrams too short for
/// a fixed RTP header or with an unparseable extension/CSRC layout.
pub fn decode(data: &[u8]) -> Result<RtpPacket<'_>, DecodeError> {
    if data.len() < 12 {
        return Err(DecodeError::RtpTooShort(data.len()));
    }

    let reader = RtpReader::new(data).map_err(|_| DecodeError::RtpTooShort(data.len()))?;

    Ok(RtpPacket {
        ssrc: reader.ssrc(),
        payload_type: reader.payload_type(),
        timestamp: reader.timestamp(),
        payload: reader.payload(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 12 + payload.len()];
        buf[0] = 0x80; // version 2, no padding/extension/csrc
        buf[1] = pt & 0x7f;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf[12..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn decodes_basic_fields() {
        let data = build_packet(97, 1, 0xDEAD_BEEF, 0x1234_5678, &[1, 2, 3, 4]);
        let packet = decode(&data).expect("should decode");
        assert_eq!(packet.payload_type, 97);
        assert_eq!(packet.timestamp, 0xDEAD_BEEF);
        assert_eq!(packet.ssrc, 0x1234_5678);
        assert_eq!(packet.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_short_datagrams() {
        let err = decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, DecodeError::RtpTooShort(4)));
    }
}
