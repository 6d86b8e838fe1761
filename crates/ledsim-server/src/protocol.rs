//! Wire protocol codec for the virtual device
//!
//! One command per UDP datagram; the first byte selects the command. All
//! multi-byte integers are little-endian. Only the current protocol version
//! is supported.

use ledsim_core::PixelUpdate;
use thiserror::Error;

pub const CMD_QUERY_INFO: u8 = 0x10;
pub const CMD_FRAGMENT_PIXELS: u8 = 0x12;
pub const CMD_FRAME_END: u8 = 0x13;
pub const CMD_QUERY_CONFIG: u8 = 0x14;

pub const PROTOCOL_VERSION: u8 = 4;

/// Maximum reply payload per datagram, kept under common MTU limits
pub const MAX_UDP_PAYLOAD: usize = 1400;
/// Config reply fragment header: `[cmd, msg_id, total, index, len:u16]`
pub const FRAGMENT_HEADER_LEN: usize = 6;
/// Usable chunk size per config reply fragment
pub const MAX_CHUNK_LEN: usize = MAX_UDP_PAYLOAD - FRAGMENT_HEADER_LEN;

/// `[index:u16, r, g, b]`
const UPDATE_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Config payload of {payload_len} bytes needs {fragments} fragments, limit is 255")]
    PayloadTooLarge {
        payload_len: usize,
        fragments: usize,
    },
}

/// A decoded request datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryInfo,
    QueryConfig,
    FragmentPixels {
        frame_id: u8,
        total_fragments: u8,
        fragment_index: u8,
        updates: Vec<PixelUpdate>,
    },
    FrameEnd {
        frame_id: u8,
    },
}

impl Command {
    /// Decode a request datagram.
    ///
    /// Empty datagrams, unknown command codes, and payloads shorter than
    /// their fixed header decode to `None`; the server ignores them without
    /// a reply.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&cmd, payload) = data.split_first()?;
        match cmd {
            CMD_QUERY_INFO => Some(Self::QueryInfo),
            CMD_QUERY_CONFIG => Some(Self::QueryConfig),
            CMD_FRAGMENT_PIXELS => {
                if payload.len() < 5 {
                    return None;
                }
                let declared = u16::from_le_bytes([payload[3], payload[4]]) as usize;
                Some(Self::FragmentPixels {
                    frame_id: payload[0],
                    total_fragments: payload[1],
                    fragment_index: payload[2],
                    updates: parse_updates(&payload[5..], declared),
                })
            }
            CMD_FRAME_END => payload.first().map(|&frame_id| Self::FrameEnd { frame_id }),
            _ => None,
        }
    }
}

/// Parse pixel updates from a fragment body.
///
/// An over-declared count is clamped to what the remaining bytes can
/// actually hold; a truncated datagram yields its parsable prefix instead
/// of being rejected.
fn parse_updates(payload: &[u8], declared: usize) -> Vec<PixelUpdate> {
    let count = declared.min(payload.len() / UPDATE_LEN);
    payload
        .chunks_exact(UPDATE_LEN)
        .take(count)
        .map(|chunk| PixelUpdate {
            index: u16::from_le_bytes([chunk[0], chunk[1]]),
            rgb: [chunk[2], chunk[3], chunk[4]],
        })
        .collect()
}

/// Encode the device-info reply.
///
/// Layout: `[cmd, version, width:u16, height:u16, pixel_size:u16]` followed
/// by three length-prefixed UTF-8 fields (name, description, serial), each
/// truncated to 255 bytes.
pub fn encode_info_response(
    width: u16,
    height: u16,
    pixel_size: u16,
    name: &str,
    description: &str,
    serial: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 3 + name.len() + description.len() + serial.len());
    out.push(CMD_QUERY_INFO);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&pixel_size.to_le_bytes());
    push_short_field(&mut out, name);
    push_short_field(&mut out, description);
    push_short_field(&mut out, serial);
    out
}

fn push_short_field(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(255);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

/// Split a config payload into numbered reply datagrams.
///
/// Each fragment is `[cmd, message_id, total_fragments, fragment_index,
/// chunk_len:u16, chunk]`. Concatenating the chunks in index order
/// reproduces the payload. A payload needing more than 255 fragments is an
/// error and nothing should be sent.
pub fn config_fragments(payload: &[u8], message_id: u8) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let total = payload.len().div_ceil(MAX_CHUNK_LEN);
    if total > 255 {
        return Err(ProtocolError::PayloadTooLarge {
            payload_len: payload.len(),
            fragments: total,
        });
    }

    Ok(payload
        .chunks(MAX_CHUNK_LEN)
        .enumerate()
        .map(|(index, chunk)| {
            let mut packet = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            packet.push(CMD_QUERY_CONFIG);
            packet.push(message_id);
            packet.push(total as u8);
            packet.push(index as u8);
            packet.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
            packet.extend_from_slice(chunk);
            packet
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_and_unknown() {
        assert_eq!(Command::decode(&[]), None);
        assert_eq!(Command::decode(&[0xFF]), None);
        assert_eq!(Command::decode(&[0x11, 1, 2]), None);
    }

    #[test]
    fn test_decode_queries() {
        assert_eq!(Command::decode(&[CMD_QUERY_INFO]), Some(Command::QueryInfo));
        assert_eq!(
            Command::decode(&[CMD_QUERY_CONFIG]),
            Some(Command::QueryConfig)
        );
    }

    #[test]
    fn test_decode_fragment_pixels() {
        // frame 7, 2 fragments, index 1, 2 updates
        let data = [
            CMD_FRAGMENT_PIXELS,
            7,
            2,
            1,
            2,
            0,
            0x34,
            0x12,
            10,
            20,
            30,
            0x01,
            0x00,
            40,
            50,
            60,
        ];
        match Command::decode(&data) {
            Some(Command::FragmentPixels {
                frame_id,
                total_fragments,
                fragment_index,
                updates,
            }) => {
                assert_eq!((frame_id, total_fragments, fragment_index), (7, 2, 1));
                assert_eq!(
                    updates,
                    vec![
                        PixelUpdate {
                            index: 0x1234,
                            rgb: [10, 20, 30]
                        },
                        PixelUpdate {
                            index: 1,
                            rgb: [40, 50, 60]
                        },
                    ]
                );
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_fragment_header_too_short_ignored() {
        assert_eq!(Command::decode(&[CMD_FRAGMENT_PIXELS, 1, 1, 0, 1]), None);
    }

    #[test]
    fn test_over_declared_count_clamped() {
        // Declares 100 updates but carries bytes for one and a half.
        let mut data = vec![CMD_FRAGMENT_PIXELS, 1, 1, 0, 100, 0];
        data.extend_from_slice(&[0, 0, 1, 2, 3]);
        data.extend_from_slice(&[1, 0, 4]);
        match Command::decode(&data) {
            Some(Command::FragmentPixels { updates, .. }) => {
                assert_eq!(
                    updates,
                    vec![PixelUpdate {
                        index: 0,
                        rgb: [1, 2, 3]
                    }]
                );
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_declared_count_limits_parsing() {
        // Carries two updates but declares one.
        let mut data = vec![CMD_FRAGMENT_PIXELS, 1, 1, 0, 1, 0];
        data.extend_from_slice(&[0, 0, 1, 2, 3]);
        data.extend_from_slice(&[1, 0, 4, 5, 6]);
        match Command::decode(&data) {
            Some(Command::FragmentPixels { updates, .. }) => assert_eq!(updates.len(), 1),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_end() {
        assert_eq!(
            Command::decode(&[CMD_FRAME_END, 9]),
            Some(Command::FrameEnd { frame_id: 9 })
        );
        assert_eq!(Command::decode(&[CMD_FRAME_END]), None);
    }

    #[test]
    fn test_info_response_layout() {
        let response = encode_info_response(48, 27, 6, "Bench", "desc", "AABB");
        assert_eq!(response[0], CMD_QUERY_INFO);
        assert_eq!(response[1], PROTOCOL_VERSION);
        assert_eq!(u16::from_le_bytes([response[2], response[3]]), 48);
        assert_eq!(u16::from_le_bytes([response[4], response[5]]), 27);
        assert_eq!(u16::from_le_bytes([response[6], response[7]]), 6);

        let mut at = 8;
        for expected in ["Bench", "desc", "AABB"] {
            let len = response[at] as usize;
            at += 1;
            assert_eq!(&response[at..at + len], expected.as_bytes());
            at += len;
        }
        assert_eq!(at, response.len());
    }

    #[test]
    fn test_info_response_truncates_long_fields() {
        let long = "x".repeat(300);
        let response = encode_info_response(1, 1, 1, &long, "", "");
        assert_eq!(response[8], 255);
        assert_eq!(response.len(), 8 + 1 + 255 + 1 + 1);
    }

    #[test]
    fn test_config_fragmentation_law() {
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let fragments = config_fragments(&payload, 42).unwrap();
        assert_eq!(fragments.len(), payload.len().div_ceil(MAX_CHUNK_LEN));

        let mut reassembled = Vec::new();
        for (index, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment[0], CMD_QUERY_CONFIG);
            assert_eq!(fragment[1], 42);
            assert_eq!(fragment[2] as usize, fragments.len());
            assert_eq!(fragment[3] as usize, index);
            let chunk_len = u16::from_le_bytes([fragment[4], fragment[5]]) as usize;
            assert_eq!(fragment.len(), FRAGMENT_HEADER_LEN + chunk_len);
            assert!(fragment.len() <= MAX_UDP_PAYLOAD);
            reassembled.extend_from_slice(&fragment[FRAGMENT_HEADER_LEN..]);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_single_fragment_payload() {
        let fragments = config_fragments(b"{}", 0).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(&fragments[0][FRAGMENT_HEADER_LEN..], b"{}");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_CHUNK_LEN * 256];
        assert!(matches!(
            config_fragments(&payload, 0),
            Err(ProtocolError::PayloadTooLarge { fragments: 256, .. })
        ));
    }
}
