// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZDLE escaping and the hex header helpers.
//!
//! A single escape character, ZDLE (CAN, 0x18), introduces every escape
//! sequence. Which bytes get escaped depends on the capability flags the
//! receiver advertised; the encode map is rebuilt whenever those change.

use super::Flags;
use crate::crc::{zmodem_crc16, zmodem_crc32};
use crate::{C_CAN, C_XON};

pub(super) const ZDLE: u8 = C_CAN;
pub(super) const ZCRCE: u8 = b'h';
pub(super) const ZCRCG: u8 = b'i';
pub(super) const ZCRCQ: u8 = b'j';
pub(super) const ZCRCW: u8 = b'k';

const XOFF: u8 = 0x13;

/// Build the 256-entry encode map from the session flags. A map entry
/// different from its index means "send ZDLE, then the entry".
pub(super) fn build_encode_map(flags: Flags) -> [u8; 256] {
    let mut map = [0u8; 256];
    for ch in 0..=255u8 {
        // lrzsz does not tolerate escapes on arbitrary characters, so
        // the always-escaped set stays minimal.
        let escape = matches!(ch, C_CAN | C_XON | XOFF)
            || ch == C_XON | 0x80
            || ch == XOFF | 0x80
            || (ch < 0x20 && flags.contains(Flags::ESCCTL))
            || (0x80..0xA0).contains(&ch)
            || (ch & 0x80 != 0 && flags.contains(Flags::ESC8));

        map[ch as usize] = if escape {
            ch | 0x40
        } else if ch == 0x7F {
            b'l'
        } else if ch == 0xFF {
            b'm'
        } else {
            ch
        };
    }
    map
}

/// Append one byte, escaped per the map.
pub(super) fn encode_byte(ch: u8, map: &[u8; 256], out: &mut Vec<u8>) {
    let mapped = map[ch as usize];
    if mapped != ch {
        out.push(ZDLE);
    }
    out.push(mapped);
}

/// Append a whole buffer, escaped per the map.
pub(super) fn encode_bytes(data: &[u8], map: &[u8; 256], out: &mut Vec<u8>) {
    for &ch in data {
        encode_byte(ch, map, out);
    }
}

/// Invert one escaped byte (the byte after a ZDLE).
fn unescape(ch: u8) -> Option<u8> {
    match ch {
        b'l' => Some(0x7F),
        b'm' => Some(0xFF),
        _ if ch & 0x40 != 0 => Some(ch & 0xBF),
        _ => None,
    }
}

/// Encode a complete data subpacket: escaped payload, `ZDLE terminator`,
/// then the escaped CRC over payload plus terminator. ZCRCW is chased
/// with XON to restart a flow-controlled line.
pub(super) fn encode_zdata_bytes(
    data: &[u8],
    terminator: u8,
    use_crc32: bool,
    map: &[u8; 256],
    out: &mut Vec<u8>,
) {
    encode_bytes(data, map, out);
    out.push(ZDLE);
    out.push(terminator);
    if use_crc32 {
        let crc = zmodem_crc32(data, Some(terminator));
        encode_bytes(&crc.to_le_bytes(), map, out);
    } else {
        let crc = zmodem_crc16(data, Some(terminator));
        encode_bytes(&crc.to_be_bytes(), map, out);
    }
    if terminator == ZCRCW {
        out.push(C_XON);
    }
}

/// Result of scanning the reassembly buffer for one data subpacket.
pub(super) enum Zdata {
    /// The terminator or its CRC has not arrived yet.
    Incomplete,
    /// A malformed escape sequence inside the subpacket.
    Invalid,
    /// A complete subpacket; the CRC has *not* been verified yet.
    Frame {
        terminator: u8,
        crc: [u8; 4],
        crc_len: usize,
    },
}

/// Decode one data subpacket from the front of `input`, appending the
/// unescaped payload to `out`. On success the consumed bytes (including
/// a trailing XON after ZCRCW) are drained from `input`; otherwise
/// `input` and `out` are untouched.
pub(super) fn decode_zdata_bytes(
    input: &mut Vec<u8>,
    use_crc32: bool,
    out: &mut Vec<u8>,
) -> Zdata {
    let crc_len = if use_crc32 { 4 } else { 2 };
    let mut decoded = Vec::new();
    let mut crc = [0u8; 4];
    let mut i = 0;

    // Payload, up to the CRC escape.
    let terminator = loop {
        if i >= input.len() {
            return Zdata::Incomplete;
        }
        let ch = input[i];
        i += 1;
        if ch != ZDLE {
            decoded.push(ch);
            continue;
        }
        if i >= input.len() {
            return Zdata::Incomplete;
        }
        let escaped = input[i];
        i += 1;
        match escaped {
            ZCRCE | ZCRCG | ZCRCQ | ZCRCW => break escaped,
            _ => match unescape(escaped) {
                Some(ch) => decoded.push(ch),
                // ZDLE followed by garbage; the repeated-CAN cancel is
                // handled by the raw input scan before buffering.
                None => return Zdata::Invalid,
            },
        }
    };

    // CRC bytes, themselves possibly escaped.
    for slot in crc.iter_mut().take(crc_len) {
        if i >= input.len() {
            return Zdata::Incomplete;
        }
        let mut ch = input[i];
        i += 1;
        if ch == ZDLE {
            if i >= input.len() {
                return Zdata::Incomplete;
            }
            match unescape(input[i]) {
                Some(u) => ch = u,
                None => return Zdata::Invalid,
            }
            i += 1;
        }
        *slot = ch;
    }

    // ZCRCW is always followed by XON; eat it.
    if terminator == ZCRCW && input.get(i) == Some(&C_XON) {
        i += 1;
    }

    input.drain(..i);
    out.extend_from_slice(&decoded);
    Zdata::Frame {
        terminator,
        crc,
        crc_len,
    }
}

/// Serialise bytes as lowercase hex, the form used by hex headers.
pub(super) fn hexify(input: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(hex::encode(input).as_bytes());
}

/// Decode a hex field; `None` on a non-hex character.
pub(super) fn dehexify(input: &[u8]) -> Option<Vec<u8>> {
    hex::decode(input).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn map_always_escapes_flow_control() {
        let map = build_encode_map(Flags::empty());
        for ch in [C_CAN, C_XON, XOFF, C_XON | 0x80, XOFF | 0x80] {
            assert_eq!(map[ch as usize], ch | 0x40);
        }
        assert_eq!(map[0x7F], b'l');
        assert_eq!(map[0xFF], b'm');
        // 8-bit control characters are always escaped.
        assert_eq!(map[0x8D], 0x8D | 0x40);
        // Plain text never is.
        assert_eq!(map[b'A' as usize], b'A');
    }

    #[test]
    fn map_honours_escape_flags() {
        let plain = build_encode_map(Flags::empty());
        assert_eq!(plain[0x01], 0x01);
        assert_eq!(plain[0xA1], 0xA1);

        let ctrl = build_encode_map(Flags::ESCCTL);
        assert_eq!(ctrl[0x01], 0x41);

        let eight = build_encode_map(Flags::ESC8);
        assert_eq!(eight[0xA1], 0xE1);
    }

    #[rstest]
    #[case(Flags::empty(), false)]
    #[case(Flags::ESCCTL, false)]
    #[case(Flags::ESCCTL, true)]
    #[case(Flags::ESCCTL.union(Flags::ESC8), true)]
    pub fn zdata_round_trip(#[case] flags: Flags, #[case] use_crc32: bool) {
        let map = build_encode_map(flags);
        let data: Vec<u8> = (0..=255).collect();
        for terminator in [ZCRCE, ZCRCG, ZCRCQ, ZCRCW] {
            let mut wire = Vec::new();
            encode_zdata_bytes(&data, terminator, use_crc32, &map, &mut wire);
            let mut buffer = wire.clone();
            let mut decoded = Vec::new();
            match decode_zdata_bytes(&mut buffer, use_crc32, &mut decoded) {
                Zdata::Frame {
                    terminator: t,
                    crc,
                    crc_len,
                } => {
                    assert_eq!(t, terminator);
                    assert_eq!(decoded, data);
                    assert!(buffer.is_empty());
                    if use_crc32 {
                        let expect = zmodem_crc32(&data, Some(terminator));
                        assert_eq!(crc[..crc_len], expect.to_le_bytes());
                    } else {
                        let expect = zmodem_crc16(&data, Some(terminator));
                        assert_eq!(crc[..crc_len], expect.to_be_bytes());
                    }
                }
                _ => panic!("subpacket did not decode"),
            }
        }
    }

    #[test]
    fn incomplete_subpacket_leaves_buffer_alone() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        encode_zdata_bytes(b"hello", ZCRCG, true, &map, &mut wire);
        let mut truncated = wire[..wire.len() - 3].to_vec();
        let before = truncated.clone();
        let mut decoded = Vec::new();
        assert!(matches!(
            decode_zdata_bytes(&mut truncated, true, &mut decoded),
            Zdata::Incomplete
        ));
        assert_eq!(truncated, before);
        assert!(decoded.is_empty());
    }

    #[test]
    fn back_to_back_subpackets_stream() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        encode_zdata_bytes(b"first", ZCRCG, false, &map, &mut wire);
        encode_zdata_bytes(b"second", ZCRCE, false, &map, &mut wire);
        let mut decoded = Vec::new();
        assert!(matches!(
            decode_zdata_bytes(&mut wire, false, &mut decoded),
            Zdata::Frame { terminator: ZCRCG, .. }
        ));
        assert_eq!(decoded, b"first");
        decoded.clear();
        assert!(matches!(
            decode_zdata_bytes(&mut wire, false, &mut decoded),
            Zdata::Frame { terminator: ZCRCE, .. }
        ));
        assert_eq!(decoded, b"second");
        assert!(wire.is_empty());
    }

    #[test]
    fn hex_round_trip() {
        let mut out = Vec::new();
        hexify(&[0x00, 0x18, 0xAB, 0xFF], &mut out);
        assert_eq!(out, b"0018abff");
        assert_eq!(dehexify(&out).unwrap(), vec![0x00, 0x18, 0xAB, 0xFF]);
        assert!(dehexify(b"zz").is_none());
    }
}
