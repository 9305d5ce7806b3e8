// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZMODEM frame headers: type, 32-bit argument, CRC kind.
//!
//! Hex header: `* * ZDLE 'B' <5 header bytes hexified> <CRC-16 hexified>
//! CR LF|0x80 [XON]`. Binary headers use `'A'` (CRC-16) or `'C'`
//! (CRC-32) with every byte ZDLE-escaped.

use super::encoding::{dehexify, encode_byte, hexify, ZDLE};
use super::Flags;
use crate::crc::{zmodem_crc16, zmodem_crc32};
use crate::{C_CR, C_LF, C_XON};
use core::convert::TryFrom;
use std::fmt::{self, Display};

pub(super) const ZPAD: u8 = b'*';

/// Frame types.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum FrameType {
    /// Request receive init
    ZRQINIT = 0,
    /// Receiver capabilities and packet size
    ZRINIT = 1,
    /// Send init sequence (optional)
    ZSINIT = 2,
    /// ACK to above
    ZACK = 3,
    /// File name from sender
    ZFILE = 4,
    /// To sender: skip this file
    ZSKIP = 5,
    /// Last packet was garbled
    ZNAK = 6,
    /// Abort batch transfers
    ZABORT = 7,
    /// Finish session
    ZFIN = 8,
    /// Resume data trans at this position
    ZRPOS = 9,
    /// Data packet(s) follow
    ZDATA = 10,
    /// End of file
    ZEOF = 11,
    /// Fatal read or write error detected
    ZFERR = 12,
    /// Request for file CRC and response
    ZCRC = 13,
    /// Receiver's challenge
    ZCHALLENGE = 14,
    /// Request is complete
    ZCOMPL = 15,
    /// Other end canned session with CAN*5
    ZCAN = 16,
    /// Request for free bytes on filesystem
    ZFREECNT = 17,
    /// Command from sending program
    ZCOMMAND = 18,
}

const FRAME_TYPES: &[FrameType] = &[
    FrameType::ZRQINIT,
    FrameType::ZRINIT,
    FrameType::ZSINIT,
    FrameType::ZACK,
    FrameType::ZFILE,
    FrameType::ZSKIP,
    FrameType::ZNAK,
    FrameType::ZABORT,
    FrameType::ZFIN,
    FrameType::ZRPOS,
    FrameType::ZDATA,
    FrameType::ZEOF,
    FrameType::ZFERR,
    FrameType::ZCRC,
    FrameType::ZCHALLENGE,
    FrameType::ZCOMPL,
    FrameType::ZCAN,
    FrameType::ZFREECNT,
    FrameType::ZCOMMAND,
];

#[derive(Clone, Copy, Debug)]
pub(super) struct InvalidFrame;

impl TryFrom<u8> for FrameType {
    type Error = InvalidFrame;

    fn try_from(value: u8) -> Result<Self, InvalidFrame> {
        FRAME_TYPES
            .iter()
            .find(|t| value == **t as u8)
            .map_or(Err(InvalidFrame), |t| Ok(*t))
    }
}

impl Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The argument of these frame types travels little-endian; everything
/// else is big-endian.
fn little_endian_argument(ptype: FrameType) -> bool {
    matches!(
        ptype,
        FrameType::ZRPOS
            | FrameType::ZEOF
            | FrameType::ZCRC
            | FrameType::ZCOMPL
            | FrameType::ZFREECNT
            | FrameType::ZSINIT
    )
}

/// These types always go out as hex headers: the receiver may not yet
/// know our CRC capability when it sees them. ZCRC is kept in hex both
/// ways for lrzsz's sake.
fn always_hex(ptype: FrameType) -> bool {
    matches!(
        ptype,
        FrameType::ZRQINIT
            | FrameType::ZRINIT
            | FrameType::ZSINIT
            | FrameType::ZCHALLENGE
            | FrameType::ZRPOS
            | FrameType::ZCRC
    )
}

/// A parsed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Header {
    pub ptype: FrameType,
    pub argument: u32,
    pub use_crc32: bool,
}

impl Header {
    /// Frame types that are followed by a data subpacket.
    pub fn has_data(&self) -> bool {
        matches!(
            self.ptype,
            FrameType::ZSINIT | FrameType::ZFILE | FrameType::ZDATA | FrameType::ZCOMMAND
        )
    }
}

pub(super) enum ParsedHeader {
    /// Not enough bytes for a complete header.
    NoData,
    /// Junk that is not a frame header.
    Invalid,
    /// A well-formed header whose CRC failed.
    CrcError,
    Ok(Header),
}

fn header_bytes(ptype: FrameType, argument: u32) -> [u8; 5] {
    let mut header = [0u8; 5];
    header[0] = ptype as u8;
    let arg = if little_endian_argument(ptype) {
        argument.to_le_bytes()
    } else {
        argument.to_be_bytes()
    };
    header[1..5].copy_from_slice(&arg);
    header
}

/// Serialise one frame header. `use_crc32` selects the binary CRC-32
/// form for types that are not forced to hex; `sending` applies the
/// sender-side ZSINIT exception (binary CRC-32 once negotiated, because
/// rz assumes it). Returns true when the hex form was used.
pub(super) fn build_header(
    ptype: FrameType,
    argument: u32,
    use_crc32: bool,
    sending: bool,
    flags: Flags,
    map: &[u8; 256],
    out: &mut Vec<u8>,
) -> bool {
    let header = header_bytes(ptype, argument);

    let mut do_hex = if always_hex(ptype) {
        true
    } else {
        flags.intersects(Flags::ESCCTL | Flags::ESC8)
    };
    if ptype == FrameType::ZSINIT && sending && use_crc32 {
        do_hex = false;
    }

    if do_hex {
        out.push(ZPAD);
        out.push(ZPAD);
        out.push(ZDLE);
        out.push(b'B');
        hexify(&header, out);
        // Hex headers always use the 16-bit CRC.
        let crc = zmodem_crc16(&header, None);
        hexify(&crc.to_be_bytes(), out);
        out.push(C_CR);
        // lrzsz sets the high bit on the LF.
        out.push(C_LF | 0x80);
        match ptype {
            FrameType::ZFIN | FrameType::ZACK => {}
            _ => out.push(C_XON),
        }
    } else {
        out.push(ZPAD);
        out.push(ZDLE);
        if use_crc32 {
            out.push(b'C');
        } else {
            out.push(b'A');
        }
        for &b in &header {
            encode_byte(b, map, out);
        }
        if use_crc32 {
            let crc = zmodem_crc32(&header, None);
            for b in crc.to_le_bytes() {
                encode_byte(b, map, out);
            }
        } else {
            let crc = zmodem_crc16(&header, None);
            for b in crc.to_be_bytes() {
                encode_byte(b, map, out);
            }
        }
    }
    do_hex
}

/// Read one possibly-escaped byte at `input[*i]`.
fn next_unescaped(input: &[u8], i: &mut usize) -> Result<Option<u8>, InvalidFrame> {
    if *i >= input.len() {
        return Ok(None);
    }
    let ch = input[*i];
    *i += 1;
    if ch != ZDLE {
        return Ok(Some(ch));
    }
    if *i >= input.len() {
        return Ok(None);
    }
    let escaped = input[*i];
    *i += 1;
    match escaped {
        b'l' => Ok(Some(0x7F)),
        b'm' => Ok(Some(0xFF)),
        _ if escaped & 0x40 != 0 => Ok(Some(escaped & 0xBF)),
        _ => Err(InvalidFrame),
    }
}

/// Parse one frame header from the front of `input`. On every outcome,
/// `discard` is the number of bytes the caller should drop.
pub(super) fn parse_header(input: &[u8]) -> (ParsedHeader, usize) {
    // Find the start of the frame.
    let mut begin = 0;
    while begin < input.len() && input[begin] != ZPAD {
        begin += 1;
    }
    if begin >= input.len() {
        return (ParsedHeader::NoData, begin);
    }
    let junk = begin;

    while begin < input.len() && input[begin] == ZPAD {
        begin += 1;
    }
    if begin >= input.len() {
        return (ParsedHeader::NoData, junk);
    }

    if input[begin] != ZDLE {
        return (ParsedHeader::Invalid, junk + 1);
    }
    begin += 1;
    if begin >= input.len() {
        return (ParsedHeader::NoData, junk);
    }

    let form = input[begin];
    begin += 1;

    let mut raw = [0u8; 9];
    let use_crc32;
    let crc_given: u32;

    match form {
        b'A' => {
            use_crc32 = false;
            let mut i = begin;
            for slot in raw.iter_mut().take(7) {
                match next_unescaped(input, &mut i) {
                    Ok(Some(b)) => *slot = b,
                    Ok(None) => return (ParsedHeader::NoData, junk),
                    Err(_) => return (ParsedHeader::Invalid, junk + 1),
                }
            }
            begin = i;
            crc_given = u32::from(u16::from_be_bytes([raw[5], raw[6]]));
        }
        b'C' => {
            use_crc32 = true;
            let mut i = begin;
            for slot in raw.iter_mut().take(9) {
                match next_unescaped(input, &mut i) {
                    Ok(Some(b)) => *slot = b,
                    Ok(None) => return (ParsedHeader::NoData, junk),
                    Err(_) => return (ParsedHeader::Invalid, junk + 1),
                }
            }
            begin = i;
            crc_given = u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]);
        }
        b'B' => {
            use_crc32 = false;
            if input.len() - begin < 14 + 2 {
                return (ParsedHeader::NoData, junk);
            }
            let Some(decoded) = dehexify(&input[begin..begin + 14]) else {
                return (ParsedHeader::Invalid, junk + 1);
            };
            raw[..5].copy_from_slice(&decoded[..5]);
            crc_given = u32::from(u16::from_be_bytes([decoded[5], decoded[6]]));
            begin += 14;
            // sz sends 0d 8a after each hex header...
            begin += 2;
            // ...and XON after all of them except ZFIN and ZACK.
            match FrameType::try_from(raw[0]) {
                Ok(FrameType::ZFIN) | Ok(FrameType::ZACK) => {}
                _ => {
                    if input.len() <= begin {
                        return (ParsedHeader::NoData, junk);
                    }
                    begin += 1;
                }
            }
        }
        _ => return (ParsedHeader::Invalid, junk + 1),
    }

    let Ok(ptype) = FrameType::try_from(raw[0]) else {
        return (ParsedHeader::Invalid, begin);
    };

    let argument = if little_endian_argument(ptype) {
        u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]])
    } else {
        u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]])
    };

    let crc_computed = if use_crc32 {
        zmodem_crc32(&raw[..5], None)
    } else {
        u32::from(zmodem_crc16(&raw[..5], None))
    };
    if crc_computed != crc_given {
        log::warn!(
            "ZMODEM: header CRC mismatch: given {:08x} computed {:08x}",
            crc_given,
            crc_computed
        );
        return (ParsedHeader::CrcError, begin);
    }

    (
        ParsedHeader::Ok(Header {
            ptype,
            argument,
            use_crc32,
        }),
        begin,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zmodem::encoding::build_encode_map;
    use rstest::rstest;

    fn parse_ok(wire: &[u8]) -> (Header, usize) {
        match parse_header(wire) {
            (ParsedHeader::Ok(h), discard) => (h, discard),
            _ => panic!("header did not parse"),
        }
    }

    #[test]
    pub fn hex_zrqinit_wire_bytes() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(FrameType::ZRQINIT, 0, false, true, Flags::empty(), &map, &mut wire);
        assert_eq!(&wire[..4], &[ZPAD, ZPAD, ZDLE, b'B']);
        assert_eq!(&wire[4..14], b"0000000000");
        assert_eq!(wire[wire.len() - 3], C_CR);
        assert_eq!(wire[wire.len() - 2], C_LF | 0x80);
        assert_eq!(wire[wire.len() - 1], C_XON);
    }

    #[rstest]
    #[case(FrameType::ZRQINIT, 0)]
    #[case(FrameType::ZRINIT, 0x23)]
    #[case(FrameType::ZRPOS, 0x01020304)]
    #[case(FrameType::ZCRC, 0xDEADBEEF)]
    #[case(FrameType::ZCHALLENGE, 0xCAFEBABE)]
    pub fn hex_header_round_trip(#[case] ptype: FrameType, #[case] argument: u32) {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(ptype, argument, true, false, Flags::empty(), &map, &mut wire);
        let (header, discard) = parse_ok(&wire);
        assert_eq!(header.ptype, ptype);
        assert_eq!(header.argument, argument);
        assert!(!header.use_crc32);
        assert_eq!(discard, wire.len());
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    pub fn binary_header_round_trip(#[case] use_crc32: bool) {
        let map = build_encode_map(Flags::empty());
        for argument in [0u32, 0x18181818, 0x7F11FF13] {
            let mut wire = Vec::new();
            build_header(
                FrameType::ZDATA,
                argument,
                use_crc32,
                true,
                Flags::empty(),
                &map,
                &mut wire,
            );
            assert_eq!(wire[0], ZPAD);
            assert_eq!(wire[1], ZDLE);
            assert_eq!(wire[2], if use_crc32 { b'C' } else { b'A' });
            let (header, discard) = parse_ok(&wire);
            assert_eq!(header.ptype, FrameType::ZDATA);
            assert_eq!(header.argument, argument);
            assert_eq!(header.use_crc32, use_crc32);
            assert_eq!(discard, wire.len());
        }
    }

    #[test]
    pub fn zeof_argument_is_little_endian() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(FrameType::ZEOF, 16, false, true, Flags::empty(), &map, &mut wire);
        // Binary CRC-16 form: * ZDLE 'A' type arg...
        assert_eq!(wire[3], FrameType::ZEOF as u8);
        assert_eq!(&wire[4..8], &[16, 0, 0, 0]);
    }

    #[test]
    pub fn zfile_argument_is_big_endian() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(FrameType::ZFILE, 5, false, true, Flags::empty(), &map, &mut wire);
        assert_eq!(&wire[4..8], &[0, 0, 0, 5]);
    }

    #[test]
    pub fn sender_zsinit_goes_binary_after_crc32() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        let hex = build_header(FrameType::ZSINIT, 0, true, true, Flags::empty(), &map, &mut wire);
        assert!(!hex);
        assert_eq!(wire[2], b'C');

        // The receiver-side ZSINIT (and a CRC-16 session) stays hex.
        wire.clear();
        let hex = build_header(FrameType::ZSINIT, 0, false, true, Flags::empty(), &map, &mut wire);
        assert!(hex);
    }

    #[test]
    pub fn corrupt_hex_header_is_crc_error() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(FrameType::ZRINIT, 0x23, false, false, Flags::empty(), &map, &mut wire);
        wire[5] = if wire[5] == b'0' { b'1' } else { b'0' };
        assert!(matches!(parse_header(&wire).0, ParsedHeader::CrcError));
    }

    #[test]
    pub fn leading_junk_is_skipped() {
        let map = build_encode_map(Flags::empty());
        let mut wire = vec![0xAA, 0x55, 0x00];
        build_header(FrameType::ZFIN, 0, false, true, Flags::empty(), &map, &mut wire);
        let (header, _) = parse_ok(&wire);
        assert_eq!(header.ptype, FrameType::ZFIN);
    }

    #[test]
    pub fn short_buffer_reports_no_data() {
        let map = build_encode_map(Flags::empty());
        let mut wire = Vec::new();
        build_header(FrameType::ZRINIT, 0, false, false, Flags::empty(), &map, &mut wire);
        for len in 0..wire.len() - 1 {
            assert!(
                matches!(parse_header(&wire[..len]).0, ParsedHeader::NoData),
                "length {}",
                len
            );
        }
    }
}
