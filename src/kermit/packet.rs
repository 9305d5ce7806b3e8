// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kermit packet layer: wire layout, block checks, assembly and parsing.
//!
//! Short packet: `MARK tochar(LEN) tochar(SEQ) TYPE data... CHECK EOL`.
//! Long packet: LEN is tochar(0), followed by two base-95 length digits
//! and a 6-bit header checksum before the data.

use super::encoding::{tochar, unchar};
use super::Params;
use crate::crc::kermit_crc16;
use core::convert::TryFrom;
use std::fmt::{self, Display};

/// Kermit packet types and their wire letters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PacketType {
    SendInit,
    Ack,
    Nak,
    Data,
    FileHeader,
    Eof,
    Break,
    Error,
    ServerInit,
    Text,
    ReceiveInit,
    Attributes,
    HostCommand,
    KermitCommand,
    GenericCommand,
    Reserved1,
    Reserved2,
}

const PACKET_TYPES: &[(PacketType, u8, &str)] = &[
    (PacketType::SendInit, b'S', "Send-Init"),
    (PacketType::Ack, b'Y', "ACK Acknowledge"),
    (PacketType::Nak, b'N', "NAK Negative Acknowledge"),
    (PacketType::Data, b'D', "File Data"),
    (PacketType::FileHeader, b'F', "File Header"),
    (PacketType::Eof, b'Z', "EOF End Of File"),
    (PacketType::Break, b'B', "EOT Break Transmission"),
    (PacketType::Error, b'E', "Error"),
    (PacketType::ServerInit, b'I', "Initialize Server"),
    (PacketType::Text, b'X', "Text Header"),
    (PacketType::ReceiveInit, b'R', "Receive Initiate"),
    (PacketType::Attributes, b'A', "File Attributes"),
    (PacketType::HostCommand, b'C', "Host Command"),
    (PacketType::KermitCommand, b'K', "Kermit Command"),
    (PacketType::GenericCommand, b'G', "Generic Kermit Command"),
    (PacketType::Reserved1, b'T', "Reserved"),
    (PacketType::Reserved2, b'Q', "Reserved"),
];

#[derive(Clone, Copy, Debug)]
pub(super) struct InvalidType;

impl TryFrom<u8> for PacketType {
    type Error = InvalidType;

    fn try_from(value: u8) -> Result<Self, InvalidType> {
        PACKET_TYPES
            .iter()
            .find(|(_, ch, _)| *ch == value)
            .map_or(Err(InvalidType), |(t, _, _)| Ok(*t))
    }
}

impl PacketType {
    pub fn wire_char(self) -> u8 {
        PACKET_TYPES.iter().find(|(t, _, _)| *t == self).unwrap().1
    }

    pub fn description(self) -> &'static str {
        PACKET_TYPES.iter().find(|(t, _, _)| *t == self).unwrap().2
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A parsed inbound packet. `data` is still in wire (escaped) form; the
/// engine decodes it with the knowledge of which packet types skip
/// prefix handling.
#[derive(Debug)]
pub(super) struct RawPacket {
    pub seq: u8,
    pub ptype: PacketType,
    /// Normalised length: SEQ through CHECK for short packets, the
    /// extended header through CHECK for long packets.
    pub length: usize,
    pub long_packet: bool,
    pub data: Vec<u8>,
}

/// Outcome of scanning the reassembly buffer for one packet.
pub(super) enum Parse {
    /// Not enough bytes; discard `discard` bytes of leading junk and
    /// wait for more input.
    Incomplete { discard: usize },
    /// A framing or check failure worth a NAK; discard `discard` bytes.
    Bad { discard: usize },
    /// A complete, check-verified packet; discard `discard` bytes.
    Ok { packet: RawPacket, discard: usize },
}

/// The 6-bit arithmetic checksum (block check 1, also the long-packet
/// header check): `(sum + ((sum & 0xC0) >> 6)) & 0x3F`.
pub(super) fn checksum1(data: &[u8], seven_bit_only: bool) -> u8 {
    let sum = arith_sum(data, seven_bit_only);
    ((sum + ((sum & 0xC0) >> 6)) & 0x3F) as u8
}

/// The 12-bit arithmetic checksum (block checks 2 and B).
pub(super) fn checksum2(data: &[u8], seven_bit_only: bool) -> u16 {
    (arith_sum(data, seven_bit_only) & 0x0FFF) as u16
}

fn arith_sum(data: &[u8], seven_bit_only: bool) -> u32 {
    data.iter()
        .map(|&b| if seven_bit_only { b & 0x7F } else { b } as u32)
        .sum()
}

/// Number of check characters on the wire for a check type.
pub(super) fn check_length(check_type: u8) -> usize {
    match check_type {
        12 => 2,
        t => t as usize,
    }
}

/// Append the check characters for `check_type` over `covered`.
fn push_check(check_type: u8, covered: &[u8], seven_bit_only: bool, out: &mut Vec<u8>) {
    match check_type {
        1 => out.push(tochar(checksum1(covered, seven_bit_only))),
        2 => {
            let sum = checksum2(covered, seven_bit_only);
            out.push(tochar(((sum >> 6) & 0x3F) as u8));
            out.push(tochar((sum & 0x3F) as u8));
        }
        12 => {
            let sum = checksum2(covered, seven_bit_only);
            out.push(tochar((((sum >> 6) & 0x3F) + 1) as u8));
            out.push(tochar(((sum & 0x3F) + 1) as u8));
        }
        _ => {
            let crc = kermit_crc16(covered, seven_bit_only);
            out.push(tochar(((crc >> 12) & 0x0F) as u8));
            out.push(tochar(((crc >> 6) & 0x3F) as u8));
            out.push(tochar((crc & 0x3F) as u8));
        }
    }
}

/// Verify the check characters found at `given` against `covered`.
fn verify_check(check_type: u8, covered: &[u8], given: &[u8], seven_bit_only: bool) -> bool {
    match check_type {
        1 => given[0] == tochar(checksum1(covered, seven_bit_only)),
        2 => {
            let sum = checksum2(covered, seven_bit_only);
            sum == ((unchar(given[0]) as u16) << 6) | unchar(given[1]) as u16
        }
        12 => {
            let sum = checksum2(covered, seven_bit_only);
            sum == ((unchar(given[0]).wrapping_sub(1) as u16) << 6)
                | unchar(given[1]).wrapping_sub(1) as u16
        }
        _ => {
            let crc = kermit_crc16(covered, seven_bit_only);
            crc == ((unchar(given[0]) as u16) << 12)
                | ((unchar(given[1]) as u16) << 6)
                | unchar(given[2]) as u16
        }
    }
}

/// Scan the reassembly buffer for one complete packet and verify its
/// check value. `check_type` is the negotiated block check; Send-Init
/// and NAK packets carry their own check type regardless.
pub(super) fn parse(input: &[u8], parms: &Params, check_type: u8, seven_bit_only: bool) -> Parse {
    if input.len() < 5 {
        return Parse::Incomplete { discard: 0 };
    }

    let mut mark = 0;
    while input[mark] != parms.mark {
        mark += 1;
        if mark >= input.len() {
            return Parse::Incomplete { discard: mark };
        }
    }
    if input.len() - mark < 5 {
        return Parse::Incomplete { discard: mark };
    }

    let len_byte = unchar(input[mark + 1]) as usize;
    let mut long_packet = false;

    if len_byte == 0 {
        if parms.long_packets {
            long_packet = true;
        } else {
            return Parse::Bad { discard: input.len() };
        }
    } else if len_byte <= 2 {
        return Parse::Bad { discard: input.len() };
    } else if len_byte > parms.maxl as usize {
        return Parse::Bad { discard: input.len() };
    }

    // Byte positions relative to MARK: LEN +1, SEQ +2, TYPE +3; long
    // packets add LENX1 +4, LENX2 +5, HCHECK +6.
    let mut length = len_byte;
    if !long_packet {
        if input.len() - (mark + 2) < length {
            return Parse::Incomplete { discard: mark };
        }
    } else if input.len() - (mark + 2) < 5 {
        return Parse::Incomplete { discard: mark };
    }

    let seq = unchar(input[mark + 2]);
    if seq > 63 {
        return Parse::Bad { discard: input.len() };
    }

    let type_char = input[mark + 3];
    let ptype = match PacketType::try_from(type_char) {
        Ok(t) => t,
        Err(_) => return Parse::Bad { discard: input.len() },
    };

    if long_packet {
        let lenx1 = unchar(input[mark + 4]) as usize;
        let lenx2 = unchar(input[mark + 5]) as usize;
        length = lenx1 * 95 + lenx2;
        if length > parms.maxlx1 as usize * 95 + parms.maxlx2 as usize {
            return Parse::Bad { discard: input.len() };
        }
        // Normalise: count the extended header, SEQ and TYPE too.
        length += 5;

        let hcheck_given = unchar(input[mark + 6]);
        let hcheck = checksum1(&input[mark + 1..mark + 6], false);
        if hcheck_given != hcheck {
            return Parse::Bad { discard: input.len() };
        }

        if input.len() - (mark + 7) < length - 5 {
            return Parse::Incomplete { discard: mark };
        }
    }

    let check_type = match ptype {
        PacketType::SendInit => 1,
        PacketType::Nak => {
            let t = len_byte.saturating_sub(2);
            if (1..=3).contains(&t) {
                t as u8
            } else {
                1
            }
        }
        _ => check_type,
    };
    let check_len = check_length(check_type);
    let overhead = if long_packet { 5 } else { 2 };
    if length < overhead + check_len {
        return Parse::Bad { discard: input.len() };
    }

    let (data_start, data_len) = if long_packet {
        (mark + 7, length - 5 - check_len)
    } else {
        (mark + 4, length - 2 - check_len)
    };

    // The check covers everything from the LEN byte through the data.
    let covered = &input[mark + 1..data_start + data_len];
    let given = &input[data_start + data_len..data_start + data_len + check_len];
    if !verify_check(check_type, covered, given, seven_bit_only) {
        return Parse::Bad { discard: input.len() };
    }

    // One past the last check character; the EOL byte is skipped as
    // leading junk on the next scan.
    let discard = mark + 2 + length;

    Parse::Ok {
        packet: RawPacket {
            seq,
            ptype,
            length,
            long_packet,
            data: input[data_start..data_start + data_len].to_vec(),
        },
        discard,
    }
}

/// Assemble a packet around an already-encoded data field.
pub(super) fn assemble(
    seq: u8,
    ptype: PacketType,
    encoded_data: &[u8],
    long_packet: bool,
    check_type: u8,
    parms: &Params,
    seven_bit_only: bool,
    out: &mut Vec<u8>,
) {
    let check_len = check_length(check_type);
    let start = out.len();
    out.push(parms.mark);
    if long_packet {
        let extended = encoded_data.len() + check_len;
        out.push(tochar(0));
        out.push(tochar(seq));
        out.push(ptype.wire_char());
        out.push(tochar((extended / 95) as u8));
        out.push(tochar((extended % 95) as u8));
        let hcheck = checksum1(&out[start + 1..start + 6], false);
        out.push(tochar(hcheck));
    } else {
        let packet_length = encoded_data.len() + 2 + check_len;
        out.push(tochar(packet_length as u8));
        out.push(tochar(seq));
        out.push(ptype.wire_char());
    }
    out.extend_from_slice(encoded_data);
    let covered = out[start + 1..].to_vec();
    push_check(check_type, &covered, seven_bit_only, out);
    out.push(parms.eol);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn test_parms() -> Params {
        let mut parms = Params::outgoing_defaults(false, true, true);
        parms.maxl = 80;
        parms
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(12)]
    pub fn assemble_parse_round_trip(#[case] check_type: u8) {
        let parms = test_parms();
        let mut wire = Vec::new();
        assemble(
            5,
            PacketType::Data,
            b"some packet data",
            false,
            check_type,
            &parms,
            false,
            &mut wire,
        );
        match parse(&wire, &parms, check_type, false) {
            Parse::Ok { packet, discard } => {
                assert_eq!(packet.seq, 5);
                assert_eq!(packet.ptype, PacketType::Data);
                assert!(!packet.long_packet);
                assert_eq!(packet.data, b"some packet data");
                assert_eq!(discard, wire.len() - 1); // EOL left behind
            }
            _ => panic!("packet did not parse"),
        }
    }

    #[test]
    pub fn long_packet_round_trip() {
        let parms = test_parms();
        let data = vec![b'x'; 300];
        let mut wire = Vec::new();
        assemble(9, PacketType::Data, &data, true, 3, &parms, false, &mut wire);
        assert_eq!(wire[1], tochar(0));
        match parse(&wire, &parms, 3, false) {
            Parse::Ok { packet, .. } => {
                assert!(packet.long_packet);
                assert_eq!(packet.seq, 9);
                assert_eq!(packet.data, data);
            }
            _ => panic!("long packet did not parse"),
        }
    }

    #[test]
    pub fn long_header_checksum_formula() {
        // HCHECK over (LEN=0, SEQ, TYPE, LENX1, LENX2) is the 6-bit fold.
        let parms = test_parms();
        let mut wire = Vec::new();
        assemble(1, PacketType::Data, &[b'y'; 100], true, 3, &parms, false, &mut wire);
        let sum: u32 = wire[1..6].iter().map(|&b| b as u32).sum();
        assert_eq!(wire[6], tochar((((sum & 0xC0) >> 6) + sum) as u8 & 0x3F));
    }

    #[test]
    pub fn corrupt_check_is_bad() {
        let parms = test_parms();
        let mut wire = Vec::new();
        assemble(0, PacketType::Data, b"abc", false, 3, &parms, false, &mut wire);
        let last_check = wire.len() - 2;
        wire[last_check] ^= 0x01;
        assert!(matches!(
            parse(&wire, &parms, 3, false),
            Parse::Bad { .. }
        ));
    }

    #[test]
    pub fn truncated_packet_waits_for_more() {
        let parms = test_parms();
        let mut wire = Vec::new();
        assemble(0, PacketType::Data, b"abcdefgh", false, 3, &parms, false, &mut wire);
        assert!(matches!(
            parse(&wire[..wire.len() - 4], &parms, 3, false),
            Parse::Incomplete { discard: 0 }
        ));
    }

    #[test]
    pub fn junk_before_mark_is_discarded() {
        let parms = test_parms();
        let mut wire = vec![0x55, 0xAA, 0x55];
        assemble(0, PacketType::Ack, b"", false, 1, &parms, false, &mut wire);
        match parse(&wire, &parms, 1, false) {
            Parse::Ok { packet, .. } => assert_eq!(packet.ptype, PacketType::Ack),
            _ => panic!("junk prefix broke the parse"),
        }
    }

    #[test]
    pub fn nak_carries_its_own_check_type() {
        // A NAK with a type-1 check parses even while type 3 is
        // negotiated, per the length-derived check rule.
        let parms = test_parms();
        let mut wire = Vec::new();
        assemble(3, PacketType::Nak, b"", false, 1, &parms, false, &mut wire);
        assert!(matches!(
            parse(&wire, &parms, 3, false),
            Parse::Ok { .. }
        ));
    }
}
