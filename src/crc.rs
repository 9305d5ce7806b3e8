// SPDX-License-Identifier: MIT OR Apache-2.0
//! CRC engines shared by the protocol modules.

use crc::{Crc, CRC_16_KERMIT, CRC_16_XMODEM, CRC_32_ISO_HDLC};

/// Kermit block check type 3: polynomial 0x8408 (reflected 0x1021),
/// initial value 0, no final inversion.
pub(crate) const KERMIT16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// ZMODEM binary headers and CRC-16 data subpackets: forward 0x1021,
/// initial value 0.
pub(crate) const XMODEM16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// ZMODEM CRC-32: IEEE 802 reflected 0xEDB88320, preset to !0, inverted.
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Kermit CRC-16 with the optional 7-bit channel masking. On a 7-bit
/// link the high bit of every byte is stripped before it enters the
/// accumulator.
pub(crate) fn kermit_crc16(data: &[u8], seven_bit_only: bool) -> u16 {
    let mut digest = KERMIT16.digest();
    if seven_bit_only {
        for &b in data {
            digest.update(&[b & 0x7F]);
        }
    } else {
        digest.update(data);
    }
    digest.finalize()
}

/// CRC-16 over a data subpacket payload plus its terminator byte.
pub(crate) fn zmodem_crc16(data: &[u8], terminator: Option<u8>) -> u16 {
    let mut digest = XMODEM16.digest();
    digest.update(data);
    if let Some(t) = terminator {
        digest.update(&[t]);
    }
    digest.finalize()
}

/// CRC-32 over a data subpacket payload plus its terminator byte.
pub(crate) fn zmodem_crc32(data: &[u8], terminator: Option<u8>) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(data);
    if let Some(t) = terminator {
        digest.update(&[t]);
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_residue_is_zero() {
        // A frame immediately followed by its own CRC bytes checks to 0.
        let data = b"123456789";
        let crc = XMODEM16.checksum(data);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(XMODEM16.checksum(&framed), 0);

        let crc = KERMIT16.checksum(data);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(KERMIT16.checksum(&framed), 0);
    }

    #[test]
    fn crc32_residue_constant() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let crc = CRC32.checksum(data);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(CRC32.checksum(&framed), 0x2144_DF1C);
    }

    #[test]
    fn check_values() {
        assert_eq!(XMODEM16.checksum(b"123456789"), 0x31C3);
        assert_eq!(KERMIT16.checksum(b"123456789"), 0x2189);
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn seven_bit_masking() {
        let clean = kermit_crc16(b"abc", false);
        let high: Vec<u8> = b"abc".iter().map(|b| b | 0x80).collect();
        assert_eq!(kermit_crc16(&high, true), clean);
        assert_ne!(kermit_crc16(&high, false), clean);
    }
}
