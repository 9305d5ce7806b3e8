// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kermit byte-level encoding: printable-range arithmetic, control
//! prefixing (QCTL), 8-bit prefixing (QBIN), and run-length encoding
//! (REPT).

/// Turn a small byte value into a printable ASCII character.
pub(super) fn tochar(b: u8) -> u8 {
    b + 32
}

/// Turn a printable ASCII character back into a small byte value.
pub(super) fn unchar(ch: u8) -> u8 {
    ch.wrapping_sub(32)
}

/// Toggle a byte between its control and printable forms.
pub(super) fn ctl(b: u8) -> u8 {
    b ^ 0x40
}

/// The active prefix characters for one direction of the link. A space
/// means "not in use".
#[derive(Clone, Copy, Debug)]
pub(super) struct Quoting {
    pub qctl: u8,
    pub qbin: u8,
    pub rept: u8,
    /// Check type 'B' lowers the RLE threshold for runs of spaces.
    pub check_b: bool,
}

/// Encode one byte (with its run length) into `out`. At most five bytes
/// are appended per call: REPT, count, QBIN, QCTL, data.
pub(super) fn encode_byte(ch: u8, mut repeat: usize, q: &Quoting, out: &mut Vec<u8>) {
    if q.rept != b' '
        && (repeat >= 3 || (q.check_b && ch == b' ' && repeat >= 2))
    {
        out.push(q.rept);
        out.push(tochar(repeat as u8));
        repeat = 1;
    }

    for _ in 0..repeat {
        let ch7 = ch & 0x7F;
        let need_qbin = q.qbin != b' ' && (ch & 0x80) != 0;
        let is_ctl = ch7 < 0x20 || ch7 == 0x7F;
        let need_qctl = is_ctl
            || (q.rept != b' ' && ch7 == q.rept)
            || (q.qbin != b' ' && ch7 == q.qbin)
            || ch7 == q.qctl;

        let mut out_ch = ch;
        if need_qbin {
            out.push(q.qbin);
            out_ch = ch7;
        }
        if need_qctl {
            out.push(q.qctl);
        }
        out.push(if is_ctl { ctl(out_ch) } else { out_ch });
    }
}

/// Decode an escaped data field back into raw bytes, appending to `out`.
/// `strip_cr` implements the receiver's text-mode CRLF normalisation.
/// Returns false on a malformed prefix sequence (QBIN after QBIN).
pub(super) fn decode_field(input: &[u8], q: &Quoting, strip_cr: bool, out: &mut Vec<u8>) -> bool {
    let mut prefix_ctrl = false;
    let mut prefix_8bit = false;
    let mut prefix_rept = false;
    let mut repeat_count: usize = 1;
    let mut pending: Option<u8> = None;

    let mut emit = |ch: u8, count: usize, out: &mut Vec<u8>| {
        for _ in 0..count {
            if strip_cr && ch == crate::C_CR {
                continue;
            }
            out.push(ch);
        }
    };

    for &raw in input {
        if let Some(ch) = pending.take() {
            emit(ch, repeat_count, out);
            repeat_count = 1;
        }

        let mut ch = raw;

        if q.rept != b' ' && ch == q.rept {
            if prefix_ctrl && prefix_8bit {
                pending = Some(q.rept | 0x80);
                prefix_ctrl = false;
                prefix_8bit = false;
                prefix_rept = false;
                continue;
            }
            if prefix_ctrl {
                pending = Some(q.rept);
                prefix_ctrl = false;
                prefix_rept = false;
                continue;
            }
            if prefix_rept {
                repeat_count = unchar(q.rept) as usize;
                prefix_rept = false;
                continue;
            }
            prefix_rept = true;
            continue;
        }

        if prefix_rept {
            repeat_count = unchar(ch) as usize;
            prefix_rept = false;
            continue;
        }

        if ch == q.qctl {
            if prefix_8bit && prefix_ctrl {
                pending = Some(q.qctl | 0x80);
                prefix_ctrl = false;
                prefix_8bit = false;
                continue;
            }
            if prefix_ctrl {
                pending = Some(q.qctl);
                prefix_ctrl = false;
                continue;
            }
            prefix_ctrl = true;
            continue;
        }

        if q.qbin != b' ' && ch == q.qbin {
            if prefix_8bit && !prefix_ctrl {
                return false;
            }
            if prefix_8bit && prefix_ctrl {
                pending = Some(q.qbin | 0x80);
                prefix_ctrl = false;
                prefix_8bit = false;
                continue;
            }
            if prefix_ctrl {
                pending = Some(q.qbin);
                prefix_ctrl = false;
                continue;
            }
            prefix_8bit = true;
            continue;
        }

        if prefix_ctrl {
            // The control prefix may quote anything; un-ctl only actual
            // control characters.
            let candidate = ctl(ch) & 0x7F;
            if candidate < 0x20 || candidate == 0x7F {
                ch = ctl(ch);
            }
            prefix_ctrl = false;
        }
        if prefix_8bit {
            ch |= 0x80;
            prefix_8bit = false;
        }

        emit(ch, repeat_count, out);
        repeat_count = 1;
    }

    if let Some(ch) = pending.take() {
        emit(ch, repeat_count, out);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const Q: Quoting = Quoting {
        qctl: b'#',
        qbin: b'&',
        rept: b'~',
        check_b: false,
    };

    const Q7: Quoting = Quoting {
        qctl: b'#',
        qbin: b' ',
        rept: b' ',
        check_b: false,
    };

    fn encode_all(data: &[u8], q: &Quoting) -> Vec<u8> {
        let mut out = Vec::new();
        let mut iter = data.iter().peekable();
        while let Some(&ch) = iter.next() {
            let mut run = 1;
            while run < 94 && iter.peek() == Some(&&ch) {
                iter.next();
                run += 1;
            }
            encode_byte(ch, run, q, &mut out);
        }
        out
    }

    #[rstest]
    #[case(b"plain text".as_slice())]
    #[case(b"\x00\x01\x1F\x7F".as_slice())]
    #[case(b"#quoted#and~reptd&".as_slice())]
    #[case(&[0x80, 0x9F, 0xFF, 0xA3, b'a' | 0x80])]
    #[case(&[b'~' | 0x80, b'#' | 0x80, b'&' | 0x80])]
    pub fn round_trip(#[case] data: &[u8]) {
        for q in [Q, Q7] {
            let encoded = encode_all(data, &q);
            // Everything on the wire must be printable or prefixed.
            let mut decoded = Vec::new();
            assert!(decode_field(&encoded, &q, false, &mut decoded));
            assert_eq!(decoded, data, "quoting {:?}", q);
        }
    }

    #[test]
    pub fn run_length_compresses() {
        let data = vec![b' '; 94];
        let encoded = encode_all(&data, &Q);
        assert_eq!(encoded, vec![b'~', tochar(94), b' ']);
        let mut decoded = Vec::new();
        assert!(decode_field(&encoded, &Q, false, &mut decoded));
        assert_eq!(decoded, data);
    }

    #[test]
    pub fn short_runs_stay_literal() {
        let encoded = encode_all(b"aa", &Q);
        assert_eq!(encoded, b"aa");
    }

    #[test]
    pub fn long_space_run_under_check_b() {
        // 600 spaces become ceil(600/94) runs of three bytes each.
        let data = vec![b' '; 600];
        let mut q = Q;
        q.check_b = true;
        let encoded = encode_all(&data, &q);
        assert_eq!(&encoded[..3], &[b'~', tochar(94), b' ']);
        assert!(encoded.len() <= 3 * 7 + 2);
        let mut decoded = Vec::new();
        assert!(decode_field(&encoded, &q, false, &mut decoded));
        assert_eq!(decoded, data);
    }

    #[test]
    pub fn check_b_space_pairs_use_rle() {
        let mut q = Q;
        q.check_b = true;
        let encoded = encode_all(b"  ", &q);
        assert_eq!(encoded, vec![b'~', tochar(2), b' ']);
    }

    #[test]
    pub fn escaped_run_of_controls() {
        let data = vec![0x0D; 10];
        let encoded = encode_all(&data, &Q);
        assert_eq!(encoded, vec![b'~', tochar(10), b'#', b'M']);
        let mut decoded = Vec::new();
        assert!(decode_field(&encoded, &Q, false, &mut decoded));
        assert_eq!(decoded, data);
    }

    #[test]
    pub fn strip_cr_on_decode() {
        let encoded = encode_all(b"line\r\n", &Q);
        let mut decoded = Vec::new();
        assert!(decode_field(&encoded, &Q, true, &mut decoded));
        assert_eq!(decoded, b"line\n");
    }

    #[test]
    pub fn qbin_qbin_is_an_error() {
        let mut decoded = Vec::new();
        assert!(!decode_field(&[b'&', b'&'], &Q, false, &mut decoded));
    }
}
