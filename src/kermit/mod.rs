// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Kermit protocol engine.
//!
//! States follow the protocol book: `S`, `SF`, `SA`, `SDW`, `SZ`, `SB`
//! on the sending side and `R`, `RF`, `RDW` on the receiving side, with
//! full-duplex sliding windows layered over both.

mod encoding;
mod packet;
mod window;

use self::encoding::{ctl, tochar, unchar, Quoting};
use self::packet::{PacketType, Parse, RawPacket};
use self::window::{Slot, Window};
use crate::session::{Config, FileRecord};
use crate::stats::{TransferState, TransferStats};
use crate::{C_CR, C_LF, C_SOH};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

/// Kermit allows up to 900k-byte extended packets; we top out at 1k.
const KERMIT_BLOCK_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Before the first byte is sent.
    Init,
    Complete,
    Abort,
    /// Send Send-Init.
    S,
    /// Send File-Header.
    Sf,
    /// Send Attributes.
    Sa,
    /// Send File-Data (windowing).
    Sdw,
    /// Send EOF.
    Sz,
    /// Send Break (EOT).
    Sb,
    /// Wait for Send-Init.
    R,
    /// Wait for File-Header.
    Rf,
    /// Wait for Attributes or File-Data (windowing).
    Rdw,
}

/// File collision behavior requested by the Attributes packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    New,
    Supersede,
    Append,
    Warn,
}

/// One side's Send-Init parameters, and after negotiation the merged
/// session parameters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Params {
    pub mark: u8,
    pub maxl: u32,
    pub time: u32,
    pub npad: u32,
    pub padc: u8,
    pub eol: u8,
    pub qctl: u8,
    pub qbin: u8,
    pub chkt: u8,
    pub rept: u8,
    pub capas: u32,
    pub windo: u32,
    pub maxlx1: u32,
    pub maxlx2: u32,
    pub whatami: u32,
    pub attributes: bool,
    pub windowing: bool,
    pub long_packets: bool,
    pub streaming: bool,
    pub windo_in: u32,
    pub windo_out: u32,
}

impl Params {
    /// The parameters we normally go in with.
    pub(crate) fn outgoing_defaults(seven_bit_only: bool, long_packets: bool, streaming: bool) -> Self {
        Params {
            mark: C_SOH,
            maxl: 80,
            time: 5,
            npad: 0,
            padc: 0x00,
            eol: C_CR,
            qctl: b'#',
            // 7-bit channel: do 8th-bit prefixing.
            qbin: if seven_bit_only { b'&' } else { b'Y' },
            chkt: b'3',
            rept: b'~',
            // RESEND, Attributes, sliding windows.
            capas: 0x10 | 0x08 | 0x04 | if long_packets { 0x02 } else { 0 },
            windo: 30,
            maxlx1: (KERMIT_BLOCK_SIZE / 95) as u32,
            maxlx2: (KERMIT_BLOCK_SIZE % 95) as u32,
            whatami: if streaming { 0x28 } else { 0x00 },
            attributes: true,
            windowing: true,
            long_packets,
            streaming,
            windo_in: 1,
            windo_out: 1,
        }
    }

    /// Bare Kermit defaults, the baseline a Send-Init is parsed onto.
    fn bare_defaults() -> Self {
        Params {
            mark: C_SOH,
            maxl: 80,
            time: 5,
            npad: 0,
            padc: 0,
            eol: C_CR,
            qctl: b'#',
            qbin: b' ',
            chkt: b'1',
            rept: b' ',
            capas: 0,
            windo: 0,
            maxlx1: 0,
            maxlx2: 0,
            whatami: 0,
            attributes: false,
            windowing: false,
            long_packets: false,
            streaming: false,
            windo_in: 1,
            windo_out: 1,
        }
    }
}

/// A fully decoded inbound packet.
#[derive(Debug)]
struct InPacket {
    seq: u8,
    ptype: PacketType,
    length: usize,
    data: Vec<u8>,
}

/// The next outbound packet, before wire encoding.
#[derive(Debug)]
struct OutPacket {
    seq: u8,
    ptype: PacketType,
    data: Vec<u8>,
}

enum InputSlot {
    /// Store at the window append position.
    Append,
    /// A retransmission of a packet already in the window.
    Existing(usize),
    /// Stored past a gap; still worth an ACK of its own.
    SavedOutOfOrder,
    /// Already dealt with (NAK sent or ignored).
    Handled,
}

pub(crate) struct Kermit {
    cfg: Config,
    state: State,
    sending: bool,
    /// Negotiated block check: 1, 2, 3, or 12 for type 'B'.
    check_type: u8,
    /// Logical sequence number; SEQ on the wire is this modulo 64.
    sequence_number: u64,
    local: Params,
    remote: Params,
    session: Params,

    file_name: Option<String>,
    file_size: u64,
    file_size_k: u64,
    file_modtime: Option<SystemTime>,
    file_position: u64,
    file_protection: Option<u32>,
    file_fullname: PathBuf,
    /// Upload stream; byte-at-a-time reads feed the RLE encoder.
    in_file: Option<BufReader<File>>,
    in_file_eof: bool,
    /// Download stream.
    out_file: Option<File>,
    outstanding_bytes: u64,
    block_size: usize,
    access: Access,

    timeout_begin: Instant,
    timeout_count: u32,
    first_r: bool,
    first_s: bool,
    first_sb: bool,
    sent_nak: bool,
    skip_file: bool,
    text_mode: bool,
    do_resend: bool,

    upload: Vec<FileRecord>,
    upload_i: usize,
    download_path: PathBuf,

    packet_buffer: Vec<u8>,
    input_packet: Option<InPacket>,
    output_queue: VecDeque<OutPacket>,
    input_window: Window,
    output_window: Window,
    ctrl_c_count: u32,
}

impl Kermit {
    fn new(sending: bool, upload: Vec<FileRecord>, download_path: PathBuf, cfg: &Config) -> Self {
        let defaults = Params::outgoing_defaults(
            cfg.seven_bit_only,
            cfg.kermit_long_packets,
            cfg.kermit_streaming,
        );
        Kermit {
            cfg: cfg.clone(),
            state: State::Init,
            sending,
            check_type: 1,
            sequence_number: 0,
            local: defaults,
            remote: Params::bare_defaults(),
            session: defaults,
            file_name: None,
            file_size: 0,
            file_size_k: 0,
            file_modtime: None,
            file_position: 0,
            file_protection: None,
            file_fullname: PathBuf::new(),
            in_file: None,
            in_file_eof: false,
            out_file: None,
            outstanding_bytes: 0,
            block_size: KERMIT_BLOCK_SIZE,
            access: Access::Warn,
            timeout_begin: Instant::now(),
            timeout_count: 0,
            first_r: true,
            first_s: true,
            first_sb: true,
            sent_nak: false,
            skip_file: false,
            text_mode: false,
            do_resend: false,
            upload,
            upload_i: 0,
            download_path,
            packet_buffer: Vec::new(),
            input_packet: None,
            output_queue: VecDeque::new(),
            input_window: Window::new(1),
            output_window: Window::new(1),
            ctrl_c_count: 0,
        }
    }

    /// Setup for an upload session; opens the first file.
    pub(crate) fn start_send(
        upload: Vec<FileRecord>,
        cfg: &Config,
        stats: &mut TransferStats,
    ) -> std::io::Result<Self> {
        let mut engine = Kermit::new(true, upload, PathBuf::new(), cfg);
        log::debug!("KERMIT: START sending");
        if !engine.setup_for_next_file(stats) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cannot open upload file",
            ));
        }
        engine.state = State::Init;
        engine.output_queue.clear();
        Ok(engine)
    }

    /// Setup for a download session.
    pub(crate) fn start_receive(download_path: PathBuf, cfg: &Config) -> Self {
        log::debug!("KERMIT: START receiving to {:?}", download_path);
        Kermit::new(false, Vec::new(), download_path, cfg)
    }

    /// Skip the currently-transferring file using the method on page 37
    /// of "The Kermit Protocol".
    pub(crate) fn skip_file(&mut self) {
        self.skip_file = true;
    }

    /// Stop the transfer, optionally keeping a partial download.
    pub(crate) fn stop(&mut self, save_partial: bool) {
        self.in_file = None;
        if let Some(file) = self.out_file.take() {
            drop(file);
            if !save_partial {
                if let Err(e) = std::fs::remove_file(&self.file_fullname) {
                    log::error!("error deleting file {:?}: {}", self.file_fullname, e);
                }
            }
        }
        self.file_name = None;
    }

    /*
     * Timers ------------------------------------------------------------
     */

    fn reset_timer(&mut self) {
        self.timeout_begin = Instant::now();
    }

    fn check_timeout(&mut self, stats: &mut TransferStats) -> bool {
        if self.session.streaming && matches!(self.state, State::Rdw | State::Sdw) {
            // No timeout processing during a streaming transfer.
            self.reset_timer();
            return false;
        }
        if self.timeout_begin.elapsed().as_secs() >= self.session.time as u64 {
            self.timeout_count += 1;
            log::debug!("KERMIT: timeout #{}", self.timeout_count);
            if self.timeout_count >= 5 {
                stats.increment_errors("TOO MANY TIMEOUTS, TRANSFER CANCELLED");
                self.abort_transfer(stats, "Too many timeouts");
            } else {
                stats.increment_errors("TIMEOUT");
            }
            self.reset_timer();
            return true;
        }
        false
    }

    /*
     * Packet builders ---------------------------------------------------
     */

    fn queue_output(&mut self, seq: u8, ptype: PacketType, data: Vec<u8>) {
        self.output_queue.push_back(OutPacket { seq, ptype, data });
    }

    /// Send an Error packet and move to the abort state.
    fn abort_transfer(&mut self, stats: &mut TransferStats, message: &str) {
        stats.finish(TransferState::Abort);
        self.state = State::Abort;
        self.error_packet(message);
    }

    fn error_packet(&mut self, message: &str) {
        log::error!("KERMIT: {}", message);
        self.queue_output(
            (self.sequence_number % 64) as u8,
            PacketType::Error,
            message.as_bytes().to_vec(),
        );
    }

    fn sequence_error(&mut self, stats: &mut TransferStats) {
        stats.set_last_message("PACKET SEQUENCE ERROR");
        self.abort_transfer(stats, "Wrong packet in sequence");
    }

    /// The Send-Init payload; also the payload of its ACK.
    fn send_init_payload(&mut self) -> Vec<u8> {
        self.sequence_number = 0;
        vec![
            tochar(self.session.maxl as u8),
            tochar(self.session.time as u8),
            tochar(self.local.npad as u8),
            ctl(self.local.padc),
            tochar(self.local.eol),
            self.local.qctl,
            self.session.qbin,
            self.session.chkt,
            self.session.rept,
            tochar(self.session.capas as u8),
            tochar(self.session.windo as u8),
            tochar(self.session.maxlx1 as u8),
            tochar(self.session.maxlx2 as u8),
            // Checkpointing was never implemented in the protocol.
            b'0',
            b'_',
            b'_',
            b'_',
            tochar(self.session.whatami as u8),
        ]
    }

    fn ack_send_init(&mut self) {
        let payload = self.send_init_payload();
        self.queue_output(0, PacketType::Ack, payload);
    }

    /// ACK the current input packet. With streaming negotiated, data
    /// ACKs are suppressed unless `really` is set.
    fn ack_packet(&mut self, really: bool) {
        debug_assert!(!self.sending);
        let seq = self.input_packet.as_ref().map_or(0, |p| p.seq);
        if self.skip_file {
            self.skip_file = false;
            self.queue_output(seq, PacketType::Ack, vec![b'X']);
            return;
        }
        if !self.session.streaming || really {
            self.queue_output(seq, PacketType::Ack, Vec::new());
        }
    }

    fn ack_packet_param(&mut self, param: &[u8]) {
        debug_assert!(!self.sending);
        let seq = self.input_packet.as_ref().map_or(0, |p| p.seq);
        self.queue_output(seq, PacketType::Ack, param.to_vec());
    }

    /// The special-case ACK to a File-Header carries the filename.
    fn ack_file_packet(&mut self) {
        let name = self.file_name.clone().unwrap_or_default();
        self.ack_packet_param(name.as_bytes());
    }

    /// Generate a NAK. `input_seq`/`input_type` describe the packet (or
    /// placeholder) that provoked it, which feeds window bookkeeping.
    fn nak_packet(&mut self, input_seq: u8, input_type: PacketType, stats: &mut TransferStats) {
        let mut seq;
        if !self.input_window.is_empty() {
            let unacked = self
                .input_window
                .indices()
                .into_iter()
                .find(|&i| !self.input_window.slots[i].acked);
            match unacked {
                // NAK the oldest un-ACK'd packet.
                Some(i) => seq = self.input_window.slots[i].seq,
                // Nothing to NAK within the window: NAK the next
                // expected packet.
                None => seq = (self.input_window.last_seq().unwrap() + 1) % 64,
            }
        } else {
            seq = ((self.sequence_number + 1) % 64) as u8;
        }
        // Very first NAK packet.
        if self.sequence_number == 0 && input_seq == 0 {
            seq = 0;
        }

        log::debug!("KERMIT: NAK SEQ {}", seq);
        self.queue_output(seq, PacketType::Nak, Vec::new());
        stats.increment_errors(&format!("NAK - SEQ {}", seq));

        if self.session.windowing {
            if !self.window_next_packet_seq(input_seq) {
                // Appending would create a gap or a repeat.
                return;
            }
            if self.input_window.is_full() && !self.input_window.front().unwrap().acked {
                // The window cannot grow; make this a NOP.
                self.output_queue.pop_back();
                return;
            }
            if self.input_window.is_full() && self.input_window.front().unwrap().acked {
                self.flush_front_slot(stats);
                self.input_window.append(Slot {
                    seq: input_seq,
                    ptype: input_type,
                    try_count: 1,
                    acked: false,
                    occupied: true,
                    data: Vec::new(),
                });
            }
        }
    }

    /*
     * Send-Init processing ----------------------------------------------
     */

    /// Parse the peer's Send-Init (or its ACK) into `remote`.
    fn process_send_init(&mut self, data: &[u8]) -> bool {
        let mut parms = Params::bare_defaults();

        if !data.is_empty() && data[0] != b' ' {
            parms.maxl = unchar(data[0]) as u32;
            if parms.maxl > 94 {
                return false;
            }
        }
        if data.len() >= 2 && data[1] != b' ' {
            parms.time = unchar(data[1]) as u32;
        }
        if data.len() >= 3 && data[2] != b' ' {
            parms.npad = unchar(data[2]) as u32;
        }
        if data.len() >= 4 && data[3] != b' ' {
            parms.padc = ctl(data[3]);
        }
        if data.len() >= 5 && data[4] != b' ' {
            parms.eol = unchar(data[4]);
        }
        if data.len() >= 6 && data[5] != b' ' {
            parms.qctl = data[5];
        }
        if data.len() >= 7 && data[6] != b' ' {
            parms.qbin = data[6];
        }
        if data.len() >= 8 && data[7] != b' ' {
            parms.chkt = data[7];
        }
        if data.len() >= 9 && data[8] != b' ' {
            parms.rept = data[8];
        }

        if data.len() >= 10 {
            let mut i = 9;
            // CAPAS can span several bytes; bit 0 marks a continuation.
            while data.len() > i {
                let capas = unchar(data[i]);
                if i == 9 {
                    parms.capas = capas as u32;
                    parms.attributes = capas & 0x08 != 0;
                    parms.windowing = capas & 0x04 != 0;
                    parms.long_packets = capas & 0x02 != 0;
                }
                i += 1;
                if capas & 0x01 == 0 {
                    break;
                }
            }
            if data.len() > i {
                parms.windo = unchar(data[i]) as u32;
                i += 1;
            }
            if data.len() > i {
                parms.maxlx1 = unchar(data[i]) as u32;
                i += 1;
            }
            if data.len() > i {
                parms.maxlx2 = unchar(data[i]) as u32;
                i += 1;
            }
            // Checkpointing fields: discard all four.
            for _ in 0..4 {
                if data.len() > i {
                    i += 1;
                }
            }
            if data.len() > i {
                let whatami = unchar(data[i]);
                if whatami & 0x08 != 0 {
                    parms.streaming = true;
                }
                parms.whatami = whatami as u32;
                i += 1;
            }
            if data.len() > i {
                // System type: length-prefixed, informational only.
                let id_length = unchar(data[i]) as usize;
                if data.len() > i + id_length {
                    log::debug!(
                        "KERMIT: peer system id {:?}",
                        String::from_utf8_lossy(&data[i + 1..i + 1 + id_length])
                    );
                    i += id_length;
                }
                i += 1;
            }
            if data.len() > i {
                // WHATAMI2: discard.
            }
        }

        // Long packets without explicit MAXLX fields default to 500.
        if parms.long_packets {
            if parms.maxlx1 == 0 && parms.maxlx2 == 0 {
                parms.maxlx1 = 500 / 95;
                parms.maxlx2 = 500 % 95;
            }
            if parms.maxlx1 * 95 + parms.maxlx2 > KERMIT_BLOCK_SIZE as u32 {
                parms.maxlx1 = (KERMIT_BLOCK_SIZE / 95) as u32;
                parms.maxlx2 = (KERMIT_BLOCK_SIZE % 95) as u32;
            }
        }

        self.remote = parms;
        true
    }

    fn valid_prefix(ch: u8) -> bool {
        (33..=62).contains(&ch) || (96..=126).contains(&ch)
    }

    /// Merge the two sides of the Send-Init exchange.
    fn negotiate_send_init(&mut self) {
        let local = self.local;
        let remote = self.remote;
        let session = &mut self.session;

        // MAXL: minimum of the two offers.
        session.maxl = local.maxl.min(remote.maxl);
        // TIME: mine.
        session.time = local.time;
        // NPAD, PADC, EOL: theirs.
        session.npad = remote.npad;
        session.padc = remote.padc;
        session.eol = remote.eol;
        // QCTL: mine.
        session.qctl = local.qctl;

        // QBIN: 'Y' offers a default, 'N' declines.
        if remote.qbin == b'Y' {
            if Self::valid_prefix(local.qbin) {
                session.qbin = local.qbin;
            }
        } else if remote.qbin == b'N' {
            session.qbin = b' ';
        } else if Self::valid_prefix(remote.qbin) {
            session.qbin = remote.qbin;
        }
        if session.qbin == b'Y' {
            // We both offered but do not need to.
            session.qbin = b' ';
        }
        if remote.qbin == session.qctl {
            session.qbin = b' ';
        }

        // CHKT: theirs iff both agree, else '1'.
        if local.chkt == remote.chkt {
            session.chkt = remote.chkt;
        } else {
            session.chkt = b'1';
        }
        self.check_type = match session.chkt {
            b'B' => 12,
            t => (t - b'0') as u8,
        };

        // REPT: theirs iff both agree and printable, else ' '.
        if local.rept == remote.rept && Self::valid_prefix(remote.rept) {
            session.rept = remote.rept;
        } else {
            session.rept = b' ';
        }
        if remote.rept == session.qctl || remote.rept == session.qbin {
            session.rept = b' ';
        }

        // Capability bitmap: the intersection.
        session.capas = local.capas & remote.capas & 0x1E;
        session.attributes = local.attributes && remote.attributes;
        if session.attributes {
            session.capas |= 0x08;
        } else {
            session.capas &= !0x08;
        }

        session.long_packets = local.long_packets && remote.long_packets;
        if session.long_packets {
            session.capas |= 0x02;
        }

        session.streaming = local.streaming && remote.streaming;
        session.whatami = if session.streaming { 0x28 } else { 0 };

        // Windowing: only if both agree, with the smaller size; a window
        // below 2 is not worth the bookkeeping. Streaming overrides.
        session.windowing = local.windowing && remote.windowing;
        if session.windowing {
            session.windo = local.windo.min(remote.windo);
            if session.windo < 2 {
                session.windo = 0;
                session.windowing = false;
            }
        }
        if session.streaming {
            session.windowing = false;
        }
        if session.windowing {
            session.capas |= 0x04;
            session.windo_in = session.windo;
            session.windo_out = session.windo;
        } else {
            session.capas &= !0x04;
            session.windo_in = 1;
            session.windo_out = 1;
        }

        let windo_in = session.windo_in as usize;
        let windo_out = session.windo_out as usize;
        self.input_window.reset(windo_in);
        self.output_window.reset(windo_out);

        log::debug!(
            "KERMIT: negotiated MAXL {} CHKT {} QBIN {} REPT {} windowing {} ({}) long {} streaming {}",
            self.session.maxl,
            self.session.chkt as char,
            self.session.qbin as char,
            self.session.rept as char,
            self.session.windowing,
            self.session.windo,
            self.session.long_packets,
            self.session.streaming,
        );
    }

    /*
     * File metadata -----------------------------------------------------
     */

    /// Process a File-Header packet: pick the local filename.
    fn process_file_header(&mut self, data: &[u8]) -> bool {
        let mut name = data.to_vec();
        // gkermit heuristic: an all-uppercase name folds to lowercase.
        if !name.iter().any(|b| b.is_ascii_lowercase()) {
            name.make_ascii_lowercase();
        }
        self.file_name = Some(String::from_utf8_lossy(&name).into_owned());
        self.file_size = 0;
        self.file_size_k = 0;
        self.file_protection = None;
        self.file_modtime = None;
        self.text_mode = false;
        self.do_resend = false;
        self.access = Access::Warn;
        true
    }

    /// Parse the date formats the Attributes packet may carry.
    fn parse_attribute_date(text: &str) -> Option<SystemTime> {
        let (date_part, time_part) = match text.split_once(' ') {
            Some((d, t)) => (d, Some(t)),
            None => (text, None),
        };
        let date = match date_part.len() {
            8 => NaiveDate::from_ymd_opt(
                date_part[0..4].parse().ok()?,
                date_part[4..6].parse().ok()?,
                date_part[6..8].parse().ok()?,
            )?,
            6 => {
                let yy: i32 = date_part[0..2].parse().ok()?;
                let year = if yy >= 69 { 1900 + yy } else { 2000 + yy };
                NaiveDate::from_ymd_opt(
                    year,
                    date_part[2..4].parse().ok()?,
                    date_part[4..6].parse().ok()?,
                )?
            }
            _ => return None,
        };
        let time = match time_part {
            Some(t) if t.len() == 8 => NaiveTime::parse_from_str(t, "%H:%M:%S").ok()?,
            Some(t) if t.len() == 5 => NaiveTime::parse_from_str(t, "%H:%M").ok()?,
            Some(_) => return None,
            None => NaiveTime::from_hms_opt(0, 0, 0)?,
        };
        let naive = NaiveDateTime::new(date, time);
        let local = Local.from_local_datetime(&naive).earliest()?;
        Some(SystemTime::from(local))
    }

    /// Process a File-Attributes packet.
    fn process_attributes(&mut self, data: &[u8], stats: &mut TransferStats) -> bool {
        let mut kermit_protection: Option<u8> = None;
        let mut i = 0;
        while i + 1 < data.len() {
            let attr = data[i];
            let length = unchar(data[i + 1]) as usize;
            i += 2;
            if i + length > data.len() {
                // Sender is not Kermit compliant, abort.
                stats.set_last_message("ERROR PARSING ATTRIBUTE PACKET");
                self.abort_transfer(stats, "Error parsing packet");
                return false;
            }
            let value = &data[i..i + length];
            match attr {
                b'!' => {
                    // File size in k-bytes.
                    let text = String::from_utf8_lossy(value);
                    self.file_size_k = text.trim().parse().unwrap_or(0);
                }
                b'"' => {
                    // File type; 'A' is ASCII.
                    if value.first() == Some(&b'A') {
                        if self.cfg.kermit_downloads_convert_text {
                            log::debug!("KERMIT: ASCII file, will do CRLF conversion");
                            self.text_mode = true;
                        }
                    }
                }
                b'#' => {
                    // Creation date.
                    let text = String::from_utf8_lossy(value);
                    self.file_modtime = Self::parse_attribute_date(text.trim())
                        .or_else(|| Some(SystemTime::now()));
                }
                b')' => {
                    self.access = match value.first() {
                        Some(b'N') => Access::New,
                        Some(b'S') => Access::Supersede,
                        Some(b'A') => Access::Append,
                        Some(b'W') => Access::Warn,
                        _ => self.access,
                    };
                }
                b'+' => {
                    // Disposition: 'R' requests RESEND.
                    if value.first() == Some(&b'R') {
                        self.do_resend = true;
                    }
                }
                b',' => {
                    // Protection, receiver format: octal.
                    let text = String::from_utf8_lossy(value);
                    if let Ok(mode) = u32::from_str_radix(text.trim(), 8) {
                        self.file_protection = Some(mode);
                    }
                }
                b'-' => {
                    // Protection, Kermit format.
                    if let Some(&v) = value.first() {
                        kermit_protection = Some(unchar(v));
                    }
                }
                b'1' => {
                    // File size in bytes.
                    let text = String::from_utf8_lossy(value);
                    self.file_size = text.trim().parse().unwrap_or(0);
                }
                _ => {
                    // Creator, charge account, block size, encoding,
                    // origin system, and the reserved codes: discard.
                }
            }
            i += length;
        }
        if i != data.len() {
            stats.set_last_message("ERROR PARSING ATTRIBUTE PACKET");
            self.abort_transfer(stats, "Error parsing packet");
            return false;
        }

        // Fall back to the Kermit protection byte: world r/w/x bits on
        // top of rw for the owner.
        if self.file_protection.is_none() {
            if let Some(kp) = kermit_protection {
                let mut mode = 0o600;
                if kp & 0x01 != 0 {
                    mode |= 0o044;
                }
                if kp & 0x02 != 0 {
                    mode |= 0o022;
                }
                if kp & 0x04 != 0 {
                    mode |= 0o111;
                }
                self.file_protection = Some(mode);
            }
        }
        true
    }

    /// Build the File-Header packet for the current upload file.
    fn send_file_header(&mut self) {
        let name = self.file_name.clone().unwrap_or_default();
        let mut data: Vec<u8>;
        if self.cfg.kermit_robust_filename {
            // Convert to "common form".
            let mut last_period = None;
            data = Vec::with_capacity(name.len());
            for ch in name.bytes() {
                if ch == b'.' {
                    last_period = Some(data.len());
                    data.push(b'_');
                } else if !ch.is_ascii_alphanumeric() {
                    data.push(b'_');
                } else {
                    data.push(ch.to_ascii_uppercase());
                }
            }
            if let Some(p) = last_period {
                data[p] = b'.';
            }
            while data.first() == Some(&b'.') {
                data.remove(0);
            }
            while data.last() == Some(&b'.') {
                data.pop();
            }
        } else {
            data = name.into_bytes();
        }
        self.queue_output((self.sequence_number % 64) as u8, PacketType::FileHeader, data);
    }

    /// Build the Attributes packet for the current upload file.
    fn send_file_attributes(&mut self) {
        let mut data = Vec::new();
        let mut itoa_buf = itoa::Buffer::new();

        // File type: AMJ for text, B8 for binary.
        data.push(b'"');
        if self.text_mode {
            data.push(tochar(1));
            data.push(b'A');
        } else {
            data.push(tochar(2));
            data.extend_from_slice(b"B8");
        }

        // File size in bytes.
        let size = itoa_buf.format(self.file_size).as_bytes().to_vec();
        data.push(b'1');
        data.push(tochar(size.len() as u8));
        data.extend_from_slice(&size);

        // Modification time.
        let modtime = self.file_modtime.unwrap_or_else(SystemTime::now);
        let local: chrono::DateTime<Local> = modtime.into();
        let text = local.format("%Y%m%d %H:%M:%S").to_string();
        data.push(b'#');
        data.push(tochar(text.len() as u8));
        data.extend_from_slice(text.as_bytes());

        // Protection, native: bottom nine bits in octal.
        let mode = self.file_protection.unwrap_or(0o644) & 0x1FF;
        let octal = format!("{:o}", mode);
        data.push(b',');
        data.push(tochar(octal.len() as u8));
        data.extend_from_slice(octal.as_bytes());

        // Protection, Kermit format: world r/w/x.
        let mut kp = 0u8;
        if mode & 0o4 != 0 {
            kp |= 0x01;
        }
        if mode & 0o2 != 0 {
            kp |= 0x02;
        }
        if mode & 0o1 != 0 {
            kp |= 0x04;
        }
        data.push(b'-');
        data.push(tochar(1));
        data.push(tochar(kp));

        // RESEND disposition.
        if self.session.capas & 0x10 != 0 && self.cfg.kermit_resend {
            data.extend_from_slice(&[b'+', tochar(1), b'R']);
            self.do_resend = true;
        }

        self.queue_output((self.sequence_number % 64) as u8, PacketType::Attributes, data);
    }

    /// Queue a File-Data packet; the payload is read from the file when
    /// the packet is encoded.
    fn send_file_data(&mut self) -> bool {
        if self.in_file_eof {
            return false;
        }
        self.queue_output((self.sequence_number % 64) as u8, PacketType::Data, Vec::new());
        true
    }

    fn send_eof(&mut self) {
        let data = if self.skip_file {
            self.skip_file = false;
            vec![b'D']
        } else {
            Vec::new()
        };
        self.queue_output((self.sequence_number % 64) as u8, PacketType::Eof, data);
    }

    fn send_eot(&mut self) {
        self.queue_output((self.sequence_number % 64) as u8, PacketType::Break, Vec::new());
    }

    /*
     * Upload file management --------------------------------------------
     */

    /// Initialize the next file to upload, or switch to EOT if the list
    /// is exhausted.
    fn setup_for_next_file(&mut self, stats: &mut TransferStats) -> bool {
        self.in_file = None;
        self.in_file_eof = false;
        self.file_name = None;

        let Some(record) = self.upload.get(self.upload_i).cloned() else {
            // Terminator: keep all the information the same, top up the
            // batch total.
            stats.batch_bytes_transfer = stats.batch_bytes_total;
            self.state = State::Sb;
            return true;
        };

        self.file_modtime = Some(record.modtime);
        self.file_size = record.size;
        self.file_protection = Some(record.mode);

        let file = match File::open(&record.path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("KERMIT: unable to open file {:?}: {}", record.path, e);
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats, "Disk I/O error");
                return false;
            }
        };

        // Text-mode sniff: any high bit in the first 1k means binary.
        self.text_mode = false;
        if !self.cfg.kermit_uploads_force_binary {
            let mut reader = BufReader::new(file);
            let mut probe = [0u8; KERMIT_BLOCK_SIZE];
            let mut text = true;
            match reader.read(&mut probe) {
                Ok(n) => {
                    if probe[..n].iter().any(|b| b & 0x80 != 0) {
                        text = false;
                    }
                }
                Err(e) => {
                    log::error!("KERMIT: read error on {:?}: {}", record.path, e);
                    stats.set_last_message("DISK I/O ERROR");
                    self.abort_transfer(stats, "Disk I/O error");
                    return false;
                }
            }
            self.text_mode = text;
            if reader.seek(SeekFrom::Start(0)).is_err() {
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats, "Disk I/O error");
                return false;
            }
            self.in_file = Some(reader);
        } else {
            self.in_file = Some(BufReader::new(file));
        }

        self.file_name = Some(
            record
                .path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        self.file_fullname = record.path.clone();
        stats.new_file(&record.path, record.size, KERMIT_BLOCK_SIZE as u64, true);
        self.file_position = 0;

        if self.state != State::Abort {
            stats.set_last_message("FILE HEADER");
            self.send_file_header();
            self.state = State::Sf;
        }
        true
    }

    /*
     * Download file management ------------------------------------------
     */

    /// Delayed file open: we should not open until both the File-Header
    /// and any Attributes have been seen. Returns the payload for the
    /// ACK when opening from an Attributes packet.
    fn open_receive_file(
        &mut self,
        from_attributes: bool,
        stats: &mut TransferStats,
    ) -> Option<Vec<u8>> {
        debug_assert!(self.out_file.is_none());

        // RESEND requires binary mode.
        if self.do_resend && self.text_mode {
            self.do_resend = false;
            return if from_attributes {
                Some(b"N+".to_vec())
            } else {
                None
            };
        }

        let name = self.file_name.clone().unwrap_or_default();
        self.file_fullname = self.download_path.join(&name);
        let mut file_exists = false;
        let mut need_new_file = false;
        let announced_size = if self.file_size > 0 {
            self.file_size
        } else {
            self.file_size_k * 1024
        };

        match std::fs::metadata(&self.file_fullname) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.file_position = 0;
                stats.set_last_message("FILE HEADER");
            }
            Err(_) => {
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats, "Disk I/O error");
                return None;
            }
            Ok(metadata) => {
                file_exists = true;
                match self.access {
                    Access::New => need_new_file = true,
                    // Overwriting is not supported; treat as new.
                    Access::Supersede => need_new_file = true,
                    Access::Warn => {
                        if self.do_resend {
                            // Crash recovery: append to the existing end.
                            self.file_position = metadata.len();
                        } else {
                            need_new_file = true;
                        }
                    }
                    Access::Append => {
                        self.file_position = metadata.len();
                        if announced_size < metadata.len() {
                            // Obviously a different file: it is smaller
                            // than what is already on disk.
                            need_new_file = true;
                            self.file_position = 0;
                        } else if announced_size > 0 {
                            stats.set_last_message("APPEND");
                        }
                    }
                }
            }
        }

        if need_new_file {
            file_exists = false;
            let mut counter = 0u32;
            loop {
                self.file_fullname = self
                    .download_path
                    .join(format!("{}.{:04}", name, counter));
                match std::fs::metadata(&self.file_fullname) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        self.file_position = 0;
                        break;
                    }
                    Err(_) => {
                        stats.set_last_message("DISK I/O ERROR");
                        self.abort_transfer(stats, "Disk I/O error");
                        return None;
                    }
                    Ok(_) => counter += 1,
                }
            }
        }

        let open = File::options()
            .read(true)
            .write(true)
            .create(!file_exists)
            .open(&self.file_fullname);
        let mut file = match open {
            Ok(f) => f,
            Err(_) => {
                stats.set_last_message("CANNOT CREATE FILE");
                self.abort_transfer(stats, "Disk I/O error: cannot create file");
                return None;
            }
        };
        if file.seek(SeekFrom::End(0)).is_err() {
            stats.set_last_message("DISK I/O ERROR");
            self.abort_transfer(stats, "Disk I/O error");
            return None;
        }
        self.out_file = Some(file);

        if self.file_modtime.is_none() {
            self.file_modtime = Some(SystemTime::now());
        }

        let fullname = self.file_fullname.clone();
        stats.new_file(&fullname, announced_size, KERMIT_BLOCK_SIZE as u64, false);
        stats.bytes_transfer = self.file_position;

        if from_attributes {
            if self.do_resend {
                // Tell the sender how much we already have:
                // '1', a base-95 length, then the length in decimal.
                let digits = self.file_position.to_string();
                let mut param = vec![b'1', tochar(digits.len() as u8)];
                param.extend_from_slice(digits.as_bytes());
                Some(param)
            } else {
                Some(b"Y".to_vec())
            }
        } else {
            None
        }
    }

    fn kermit_update_blocks(&mut self, stats: &mut TransferStats) {
        stats.block_size = self.block_size as u64;
        let maxl = self.session.maxl.max(1) as u64;
        stats.blocks = self.file_size / maxl;
        stats.blocks_transfer = self.file_position / maxl;
        if self.file_position % maxl > 0 {
            stats.blocks_transfer += 1;
        }
    }

    /// Write decoded file data to disk, opening the file first if the
    /// sender never sent Attributes.
    fn write_file_data(&mut self, data: &[u8], stats: &mut TransferStats) -> bool {
        if self.out_file.is_none() {
            self.open_receive_file(false, stats);
        }
        let Some(file) = self.out_file.as_mut() else {
            return false;
        };
        if let Err(e) = file.write_all(data) {
            log::error!("KERMIT: write error: {}", e);
            stats.set_last_message("DISK I/O ERROR");
            self.abort_transfer(stats, "Disk I/O error");
            return false;
        }
        self.file_position += data.len() as u64;
        stats.bytes_transfer = self.file_position;
        self.kermit_update_blocks(stats);
        true
    }

    /// Close the download file: protection bits first, then mtime.
    fn close_receive_file(&mut self) {
        if let Some(file) = self.out_file.take() {
            #[cfg(unix)]
            if let Some(mode) = self.file_protection {
                use std::os::unix::fs::PermissionsExt;
                let _ = file.set_permissions(std::fs::Permissions::from_mode(mode & 0o777));
            }
            if let Some(modtime) = self.file_modtime {
                let _ = file.set_modified(modtime);
            }
        }
        self.file_name = None;
    }

    /*
     * Data field encoding (file-backed) ---------------------------------
     */

    fn quoting(&self) -> Quoting {
        Quoting {
            qctl: self.session.qctl,
            qbin: self.session.qbin,
            rept: self.session.rept,
            check_b: self.check_type == 12,
        }
    }

    fn decode_quoting(&self) -> Quoting {
        Quoting {
            qctl: self.remote.qctl,
            qbin: self.session.qbin,
            rept: self.session.rept,
            check_b: self.check_type == 12,
        }
    }

    /// Encode an in-memory payload with prefixing and RLE.
    fn encode_plain_field(&self, input: &[u8]) -> Vec<u8> {
        let q = self.quoting();
        let mut out = Vec::with_capacity(input.len() + 16);
        let mut iter = input.iter().peekable();
        while let Some(&ch) = iter.next() {
            let mut run = 1;
            while run < 94 && iter.peek() == Some(&&ch) {
                iter.next();
                run += 1;
            }
            encoding::encode_byte(ch, run, &q, &mut out);
        }
        out
    }

    /// Encode the next File-Data payload straight from the upload file,
    /// with text-mode CRLF expansion and RLE.
    fn encode_file_data(&mut self, stats: &mut TransferStats) -> Option<Vec<u8>> {
        let q = self.quoting();
        let data_max = if self.session.long_packets {
            (self.session.maxlx1 * 95 + self.session.maxlx2) as usize - 9
        } else {
            self.session.maxl as usize
        };
        let text_max = (self.session.maxl as usize).saturating_sub(7);

        let Some(file) = self.in_file.as_mut() else {
            return None;
        };
        if file.seek(SeekFrom::Start(self.file_position)).is_err() {
            stats.set_last_message("DISK I/O ERROR");
            self.abort_transfer(stats, "Disk I/O error");
            return None;
        }
        self.outstanding_bytes = 0;

        let mut out = Vec::with_capacity(data_max);
        let mut crlf = false;
        let mut first = true;
        let mut last_ch = 0u8;
        let mut repeat: usize = 0;

        loop {
            if out.len() + 5 >= data_max {
                break;
            }
            if self.text_mode && out.len() >= text_max {
                break;
            }

            let mut ch;
            if crlf {
                ch = C_LF;
            } else {
                let mut byte = [0u8; 1];
                match self.in_file.as_mut().unwrap().read(&mut byte) {
                    Ok(0) => {
                        self.in_file_eof = true;
                        break;
                    }
                    Ok(_) => ch = byte[0],
                    Err(e) => {
                        log::error!("KERMIT: read error: {}", e);
                        stats.set_last_message("DISK I/O ERROR");
                        self.abort_transfer(stats, "Disk I/O error");
                        return None;
                    }
                }
                self.outstanding_bytes += 1;
            }

            // Text files: strip CRs, expand LF to CRLF.
            if self.text_mode && ch == C_CR {
                continue;
            }
            if self.text_mode && ch == C_LF {
                if !crlf {
                    crlf = true;
                    ch = C_CR;
                } else {
                    crlf = false;
                }
            }

            if first {
                last_ch = ch;
                first = false;
                repeat = 0;
            }
            if last_ch == ch && repeat < 94 {
                repeat += 1;
            } else {
                encoding::encode_byte(last_ch, repeat, &q, &mut out);
                repeat = 1;
                last_ch = ch;
            }
        }

        if repeat > 0 {
            encoding::encode_byte(last_ch, repeat, &q, &mut out);
        }
        if self.text_mode && crlf {
            encoding::encode_byte(C_LF, 1, &q, &mut out);
        }

        self.block_size = out.len();
        Some(out)
    }

    /*
     * Inbound packet handling -------------------------------------------
     */

    /// Pull one packet out of the reassembly buffer. Returns true when a
    /// packet event was consumed, even a bad one.
    fn decode_from_buffer(&mut self, stats: &mut TransferStats) -> bool {
        let result = packet::parse(
            &self.packet_buffer,
            &self.session,
            self.check_type,
            self.cfg.seven_bit_only,
        );
        match result {
            Parse::Incomplete { discard } => {
                self.packet_buffer.drain(..discard);
                false
            }
            Parse::Bad { discard } => {
                self.packet_buffer.drain(..discard);
                if !self.sending {
                    self.nak_packet(0, PacketType::Nak, stats);
                }
                true
            }
            Parse::Ok { packet, discard } => {
                self.packet_buffer.drain(..discard);
                self.finish_decode(packet, stats);
                true
            }
        }
    }

    /// Decode the data field and run the per-type payload processing.
    fn finish_decode(&mut self, raw: RawPacket, stats: &mut TransferStats) {
        log::debug!(
            "KERMIT: got {} SEQ {} ({} bytes)",
            raw.ptype.description(),
            raw.seq,
            raw.data.len()
        );

        // Send-Init, its ACK, and Attributes skip prefix handling.
        let no_prefix = raw.ptype == PacketType::Attributes
            || (raw.seq == 0
                && matches!(raw.ptype, PacketType::SendInit | PacketType::Ack));
        let decoded = if no_prefix {
            raw.data
        } else {
            let strip_cr =
                raw.ptype == PacketType::Data && self.state == State::Rdw && self.text_mode;
            let mut out = Vec::with_capacity(raw.data.len());
            if !encoding::decode_field(&raw.data, &self.decode_quoting(), strip_cr, &mut out) {
                if !self.sending {
                    self.nak_packet(raw.seq, raw.ptype, stats);
                }
                return;
            }
            out
        };

        let packet = InPacket {
            seq: raw.seq,
            ptype: raw.ptype,
            length: raw.length,
            data: decoded,
        };

        let ok = match packet.ptype {
            PacketType::SendInit => self.process_send_init(&packet.data),
            PacketType::FileHeader => self.process_file_header(&packet.data),
            PacketType::Attributes => self.process_attributes(&packet.data, stats),
            PacketType::Error => {
                let message = String::from_utf8_lossy(&packet.data).into_owned();
                stats.set_last_message(&message);
                stats.finish(TransferState::Abort);
                self.state = State::Abort;
                true
            }
            PacketType::Reserved1 | PacketType::Reserved2 => {
                stats.set_last_message("ERROR - WRONG PACKET TYPE");
                self.abort_transfer(stats, "Improper packet type");
                false
            }
            PacketType::Nak
                if self.sending
                    && self.session.streaming
                    && matches!(self.state, State::Sdw | State::Sz) =>
            {
                // A NAK while streaming is always fatal.
                stats.set_last_message("ERROR - NAK WHILE STREAMING");
                self.abort_transfer(stats, "NAK while streaming");
                false
            }
            _ => true,
        };

        self.input_packet = if ok { Some(packet) } else { None };
    }

    /*
     * Sliding window ----------------------------------------------------
     */

    /// True when `seq` is exactly one past the end of the input window.
    fn window_next_packet_seq(&self, seq: u8) -> bool {
        match self.input_window.last_seq() {
            None => true,
            Some(last) => seq == (last + 1) % 64,
        }
    }

    /// Write the oldest slot to disk (if it holds file data) and drop it.
    fn flush_front_slot(&mut self, stats: &mut TransferStats) {
        if let Some(slot) = self.input_window.pop_front() {
            if slot.ptype == PacketType::Data {
                self.write_file_data(&slot.data, stats);
            }
        }
    }

    /// Find where the incoming packet belongs in the input window; the
    /// four cases from p. 55 of "The Kermit Protocol".
    fn find_input_slot(
        &mut self,
        seq: u8,
        ptype: PacketType,
        data: &[u8],
        stats: &mut TransferStats,
    ) -> InputSlot {
        if self.input_window.is_empty() {
            return InputSlot::Append;
        }

        let seq_end = self.input_window.last_seq().unwrap() as u32;
        let seq_end_ws = (seq_end + self.session.windo_in) % 64;
        let seq32 = seq as u32;

        if seq32 == (seq_end + 1) % 64 {
            // Case 1: the usual case. Flush the oldest acknowledged
            // slot when the window is about to overflow.
            if self.input_window.is_full() {
                if self.input_window.front().unwrap().acked {
                    self.flush_front_slot(stats);
                } else {
                    // A gap is pinned at the front; we cannot accept
                    // more until it is filled.
                    self.nak_packet(seq, ptype, stats);
                    return InputSlot::Handled;
                }
            }
            return InputSlot::Append;
        }

        // Case 2: a packet was lost somewhere in (end+2 .. end+WINDO).
        let lost_packet = (seq_end_ws > seq_end + 2
            && seq_end + 2 <= seq32
            && seq32 <= seq_end_ws)
            || (seq_end_ws < seq_end + 2 && (seq32 >= seq_end + 2 || seq32 <= seq_end_ws));
        if lost_packet {
            let missing = ((seq_end + 1) % 64) as u8;
            self.nak_packet(missing, ptype, stats);

            // Save what we have, insert NAK placeholders up to the
            // received packet, then store it where it belongs.
            self.window_save_all(stats);
            let mut gap_seq = missing;
            // nak_packet may already have appended the first placeholder.
            if self.input_window.last_seq() == Some(gap_seq) {
                gap_seq = (gap_seq + 1) % 64;
            }
            while gap_seq != seq && !self.input_window.is_full() {
                self.input_window.append(Slot {
                    seq: gap_seq,
                    ptype: PacketType::Nak,
                    try_count: 0,
                    acked: false,
                    occupied: true,
                    data: Vec::new(),
                });
                gap_seq = (gap_seq + 1) % 64;
            }
            if !self.input_window.is_full() {
                self.input_window.append(Slot {
                    seq,
                    ptype,
                    try_count: 0,
                    acked: true,
                    occupied: true,
                    data: data.to_vec(),
                });
                return InputSlot::SavedOutOfOrder;
            }
            return InputSlot::Handled;
        }

        // Case 3: a retransmission of a packet already in the window.
        if let Some(i) = self.input_window.find_seq(seq) {
            return InputSlot::Existing(i);
        }

        // Case 4: outside the window entirely; ignore it.
        InputSlot::Handled
    }

    /// Save the incoming packet into the receive window.
    fn save_input_packet(&mut self, stats: &mut TransferStats) {
        let Some(pkt) = &self.input_packet else {
            return;
        };
        if self.sending {
            return;
        }
        let (seq, ptype, data) = (pkt.seq, pkt.ptype, pkt.data.clone());

        match self.find_input_slot(seq, ptype, &data, stats) {
            InputSlot::Handled => {
                self.input_packet = None;
            }
            InputSlot::SavedOutOfOrder => {
                // Leave the packet for the state machine so it still
                // gets its ACK; the window already holds it.
            }
            InputSlot::Existing(i) => {
                self.input_window.replace(
                    i,
                    Slot {
                        seq,
                        ptype,
                        try_count: 0,
                        acked: true,
                        occupied: true,
                        data,
                    },
                );
            }
            InputSlot::Append => {
                self.input_window.append(Slot {
                    seq,
                    ptype,
                    try_count: 0,
                    acked: true,
                    occupied: true,
                    data,
                });
                self.sequence_number += 1;
            }
        }
    }

    /// Drain the input window from the front, writing file data in
    /// order. Returns false if an unacknowledged gap remains.
    fn window_save_all(&mut self, stats: &mut TransferStats) -> bool {
        while !self.input_window.is_empty() {
            if !self.input_window.front().unwrap().acked {
                return false;
            }
            self.flush_front_slot(stats);
            if self.state == State::Abort {
                return false;
            }
        }
        true
    }

    /// See if the peer repeated a packet we already answered, or is
    /// responding to something in our output window.
    fn check_for_repeat(
        &mut self,
        output: &mut Vec<u8>,
        stats: &mut TransferStats,
    ) {
        let Some(pkt) = &self.input_packet else {
            return;
        };
        if self.session.streaming && matches!(self.state, State::Rdw | State::Sdw) {
            return;
        }
        let (seq, ptype) = (pkt.seq, pkt.ptype);

        let slot_i = self.output_window.find_seq(seq);
        if slot_i.is_none() && self.sending {
            // NAK one past the current sequence: the receiver is trying
            // to unstick the transfer. Clear the output window and turn
            // it into an empty ACK.
            if ptype == PacketType::Nak && seq == ((self.sequence_number + 1) % 64) as u8 {
                self.output_window.clear();
                self.input_packet = Some(InPacket {
                    seq: (self.sequence_number % 64) as u8,
                    ptype: PacketType::Ack,
                    length: 0,
                    data: Vec::new(),
                });
                return;
            }
        }

        let Some(i) = slot_i else {
            return;
        };

        let mut resend = false;
        if !self.sending {
            // The sender repeated something; re-send our last response.
            resend = true;
        } else {
            match ptype {
                PacketType::Ack => {
                    self.output_window.slots[i].acked = true;
                }
                PacketType::Nak => {
                    stats.increment_errors(&format!("NAK - SEQ {}", seq));
                    resend = true;
                }
                _ => {
                    self.sequence_error(stats);
                    self.input_packet = None;
                    return;
                }
            }
        }

        if resend {
            log::debug!(
                "KERMIT: re-send SEQ {} ({})",
                seq,
                self.output_window.slots[i].ptype.description()
            );
            let data = self.output_window.slots[i].data.clone();
            output.extend_from_slice(&data);
            self.output_window.slots[i].try_count += 1;
            self.input_packet = None;
        }
    }

    /// On a timeout: NAK the oldest hole (receiver) or re-send the
    /// oldest unacknowledged packet (sender).
    fn handle_timeout(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) {
        if !self.sending {
            let seq = if !self.input_window.is_empty() {
                let unacked = self
                    .input_window
                    .indices()
                    .into_iter()
                    .find(|&i| !self.input_window.slots[i].acked);
                match unacked {
                    Some(i) => self.input_window.slots[i].seq,
                    None => self.input_window.last_seq().unwrap(),
                }
            } else {
                (self.sequence_number % 64) as u8
            };
            self.nak_packet(seq, PacketType::Nak, stats);
        } else if self.session.windowing {
            let unacked = self
                .output_window
                .indices()
                .into_iter()
                .find(|&i| !self.output_window.slots[i].acked);
            if let Some(i) = unacked {
                let data = self.output_window.slots[i].data.clone();
                output.extend_from_slice(&data);
                self.output_window.slots[i].try_count += 1;
            }
        }
    }

    /// Drop acknowledged packets off the front of the send window.
    fn move_windows(&mut self) {
        if self.sending {
            while !self.output_window.is_empty() && self.output_window.front().unwrap().acked {
                self.output_window.pop_front();
            }
        }
    }

    /*
     * Receive states ----------------------------------------------------
     */

    fn receive_r(&mut self, stats: &mut TransferStats) -> bool {
        if self.first_r {
            stats.set_last_message("WAITING FOR SEND-INIT...");
            self.first_r = false;
        }
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::SendInit => {
                stats.set_last_message("ACK SEND-INIT");
                self.negotiate_send_init();
                self.ack_send_init();
                self.input_packet = None;
                stats.set_last_message("WAITING FOR FILE HEADER...");
                self.state = State::Rf;
                true
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn receive_rf(&mut self, stats: &mut TransferStats) -> bool {
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::FileHeader => {
                stats.set_last_message("FILE HEADER");
                self.ack_file_packet();
                self.input_packet = None;
                stats.set_last_message("WAITING FOR ATTRIBUTES OR FILE DATA...");
                self.state = State::Rdw;
                true
            }
            PacketType::Break => {
                stats.set_last_message("END OF TRANSMISSION");
                // We send the ACK but do not care whether it arrives.
                self.ack_packet(true);
                self.input_packet = None;
                self.state = State::Complete;
                stats.set_last_message("SUCCESS");
                stats.finish(TransferState::End);
                log::info!("KERMIT: download complete");
                true
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn receive_rdw(&mut self, stats: &mut TransferStats) -> bool {
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Eof => {
                let skipped = pkt.data.first() == Some(&b'D');
                if skipped {
                    // The remote side skipped this file.
                    stats.set_last_message("SKIP FILE");
                    log::info!(
                        "DOWNLOAD FILE COMPLETE (PARTIAL): protocol {}, filename {}, filesize {}",
                        stats.protocol_name,
                        stats.filename,
                        self.file_position
                    );
                } else {
                    let seq = pkt.seq;
                    if self.session.windowing && !self.window_save_all(stats) {
                        // Still missing packets inside the window.
                        self.nak_packet(seq, PacketType::Eof, stats);
                        self.input_packet = None;
                        return false;
                    }
                    stats.set_last_message("EOF");
                    log::info!(
                        "DOWNLOAD FILE COMPLETE: protocol {}, filename {}, filesize {}",
                        stats.protocol_name,
                        stats.filename,
                        self.file_position
                    );
                }

                stats.state = TransferState::FileDone;
                self.close_receive_file();
                self.ack_packet(true);
                self.input_packet = None;
                stats.set_last_message("WAITING FOR FILE HEADER...");
                self.state = State::Rf;
                false
            }
            PacketType::Data => {
                stats.set_last_message("DATA");
                self.block_size = pkt.length;
                stats.bytes_transfer = self.file_position;
                self.kermit_update_blocks(stats);
                self.ack_packet(false);
                self.input_packet = None;
                true
            }
            PacketType::Attributes => {
                stats.set_last_message("ATTRIBUTES");
                if self.out_file.is_none() {
                    if let Some(param) = self.open_receive_file(true, stats) {
                        self.ack_packet_param(&param);
                    }
                }
                self.input_packet = None;
                true
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn kermit_receive(&mut self, stats: &mut TransferStats) -> bool {
        let mut done = false;
        while !done {
            match self.state {
                State::Init => {
                    self.state = State::R;
                    self.text_mode = false;
                }
                State::R => done = self.receive_r(stats),
                State::Rf => done = self.receive_rf(stats),
                State::Rdw => done = self.receive_rdw(stats),
                State::Abort | State::Complete => done = true,
                // Send states are unreachable on the receive side.
                _ => unreachable!("send state on receive side"),
            }
        }
        done
    }

    /*
     * Send states -------------------------------------------------------
     */

    fn send_s(&mut self, stats: &mut TransferStats) -> bool {
        if self.first_s {
            stats.set_last_message("SENDING SEND-INIT...");
            let payload = self.send_init_payload();
            self.queue_output(0, PacketType::SendInit, payload);
            self.first_s = false;
        }
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Nak => {
                // Re-send our Send-Init.
                let payload = self.send_init_payload();
                self.queue_output(0, PacketType::SendInit, payload);
                self.input_packet = None;
                true
            }
            PacketType::Ack => {
                // The ACK to a Send-Init looks like a Send-Init.
                let data = pkt.data.clone();
                self.process_send_init(&data);
                self.negotiate_send_init();
                self.input_packet = None;
                self.sequence_number += 1;
                stats.set_last_message("FILE HEADER");
                self.send_file_header();
                self.state = State::Sf;
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn send_sf(&mut self, stats: &mut TransferStats) -> bool {
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Ack => {
                self.input_packet = None;
                self.sequence_number += 1;
                if self.session.attributes {
                    stats.set_last_message("ATTRIBUTES");
                    self.send_file_attributes();
                    self.state = State::Sa;
                } else {
                    stats.set_last_message("DATA");
                    if !self.send_file_data() {
                        stats.set_last_message("EOF");
                        self.send_eof();
                        self.state = State::Sz;
                    } else {
                        self.state = State::Sdw;
                    }
                }
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn send_sa(&mut self, stats: &mut TransferStats) -> bool {
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Ack => {
                let data = pkt.data.clone();
                self.input_packet = None;
                self.output_queue.clear();

                // RESEND: the receiver tells us how much it already has.
                if self.do_resend && !data.is_empty() && data[0] == b'1' && data.len() > 2 {
                    let digits: String = data[2..]
                        .iter()
                        .take_while(|b| b.is_ascii_digit())
                        .map(|&b| b as char)
                        .collect();
                    self.file_position = digits.parse().unwrap_or(0);
                    if let Some(file) = self.in_file.as_mut() {
                        let _ = file.seek(SeekFrom::Start(self.file_position));
                    }
                    self.outstanding_bytes = 0;
                    log::debug!("KERMIT: RESEND seek to {}", self.file_position);
                }

                if !self.session.streaming && !self.session.windowing {
                    // Streaming and windowing increment SEQ when the
                    // next data packet is generated instead.
                    self.sequence_number += 1;
                }
                stats.set_last_message("DATA");
                self.state = State::Sdw;
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn send_sd_next_packet(&mut self, stats: &mut TransferStats) {
        if self.session.streaming && !self.output_queue.is_empty() {
            // There is already an outbound packet; NOP.
            return;
        }
        if self.session.streaming || self.session.windowing {
            self.sequence_number += 1;
        }
        if self.file_position == self.file_size || self.skip_file {
            stats.set_last_message("EOF");
            self.send_eof();
            self.state = State::Sz;
        } else if !self.send_file_data() {
            stats.set_last_message("EOF");
            self.send_eof();
            self.state = State::Sz;
        }
    }

    fn send_sdw(&mut self, stats: &mut TransferStats) -> bool {
        if self.input_packet.is_none() {
            if self.session.streaming || self.session.windowing {
                self.send_sd_next_packet(stats);
            }
            return true;
        }
        let ptype = self.input_packet.as_ref().unwrap().ptype;
        match ptype {
            PacketType::Ack => {
                self.input_packet = None;
                if self.session.windowing {
                    // Just send the next packet out, whatever it is.
                    self.send_sd_next_packet(stats);
                    return true;
                }
                if !self.session.streaming {
                    self.sequence_number += 1;
                    self.file_position += self.outstanding_bytes;
                    stats.bytes_transfer = self.file_position;
                    self.kermit_update_blocks(stats);
                }
                self.send_sd_next_packet(stats);
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn send_sz(&mut self, stats: &mut TransferStats) -> bool {
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Ack => {
                self.input_packet = None;
                if self.session.windowing && !self.output_window.is_empty() {
                    // Still waiting on another ACK down the line.
                    return true;
                }
                self.sequence_number += 1;
                log::info!(
                    "UPLOAD FILE COMPLETE: protocol {}, filename {}, filesize {}",
                    stats.protocol_name,
                    stats.filename,
                    self.file_size
                );
                stats.batch_bytes_transfer += self.file_size;
                stats.state = TransferState::FileDone;
                self.in_file = None;
                self.file_name = None;
                self.upload_i += 1;
                self.setup_for_next_file(stats);
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn send_sb(&mut self, stats: &mut TransferStats) -> bool {
        if self.first_sb {
            stats.set_last_message("SENDING EOT...");
            self.send_eot();
            self.first_sb = false;
        }
        let Some(pkt) = &self.input_packet else {
            return true;
        };
        match pkt.ptype {
            PacketType::Ack => {
                self.input_packet = None;
                self.state = State::Complete;
                stats.set_last_message("SUCCESS");
                stats.finish(TransferState::End);
                log::info!("KERMIT: upload complete");
                false
            }
            _ => {
                self.sequence_error(stats);
                true
            }
        }
    }

    fn kermit_send(&mut self, stats: &mut TransferStats) -> bool {
        let mut done = false;
        while !done {
            match self.state {
                State::Init => self.state = State::S,
                State::S => done = self.send_s(stats),
                State::Sf => done = self.send_sf(stats),
                State::Sa => done = self.send_sa(stats),
                State::Sdw => done = self.send_sdw(stats),
                State::Sz => done = self.send_sz(stats),
                State::Sb => done = self.send_sb(stats),
                State::Abort | State::Complete => done = true,
                // Receive states are unreachable on the send side.
                _ => unreachable!("receive state on send side"),
            }
        }
        done
    }

    /*
     * Outbound encoding -------------------------------------------------
     */

    /// Encode the queued outbound packet into `output`. Returns the SEQ
    /// and type that went out, if anything did.
    fn encode_output_packet(
        &mut self,
        output: &mut Vec<u8>,
        stats: &mut TransferStats,
    ) -> Option<(u8, PacketType)> {
        let pkt = self.output_queue.pop_front()?;

        let mut long_packet = false;
        let check_type = match pkt.ptype {
            PacketType::SendInit | PacketType::Nak => 1,
            // The ACK to a Send-Init uses the type 1 check.
            PacketType::Ack if self.sequence_number == 0 => 1,
            PacketType::Data => {
                if self.session.long_packets {
                    long_packet = true;
                }
                self.check_type
            }
            _ => self.check_type,
        };

        let encoded = match pkt.ptype {
            PacketType::SendInit | PacketType::Attributes => pkt.data.clone(),
            PacketType::Ack if pkt.seq == 0 && self.sequence_number == 0 => pkt.data.clone(),
            PacketType::Data if self.sending => match self.encode_file_data(stats) {
                Some(data) => data,
                None => return None,
            },
            _ => self.encode_plain_field(&pkt.data),
        };

        packet::assemble(
            pkt.seq,
            pkt.ptype,
            &encoded,
            long_packet,
            check_type,
            &self.session,
            self.cfg.seven_bit_only,
            output,
        );

        if (self.session.streaming || self.session.windowing) && pkt.ptype == PacketType::Data {
            // Assume everything delivers.
            self.file_position += self.outstanding_bytes;
            stats.bytes_transfer = self.file_position;
            self.kermit_update_blocks(stats);
        }

        Some((pkt.seq, pkt.ptype))
    }

    /*
     * Main pump ---------------------------------------------------------
     */

    pub(crate) fn process(
        &mut self,
        input: &[u8],
        output: &mut Vec<u8>,
        output_max: usize,
        stats: &mut TransferStats,
    ) {
        if matches!(self.state, State::Abort | State::Complete) {
            return;
        }

        let free_space_needed = if self.session.long_packets {
            (self.session.maxlx1 * 95 + self.session.maxlx2) as usize
        } else {
            self.session.maxl as usize
        } + self.remote.npad as usize
            + 10;

        log::debug!(
            "KERMIT: SEQ {} ({}) state {:?} input {} bytes",
            self.sequence_number % 64,
            self.sequence_number,
            self.state,
            input.len()
        );

        let mut toss_input_buffer = false;
        if self.sequence_number == 0 && !self.sent_nak {
            if self.state == State::Init && !self.sending {
                // Toss a NAK on the output to speed things up.
                self.nak_packet(0, PacketType::Nak, stats);
            }
            // Throw away data accumulated before the transfer started.
            toss_input_buffer = true;
            self.sent_nak = true;
        }

        if !input.is_empty() {
            self.reset_timer();
        } else if self.check_timeout(stats) {
            self.handle_timeout(output, stats);
        }

        // Look for ^C's from the remote user.
        if input.len() < 10 && !input.is_empty() {
            for &b in input {
                if b == 0x03 {
                    self.ctrl_c_count += 1;
                } else {
                    self.ctrl_c_count = 0;
                }
            }
            if self.ctrl_c_count >= 3 {
                stats.set_last_message("ABORTED BY REMOTE SIDE");
                self.abort_transfer(stats, "Aborted by remote side");
            }
        }

        if !toss_input_buffer {
            self.packet_buffer.extend_from_slice(input);
        }

        let mut done = false;
        if output_max.saturating_sub(output.len()) < free_space_needed {
            done = true;
        }
        if self.output_window.is_full()
            && self.sending
            && input.is_empty()
            && self.packet_buffer.len() < 5
            && !self.session.streaming
        {
            done = true;
        }

        let mut had_some_input = true;
        while !done {
            if output_max.saturating_sub(output.len()) < free_space_needed {
                break;
            }
            if self.output_window.is_full()
                && self.sending
                && !had_some_input
                && !self.session.streaming
            {
                break;
            }

            // Decode received bytes into packets.
            had_some_input = self.decode_from_buffer(stats);

            // See if this is a repeat packet.
            self.check_for_repeat(output, stats);

            // If the packet is still here, save it to the window.
            self.save_input_packet(stats);

            // Move the sliding window boundaries.
            self.move_windows();

            if self.output_window.is_full() && self.sending && !self.session.streaming {
                break;
            }

            done = if self.sending {
                self.kermit_send(stats)
            } else {
                self.kermit_receive(stats)
            };

            self.emit_output(output, stats);

            if !had_some_input {
                done = true;
            } else {
                done = false;
            }
            if matches!(self.state, State::Abort | State::Complete) {
                done = true;
            }
        }

        // Drain any responses still queued behind the one sent above.
        while !self.output_queue.is_empty()
            && output_max.saturating_sub(output.len()) >= free_space_needed
        {
            if self.sending && !self.session.streaming && self.output_window.is_full() {
                break;
            }
            self.emit_output(output, stats);
        }

        if !output.is_empty() {
            self.reset_timer();
        }

        // Do not see this packet again next call.
        self.input_packet = None;
    }

    /// Encode one queued packet to the sink, padding first and saving
    /// the wire image for retransmission (NAKs aside).
    fn emit_output(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) {
        if self.output_queue.is_empty() {
            return;
        }
        // Padding ahead of the packet, if the peer asked for it.
        if self.remote.npad > 0 {
            output.extend(std::iter::repeat(self.remote.padc).take(self.remote.npad as usize));
        }

        let start = output.len();
        let sent = self.encode_output_packet(output, stats);

        if let Some((seq, ptype)) = sent {
            if output.len() != start && ptype != PacketType::Nak {
                let slot = Slot {
                    seq,
                    ptype,
                    try_count: 1,
                    acked: false,
                    occupied: true,
                    data: output[start..].to_vec(),
                };
                if self.sending && !self.session.streaming {
                    self.output_window.append(slot);
                } else {
                    // Receiving (or streaming): hang onto only the last
                    // packet sent.
                    self.output_window.clear();
                    let mut slot = slot;
                    slot.acked = true;
                    self.output_window.append(slot);
                }
            }
        }
    }
}
