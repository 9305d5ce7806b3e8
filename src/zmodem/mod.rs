// SPDX-License-Identifier: MIT OR Apache-2.0
//! The ZMODEM protocol engine.
//!
//! Every exchange is a frame header (hex or binary) optionally followed
//! by data subpackets. The receiver drives recovery: ZRPOS repositions
//! the sender, ZCRC decides between skip and crash recovery, and ZACK
//! windows the streaming data flow.

mod encoding;
mod frame;

use self::encoding::{
    build_encode_map, decode_zdata_bytes, encode_zdata_bytes, Zdata, ZCRCE, ZCRCG, ZCRCQ, ZCRCW,
};
use self::frame::{FrameType, ParsedHeader};
use crate::crc::{zmodem_crc16, zmodem_crc32, CRC32};
use crate::session::{Config, FileRecord, ZmodemFlavor};
use crate::stats::{TransferState, TransferStats};
use crate::C_CAN;
use binread::{io::Cursor, BinRead, BinReaderExt, NullString};
use bitflags::bitflags;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// ZMODEM maxes out at 1024-byte data subpackets.
const ZMODEM_BLOCK_SIZE: usize = 1024;

/// Worst case, every byte of a subpacket plus its CRC is escaped.
const ZMODEM_MAX_BLOCK_SIZE: usize = 2 * (ZMODEM_BLOCK_SIZE + 4 + 1);

/// Require an ACK every 32 subpackets on a reliable link.
const WINDOW_SIZE_RELIABLE: u32 = 32;

/// Require an ACK every 4 subpackets once the link has shown errors.
const WINDOW_SIZE_UNRELIABLE: u32 = 4;

bitflags! {
    /// Receiver capability bits carried in ZRINIT (and amended by
    /// ZSINIT).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Flags: u32 {
        /// Can send and receive in full duplex
        const CANFDX = 0x01;
        /// Can receive data in parallel with disk I/O
        const CANOVIO = 0x02;
        /// Can send a break signal
        const CANBRK = 0x04;
        /// Can decrypt
        const CANCRY = 0x08;
        /// Can uncompress
        const CANLZW = 0x10;
        /// Can use 32-bit frame check
        const CANFC32 = 0x20;
        /// Expects control characters to be escaped
        const ESCCTL = 0x40;
        /// Expects the 8th bit to be escaped
        const ESC8 = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Before the first byte is sent.
    Init,
    Complete,
    Abort,
    /// Collecting the data subpackets behind a ZFILE, ZSINIT, ZDATA or
    /// ZCOMMAND header (receiver), or streaming them out (sender).
    Data,

    // Receiver side.
    Zrinit,
    ZrinitWait,
    Zchallenge,
    ZchallengeWait,
    Zrpos,
    ZrposWait,
    Zskip,
    Zcrc,
    ZcrcWait,

    // Sender side.
    Zrqinit,
    ZrqinitWait,
    Zsinit,
    ZsinitWait,
    Zfile,
    ZfileWait,
    Zeof,
    ZeofWait,
    Zfin,
    ZfinWait,
}

/// The frame currently being processed, including any accumulated
/// subpacket data.
#[derive(Debug)]
struct Packet {
    ptype: FrameType,
    use_crc32: bool,
    data: Vec<u8>,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            ptype: FrameType::ZNAK,
            use_crc32: false,
            data: Vec::new(),
        }
    }
}

/// The ZFILE data subpacket leads with a NUL-terminated name.
#[derive(BinRead)]
#[br(assert(!file_name.is_empty()))]
struct ZfileHeader {
    file_name: NullString,
}

pub(crate) struct Zmodem {
    cfg: Config,
    state: State,
    prior_state: State,
    flags: Flags,
    use_crc32: bool,
    sending: bool,

    file_name: Option<String>,
    file_size: u64,
    file_modtime: Option<SystemTime>,
    file_position: u64,
    file_stream: Option<File>,
    file_crc32: u32,
    file_fullname: PathBuf,

    block_size: usize,
    /// The next sent block must ask for ZACK.
    ack_required: bool,
    /// We are waiting to hear a ZACK.
    waiting_for_ack: bool,
    /// A ZDATA frame is open and streaming subpackets.
    streaming_zdata: bool,
    /// CRC kind of the open ZDATA frame; its subpackets must match the
    /// header that announced them.
    data_frame_crc32: bool,

    timeout_begin: Instant,
    timeout_count: u32,

    confirmed_bytes: u64,
    last_confirmed_bytes: u64,
    reliable_link: bool,
    file_position_downgrade: u64,
    blocks_ack_count: u32,
    consecutive_errors: u32,

    upload: Vec<FileRecord>,
    upload_i: usize,
    download_path: PathBuf,

    packet: Packet,
    packet_buffer: Vec<u8>,
    /// Encoded subpackets waiting for room in the host's output buffer.
    outbound_packet: Vec<u8>,
    encode_map: [u8; 256],
    zchallenge_value: u32,
    can_count: u32,
}

impl Zmodem {
    fn new(sending: bool, upload: Vec<FileRecord>, download_path: PathBuf, cfg: &Config) -> Self {
        let use_crc32 = !sending && cfg.zmodem_flavor == ZmodemFlavor::Crc32;
        Zmodem {
            cfg: cfg.clone(),
            state: State::Init,
            prior_state: State::Init,
            flags: Flags::empty(),
            use_crc32,
            sending,
            file_name: None,
            file_size: 0,
            file_modtime: None,
            file_position: 0,
            file_stream: None,
            file_crc32: 0,
            file_fullname: PathBuf::new(),
            block_size: ZMODEM_BLOCK_SIZE,
            ack_required: false,
            waiting_for_ack: false,
            streaming_zdata: false,
            data_frame_crc32: false,
            timeout_begin: Instant::now(),
            timeout_count: 0,
            confirmed_bytes: 0,
            last_confirmed_bytes: 0,
            reliable_link: true,
            file_position_downgrade: 0,
            blocks_ack_count: WINDOW_SIZE_RELIABLE,
            consecutive_errors: 0,
            upload,
            upload_i: 0,
            download_path,
            packet: Packet::default(),
            packet_buffer: Vec::new(),
            outbound_packet: Vec::new(),
            encode_map: build_encode_map(Flags::empty()),
            zchallenge_value: 0,
            can_count: 0,
        }
    }

    /// Setup for an upload session; opens the first file.
    pub(crate) fn start_send(
        upload: Vec<FileRecord>,
        cfg: &Config,
        stats: &mut TransferStats,
    ) -> std::io::Result<Self> {
        let mut engine = Zmodem::new(true, upload, PathBuf::new(), cfg);
        log::debug!("ZMODEM: START sending");
        if !engine.setup_for_next_file(stats) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cannot open upload file",
            ));
        }
        engine.state = State::Init;
        Ok(engine)
    }

    /// Setup for a download session.
    pub(crate) fn start_receive(download_path: PathBuf, cfg: &Config) -> Self {
        log::debug!("ZMODEM: START receiving to {:?}", download_path);
        Zmodem::new(false, Vec::new(), download_path, cfg)
    }

    /// Stop the transfer, optionally keeping a partial download.
    pub(crate) fn stop(&mut self, save_partial: bool) {
        if let Some(file) = self.file_stream.take() {
            drop(file);
            if !save_partial && !self.sending {
                if let Err(e) = std::fs::remove_file(&self.file_fullname) {
                    log::error!("error deleting file {:?}: {}", self.file_fullname, e);
                }
            }
        }
        self.file_name = None;
    }

    /*
     * Bookkeeping -------------------------------------------------------
     */

    fn reset_timer(&mut self) {
        self.timeout_begin = Instant::now();
    }

    fn check_timeout(&mut self, stats: &mut TransferStats) -> bool {
        if self.timeout_begin.elapsed().as_secs() >= 10 {
            self.timeout_count += 1;
            log::debug!("ZMODEM: timeout #{}", self.timeout_count);
            if self.timeout_count >= 5 {
                self.increment_errors(stats, "TOO MANY TIMEOUTS, TRANSFER CANCELLED");
                stats.finish(TransferState::Abort);
                self.state = State::Abort;
            } else {
                self.increment_errors(stats, "TIMEOUT");
            }
            self.reset_timer();
            return true;
        }
        false
    }

    /// Count an error; every error marks the link as unreliable for the
    /// rest of the session. Fifteen in a row outside the data phase
    /// means the other end probably is not running ZMODEM at all.
    fn increment_errors(&mut self, stats: &mut TransferStats, message: &str) {
        stats.increment_errors(message);
        stats.block_size = self.block_size as u64;
        self.consecutive_errors += 1;
        self.reliable_link = false;
        if self.consecutive_errors >= 15 && self.state != State::Data {
            stats.set_last_message("LINE NOISE, !@#&*%U");
            stats.finish(TransferState::Abort);
            self.state = State::Abort;
        }
    }

    fn increment_blocks(&mut self, stats: &mut TransferStats) {
        stats.block_size = self.block_size as u64;
        stats.update_blocks(self.file_position, ZMODEM_BLOCK_SIZE as u64);
        self.consecutive_errors = 0;
    }

    fn abort_transfer(&mut self, stats: &mut TransferStats) {
        stats.finish(TransferState::Abort);
        self.state = State::Abort;
    }

    /// Move up to a larger block size if things are going well: 8 KiB of
    /// confirmed progress since the last downgrade doubles it.
    fn block_size_up(&mut self) {
        if self.confirmed_bytes.saturating_sub(self.file_position_downgrade) > 8 * 1024 {
            self.block_size = (self.block_size * 2).min(ZMODEM_BLOCK_SIZE);
        }
        self.last_confirmed_bytes = self.confirmed_bytes;
    }

    /// Move down to a smaller block size if things are going badly.
    fn block_size_down(&mut self, stats: &mut TransferStats) {
        let outstanding_packets =
            (self.confirmed_bytes.saturating_sub(self.last_confirmed_bytes)) / self.block_size as u64;
        if outstanding_packets >= 3 && self.block_size > 32 {
            self.block_size /= 2;
            self.file_position_downgrade = self.confirmed_bytes;
        }
        if outstanding_packets >= 10 && self.block_size == 32 {
            // Too much line noise, give up.
            stats.set_last_message("LINE NOISE, !@#&*%U");
            self.abort_transfer(stats);
        }
        self.blocks_ack_count = WINDOW_SIZE_UNRELIABLE;
        self.last_confirmed_bytes = self.confirmed_bytes;
    }

    /*
     * Frame plumbing ----------------------------------------------------
     */

    /// Serialise a frame header into `out` and prime `packet` for any
    /// data subpacket that follows it.
    fn build_packet(&mut self, ptype: FrameType, argument: u32, out: &mut Vec<u8>) {
        log::debug!("ZMODEM: send {} argument {:08x}", ptype, argument);
        self.packet.ptype = ptype;
        self.packet.use_crc32 = self.use_crc32;
        self.packet.data.clear();

        // lrzsz wants control characters escaped inside ZSINIT even
        // before it has asked for escaping.
        let map;
        let map_ref = if ptype == FrameType::ZSINIT && !self.flags.contains(Flags::ESCCTL) {
            map = build_encode_map(self.flags | Flags::ESCCTL);
            &map
        } else {
            &self.encode_map
        };

        let hex = frame::build_header(
            ptype,
            argument,
            self.use_crc32,
            self.sending,
            self.flags,
            map_ref,
            out,
        );
        if hex {
            // Hex headers are CRC-16; so is any subpacket behind them.
            self.packet.use_crc32 = false;
        }
    }

    /// Pull the next frame header out of the reassembly buffer. On a
    /// complete header that announces data, switch to the data-collection
    /// state.
    fn next_header(&mut self) -> ParsedHeader {
        let (parsed, discard) = frame::parse_header(&self.packet_buffer);
        if discard > 0 {
            self.packet_buffer.drain(..discard);
        }
        if let ParsedHeader::Ok(header) = &parsed {
            log::debug!(
                "ZMODEM: got {} argument {:08x} crc32 {}",
                header.ptype,
                header.argument,
                header.use_crc32
            );
            self.packet.ptype = header.ptype;
            self.packet.use_crc32 = header.use_crc32;
            if header.has_data() {
                self.prior_state = self.state;
                self.state = State::Data;
                self.packet.data.clear();
            }
        }
        parsed
    }

    /// The garbled-header response: count the error and send ZNAK.
    fn garbled_header(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) {
        self.increment_errors(stats, "GARBLED HEADER");
        self.packet_buffer.clear();
        if self.state != State::Abort {
            self.build_packet(FrameType::ZNAK, 0, output);
        }
    }

    /*
     * Receiver: file management -----------------------------------------
     */

    /// Parse the ZFILE metadata subpacket and decide how to receive the
    /// file: fresh (ZRPOS 0), skip/crash-recovery probe (ZCRC), or a
    /// renamed copy.
    fn receive_zfile(&mut self, stats: &mut TransferStats) -> bool {
        let mut cursor = Cursor::new(self.packet.data.as_slice());
        let header: ZfileHeader = match cursor.read_ne() {
            Ok(h) => h,
            Err(_) => {
                log::error!("ZMODEM: malformed ZFILE data");
                self.abort_transfer(stats);
                return true;
            }
        };
        let name = String::from_utf8_lossy(&header.file_name).into_owned();
        let rest = &self.packet.data[cursor.position() as usize..];
        let meta = String::from_utf8_lossy(rest);
        let mut fields = meta.split_whitespace();
        self.file_size = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        self.file_modtime = fields
            .next()
            .and_then(|f| u64::from_str_radix(f, 8).ok())
            .map(|secs| UNIX_EPOCH + std::time::Duration::from_secs(secs));
        // The mode field is not encoded portably; parse and ignore it.
        let _mode = fields.next().and_then(|f| u32::from_str_radix(f, 8).ok());

        log::debug!(
            "ZMODEM: ZFILE name {:?} size {} mtime {:?}",
            name,
            self.file_size,
            self.file_modtime
        );
        self.file_name = Some(name.clone());
        self.file_fullname = self.download_path.join(&name);

        let mut file_exists = false;
        let mut need_new_file = false;

        match std::fs::metadata(&self.file_fullname) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Creating the file; go straight to ZRPOS.
                self.file_position = 0;
                stats.set_last_message("ZRPOS");
                self.state = State::Zrpos;
            }
            Err(_) => {
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats);
                return true;
            }
            Ok(metadata) => {
                file_exists = true;
                self.file_position = metadata.len();
                if self.file_size < self.file_position {
                    // Obviously a new file: it is smaller than what is
                    // already on disk.
                    need_new_file = true;
                } else if self.file_size == self.file_position || self.file_size > 0 {
                    // Same size means a possible skip; smaller on disk
                    // means a crash recovery candidate. Either way the
                    // CRC decides.
                    stats.set_last_message("ZCRC");
                    self.state = State::Zcrc;
                } else {
                    // Zero-length announcement: just start over.
                    stats.set_last_message("ZRPOS");
                    self.state = State::Zrpos;
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
                        self.state = State::Zrpos;
                        break;
                    }
                    Err(_) => {
                        stats.set_last_message("DISK I/O ERROR");
                        self.abort_transfer(stats);
                        return true;
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
                self.abort_transfer(stats);
                return true;
            }
        };
        if file.seek(SeekFrom::End(0)).is_err() {
            stats.set_last_message("DISK I/O ERROR");
            self.abort_transfer(stats);
            return true;
        }
        self.file_stream = Some(file);

        let fullname = self.file_fullname.clone();
        stats.new_file(&fullname, self.file_size, ZMODEM_BLOCK_SIZE as u64, false);
        stats.bytes_transfer = self.file_position;

        false
    }

    /// CRC-32 the on-disk file, preserving the read position.
    fn compute_file_crc32(&mut self, limit: Option<u64>) -> std::io::Result<u64> {
        let file = self
            .file_stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no file"))?;
        let original = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        let mut digest = CRC32.digest();
        let mut total: u64 = 0;
        let mut buffer = [0u8; 4096];
        loop {
            let want = match limit {
                Some(l) if total >= l => 0,
                Some(l) => buffer.len().min((l - total) as usize),
                None => buffer.len(),
            };
            if want == 0 {
                break;
            }
            let n = file.read(&mut buffer[..want])?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);
            total += n as u64;
        }
        file.seek(SeekFrom::Start(original))?;
        self.file_crc32 = digest.finalize();
        Ok(total)
    }

    /// Close the download file and stamp its modification time.
    fn close_receive_file(&mut self) {
        if let Some(file) = self.file_stream.take() {
            if let Some(modtime) = self.file_modtime {
                let _ = file.set_modified(modtime);
            }
        }
        self.file_name = None;
    }

    /*
     * Receiver states ---------------------------------------------------
     */

    fn receive_zchallenge(&mut self, output: &mut Vec<u8>) -> bool {
        self.zchallenge_value = rand::random::<u32>();
        let value = self.zchallenge_value;
        self.build_packet(FrameType::ZCHALLENGE, value, output);
        self.state = State::ZchallengeWait;
        self.packet_buffer.clear();
        false
    }

    fn receive_zchallenge_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zchallenge;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZACK => {
                        if header.argument == self.zchallenge_value {
                            stats.set_last_message("ZCHALLENGE -- OK");
                            stats.set_last_message("ZRINIT");
                            self.state = State::Zrinit;
                        } else {
                            self.increment_errors(stats, "ZCHALLENGE -- ERROR");
                            self.abort_transfer(stats);
                            return true;
                        }
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zchallenge;
                    }
                    FrameType::ZRQINIT => {
                        // sz re-sends a spurious ZRQINIT; not an error.
                        stats.set_last_message("ZRQINIT");
                        self.state = State::Zchallenge;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn receive_zrinit(&mut self, output: &mut Vec<u8>) -> bool {
        let mut flags = Flags::CANFDX | Flags::CANOVIO;
        if self.use_crc32 {
            flags |= Flags::CANFC32;
        }
        if self.cfg.zmodem_escape_ctrl {
            flags |= Flags::ESCCTL;
        }
        self.flags = flags;
        self.encode_map = build_encode_map(self.flags);
        let bits = flags.bits();
        self.build_packet(FrameType::ZRINIT, bits, output);
        self.state = State::ZrinitWait;
        self.packet_buffer.clear();
        false
    }

    fn receive_zrinit_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = if self.prior_state == State::Zskip {
                    State::Zskip
                } else {
                    State::Zrinit
                };
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZFIN => {
                        // The last file has come down; we are done.
                        stats.set_last_message("ZFIN");
                        self.build_packet(FrameType::ZFIN, 0, output);
                        self.state = State::ZfinWait;
                    }
                    FrameType::ZRQINIT => {
                        // The sender repeated its ZRQINIT.
                        stats.set_last_message("ZRINIT");
                        self.state = State::Zrinit;
                    }
                    FrameType::ZSINIT => {
                        stats.set_last_message("ZSINIT");
                        if header.argument & Flags::ESCCTL.bits() != 0 {
                            self.flags |= Flags::ESCCTL;
                        }
                        if header.argument & Flags::ESC8.bits() != 0 {
                            self.flags |= Flags::ESC8;
                        }
                        self.encode_map = build_encode_map(self.flags);
                        // The attention string subpacket follows; the
                        // data state ACKs once it is in.
                    }
                    FrameType::ZCOMMAND => {
                        // Refused flat out; the data state answers with
                        // a failed ZCOMPL.
                        stats.set_last_message("ERROR: ZCOMMAND NOT SUPPORTED");
                    }
                    FrameType::ZFILE => {
                        stats.set_last_message("ZFILE");
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = if self.prior_state == State::Zskip {
                            State::Zskip
                        } else {
                            State::Zrinit
                        };
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn receive_zcrc(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        // CRC-32 the bytes we already have on disk.
        let total = match self.compute_file_crc32(None) {
            Ok(total) => total,
            Err(_) => {
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats);
                return true;
            }
        };
        log::debug!(
            "ZMODEM: on-disk CRC32 {:08x} over {} bytes",
            self.file_crc32,
            total
        );
        self.build_packet(FrameType::ZCRC, total as u32, output);
        self.state = State::ZcrcWait;
        self.packet_buffer.clear();
        false
    }

    fn receive_zcrc_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zcrc;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZCRC => {
                        if header.argument == self.file_crc32 {
                            // Same file; length decides skip vs resume.
                            if self.file_size == self.file_position {
                                self.state = State::Zskip;
                            } else {
                                self.state = State::Zrpos;
                            }
                        } else {
                            // A different file with the same name.
                            let name = self.file_name.clone().unwrap_or_default();
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
                                        self.abort_transfer(stats);
                                        return true;
                                    }
                                    Ok(_) => counter += 1,
                                }
                            }
                            let open = File::options()
                                .read(true)
                                .write(true)
                                .create(true)
                                .truncate(true)
                                .open(&self.file_fullname);
                            match open {
                                Ok(file) => self.file_stream = Some(file),
                                Err(_) => {
                                    stats.set_last_message("CANNOT CREATE FILE");
                                    self.abort_transfer(stats);
                                    return true;
                                }
                            }
                            let fullname = self.file_fullname.clone();
                            stats.new_file(
                                &fullname,
                                self.file_size,
                                ZMODEM_BLOCK_SIZE as u64,
                                false,
                            );
                            self.state = State::Zrpos;
                        }
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zcrc;
                    }
                    FrameType::ZFILE => {
                        // The sender does not understand ZCRC; fall back
                        // to plain crash recovery.
                        self.increment_errors(stats, "Sender does not understand ZCRC!");
                        self.state = State::Zrpos;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn receive_zrpos(&mut self, output: &mut Vec<u8>) -> bool {
        let position = self.file_position as u32;
        self.build_packet(FrameType::ZRPOS, position, output);
        self.state = State::ZrposWait;
        self.packet_buffer.clear();
        false
    }

    fn receive_zrpos_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zrpos;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                if self.prior_state != State::ZrposWait {
                    self.garbled_header(output, stats);
                    true
                } else {
                    // Mid-stream garbage; keep draining the buffer.
                    false
                }
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZEOF => {
                        stats.state = TransferState::FileDone;
                        stats.set_last_message("ZEOF");
                        if self.file_position == u64::from(header.argument) {
                            self.close_receive_file();
                            log::info!(
                                "DOWNLOAD FILE COMPLETE: protocol {}, filename {}, filesize {}",
                                stats.protocol_name,
                                stats.filename,
                                self.file_size
                            );
                            self.build_packet(FrameType::ZRINIT, self.flags.bits(), output);
                            stats.set_last_message("ZRINIT");
                            // ZEOF is followed by ZFIN or another ZFILE.
                            self.prior_state = State::ZrinitWait;
                            self.state = State::ZrinitWait;
                        } else {
                            log::error!(
                                "ZMODEM: ZEOF position {} != file position {}",
                                header.argument,
                                self.file_position
                            );
                            self.increment_errors(stats, "ZEOF POSITION MISMATCH");
                        }
                    }
                    FrameType::ZDATA => {
                        let offset = header.argument.swap_bytes();
                        if u64::from(offset) != self.file_position {
                            // Data for somewhere else; reposition the
                            // sender.
                            let position = self.file_position as u32;
                            self.state = State::ZrposWait;
                            self.build_packet(FrameType::ZRPOS, position, output);
                        } else {
                            stats.set_last_message("ZDATA");
                            // next_header() has already moved us to the
                            // data-collection state.
                        }
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zrpos;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Collect and verify data subpackets (receiver side).
    fn receive_zdata(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        let frame_crc32 = self.packet.use_crc32;
        let mut decoded = Vec::new();
        let result = decode_zdata_bytes(&mut self.packet_buffer, frame_crc32, &mut decoded);
        let (terminator, crc_given, crc_len) = match result {
            Zdata::Incomplete => return true,
            Zdata::Invalid => {
                // Treat a broken escape like a failed CRC.
                (0, [0u8; 4], 0)
            }
            Zdata::Frame {
                terminator,
                crc,
                crc_len,
            } => (terminator, crc, crc_len),
        };

        let (end_of_packet, acknowledge) = match terminator {
            ZCRCG => (false, false),
            ZCRCE => (true, false),
            ZCRCW => (true, true),
            ZCRCQ => (false, true),
            _ if crc_len == 0 => (false, false),
            _ => {
                // Not a ZMODEM terminator at all.
                self.abort_transfer(stats);
                return true;
            }
        };

        let crc_ok = crc_len > 0
            && if frame_crc32 {
                let computed = zmodem_crc32(&decoded, Some(terminator));
                computed == u32::from_le_bytes(crc_given)
            } else {
                let computed = zmodem_crc16(&decoded, Some(terminator));
                computed == u16::from_be_bytes([crc_given[0], crc_given[1]])
            };

        if crc_ok {
            if self.prior_state == State::ZrposWait {
                // File data: straight to disk.
                let Some(file) = self.file_stream.as_mut() else {
                    self.abort_transfer(stats);
                    return true;
                };
                if file.write_all(&decoded).is_err() {
                    stats.set_last_message("DISK I/O ERROR");
                    self.abort_transfer(stats);
                    return true;
                }
                self.file_position += decoded.len() as u64;
                self.block_size = decoded.len();
                stats.bytes_transfer = self.file_position;
                self.increment_blocks(stats);

                if acknowledge {
                    let position = (self.file_position as u32).swap_bytes();
                    self.build_packet(FrameType::ZACK, position, output);
                    // Later subpackets in this frame keep its CRC kind.
                    self.packet.use_crc32 = frame_crc32;
                }
                if end_of_packet {
                    self.state = State::ZrposWait;
                    return false;
                }
                // Stay in the data state for the next subpacket.
                return false;
            }
        } else {
            if self.prior_state == State::ZrposWait {
                self.increment_errors(stats, "CRC ERROR");
                if self.state == State::Abort {
                    return true;
                }
                self.packet_buffer.clear();
                let position = self.file_position as u32;
                self.build_packet(FrameType::ZRPOS, position, output);
                // Leave "CRC ERROR" up on the display.
                self.state = State::ZrposWait;
                return true;
            } else if self.prior_state == State::ZrinitWait {
                self.increment_errors(stats, "CRC ERROR");
                if self.state == State::Abort {
                    return true;
                }
                self.packet_buffer.clear();
                self.build_packet(FrameType::ZNAK, 0, output);
                self.state = State::ZrinitWait;
                return true;
            }
            return true;
        }

        // Metadata subpackets accumulate until the frame is complete.
        self.packet.data.extend_from_slice(&decoded);

        if self.prior_state == State::ZrinitWait {
            match self.packet.ptype {
                FrameType::ZFILE => {
                    self.state = State::Zfile;
                }
                FrameType::ZSINIT => {
                    self.state = State::ZrinitWait;
                    self.build_packet(FrameType::ZACK, 0, output);
                    return true;
                }
                FrameType::ZCOMMAND => {
                    // Answer with a failed ZCOMPL; never execute it.
                    self.state = State::ZrinitWait;
                    self.build_packet(FrameType::ZCOMPL, 1, output);
                    return true;
                }
                _ => {
                    self.state = State::Data;
                }
            }
        } else {
            self.state = State::Data;
        }
        false
    }

    fn receive_zskip(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        self.close_receive_file();
        log::info!(
            "DOWNLOAD FILE COMPLETE: protocol {}, filename {}, filesize {}",
            stats.protocol_name,
            stats.filename,
            self.file_size
        );
        self.build_packet(FrameType::ZSKIP, 0, output);
        stats.state = TransferState::FileDone;
        stats.set_last_message("ZSKIP");
        // ZSKIP is followed immediately by another ZFILE or ZFIN.
        self.prior_state = State::Zskip;
        self.state = State::ZrinitWait;
        self.packet_buffer.clear();
        false
    }

    fn zmodem_receive(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) {
        let mut done = false;
        while !done {
            match self.state {
                State::Init => {
                    if self.cfg.zmodem_zchallenge {
                        stats.set_last_message("ZCHALLENGE");
                        self.state = State::Zchallenge;
                    } else {
                        stats.set_last_message("ZRINIT");
                        self.state = State::Zrinit;
                    }
                }
                State::Zchallenge => done = self.receive_zchallenge(output),
                State::ZchallengeWait => done = self.receive_zchallenge_wait(output, stats),
                State::Zcrc => done = self.receive_zcrc(output, stats),
                State::ZcrcWait => done = self.receive_zcrc_wait(output, stats),
                State::Zrinit => done = self.receive_zrinit(output),
                State::ZrinitWait => done = self.receive_zrinit_wait(output, stats),
                State::Zrpos => done = self.receive_zrpos(output),
                State::ZrposWait => done = self.receive_zrpos_wait(output, stats),
                State::Zfile => done = self.receive_zfile(stats),
                State::Zskip => done = self.receive_zskip(output, stats),
                State::Data => done = self.receive_zdata(output, stats),
                State::ZfinWait => {
                    // The sender's Over-and-Out needs no reply.
                    done = true;
                    self.state = State::Complete;
                    stats.set_last_message("SUCCESS");
                    stats.finish(TransferState::End);
                    log::info!("ZMODEM: download complete");
                }
                State::Abort | State::Complete => done = true,
                // Sender states are unreachable on the receive side.
                _ => unreachable!("send state on receive side"),
            }
        }
    }

    /*
     * Sender: file management -------------------------------------------
     */

    fn setup_for_next_file(&mut self, stats: &mut TransferStats) -> bool {
        self.file_stream = None;
        self.file_name = None;

        let Some(record) = self.upload.get(self.upload_i).cloned() else {
            // Terminator: top up the batch total, then finish.
            stats.batch_bytes_transfer = stats.batch_bytes_total;
            self.state = State::Zfin;
            return true;
        };

        self.file_modtime = Some(record.modtime);
        self.file_size = record.size;
        self.file_position = 0;

        match File::open(&record.path) {
            Ok(f) => self.file_stream = Some(f),
            Err(e) => {
                log::error!("ZMODEM: unable to open file {:?}: {}", record.path, e);
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats);
                return false;
            }
        }

        self.file_name = Some(
            record
                .path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        self.file_fullname = record.path.clone();
        stats.new_file(&record.path, record.size, ZMODEM_BLOCK_SIZE as u64, true);

        if self.state != State::Abort {
            stats.state = TransferState::Transfer;
            // We need to send ZFILE now.
            self.state = State::Zfile;
        }
        true
    }

    fn finish_upload_file(&mut self, stats: &mut TransferStats) {
        stats.batch_bytes_transfer += self.file_size;
        stats.state = TransferState::FileDone;
        log::info!(
            "UPLOAD FILE COMPLETE: protocol {}, filename {}, filesize {}",
            stats.protocol_name,
            stats.filename,
            self.file_size
        );
        self.file_stream = None;
        self.file_name = None;
        self.upload_i += 1;
        self.setup_for_next_file(stats);
    }

    /*
     * Sender states -----------------------------------------------------
     */

    fn send_zrqinit(&mut self, output: &mut Vec<u8>) -> bool {
        self.build_packet(FrameType::ZRQINIT, 0, output);
        self.state = State::ZrqinitWait;
        self.packet_buffer.clear();
        false
    }

    fn send_zrqinit_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zrqinit;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZRINIT => {
                        stats.set_last_message("ZRINIT");
                        self.flags = Flags::from_bits_truncate(header.argument);
                        if self.flags.contains(Flags::CANFC32)
                            && self.cfg.zmodem_flavor == ZmodemFlavor::Crc32
                        {
                            self.use_crc32 = true;
                        }
                        log::debug!("ZMODEM: receiver flags {:?}", self.flags);
                        self.encode_map = build_encode_map(self.flags);
                        self.state = State::Zsinit;
                    }
                    FrameType::ZCHALLENGE => {
                        // Echo the value back; remain in this state.
                        self.build_packet(FrameType::ZACK, header.argument, output);
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zrqinit;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn send_zsinit(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if !self.flags.contains(Flags::ESCCTL) && self.cfg.zmodem_escape_ctrl {
            let options = Flags::ESCCTL.bits();
            self.build_packet(FrameType::ZSINIT, options, output);
            self.state = State::ZsinitWait;
            stats.set_last_message("ZSINIT");
            // The attention string: empty, NUL-terminated.
            let use_crc32 = self.packet.use_crc32;
            encode_zdata_bytes(&[0u8], ZCRCW, use_crc32, &self.encode_map, output);
        } else {
            // Head straight into the file upload.
            stats.set_last_message("ZFILE");
            self.state = State::Zfile;
        }
        self.packet_buffer.clear();
        false
    }

    fn send_zsinit_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zsinit;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZACK => {
                        stats.set_last_message("ZFILE");
                        self.state = State::Zfile;
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zsinit;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn send_zfile(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        self.build_packet(FrameType::ZFILE, 0, output);
        self.state = State::ZfileWait;
        stats.set_last_message("ZFILE");

        // "<name>\0<size> <mtime-octal> <mode-octal> 0 0 1 <size>"
        let mut itoa_buf = itoa::Buffer::new();
        let mut data = Vec::new();
        data.extend_from_slice(self.file_name.clone().unwrap_or_default().as_bytes());
        data.push(0);
        data.extend_from_slice(itoa_buf.format(self.file_size).as_bytes());
        let mtime_secs = self
            .file_modtime
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        data.extend_from_slice(format!(" {:o}", mtime_secs).as_bytes());
        let mode = self
            .upload
            .get(self.upload_i)
            .map(|record| record.mode)
            .unwrap_or(0o644);
        data.extend_from_slice(format!(" {:o} 0 0 1 ", mode & 0o777).as_bytes());
        data.extend_from_slice(itoa_buf.format(self.file_size).as_bytes());
        data.push(0);

        let use_crc32 = self.packet.use_crc32;
        encode_zdata_bytes(&data, ZCRCW, use_crc32, &self.encode_map, output);

        self.packet_buffer.clear();
        false
    }

    /// Answer the receiver's ZCRC probe with our CRC over the prefix.
    fn answer_zcrc(&mut self, limit: u32, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        stats.set_last_message("ZCRC");
        match self.compute_file_crc32(Some(u64::from(limit))) {
            Ok(_) => {
                let crc = self.file_crc32;
                self.build_packet(FrameType::ZCRC, crc, output);
                false
            }
            Err(_) => {
                stats.set_last_message("DISK I/O ERROR");
                self.abort_transfer(stats);
                true
            }
        }
    }

    fn send_zfile_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zfile;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZRPOS => {
                        stats.set_last_message("ZRPOS");
                        if u64::from(header.argument) > self.file_size {
                            // The receiver lied to us.
                            self.abort_transfer(stats);
                            return true;
                        }
                        self.file_position = u64::from(header.argument);
                        if self.seek_file(stats).is_err() {
                            return true;
                        }
                        let offset = (self.file_position as u32).swap_bytes();
                        self.build_packet(FrameType::ZDATA, offset, output);
                        self.data_frame_crc32 = self.packet.use_crc32;
                        self.prior_state = State::ZfileWait;
                        self.state = State::Data;
                        self.ack_required = false;
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zfile;
                    }
                    FrameType::ZCRC => {
                        return self.answer_zcrc(header.argument, output, stats);
                    }
                    FrameType::ZSKIP => {
                        stats.set_last_message("ZSKIP");
                        self.finish_upload_file(stats);
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn seek_file(&mut self, stats: &mut TransferStats) -> Result<(), ()> {
        let position = self.file_position;
        let Some(file) = self.file_stream.as_mut() else {
            self.abort_transfer(stats);
            return Err(());
        };
        if file.seek(SeekFrom::Start(position)).is_err() {
            stats.set_last_message("DISK I/O ERROR");
            self.abort_transfer(stats);
            return Err(());
        }
        Ok(())
    }

    /// Stream data subpackets (sender side).
    fn send_zdata(
        &mut self,
        output: &mut Vec<u8>,
        output_start: usize,
        output_max: usize,
        stats: &mut TransferStats,
    ) -> bool {
        let mut got_error = false;
        let mut use_spare_packet = false;

        if !self.packet_buffer.is_empty() {
            match self.next_header() {
                ParsedHeader::Invalid | ParsedHeader::CrcError => {
                    self.garbled_header(output, stats);
                    return true;
                }
                ParsedHeader::NoData => return true,
                ParsedHeader::Ok(header) => match header.ptype {
                    FrameType::ZSKIP => {
                        // The proper way to skip a file: an empty ZCRCW,
                        // then head to ZEOF.
                        self.outbound_packet.clear();
                        output.truncate(output_start);
                        let use_crc32 = self.data_frame_crc32;
                        self.packet.use_crc32 = use_crc32;
                        encode_zdata_bytes(&[], ZCRCW, use_crc32, &self.encode_map, output);
                        stats.set_last_message("ZEOF");
                        self.state = State::Zeof;
                        return false;
                    }
                    FrameType::ZRPOS => {
                        if !self.ack_required {
                            // The first ZRPOS that signals an error.
                            self.increment_errors(stats, "CRC ERROR");
                            if self.state == State::Abort {
                                return true;
                            }
                            self.ack_required = true;
                            self.waiting_for_ack = false;
                            // Restart cleanly with an empty ZCRCW.
                            output.truncate(output_start);
                            self.outbound_packet.clear();
                            self.streaming_zdata = false;
                            self.packet_buffer.clear();
                            got_error = true;
                        } else {
                            // The second ZRPOS, answering our ZCRCW.
                            self.ack_required = false;
                            self.waiting_for_ack = false;
                        }

                        if u64::from(header.argument) <= self.file_size {
                            self.confirmed_bytes = u64::from(header.argument);
                            if got_error {
                                self.block_size_down(stats);
                                if self.state == State::Abort {
                                    return true;
                                }
                            }
                            self.file_position = u64::from(header.argument);
                            if self.seek_file(stats).is_err() {
                                return true;
                            }
                            stats.bytes_transfer = self.file_position;
                            let offset = (self.file_position as u32).swap_bytes();
                            self.build_packet(FrameType::ZDATA, offset, output);
                            self.data_frame_crc32 = self.packet.use_crc32;
                        } else {
                            // The receiver lied to us.
                            self.abort_transfer(stats);
                            return true;
                        }
                    }
                    FrameType::ZACK => {
                        self.ack_required = false;
                        self.waiting_for_ack = false;
                        let position = u64::from(header.argument.swap_bytes());
                        if position > self.file_size {
                            // HyperTerminal claims a position past the
                            // end when the user skips; treat as EOF.
                            stats.set_last_message("ZEOF");
                            self.state = State::Zeof;
                            return false;
                        }
                        self.file_position = position;
                        if self.seek_file(stats).is_err() {
                            return true;
                        }
                        self.confirmed_bytes = position;
                        self.block_size_up();

                        if self.file_position == self.file_size {
                            stats.set_last_message("ZEOF");
                            self.state = State::Zeof;
                            return false;
                        }
                        stats.bytes_transfer = self.file_position;
                        if !self.streaming_zdata {
                            let offset = (self.file_position as u32).swap_bytes();
                            self.build_packet(FrameType::ZDATA, offset, output);
                            self.data_frame_crc32 = self.packet.use_crc32;
                            self.streaming_zdata = true;
                        }
                    }
                    FrameType::ZNAK => {
                        // A garbled header mid-stream: resynchronise
                        // with an empty ZCRCW.
                        self.increment_errors(stats, "ZNAK");
                        if self.state == State::Abort {
                            return true;
                        }
                        self.ack_required = true;
                        self.waiting_for_ack = false;
                        self.streaming_zdata = false;
                        output.truncate(output_start);
                        self.outbound_packet.clear();
                        self.packet_buffer.clear();
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                },
            }
        } else if self.waiting_for_ack {
            if self.check_timeout(stats) {
                if self.state == State::Abort {
                    return true;
                }
                // Re-send the ZCRCW recovery block.
                self.ack_required = true;
                self.waiting_for_ack = false;
            } else {
                return true;
            }
        }

        if !self.waiting_for_ack && !self.ack_required {
            if self.outbound_packet.is_empty() && self.file_stream.is_some() {
                if output_max.saturating_sub(output.len()) < 2 * self.block_size {
                    // No room in the output; stage into the spare
                    // packet, to be drained on later calls.
                    use_spare_packet = true;
                }
                stats.set_last_message("ZDATA");

                let mut data = vec![0u8; self.block_size];
                let mut last_block = false;
                let n = match self.file_stream.as_mut().unwrap().read(&mut data) {
                    Ok(n) => n,
                    Err(e) => {
                        log::error!("ZMODEM: read error: {}", e);
                        stats.set_last_message("DISK I/O ERROR");
                        self.abort_transfer(stats);
                        return true;
                    }
                };
                data.truncate(n);
                if n < self.block_size {
                    last_block = true;
                    self.file_position = self.file_size;
                    stats.bytes_transfer = self.file_size;
                } else {
                    self.file_position += n as u64;
                    stats.bytes_transfer += n as u64;
                }
                self.increment_blocks(stats);

                let use_crc32 = self.data_frame_crc32;
                self.packet.use_crc32 = use_crc32;
                let terminator = if last_block {
                    self.waiting_for_ack = true;
                    ZCRCW
                } else {
                    self.blocks_ack_count -= 1;
                    if self.blocks_ack_count == 0 {
                        // Require a ZACK via ZCRCQ.
                        self.blocks_ack_count = if self.reliable_link {
                            WINDOW_SIZE_RELIABLE
                        } else {
                            WINDOW_SIZE_UNRELIABLE
                        };
                        self.waiting_for_ack = true;
                        self.streaming_zdata = true;
                        ZCRCQ
                    } else {
                        ZCRCG
                    }
                };
                if use_spare_packet {
                    let mut spare = std::mem::take(&mut self.outbound_packet);
                    encode_zdata_bytes(&data, terminator, use_crc32, &self.encode_map, &mut spare);
                    self.outbound_packet = spare;
                } else {
                    encode_zdata_bytes(&data, terminator, use_crc32, &self.encode_map, output);
                }
            }
        } else if self.ack_required && !self.waiting_for_ack {
            // Send an empty ZCRCW to resynchronise after an error.
            let use_crc32 = self.data_frame_crc32;
            self.packet.use_crc32 = use_crc32;
            if !self.outbound_packet.is_empty() {
                let mut spare = std::mem::take(&mut self.outbound_packet);
                encode_zdata_bytes(&[], ZCRCW, use_crc32, &self.encode_map, &mut spare);
                self.outbound_packet = spare;
                self.waiting_for_ack = true;
            } else if output_max.saturating_sub(output.len()) > 32 {
                encode_zdata_bytes(&[], ZCRCW, use_crc32, &self.encode_map, output);
                self.waiting_for_ack = true;
            }
        }

        // Force the queue to fill up on this call.
        !use_spare_packet
    }

    fn send_zeof(&mut self, output: &mut Vec<u8>) -> bool {
        let size = self.file_size as u32;
        self.build_packet(FrameType::ZEOF, size, output);
        self.state = State::ZeofWait;
        self.packet_buffer.clear();
        false
    }

    fn send_zeof_wait(&mut self, output: &mut Vec<u8>, stats: &mut TransferStats) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zeof;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZRINIT => {
                        stats.set_last_message("ZRINIT");
                        self.finish_upload_file(stats);
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zeof;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn send_zfin(&mut self, output: &mut Vec<u8>) -> bool {
        self.build_packet(FrameType::ZFIN, 0, output);
        self.state = State::ZfinWait;
        self.packet_buffer.clear();
        false
    }

    fn send_zfin_wait(
        &mut self,
        output: &mut Vec<u8>,
        output_start: usize,
        stats: &mut TransferStats,
    ) -> bool {
        if self.packet_buffer.is_empty() {
            if self.check_timeout(stats) && self.state != State::Abort {
                self.state = State::Zfin;
                return false;
            }
            return true;
        }
        match self.next_header() {
            ParsedHeader::Invalid | ParsedHeader::CrcError => {
                self.garbled_header(output, stats);
                true
            }
            ParsedHeader::NoData => true,
            ParsedHeader::Ok(header) => {
                match header.ptype {
                    FrameType::ZFIN => {
                        // Over-and-Out.
                        output.truncate(output_start);
                        output.extend_from_slice(b"OO");
                        self.state = State::Complete;
                        stats.set_last_message("SUCCESS");
                        stats.finish(TransferState::End);
                        log::info!("ZMODEM: upload complete");
                    }
                    FrameType::ZNAK => {
                        self.increment_errors(stats, "ZNAK");
                        self.state = State::Zfin;
                    }
                    FrameType::ZRINIT => {
                        self.increment_errors(stats, "ZRINIT");
                        self.state = State::Zfin;
                    }
                    _ => {
                        self.abort_transfer(stats);
                        return true;
                    }
                }
                false
            }
        }
    }

    fn zmodem_send(
        &mut self,
        output: &mut Vec<u8>,
        output_start: usize,
        output_max: usize,
        stats: &mut TransferStats,
    ) {
        let mut done = false;
        while !done {
            if !self.outbound_packet.is_empty() {
                // Dispatch whatever fits from the deferred queue first.
                let n = (output_max.saturating_sub(output.len())).min(self.outbound_packet.len());
                if n > 0 {
                    output.extend(self.outbound_packet.drain(..n));
                }
                done = true;
                continue;
            }
            match self.state {
                State::Init => {
                    stats.set_last_message("ZRQINIT");
                    self.state = State::Zrqinit;
                }
                State::Zsinit => done = self.send_zsinit(output, stats),
                State::ZsinitWait => done = self.send_zsinit_wait(output, stats),
                State::Zrqinit => done = self.send_zrqinit(output),
                State::ZrqinitWait => done = self.send_zrqinit_wait(output, stats),
                State::Zfile => done = self.send_zfile(output, stats),
                State::ZfileWait => done = self.send_zfile_wait(output, stats),
                State::Data => done = self.send_zdata(output, output_start, output_max, stats),
                State::Zeof => done = self.send_zeof(output),
                State::ZeofWait => done = self.send_zeof_wait(output, stats),
                State::Zfin => done = self.send_zfin(output),
                State::ZfinWait => done = self.send_zfin_wait(output, output_start, stats),
                State::Abort | State::Complete => done = true,
                // Receiver states are unreachable on the send side.
                _ => unreachable!("receive state on send side"),
            }
        }
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
        debug_assert!(output_max > ZMODEM_MAX_BLOCK_SIZE);

        if !input.is_empty() {
            self.reset_timer();
        }

        // Five consecutive CANs is the cancel sequence; four in a row is
        // already unambiguous.
        for &b in input {
            if b == C_CAN {
                self.can_count += 1;
            } else {
                self.can_count = 0;
            }
            if self.can_count >= 4 {
                stats.set_last_message(if self.sending {
                    "TRANSFER CANCELLED BY RECEIVER"
                } else {
                    "TRANSFER CANCELLED BY SENDER"
                });
                self.abort_transfer(stats);
                return;
            }
        }

        self.packet_buffer.extend_from_slice(input);
        let output_start = output.len();

        if self.sending {
            self.zmodem_send(output, output_start, output_max, stats);
        } else {
            self.zmodem_receive(output, stats);
        }

        if !output.is_empty() {
            self.reset_timer();
        }
    }
}
