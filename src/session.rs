// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatcher: owns the statistics record, the upload list or the
//! download directory, and routes the byte pump to the selected engine.

use crate::kermit::Kermit;
use crate::stats::{TransferState, TransferStats};
use crate::zmodem::Zmodem;
use crate::Error;
use std::path::PathBuf;
use std::time::SystemTime;

/// The file transfer protocols the host can ask for. Only Kermit and
/// Zmodem have engines here; the Xmodem family and ASCII transfers are
/// routed elsewhere by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Ascii,
    Xmodem,
    XmodemCrc,
    XmodemRelaxed,
    Xmodem1k,
    Xmodem1kG,
    Ymodem,
    YmodemG,
    Kermit,
    Zmodem,
}

impl Protocol {
    /// The display name used in logs and the statistics record.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Ascii => "ASCII",
            Protocol::Kermit => "Kermit",
            Protocol::Xmodem => "Xmodem",
            Protocol::XmodemCrc => "Xmodem CRC",
            Protocol::XmodemRelaxed => "Xmodem Relaxed",
            Protocol::Xmodem1k => "Xmodem-1K",
            Protocol::Xmodem1kG => "Xmodem-1K/G",
            Protocol::Ymodem => "Ymodem Batch",
            Protocol::YmodemG => "Ymodem/G Batch",
            Protocol::Zmodem => "Zmodem Batch",
        }
    }

    /// Whether the protocol can move several files in one session.
    pub fn batchable(self) -> bool {
        matches!(
            self,
            Protocol::Kermit | Protocol::Zmodem | Protocol::Ymodem | Protocol::YmodemG
        )
    }
}

/// The Zmodem frame check flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZmodemFlavor {
    Crc16,
    Crc32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Engine knobs, mirroring the original terminal's option set. The
/// defaults are what the stock configuration shipped with.
#[derive(Clone, Debug)]
pub struct Config {
    pub zmodem_flavor: ZmodemFlavor,
    /// Receiver opens with a ZCHALLENGE round before ZRINIT.
    pub zmodem_zchallenge: bool,
    /// Ask the peer to escape control characters.
    pub zmodem_escape_ctrl: bool,
    pub kermit_long_packets: bool,
    pub kermit_streaming: bool,
    pub kermit_resend: bool,
    /// Upload filenames in Kermit "common form".
    pub kermit_robust_filename: bool,
    pub kermit_uploads_force_binary: bool,
    pub kermit_downloads_convert_text: bool,
    /// The link strips the high bit; Kermit checksums mask it too.
    pub seven_bit_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            zmodem_flavor: ZmodemFlavor::Crc32,
            zmodem_zchallenge: false,
            zmodem_escape_ctrl: false,
            kermit_long_packets: true,
            kermit_streaming: true,
            kermit_resend: true,
            kermit_robust_filename: false,
            kermit_uploads_force_binary: true,
            kermit_downloads_convert_text: true,
            seven_bit_only: false,
        }
    }
}

/// One file queued for upload, with the stat fields the protocols
/// announce to the peer.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modtime: SystemTime,
    pub mode: u32,
}

impl FileRecord {
    /// Capture a file's metadata for the upload list.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path)?;
        let modtime = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o777
        };
        #[cfg(not(unix))]
        let mode = 0o644;
        Ok(FileRecord {
            size: metadata.len(),
            modtime,
            mode,
            path,
        })
    }
}

enum Engine {
    Kermit(Box<Kermit>),
    Zmodem(Box<Zmodem>),
}

/// One file transfer session. Exactly one exists at a time per link;
/// it owns the open file, the statistics record and all protocol state.
pub struct Session {
    protocol: Protocol,
    direction: Direction,
    stats: TransferStats,
    engine: Engine,
}

impl Session {
    /// Start an upload of `files` with `protocol`.
    pub fn start_send(
        protocol: Protocol,
        files: Vec<FileRecord>,
        config: Config,
    ) -> Result<Session, Error> {
        if files.is_empty() {
            return Err(Error::EmptyFileList);
        }
        let mut stats = TransferStats::new(protocol.name());
        stats.batch_bytes_total = files.iter().map(|f| f.size).sum();
        log::info!("UPLOAD BEGIN: protocol {}", protocol.name());

        let engine = match protocol {
            Protocol::Kermit => Engine::Kermit(Box::new(Kermit::start_send(
                files, &config, &mut stats,
            )?)),
            Protocol::Zmodem => Engine::Zmodem(Box::new(Zmodem::start_send(
                files, &config, &mut stats,
            )?)),
            other => return Err(Error::UnsupportedProtocol(other)),
        };

        Ok(Session {
            protocol,
            direction: Direction::Send,
            stats,
            engine,
        })
    }

    /// Start a download into `download_path` with `protocol`.
    pub fn start_receive(
        protocol: Protocol,
        download_path: impl Into<PathBuf>,
        config: Config,
    ) -> Result<Session, Error> {
        let mut download_path = download_path.into();
        // Strip a trailing slash the way shell-completed paths carry it.
        if let Some(s) = download_path.to_str() {
            let trimmed = s.trim_end_matches('/');
            if trimmed.len() != s.len() && !trimmed.is_empty() {
                download_path = PathBuf::from(trimmed);
            }
        }

        let mut stats = TransferStats::new(protocol.name());
        stats.pathname = download_path.to_string_lossy().into_owned();
        log::info!("DOWNLOAD BEGIN: protocol {}", protocol.name());

        let engine = match protocol {
            Protocol::Kermit => {
                Engine::Kermit(Box::new(Kermit::start_receive(download_path, &config)))
            }
            Protocol::Zmodem => {
                Engine::Zmodem(Box::new(Zmodem::start_receive(download_path, &config)))
            }
            other => return Err(Error::UnsupportedProtocol(other)),
        };

        Ok(Session {
            protocol,
            direction: Direction::Receive,
            stats,
            engine,
        })
    }

    /// The byte pump. Consumes all of `input`, appends at most
    /// `output_max - output.len()` bytes destined for the peer to
    /// `output`, and never blocks.
    pub fn process(&mut self, input: &[u8], output: &mut Vec<u8>, output_max: usize) {
        let before = self.stats.state;
        match &mut self.engine {
            Engine::Kermit(k) => k.process(input, output, output_max, &mut self.stats),
            Engine::Zmodem(z) => z.process(input, output, output_max, &mut self.stats),
        }
        let after = self.stats.state;
        if before != after {
            match after {
                TransferState::End => log::info!(
                    "TRANSFER END: protocol {}, {} bytes",
                    self.stats.protocol_name,
                    self.stats.batch_bytes_transfer
                ),
                TransferState::Abort => log::info!(
                    "TRANSFER ABORT: protocol {}: {}",
                    self.stats.protocol_name,
                    self.stats.last_message
                ),
                _ => {}
            }
        }
    }

    /// Stop the transfer and close any open file. A partial download is
    /// kept on disk only when `save_partial` is set.
    pub fn stop(&mut self, save_partial: bool) {
        match &mut self.engine {
            Engine::Kermit(k) => k.stop(save_partial),
            Engine::Zmodem(z) => z.stop(save_partial),
        }
        if !matches!(
            self.stats.state,
            TransferState::End | TransferState::Abort
        ) {
            self.stats.finish(TransferState::Abort);
        }
    }

    /// Skip the file currently being transferred (Kermit only).
    pub fn skip_file(&mut self) {
        if let Engine::Kermit(k) = &mut self.engine {
            k.skip_file();
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The statistics record, read-only for the host.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_protocols_are_refused() {
        for protocol in [
            Protocol::Ascii,
            Protocol::Xmodem,
            Protocol::XmodemCrc,
            Protocol::XmodemRelaxed,
            Protocol::Xmodem1k,
            Protocol::Xmodem1kG,
            Protocol::Ymodem,
            Protocol::YmodemG,
        ] {
            let result = Session::start_receive(protocol, "/tmp", Config::default());
            assert!(matches!(result, Err(Error::UnsupportedProtocol(p)) if p == protocol));
        }
    }

    #[test]
    fn empty_upload_list_is_refused() {
        let result = Session::start_send(Protocol::Zmodem, Vec::new(), Config::default());
        assert!(matches!(result, Err(Error::EmptyFileList)));
    }

    #[test]
    fn protocol_names() {
        assert_eq!(Protocol::Zmodem.name(), "Zmodem Batch");
        assert_eq!(Protocol::Kermit.name(), "Kermit");
        assert!(Protocol::Kermit.batchable());
        assert!(!Protocol::Xmodem.batchable());
    }
}
