// SPDX-License-Identifier: MIT OR Apache-2.0
//! The transfer statistics record shared between the engines and the host.

use std::path::Path;
use std::time::SystemTime;

/// Coarse progress of the whole session, observable by the host between
/// pump calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Before the first byte moves.
    Init,
    /// Exchanging file metadata.
    FileInfo,
    /// Moving file data.
    Transfer,
    /// The current file finished; more may follow in a batch.
    FileDone,
    /// The whole batch finished successfully.
    End,
    /// The transfer was cancelled or errored out.
    Abort,
}

/// Progress counters and identification for the running transfer. The
/// engines mutate this; the host reads it between pump invocations.
#[derive(Debug)]
pub struct TransferStats {
    pub state: TransferState,
    pub protocol_name: String,
    pub filename: String,
    pub pathname: String,
    pub last_message: String,
    pub bytes_total: u64,
    pub bytes_transfer: u64,
    pub blocks: u64,
    pub blocks_transfer: u64,
    pub block_size: u64,
    pub error_count: u64,
    pub batch_bytes_total: u64,
    pub batch_bytes_transfer: u64,
    pub file_start_time: Option<SystemTime>,
    pub batch_start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

impl TransferStats {
    pub(crate) fn new(protocol_name: &str) -> Self {
        TransferStats {
            state: TransferState::Init,
            protocol_name: protocol_name.to_owned(),
            filename: String::new(),
            pathname: String::new(),
            last_message: String::new(),
            bytes_total: 0,
            bytes_transfer: 0,
            blocks: 0,
            blocks_transfer: 0,
            block_size: 0,
            error_count: 0,
            batch_bytes_total: 0,
            batch_bytes_transfer: 0,
            file_start_time: None,
            batch_start_time: Some(SystemTime::now()),
            end_time: None,
        }
    }

    pub(crate) fn set_last_message(&mut self, message: &str) {
        self.last_message = message.to_owned();
    }

    /// Reset the per-file counters for a new file.
    pub(crate) fn new_file(
        &mut self,
        fullname: &Path,
        filesize: u64,
        block_size: u64,
        sending: bool,
    ) {
        self.blocks_transfer = 0;
        self.bytes_transfer = 0;
        self.error_count = 0;
        self.last_message.clear();
        self.bytes_total = filesize;
        self.blocks = filesize / block_size;
        if filesize % block_size > 0 {
            self.blocks += 1;
        }
        self.filename = fullname
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.pathname = fullname
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.state = TransferState::Transfer;
        self.file_start_time = Some(SystemTime::now());

        if sending {
            log::info!(
                "UPLOAD: sending file {}/{}, {} bytes",
                self.pathname,
                self.filename,
                filesize
            );
        } else {
            log::info!(
                "DOWNLOAD: receiving file {}/{}, {} bytes",
                self.pathname,
                self.filename,
                filesize
            );
        }
    }

    /// Refresh the block counters from the current file position.
    pub(crate) fn update_blocks(&mut self, file_position: u64, block_size: u64) {
        self.block_size = block_size;
        if block_size > 0 {
            self.blocks_transfer = file_position / block_size;
            if file_position % block_size > 0 {
                self.blocks_transfer += 1;
            }
        }
    }

    /// Record a recoverable error and leave the message on the display.
    pub(crate) fn increment_errors(&mut self, message: &str) {
        log::warn!("{}", message);
        self.last_message = message.to_owned();
        self.error_count += 1;
    }

    /// Final bookkeeping for a finished or aborted session.
    pub(crate) fn finish(&mut self, state: TransferState) {
        self.state = state;
        self.end_time = Some(SystemTime::now());
    }
}
