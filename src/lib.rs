// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kermit and ZMODEM file transfer protocol engines.
//!
//! The crate is a *byte pump*: the host hands [`Session::process`] whatever
//! bytes arrived from the remote side plus a buffer to fill with bytes to
//! send back. All protocol work happens inside that call; nothing blocks,
//! and timeouts are evaluated against a clock sampled once per call.
//!
//! ```no_run
//! use qxfer::{Config, Protocol, Session, TransferState};
//!
//! let mut session = Session::start_receive(
//!     Protocol::Zmodem,
//!     "/tmp/downloads",
//!     Config::default(),
//! )?;
//! let mut output = Vec::new();
//! loop {
//!     let input = [0u8; 0]; // bytes that arrived from the remote side
//!     output.clear();
//!     session.process(&input, &mut output, 4096);
//!     // write `output` to the remote side here
//!     match session.stats().state {
//!         TransferState::End | TransferState::Abort => break,
//!         _ => {}
//!     }
//! }
//! # Ok::<(), qxfer::Error>(())
//! ```

mod crc;
mod kermit;
mod session;
mod stats;
mod zmodem;

pub use session::{Config, Direction, FileRecord, Protocol, Session, ZmodemFlavor};
pub use stats::{TransferState, TransferStats};

use thiserror::Error as ThisError;

/// Errors surfaced at the host-facing API boundary. Failures during a
/// running transfer are reported through [`TransferStats`] instead.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no transfer engine for protocol {0:?}")]
    UnsupportedProtocol(Protocol),
    #[error("upload file list is empty")]
    EmptyFileList,
}

// Control characters shared by both protocols.
pub(crate) const C_SOH: u8 = 0x01;
pub(crate) const C_LF: u8 = 0x0A;
pub(crate) const C_CR: u8 = 0x0D;
pub(crate) const C_XON: u8 = 0x11;
pub(crate) const C_CAN: u8 = 0x18;
