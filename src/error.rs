use thiserror::Error;

use crate::types::CashType;

/// Errors surfaced by the driver.
///
/// Exchange-level failures (`Io`, `SerialPort`, framing and protocol
/// variants) abort the current exchange; the poll loop reacts by restarting
/// device initialization. `UnsupportedCashType` only fails the request that
/// carried it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("synchronization error: frame starts with 0x{byte:02x}")]
    Sync { byte: u8 },

    #[error("inconsistent frame length byte 0x{length:02x}")]
    Length { length: u8 },

    #[error("crc mismatch in frame from address 0x{address:02x}")]
    Crc { address: u8 },

    #[error("device rejected the command as illegal")]
    IllegalCommand,

    #[error("no frame addressed to this controller was received")]
    NoResponse,

    #[error("command was not accepted by the device")]
    NotAccepted,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cash type {0} is not supported by the connected device")]
    UnsupportedCashType(CashType),

    #[error("timed out waiting for the operate thread")]
    Timeout,

    #[error("driver is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
