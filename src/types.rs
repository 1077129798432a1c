//! Host-facing data model of the validator.

use std::fmt;

use crate::error::{Error, Result};

/// A banknote denomination accepted by the validator.
///
/// Ordered lexicographically by currency code, then numerically by
/// denomination.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CashType {
    /// Three-letter code reported by the device.
    ///
    /// The device actually reports a *country* code here; it is carried
    /// verbatim. TODO: map country codes to ISO currency codes.
    pub currency_code: String,
    /// Denomination in minor currency units.
    pub denomination: u64,
}

impl CashType {
    pub fn new(currency_code: impl Into<String>, denomination: u64) -> Self {
        Self {
            currency_code: currency_code.into(),
            denomination,
        }
    }
}

impl fmt::Display for CashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.currency_code, self.denomination)
    }
}

/// Identity reported by the validator in its identification response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub part_number: String,
    pub serial_number: String,
    pub asset_number: u64,
}

/// Size of the identification response in bytes.
const IDENTIFICATION_LEN: usize = 34;

impl DeviceInfo {
    /// Decodes the 34-byte identification response: a 15-byte part number,
    /// a 12-byte serial number (both ASCII, space-padded) and a 7-byte
    /// big-endian asset number.
    pub(crate) fn from_identification(data: &[u8]) -> Result<Self> {
        if data.len() != IDENTIFICATION_LEN {
            return Err(Error::Protocol(format!(
                "identification response is {} bytes, expected {IDENTIFICATION_LEN}",
                data.len()
            )));
        }

        let asset_number = data[27..34]
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));

        Ok(Self {
            part_number: ascii_trimmed(&data[..15]),
            serial_number: ascii_trimmed(&data[15..27]),
            asset_number,
        })
    }
}

fn ascii_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Security screening level for a bill type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BillSecurityLevel {
    Normal,
    High,
}

/// Host decision for a bill held in escrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CashAction {
    /// Keep the bill in escrow; the decision will be requested again.
    Hold,
    /// Stack the bill into the drop cassette.
    Accept,
    /// Return the bill to the customer.
    Return,
}

/// States reported by the validator in poll responses.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStateCode {
    /// Initial value only; never reported by the device.
    Unknown = 0x00,
    PowerUp = 0x10,
    PowerUpWithBillInValidator = 0x11,
    PowerUpWithBillInStacker = 0x12,
    Initialize = 0x13,
    Idling = 0x14,
    Accepting = 0x15,
    Stacking = 0x17,
    Returning = 0x18,
    UnitDisabled = 0x19,
    Holding = 0x1a,
    DeviceBusy = 0x1b,
    Rejecting = 0x1c,
    DropCassetteFull = 0x41,
    DropCassetteOutOfPosition = 0x42,
    ValidatorJammed = 0x43,
    DropCassetteJammed = 0x44,
    Cheated = 0x45,
    Pause = 0x46,
    Failure = 0x47,
    EscrowPosition = 0x80,
    BillStacked = 0x81,
    BillReturned = 0x82,
}

impl DeviceStateCode {
    /// Maps a reported state byte. `0x00` is reserved for the driver's
    /// initial value and is not a valid report.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::PowerUp),
            0x11 => Some(Self::PowerUpWithBillInValidator),
            0x12 => Some(Self::PowerUpWithBillInStacker),
            0x13 => Some(Self::Initialize),
            0x14 => Some(Self::Idling),
            0x15 => Some(Self::Accepting),
            0x17 => Some(Self::Stacking),
            0x18 => Some(Self::Returning),
            0x19 => Some(Self::UnitDisabled),
            0x1a => Some(Self::Holding),
            0x1b => Some(Self::DeviceBusy),
            0x1c => Some(Self::Rejecting),
            0x41 => Some(Self::DropCassetteFull),
            0x42 => Some(Self::DropCassetteOutOfPosition),
            0x43 => Some(Self::ValidatorJammed),
            0x44 => Some(Self::DropCassetteJammed),
            0x45 => Some(Self::Cheated),
            0x46 => Some(Self::Pause),
            0x47 => Some(Self::Failure),
            0x80 => Some(Self::EscrowPosition),
            0x81 => Some(Self::BillStacked),
            0x82 => Some(Self::BillReturned),
            _ => None,
        }
    }

    /// Whether the optional second poll byte is meaningful for this state:
    /// a reject/failure subcode, or a bill-type index for the escrow states.
    fn carries_info(self) -> bool {
        matches!(
            self,
            Self::Rejecting
                | Self::Failure
                | Self::EscrowPosition
                | Self::BillStacked
                | Self::BillReturned
        )
    }
}

/// A snapshot of the validator state as reported by a poll response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceState {
    pub code: DeviceStateCode,
    /// Subcode for `Rejecting`/`Failure`, bill-type index for
    /// `EscrowPosition`/`BillStacked`/`BillReturned`, 0 otherwise.
    pub info: u8,
}

impl DeviceState {
    pub fn new(code: DeviceStateCode, info: u8) -> Self {
        let info = if code.carries_info() { info } else { 0 };
        Self { code, info }
    }

    /// Parses a 1- or 2-byte poll payload.
    pub(crate) fn from_poll(payload: &[u8]) -> Result<Self> {
        let (code, info) = match *payload {
            [code] => (code, 0),
            [code, info] => (code, info),
            _ => {
                return Err(Error::Protocol(format!(
                    "poll response is {} bytes, expected 1 or 2",
                    payload.len()
                )))
            }
        };

        let code = DeviceStateCode::from_u8(code)
            .ok_or_else(|| Error::Protocol(format!("unknown device state 0x{code:02x}")))?;

        Ok(Self::new(code, info))
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            code: DeviceStateCode::Unknown,
            info: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cash_types_order_by_currency_then_denomination() {
        let eur = CashType::new("EUR", 500);
        let rub_small = CashType::new("RUB", 100);
        let rub_large = CashType::new("RUB", 500);

        assert!(eur < rub_small);
        assert!(rub_small < rub_large);
        assert_eq!(rub_small, CashType::new("RUB", 100));
    }

    #[test]
    fn identification_decodes_padded_fields() {
        let mut data = vec![b' '; 34];
        data[..10].copy_from_slice(b"CCNET-PART");
        data[15..22].copy_from_slice(b"SN00042");
        data[27..34].copy_from_slice(&[0, 0, 0, 0, 0, 1, 0]);

        let info = DeviceInfo::from_identification(&data).unwrap();

        assert_eq!(info.part_number, "CCNET-PART");
        assert_eq!(info.serial_number, "SN00042");
        assert_eq!(info.asset_number, 256);
    }

    #[test]
    fn identification_rejects_wrong_size() {
        assert!(DeviceInfo::from_identification(&[0u8; 33]).is_err());
    }

    #[test]
    fn poll_payload_parses_one_or_two_bytes() {
        let idling = DeviceState::from_poll(&[0x14]).unwrap();
        assert_eq!(idling, DeviceState::new(DeviceStateCode::Idling, 0));

        let escrow = DeviceState::from_poll(&[0x80, 0x02]).unwrap();
        assert_eq!(escrow.code, DeviceStateCode::EscrowPosition);
        assert_eq!(escrow.info, 2);
    }

    #[test]
    fn info_is_zeroed_for_states_that_do_not_carry_it() {
        let state = DeviceState::from_poll(&[0x14, 0x07]).unwrap();
        assert_eq!(state.info, 0);
    }

    #[test]
    fn poll_payload_rejects_bad_shapes() {
        assert!(DeviceState::from_poll(&[]).is_err());
        assert!(DeviceState::from_poll(&[0x14, 0x00, 0x01]).is_err());
        assert!(DeviceState::from_poll(&[0x99]).is_err());
        assert!(DeviceState::from_poll(&[0x00]).is_err());
    }
}
