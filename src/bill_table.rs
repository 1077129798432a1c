//! Bill-table decoding and the bit layout shared by the enable and
//! security bitmaps.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::CashType;

/// Number of bill-type slots in the device table.
pub const BILL_TYPES_MAX: usize = 24;

/// Size of one bill-table record on the wire.
const RECORD_LEN: usize = 5;

/// Size of the full bill-table response.
pub(crate) const BILL_TABLE_LEN: usize = BILL_TYPES_MAX * RECORD_LEN;

/// Minor currency units per major unit, fixed at two decimal digits.
/// Wrong for zero- and three-digit currencies; kept until a per-currency
/// table is introduced.
const MINOR_UNITS_PER_MAJOR: u64 = 100;

const EXPONENT_SIGN_BIT: u8 = 0x80;

/// Mapping from a device bill-type index to the cash type in that slot.
/// Unused slots are absent.
pub type BillTable = BTreeMap<u8, CashType>;

/// Decodes the 120-byte bill-table response.
///
/// Each 5-byte record is a denomination mantissa, a 3-character code and a
/// sign-magnitude decimal exponent. A record with mantissa 0 marks an
/// unused slot. A negative exponent must divide the denomination exactly.
pub(crate) fn decode(data: &[u8]) -> Result<BillTable> {
    if data.len() != BILL_TABLE_LEN {
        return Err(Error::Protocol(format!(
            "bill table response is {} bytes, expected {BILL_TABLE_LEN}",
            data.len()
        )));
    }

    let mut table = BillTable::new();

    for index in 0..BILL_TYPES_MAX {
        let record = &data[index * RECORD_LEN..][..RECORD_LEN];
        if record[0] == 0 {
            continue;
        }

        let currency_code = String::from_utf8_lossy(&record[1..4]).into_owned();

        let mantissa = u64::from(record[0]) * MINOR_UNITS_PER_MAJOR;
        let exponent = u32::from(record[4] & !EXPONENT_SIGN_BIT);
        let scale = 10u64.checked_pow(exponent).ok_or_else(|| {
            Error::Protocol(format!("bill type {index}: exponent {exponent} out of range"))
        })?;

        let denomination = if record[4] & EXPONENT_SIGN_BIT != 0 {
            if mantissa % scale != 0 {
                return Err(Error::Protocol(format!(
                    "bill type {index}: {mantissa} is not divisible by 10^{exponent}"
                )));
            }
            mantissa / scale
        } else {
            mantissa.checked_mul(scale).ok_or_else(|| {
                Error::Protocol(format!("bill type {index}: denomination overflow"))
            })?
        };

        table.insert(index as u8, CashType::new(currency_code, denomination));
    }

    Ok(table)
}

// The enable and security bitmaps are 24-bit little-endian words spread
// over 3-byte triplets: bill type `n` lives in byte `2 - n / 8` at bit
// `n % 8`.

pub(crate) fn set_mask_bit(triplet: &mut [u8], index: u8) {
    debug_assert!(triplet.len() == 3 && (index as usize) < BILL_TYPES_MAX);
    triplet[2 - (index / 8) as usize] |= 1 << (index % 8);
}

pub(crate) fn mask_bit(triplet: &[u8], index: u8) -> bool {
    debug_assert!(triplet.len() == 3 && (index as usize) < BILL_TYPES_MAX);
    triplet[2 - (index / 8) as usize] & (1 << (index % 8)) != 0
}
