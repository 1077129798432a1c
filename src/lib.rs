//! Driver for serial-attached CCNET bill validators (banknote acceptors).

pub mod bill_table;
pub mod error;
pub mod frame;
pub mod mock;
pub mod operator;
mod request;
mod transport;
pub mod types;
mod validator;

pub use bill_table::BillTable;
pub use error::{Error, Result};
pub use operator::BillValidatorOperator;
pub use request::Reply;
pub use types::{
    BillSecurityLevel, CashAction, CashType, DeviceInfo, DeviceState, DeviceStateCode,
};
pub use validator::{BillValidator, BAUD_RATE};
