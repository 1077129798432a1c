use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use ccnet_validator::{BillValidator, BillValidatorOperator, CashAction, CashType};

/// Operator that logs every device event and accepts every bill.
struct AcceptingOperator;

impl BillValidatorOperator for AcceptingOperator {
    fn drop_cassette_full(&self) {
        log::warn!("drop cassette is full");
    }

    fn drop_cassette_installed(&self) {
        log::info!("drop cassette installed");
    }

    fn drop_cassette_removed(&self) {
        log::warn!("drop cassette removed");
    }

    fn request_cash_action(&self, cash_type: &CashType) -> mpsc::Receiver<CashAction> {
        log::info!("bill at escrow: {cash_type}, accepting");

        let (tx, rx) = mpsc::channel();
        let _ = tx.send(CashAction::Accept);
        rx
    }

    fn cash_accepted(&self, cash_type: &CashType) {
        log::info!("accepted {cash_type}");
    }

    fn cash_returned(&self, cash_type: &CashType) {
        log::info!("returned {cash_type}");
    }
}

fn main() -> ccnet_validator::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let serial_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".into());

    let validator = BillValidator::open(&serial_path, Arc::new(AcceptingOperator))?;

    let info = validator.get_device_info().wait()?;
    log::info!(
        "connected to {} (serial {})",
        info.part_number,
        info.serial_number
    );

    let cash_types = validator.get_cash_types().wait()?;
    log::info!("supported cash types: {cash_types:?}");

    validator.set_enabled_cash_types(cash_types).wait()?;

    // accept bills until interrupted
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
