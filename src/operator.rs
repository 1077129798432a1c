//! Outward callback surface implemented by the embedding application.

use std::sync::mpsc;

use crate::types::{CashAction, CashType};

/// Upcalls the driver makes in response to autonomous device events.
///
/// Notifications are fire-and-forget and should return quickly; they run on
/// the operate thread and delay polling while they execute.
///
/// [`request_cash_action`](Self::request_cash_action) returns the receiving
/// end of a decision channel. The implementation typically hands the sender
/// to its own UI or business logic and returns immediately; the driver
/// waits up to 10 seconds for the decision and returns the bill when none
/// arrives.
pub trait BillValidatorOperator: Send + Sync {
    /// The drop cassette reached capacity.
    fn drop_cassette_full(&self);

    /// A previously removed drop cassette is back in position.
    fn drop_cassette_installed(&self);

    /// The drop cassette was removed from the validator.
    fn drop_cassette_removed(&self);

    /// A recognized bill is held in escrow awaiting a decision.
    fn request_cash_action(&self, cash_type: &CashType) -> mpsc::Receiver<CashAction>;

    /// A bill was stacked into the drop cassette.
    fn cash_accepted(&self, cash_type: &CashType);

    /// A bill was returned to the customer.
    fn cash_returned(&self, cash_type: &CashType);
}
