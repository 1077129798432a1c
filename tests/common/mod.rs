#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ccnet_validator::{BillValidatorOperator, CashAction, CashType};

static INIT: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if !INIT.swap(true, Ordering::SeqCst) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
            .try_init()
            .ok();
    }
}

/// One recorded operator upcall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upcall {
    CassetteFull,
    CassetteInstalled,
    CassetteRemoved,
    ActionRequested(CashType),
    Accepted(CashType),
    Returned(CashType),
}

/// Scripted answer to one escrow decision request.
pub enum Decision {
    Act(CashAction),
    /// Keep the decision channel open but never answer, forcing the
    /// driver's timeout path.
    NoAnswer,
}

/// Operator that records every upcall and answers escrow requests from a
/// preloaded script.
pub struct TestOperator {
    upcalls: Mutex<Vec<Upcall>>,
    decisions: Mutex<VecDeque<Decision>>,
    held_senders: Mutex<Vec<mpsc::Sender<CashAction>>>,
}

impl TestOperator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upcalls: Mutex::new(Vec::new()),
            decisions: Mutex::new(VecDeque::new()),
            held_senders: Mutex::new(Vec::new()),
        })
    }

    pub fn push_decision(&self, decision: Decision) {
        self.decisions.lock().push_back(decision);
    }

    pub fn upcalls(&self) -> Vec<Upcall> {
        self.upcalls.lock().clone()
    }

    /// Blocks until `predicate` holds for the upcall log, up to `timeout`.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[Upcall]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.upcalls.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl BillValidatorOperator for TestOperator {
    fn drop_cassette_full(&self) {
        self.upcalls.lock().push(Upcall::CassetteFull);
    }

    fn drop_cassette_installed(&self) {
        self.upcalls.lock().push(Upcall::CassetteInstalled);
    }

    fn drop_cassette_removed(&self) {
        self.upcalls.lock().push(Upcall::CassetteRemoved);
    }

    fn request_cash_action(&self, cash_type: &CashType) -> mpsc::Receiver<CashAction> {
        self.upcalls
            .lock()
            .push(Upcall::ActionRequested(cash_type.clone()));

        let (tx, rx) = mpsc::channel();
        match self.decisions.lock().pop_front() {
            Some(Decision::Act(action)) => {
                let _ = tx.send(action);
            }
            Some(Decision::NoAnswer) | None => {
                self.held_senders.lock().push(tx);
            }
        }
        rx
    }

    fn cash_accepted(&self, cash_type: &CashType) {
        self.upcalls.lock().push(Upcall::Accepted(cash_type.clone()));
    }

    fn cash_returned(&self, cash_type: &CashType) {
        self.upcalls.lock().push(Upcall::Returned(cash_type.clone()));
    }
}
