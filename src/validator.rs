//! The bill-validator controller: public request API and the operate
//! thread that owns the serial port.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bill_table::{self, BillTable};
use crate::error::{Error, Result};
use crate::operator::BillValidatorOperator;
use crate::request::{self, Reply, Request, Responder};
use crate::transport::Transport;
use crate::types::{
    BillSecurityLevel, CashAction, CashType, DeviceInfo, DeviceState, DeviceStateCode,
};

/// Serial baud rate mandated by the protocol (bps).
pub const BAUD_RATE: u32 = 9_600;
/// Timeout for blocking serial reads (milliseconds).
const SERIAL_TIMEOUT_MS: u64 = 10_000;
/// Delay between poll cycles (milliseconds).
const POLL_CYCLE_MS: u64 = 100;
/// Time allowed for the operator to decide on an escrowed bill (seconds).
const CASH_ACTION_TIMEOUT_SECS: u64 = 10;

type RequestQueue = Arc<Mutex<VecDeque<Request>>>;

/// Controller for a CCNET bill validator on a serial line.
///
/// A dedicated operate thread owns the serial port: it initializes the
/// device (reset, identification, bill table), polls it at ~10 Hz,
/// translates state transitions into [`BillValidatorOperator`] upcalls and
/// services queued requests between polls. The public methods never touch
/// the port; they enqueue a request and hand back a [`Reply`].
///
/// ```no_run
/// use std::sync::{mpsc, Arc};
///
/// use ccnet_validator::{BillValidator, BillValidatorOperator, CashAction, CashType};
///
/// struct Kiosk;
///
/// impl BillValidatorOperator for Kiosk {
///     fn drop_cassette_full(&self) {}
///     fn drop_cassette_installed(&self) {}
///     fn drop_cassette_removed(&self) {}
///     fn request_cash_action(&self, _cash_type: &CashType) -> mpsc::Receiver<CashAction> {
///         let (tx, rx) = mpsc::channel();
///         let _ = tx.send(CashAction::Accept);
///         rx
///     }
///     fn cash_accepted(&self, cash_type: &CashType) {
///         println!("credited {cash_type}");
///     }
///     fn cash_returned(&self, _cash_type: &CashType) {}
/// }
///
/// # fn main() -> ccnet_validator::Result<()> {
/// let validator = BillValidator::open("/dev/ttyUSB0", Arc::new(Kiosk))?;
///
/// let supported = validator.get_cash_types().wait()?;
/// validator.set_enabled_cash_types(supported).wait()?;
/// # Ok(())
/// # }
/// ```
pub struct BillValidator {
    queue: RequestQueue,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BillValidator {
    /// Opens the serial device at `serial_path` (9600 baud, 8-N-1, no flow
    /// control) and starts the operate thread.
    pub fn open(serial_path: &str, operator: Arc<dyn BillValidatorOperator>) -> Result<Self> {
        let port = serialport::new(serial_path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open_native()?;

        Ok(Self::with_port(port, operator))
    }

    /// Starts the operate thread over an already open port.
    ///
    /// Anything implementing `Read + Write` works; tests drive the
    /// controller against [`mock::MockValidator`](crate::mock::MockValidator).
    pub fn with_port<P>(port: P, operator: Arc<dyn BillValidatorOperator>) -> Self
    where
        P: Read + Write + Send + 'static,
    {
        let queue: RequestQueue = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker_queue = Arc::clone(&queue);
        let worker_stop = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            Operate::new(port, operator, worker_queue, worker_stop).run();
        });

        Self {
            queue,
            stop,
            worker: Some(worker),
        }
    }

    /// Returns the identity read from the device during initialization.
    pub fn get_device_info(&self) -> Reply<DeviceInfo> {
        self.enqueue(Request::GetDeviceInfo)
    }

    /// Returns every cash type present in the cached bill table.
    pub fn get_cash_types(&self) -> Reply<BTreeSet<CashType>> {
        self.enqueue(Request::GetCashTypes)
    }

    /// Reads the device status and returns the cash types currently
    /// enabled for acceptance.
    pub fn get_enabled_cash_types(&self) -> Reply<BTreeSet<CashType>> {
        self.enqueue(Request::GetEnabledCashTypes)
    }

    /// Enables exactly the given cash types for acceptance, with escrow.
    ///
    /// Fails with [`Error::UnsupportedCashType`] if any entry is absent
    /// from the bill table; nothing is sent to the device in that case.
    pub fn set_enabled_cash_types(&self, cash_types: BTreeSet<CashType>) -> Reply<()> {
        self.enqueue(|responder| Request::SetEnabledCashTypes(cash_types, responder))
    }

    /// Reads the device status and returns the security level of every
    /// cash type in the bill table.
    pub fn get_cash_types_security_levels(&self) -> Reply<BTreeMap<CashType, BillSecurityLevel>> {
        self.enqueue(Request::GetSecurityLevels)
    }

    /// Sets the security level per cash type. Entries at
    /// [`BillSecurityLevel::Normal`] contribute nothing; entries at
    /// [`BillSecurityLevel::High`] must exist in the bill table.
    pub fn set_cash_types_security_levels(
        &self,
        levels: BTreeMap<CashType, BillSecurityLevel>,
    ) -> Reply<()> {
        self.enqueue(|responder| Request::SetSecurityLevels(levels, responder))
    }

    /// Stops the operate thread and fails requests still in the queue
    /// with [`Error::Stopped`]. Dropping the controller does the same.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn enqueue<T>(&self, make: impl FnOnce(Responder<T>) -> Request) -> Reply<T> {
        let (responder, reply) = request::channel();

        if self.stop.load(Ordering::Relaxed) {
            responder.fulfill(Err(Error::Stopped));
            return reply;
        }

        self.queue.lock().push_back(make(responder));
        reply
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("operate thread panicked");
            }
        }

        for request in self.queue.lock().drain(..) {
            request.cancel();
        }
    }
}

impl Drop for BillValidator {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

enum Cycle {
    Continue,
    Reinitialize,
}

/// The operate thread: exclusive owner of the serial port and of the
/// cached identity and bill table.
struct Operate<P> {
    transport: Transport<P>,
    operator: Arc<dyn BillValidatorOperator>,
    queue: RequestQueue,
    stop: Arc<AtomicBool>,
    device_info: DeviceInfo,
    bill_table: BillTable,
    state: DeviceState,
}

impl<P: Read + Write> Operate<P> {
    fn new(
        port: P,
        operator: Arc<dyn BillValidatorOperator>,
        queue: RequestQueue,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport: Transport::new(port),
            operator,
            queue,
            stop,
            device_info: DeviceInfo::default(),
            bill_table: BillTable::new(),
            state: DeviceState::default(),
        }
    }

    fn running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    fn run(mut self) {
        while self.running() {
            if let Err(err) = self.initialize() {
                log::warn!("initialization failed: {err}");
                thread::sleep(Duration::from_millis(POLL_CYCLE_MS));
                continue;
            }

            while self.running() {
                match self.cycle() {
                    Ok(Cycle::Continue) => {}
                    Ok(Cycle::Reinitialize) => break,
                    Err(err) => {
                        log::warn!("poll cycle failed: {err}");
                        break;
                    }
                }
            }
        }

        log::debug!("operate thread exiting");
    }

    /// Reset, identification, bill table. The table has to be re-read
    /// after every reset; it can change when the cassette is serviced.
    fn initialize(&mut self) -> Result<()> {
        self.transport.reset()?;
        self.device_info = self.transport.identification()?;
        self.bill_table = self.transport.bill_table()?;

        if self.bill_table.is_empty() {
            return Err(Error::Protocol("device reported an empty bill table".into()));
        }

        log::info!(
            "validator ready: part {}, serial {}, {} bill types",
            self.device_info.part_number,
            self.device_info.serial_number,
            self.bill_table.len()
        );

        Ok(())
    }

    fn cycle(&mut self) -> Result<Cycle> {
        let previous = self.state;
        self.state = self.transport.poll()?;

        if previous.code != self.state.code {
            log::debug!("state changed: {:?} -> {:?}", previous.code, self.state.code);

            if previous.code == DeviceStateCode::DropCassetteOutOfPosition {
                // the bill table may have changed while the cassette was out
                self.operator.drop_cassette_installed();
                return Ok(Cycle::Reinitialize);
            }

            match self.state.code {
                DeviceStateCode::DropCassetteFull => self.operator.drop_cassette_full(),
                DeviceStateCode::DropCassetteOutOfPosition => self.operator.drop_cassette_removed(),
                DeviceStateCode::ValidatorJammed
                | DeviceStateCode::DropCassetteJammed
                | DeviceStateCode::Failure => {
                    // observed only; recovery needs service intervention
                    log::warn!(
                        "validator reported {:?} (info 0x{:02x})",
                        self.state.code,
                        self.state.info
                    );
                }
                DeviceStateCode::EscrowPosition => self.escrow_decision()?,
                DeviceStateCode::BillStacked => {
                    let cash_type = self.cash_type_for(self.state.info)?;
                    self.operator.cash_accepted(&cash_type);
                }
                DeviceStateCode::BillReturned => {
                    let cash_type = self.cash_type_for(self.state.info)?;
                    self.operator.cash_returned(&cash_type);
                }
                _ => {}
            }
        }

        if self.service_one_request() {
            log::warn!("request handler hit an exchange failure, reinitializing");
            return Ok(Cycle::Reinitialize);
        }

        thread::sleep(Duration::from_millis(POLL_CYCLE_MS));
        Ok(Cycle::Continue)
    }

    /// Asks the operator what to do with the bill in escrow and carries
    /// the decision out. No decision within the bound returns the bill.
    fn escrow_decision(&mut self) -> Result<()> {
        let cash_type = self.cash_type_for(self.state.info)?;
        let decision = self.operator.request_cash_action(&cash_type);

        match decision.recv_timeout(Duration::from_secs(CASH_ACTION_TIMEOUT_SECS)) {
            Ok(CashAction::Accept) => self.transport.stack_bill(),
            Ok(CashAction::Return) => self.transport.return_bill(),
            Ok(CashAction::Hold) => {
                // pretend we saw idling so the next poll in escrow
                // re-requests a decision
                self.state = DeviceState::new(DeviceStateCode::Idling, 0);
                self.transport.hold_bill()
            }
            Err(err) => {
                log::info!("no cash action for {cash_type} ({err}), returning the bill");
                self.transport.return_bill()
            }
        }
    }

    /// Looks up the cash type behind a bill-type index reported in a poll.
    fn cash_type_for(&self, index: u8) -> Result<CashType> {
        self.bill_table
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("device reported unknown bill type {index}")))
    }

    /// Services at most one queued request. Returns `true` when the
    /// handler failed in the exchange layer, which also poisons the poll
    /// loop; semantic failures only concern the caller.
    fn service_one_request(&mut self) -> bool {
        let Some(request) = self.queue.lock().pop_front() else {
            return false;
        };

        match request {
            Request::GetDeviceInfo(responder) => {
                responder.fulfill(Ok(self.device_info.clone()));
                false
            }
            Request::GetCashTypes(responder) => {
                responder.fulfill(Ok(self.bill_table.values().cloned().collect()));
                false
            }
            Request::GetEnabledCashTypes(responder) => {
                let result = self.enabled_cash_types();
                deliver(responder, result)
            }
            Request::SetEnabledCashTypes(cash_types, responder) => {
                let result = self.enable_cash_types(&cash_types);
                deliver(responder, result)
            }
            Request::GetSecurityLevels(responder) => {
                let result = self.security_levels();
                deliver(responder, result)
            }
            Request::SetSecurityLevels(levels, responder) => {
                let result = self.set_security_levels(&levels);
                deliver(responder, result)
            }
        }
    }

    fn enabled_cash_types(&mut self) -> Result<BTreeSet<CashType>> {
        let status = self.transport.status()?;

        let mut enabled = BTreeSet::new();
        for (&index, cash_type) in &self.bill_table {
            if bill_table::mask_bit(&status[3..6], index) {
                enabled.insert(cash_type.clone());
            }
        }

        Ok(enabled)
    }

    fn enable_cash_types(&mut self, cash_types: &BTreeSet<CashType>) -> Result<()> {
        let mut payload = [0u8; 6];
        for cash_type in cash_types {
            let index = self.index_of(cash_type)?;
            // enabled and escrow-capable go together
            bill_table::set_mask_bit(&mut payload[0..3], index);
            bill_table::set_mask_bit(&mut payload[3..6], index);
        }

        self.transport.enable_bill_types(&payload)
    }

    fn security_levels(&mut self) -> Result<BTreeMap<CashType, BillSecurityLevel>> {
        let status = self.transport.status()?;

        let mut levels = BTreeMap::new();
        for (&index, cash_type) in &self.bill_table {
            let level = if bill_table::mask_bit(&status[0..3], index) {
                BillSecurityLevel::High
            } else {
                BillSecurityLevel::Normal
            };
            levels.insert(cash_type.clone(), level);
        }

        Ok(levels)
    }

    fn set_security_levels(
        &mut self,
        levels: &BTreeMap<CashType, BillSecurityLevel>,
    ) -> Result<()> {
        let mut payload = [0u8; 3];
        for (cash_type, level) in levels {
            if *level == BillSecurityLevel::High {
                let index = self.index_of(cash_type)?;
                bill_table::set_mask_bit(&mut payload, index);
            }
        }

        self.transport.set_security(&payload)
    }

    fn index_of(&self, cash_type: &CashType) -> Result<u8> {
        self.bill_table
            .iter()
            .find(|&(_, candidate)| candidate == cash_type)
            .map(|(&index, _)| index)
            .ok_or_else(|| Error::UnsupportedCashType(cash_type.clone()))
    }
}

/// Fulfills `responder`, reporting whether the failure came from the
/// exchange layer rather than from the request itself.
fn deliver<T>(responder: Responder<T>, result: Result<T>) -> bool {
    let exchange_failed = match &result {
        Ok(_) | Err(Error::UnsupportedCashType(_)) => false,
        Err(_) => true,
    };
    responder.fulfill(result);
    exchange_failed
}
