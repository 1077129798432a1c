//! In-memory mock validator for exercising the driver without hardware.
//!
//! [`MockValidator::new`] returns the mock itself plus a [`MockPort`]
//! implementing `Read + Write` that is handed to
//! [`BillValidator::with_port`](crate::BillValidator::with_port). The mock
//! answers every command frame the driver writes: poll responses come from
//! a script (the last scripted state repeats), identification, bill table
//! and status come from configurable canned data, and everything else is
//! ACKed.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::frame::{self, Command};

/// How long a read on the [`MockPort`] blocks before giving up.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Test-side handle to the scripted device.
pub struct MockValidator {
    inner: Arc<Mutex<Inner>>,
}

/// Driver-side half of the mock; owns nothing but a reference to the
/// shared device state.
pub struct MockPort {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    /// Bytes queued for the host to read.
    pending: VecDeque<u8>,
    /// Partially received host frame.
    partial: Vec<u8>,
    /// Every command frame seen, as (command byte, payload).
    commands: Vec<(u8, Vec<u8>)>,
    /// Scripted poll payloads; consumed one per poll, last repeats.
    poll_script: VecDeque<Vec<u8>>,
    poll_state: Vec<u8>,
    identification: Vec<u8>,
    bill_table: Vec<u8>,
    status: [u8; 6],
}

impl MockValidator {
    pub fn new() -> (Self, MockPort) {
        let inner = Arc::new(Mutex::new(Inner {
            pending: VecDeque::new(),
            partial: Vec::new(),
            commands: Vec::new(),
            poll_script: VecDeque::new(),
            poll_state: vec![0x14], // idling
            identification: identification_bytes("CCNET-MOCK", "0000001", 1),
            bill_table: Vec::new(),
            status: [0u8; 6],
        }));

        let mock = Self {
            inner: Arc::clone(&inner),
        };
        // a device with no bills to accept is useless; give it a default
        mock.set_bill_table(&[(1, 1, "RUB", 0x00), (2, 5, "RUB", 0x00), (4, 10, "RUB", 0x00)]);

        (mock, MockPort { inner })
    }

    /// Replaces the device identity returned by identification.
    pub fn set_identification(&self, part_number: &str, serial_number: &str, asset_number: u64) {
        self.inner.lock().identification =
            identification_bytes(part_number, serial_number, asset_number);
    }

    /// Replaces the bill table with `(index, mantissa, code, exponent)`
    /// records; all other slots are left unused.
    pub fn set_bill_table(&self, entries: &[(u8, u8, &str, u8)]) {
        let mut table = vec![0u8; 120];
        for &(index, mantissa, code, exponent) in entries {
            let record = &mut table[usize::from(index) * 5..][..5];
            record[0] = mantissa;
            record[1..4].copy_from_slice(code.as_bytes());
            record[4] = exponent;
        }
        self.inner.lock().bill_table = table;
    }

    /// Sets the 6-byte status response from its two bitmap triplets.
    pub fn set_status(&self, security: [u8; 3], enabled: [u8; 3]) {
        let mut status = [0u8; 6];
        status[..3].copy_from_slice(&security);
        status[3..].copy_from_slice(&enabled);
        self.inner.lock().status = status;
    }

    /// Appends a poll payload to the script.
    pub fn push_poll(&self, payload: &[u8]) {
        self.inner.lock().poll_script.push_back(payload.to_vec());
    }

    /// Snapshot of every command frame received so far.
    pub fn commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().commands.clone()
    }

    /// Number of received frames carrying `command`.
    pub fn count_command(&self, command: Command) -> usize {
        self.inner
            .lock()
            .commands
            .iter()
            .filter(|(code, _)| *code == command as u8)
            .count()
    }

    /// Blocks until `predicate` holds for the command log, up to `timeout`.
    pub fn wait_for_commands(
        &self,
        timeout: Duration,
        predicate: impl Fn(&[(u8, Vec<u8>)]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.inner.lock().commands) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Inner {
    fn process_written(&mut self) {
        loop {
            if self.partial.len() < 3 {
                return;
            }

            let frame_len = self.partial[2] as usize;
            if frame_len < 6 {
                // not a well-formed driver frame; drop what we have
                self.partial.clear();
                return;
            }
            if self.partial.len() < frame_len {
                return;
            }

            let frame: Vec<u8> = self.partial.drain(..frame_len).collect();
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let body = &frame[3..frame.len() - 2];
        match body {
            [] | [frame::ACK] | [frame::NAK] => {} // host control traffic
            [command, payload @ ..] => {
                self.commands.push((*command, payload.to_vec()));
                self.respond(*command);
            }
        }
    }

    fn respond(&mut self, command: u8) {
        let reply = match command {
            code if code == Command::Poll as u8 => {
                if let Some(next) = self.poll_script.pop_front() {
                    self.poll_state = next;
                }
                frame::encode_data(frame::VALIDATOR_ADDR, &self.poll_state)
            }
            code if code == Command::Identification as u8 => {
                frame::encode_data(frame::VALIDATOR_ADDR, &self.identification)
            }
            code if code == Command::GetBillTable as u8 => {
                frame::encode_data(frame::VALIDATOR_ADDR, &self.bill_table)
            }
            code if code == Command::GetStatus as u8 => {
                frame::encode_data(frame::VALIDATOR_ADDR, &self.status)
            }
            _ => frame::encode_control(frame::VALIDATOR_ADDR, frame::ACK),
        };
        self.pending.extend(reply);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + READ_TIMEOUT;
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.pending.is_empty() {
                    let mut count = 0;
                    for slot in buf.iter_mut() {
                        match inner.pending.pop_front() {
                            Some(byte) => {
                                *slot = byte;
                                count += 1;
                            }
                            None => break,
                        }
                    }
                    return Ok(count);
                }
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "mock validator has nothing to send",
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.partial.extend_from_slice(buf);
        inner.process_written();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn identification_bytes(part_number: &str, serial_number: &str, asset_number: u64) -> Vec<u8> {
    let mut data = vec![b' '; 34];
    let part = part_number.as_bytes();
    data[..part.len().min(15)].copy_from_slice(&part[..part.len().min(15)]);
    let serial = serial_number.as_bytes();
    data[15..15 + serial.len().min(12)].copy_from_slice(&serial[..serial.len().min(12)]);
    data[27..34].copy_from_slice(&asset_number.to_be_bytes()[1..]);
    data
}
