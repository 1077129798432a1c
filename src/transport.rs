//! Reliable request/response exchange over the half-duplex serial link,
//! and the typed command set built on top of it.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use crate::bill_table::{self, BillTable};
use crate::error::{Error, Result};
use crate::frame::{self, Command, Frame};
use crate::types::{DeviceInfo, DeviceState};

/// Attempts to transmit a command before giving up.
const SEND_ATTEMPTS: u32 = 3;
/// Attempts to receive a frame addressed to this controller per transmission.
const READ_ATTEMPTS: u32 = 5;
/// Delay between writing a command and reading the response (milliseconds).
const RESPONSE_DELAY_MS: u64 = 10;
/// Quiet period after a completed exchange or an emitted NAK (milliseconds).
const INTER_FRAME_MS: u64 = 20;

/// Size of the get-status response in bytes.
const STATUS_LEN: usize = 6;

/// Blocking exchange layer owning the serial port.
pub(crate) struct Transport<P> {
    port: P,
}

impl<P: Read + Write> Transport<P> {
    pub(crate) fn new(port: P) -> Self {
        Self { port }
    }

    /// Sends `command` and returns the data payload of the response.
    fn transact(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        self.exchange(command, payload, true)
    }

    /// Sends `command` expecting a bare ACK response.
    fn execute(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.exchange(command, payload, false).map(|_| ())
    }

    fn exchange(&mut self, command: Command, payload: &[u8], expect_data: bool) -> Result<Vec<u8>> {
        let command_frame = frame::encode_command(command, payload);

        for _ in 0..SEND_ATTEMPTS {
            self.port.write_all(&command_frame)?;
            // let the device begin responding before the first read
            thread::sleep(Duration::from_millis(RESPONSE_DELAY_MS));

            let response = self.read_addressed_frame()?;

            match response.payload.as_slice() {
                [frame::ILLEGAL_COMMAND] => return Err(Error::IllegalCommand),
                [frame::NAK] => {
                    // the device did not accept our frame; retransmit
                    log::debug!("device NAKed {command:?}, retransmitting");
                    continue;
                }
                [frame::ACK] if !expect_data => {
                    thread::sleep(Duration::from_millis(INTER_FRAME_MS));
                    return Ok(Vec::new());
                }
                _ if expect_data => {
                    self.send_control(response.address, frame::ACK)?;
                    thread::sleep(Duration::from_millis(INTER_FRAME_MS));
                    return Ok(response.payload);
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected a control response to {command:?}, got {} byte(s)",
                        other.len()
                    )));
                }
            }
        }

        Err(Error::NotAccepted)
    }

    /// Reads frames until one addressed to this controller arrives.
    ///
    /// Frames addressed elsewhere are bus traffic for other peripherals and
    /// are discarded. A frame failing CRC verification is answered with a
    /// NAK so the sender retransmits; framing faults use up read attempts
    /// like any other bad frame.
    fn read_addressed_frame(&mut self) -> Result<Frame> {
        for _ in 0..READ_ATTEMPTS {
            match Frame::read_from(&mut self.port) {
                Ok(frame) if frame.address == frame::VALIDATOR_ADDR => return Ok(frame),
                Ok(frame) => {
                    log::trace!("discarding frame addressed to 0x{:02x}", frame.address);
                }
                Err(Error::Crc { address }) => {
                    log::warn!("crc mismatch in frame from address 0x{address:02x}");
                    self.send_control(address, frame::NAK)?;
                    thread::sleep(Duration::from_millis(INTER_FRAME_MS));
                }
                Err(err @ (Error::Sync { .. } | Error::Length { .. })) => {
                    log::warn!("framing fault: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::NoResponse)
    }

    fn send_control(&mut self, address: u8, control: u8) -> Result<()> {
        self.port.write_all(&frame::encode_control(address, control))?;
        Ok(())
    }

    // Typed command set.

    /// Restarts the validator's initialization sequence.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.execute(Command::Reset, &[])
    }

    /// Reads the validator's current state.
    pub(crate) fn poll(&mut self) -> Result<DeviceState> {
        let response = self.transact(Command::Poll, &[])?;
        DeviceState::from_poll(&response)
    }

    /// Reads the device identity.
    pub(crate) fn identification(&mut self) -> Result<DeviceInfo> {
        let response = self.transact(Command::Identification, &[])?;
        DeviceInfo::from_identification(&response)
    }

    /// Downloads and decodes the bill table.
    pub(crate) fn bill_table(&mut self) -> Result<BillTable> {
        let response = self.transact(Command::GetBillTable, &[])?;
        bill_table::decode(&response)
    }

    /// Reads the 6-byte status bitmaps (high-security mask, enable mask).
    pub(crate) fn status(&mut self) -> Result<[u8; STATUS_LEN]> {
        let response = self.transact(Command::GetStatus, &[])?;
        response.as_slice().try_into().map_err(|_| {
            Error::Protocol(format!(
                "status response is {} bytes, expected {STATUS_LEN}",
                response.len()
            ))
        })
    }

    /// Writes the enable and escrow-enable bitmap triplets.
    pub(crate) fn enable_bill_types(&mut self, bitmaps: &[u8; 6]) -> Result<()> {
        self.execute(Command::EnableBillTypes, bitmaps)
    }

    /// Writes the high-security bitmap triplet.
    pub(crate) fn set_security(&mut self, bitmap: &[u8; 3]) -> Result<()> {
        self.execute(Command::SetSecurity, bitmap)
    }

    /// Stacks the escrowed bill into the drop cassette.
    pub(crate) fn stack_bill(&mut self) -> Result<()> {
        self.execute(Command::Stack, &[])
    }

    /// Returns the escrowed bill to the customer.
    pub(crate) fn return_bill(&mut self) -> Result<()> {
        self.execute(Command::Return, &[])
    }

    /// Keeps the escrowed bill in place for another decision round.
    pub(crate) fn hold_bill(&mut self) -> Result<()> {
        self.execute(Command::Hold, &[])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// Port fed from a fixed byte script, recording everything written.
    struct ScriptedPort {
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl ScriptedPort {
        fn new(replies: &[Vec<u8>]) -> Self {
            Self {
                input: replies.iter().flatten().copied().collect(),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"));
            }
            let mut count = 0;
            for slot in buf.iter_mut() {
                match self.input.pop_front() {
                    Some(byte) => {
                        *slot = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn device_ack() -> Vec<u8> {
        frame::encode_control(frame::VALIDATOR_ADDR, frame::ACK)
    }

    fn device_nak() -> Vec<u8> {
        frame::encode_control(frame::VALIDATOR_ADDR, frame::NAK)
    }

    #[test]
    fn nak_then_ack_retransmits_exactly_once() {
        let port = ScriptedPort::new(&[device_nak(), device_ack()]);
        let mut transport = Transport::new(port);

        transport.reset().unwrap();

        let command = frame::encode_command(Command::Reset, &[]);
        let expected: Vec<u8> = [command.clone(), command].concat();
        assert_eq!(transport.port.written, expected);
    }

    #[test]
    fn persistent_nak_is_not_accepted() {
        let port = ScriptedPort::new(&[device_nak(), device_nak(), device_nak()]);
        let mut transport = Transport::new(port);

        assert!(matches!(transport.reset(), Err(Error::NotAccepted)));
    }

    #[test]
    fn illegal_command_is_terminal() {
        let port = ScriptedPort::new(&[frame::encode_control(
            frame::VALIDATOR_ADDR,
            frame::ILLEGAL_COMMAND,
        )]);
        let mut transport = Transport::new(port);

        assert!(matches!(transport.reset(), Err(Error::IllegalCommand)));
    }

    #[test]
    fn frames_for_other_addresses_are_discarded() {
        let port = ScriptedPort::new(&[frame::encode_control(0x01, frame::ACK), device_ack()]);
        let mut transport = Transport::new(port);

        transport.reset().unwrap();

        // one transmission was enough
        let command = frame::encode_command(Command::Reset, &[]);
        assert_eq!(transport.port.written, command);
    }

    #[test]
    fn crc_fault_is_naked_and_reread() {
        let mut corrupted = device_ack();
        corrupted[3] ^= 0x40;

        let port = ScriptedPort::new(&[corrupted, device_ack()]);
        let mut transport = Transport::new(port);

        transport.reset().unwrap();

        let command = frame::encode_command(Command::Reset, &[]);
        let nak = frame::encode_control(frame::VALIDATOR_ADDR, frame::NAK);
        let expected: Vec<u8> = [command, nak].concat();
        assert_eq!(transport.port.written, expected);
    }

    #[test]
    fn transact_acks_and_returns_the_payload() {
        let port = ScriptedPort::new(&[frame::encode_data(frame::VALIDATOR_ADDR, &[0x14])]);
        let mut transport = Transport::new(port);

        let state = transport.poll().unwrap();
        assert_eq!(state, DeviceState::from_poll(&[0x14]).unwrap());

        let command = frame::encode_command(Command::Poll, &[]);
        let ack = frame::encode_control(frame::VALIDATOR_ADDR, frame::ACK);
        let expected: Vec<u8> = [command, ack].concat();
        assert_eq!(transport.port.written, expected);
    }

    #[test]
    fn data_response_to_control_command_is_a_protocol_error() {
        let port = ScriptedPort::new(&[frame::encode_data(frame::VALIDATOR_ADDR, &[0x14, 0x00])]);
        let mut transport = Transport::new(port);

        assert!(matches!(transport.reset(), Err(Error::Protocol(_))));
    }

    #[test]
    fn status_validates_response_size() {
        let port = ScriptedPort::new(&[frame::encode_data(frame::VALIDATOR_ADDR, &[0u8; 5])]);
        let mut transport = Transport::new(port);

        assert!(matches!(transport.status(), Err(Error::Protocol(_))));
    }
}
