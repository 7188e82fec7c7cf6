//! RS-485 driver contract
//!
//! The MS/TP state machines are polymorphic over this trait so the same
//! engine runs against a UART behind interrupt-driven ring buffers on an
//! embedded target, a termios serial port on a gateway, or the in-memory
//! driver used by the tests. The trait captures exactly what Clause 9
//! timing needs from the hardware: non-blocking byte input, blocking frame
//! output with line turnaround, and a silence timer that resets on every
//! octet moved in either direction.

#[cfg(not(feature = "std"))]
use alloc::{collections::VecDeque, vec::Vec};

#[cfg(feature = "std")]
use std::collections::VecDeque;

use bitflags::bitflags;

use crate::datalink::{DataLinkError, Result};

/// Baud rates permitted on an MS/TP segment (Clause 9.2.1).
pub const VALID_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 76800, 115200];

/// Default baud rate; every MS/TP device must support it.
pub const DEFAULT_BAUD_RATE: u32 = 38400;

bitflags! {
    /// UART line error conditions since the last status read.
    ///
    /// The receive state machine treats any set flag as a ReceiveError
    /// event: the octet stream can no longer be trusted, so the frame in
    /// progress is discarded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineStatus: u8 {
        /// Stop bit not found where expected.
        const FRAMING_ERROR = 0b0000_0001;
        /// Receive FIFO overflowed; octets were lost.
        const OVERRUN = 0b0000_0010;
        /// Break condition seen on the line.
        const BREAK = 0b0000_0100;
    }
}

/// Capability set the MS/TP engine requires from an RS-485 transceiver.
pub trait Rs485Driver {
    /// Configure the UART at the current baud rate, 8 data bits, no
    /// parity, one stop bit, half duplex. A failure here is fatal for the
    /// port; all later errors are absorbed by the state machines.
    fn init(&mut self) -> Result<()>;

    /// Non-blocking pop of one received octet. Reading an octet resets the
    /// silence timer.
    fn byte_available(&mut self) -> Option<u8>;

    /// Line error conditions accumulated since the previous call. Reading
    /// clears them.
    fn line_status(&mut self) -> LineStatus;

    /// Drive the transmitter: assert RTS, emit the octets, wait for the
    /// shift register to drain, release RTS. Resets the silence timer.
    fn send(&mut self, octets: &[u8]) -> Result<()>;

    /// Milliseconds since the last octet was received or transmitted.
    fn silence_ms(&self) -> u32;

    /// Force the silence timer to zero.
    fn silence_reset(&mut self);

    /// Current baud rate.
    fn baud_rate(&self) -> u32;

    /// Change the baud rate. Only values in [`VALID_BAUD_RATES`] are
    /// accepted.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
}

/// Validate a baud rate against the MS/TP enumerated set.
pub fn check_baud_rate(baud: u32) -> Result<()> {
    if VALID_BAUD_RATES.contains(&baud) {
        Ok(())
    } else {
        Err(DataLinkError::InvalidBaudRate(baud))
    }
}

/// In-memory RS-485 driver with a manually advanced clock.
///
/// Feed it received octets with [`inject`](SimulatedRs485::inject), move
/// time forward with [`advance`](SimulatedRs485::advance), and inspect
/// what the engine transmitted through
/// [`take_transmitted`](SimulatedRs485::take_transmitted). The state
/// machine tests and the examples in this crate drive their ports with it;
/// it is also a reasonable starting point for a software loopback.
#[derive(Debug)]
pub struct SimulatedRs485 {
    rx: VecDeque<u8>,
    tx: Vec<Vec<u8>>,
    status: LineStatus,
    clock_ms: u32,
    last_activity_ms: u32,
    baud: u32,
}

impl SimulatedRs485 {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            status: LineStatus::empty(),
            clock_ms: 0,
            last_activity_ms: 0,
            baud: DEFAULT_BAUD_RATE,
        }
    }

    /// Queue octets as if they arrived on the wire.
    pub fn inject(&mut self, octets: &[u8]) {
        self.rx.extend(octets.iter().copied());
    }

    /// Raise a line error condition for the next status read.
    pub fn inject_error(&mut self, status: LineStatus) {
        self.status |= status;
    }

    /// Advance the simulated clock.
    pub fn advance(&mut self, ms: u32) {
        self.clock_ms = self.clock_ms.wrapping_add(ms);
    }

    /// Frames transmitted since the last call, oldest first.
    pub fn take_transmitted(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.tx)
    }

    /// Number of transmissions currently captured.
    pub fn transmitted_count(&self) -> usize {
        self.tx.len()
    }
}

impl Default for SimulatedRs485 {
    fn default() -> Self {
        Self::new()
    }
}

impl Rs485Driver for SimulatedRs485 {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn byte_available(&mut self) -> Option<u8> {
        let octet = self.rx.pop_front()?;
        self.last_activity_ms = self.clock_ms;
        Some(octet)
    }

    fn line_status(&mut self) -> LineStatus {
        core::mem::take(&mut self.status)
    }

    fn send(&mut self, octets: &[u8]) -> Result<()> {
        self.tx.push(octets.to_vec());
        self.last_activity_ms = self.clock_ms;
        Ok(())
    }

    fn silence_ms(&self) -> u32 {
        self.clock_ms.wrapping_sub(self.last_activity_ms)
    }

    fn silence_reset(&mut self) {
        self.last_activity_ms = self.clock_ms;
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        check_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_tracks_activity() {
        let mut drv = SimulatedRs485::new();
        drv.advance(100);
        assert_eq!(drv.silence_ms(), 100);

        drv.inject(&[0x55]);
        assert_eq!(drv.byte_available(), Some(0x55));
        assert_eq!(drv.silence_ms(), 0);

        drv.advance(30);
        assert_eq!(drv.silence_ms(), 30);
        drv.send(&[0x01]).unwrap();
        assert_eq!(drv.silence_ms(), 0);
    }

    #[test]
    fn baud_rate_validation() {
        let mut drv = SimulatedRs485::new();
        for baud in VALID_BAUD_RATES {
            assert!(drv.set_baud_rate(baud).is_ok());
        }
        assert!(matches!(
            drv.set_baud_rate(14400),
            Err(DataLinkError::InvalidBaudRate(14400))
        ));
        assert_eq!(drv.baud_rate(), 115200);
    }

    #[test]
    fn line_status_clears_on_read() {
        let mut drv = SimulatedRs485::new();
        drv.inject_error(LineStatus::FRAMING_ERROR | LineStatus::OVERRUN);
        assert_eq!(drv.line_status(), LineStatus::FRAMING_ERROR | LineStatus::OVERRUN);
        assert!(drv.line_status().is_empty());
    }
}
