//! Transaction State Machine for confirmed services
//!
//! Every confirmed request is tracked by an invoke id while it is alive:
//! the request octets are kept for retransmission, a countdown timer drives
//! retries, and whatever comes back (an ack, an error, a reject, an abort,
//! or nothing at all) is surfaced to the caller as a [`TsmEvent`] carrying
//! that invoke id. The machine is synchronous and owns no clock; the
//! application task calls [`TransactionStateMachine::tick`] with elapsed
//! milliseconds from its own monotonic source.
//!
//! Per-transaction lifecycle:
//!
//! ```text
//! begin -> AWAIT_CONFIRMATION -+-> ack/error/reject/abort -> IDLE
//!                              +-> timeout, retries left   -> retransmit
//!                              +-> timeout, none left      -> IDLE (Timeout)
//!                              +-> segmented ComplexAck    -> SEGMENTED_CONFIRMATION
//! ```
//!
//! An invoke id is reusable the moment its record returns to IDLE. There
//! is no ordering guarantee between transactions; within one invoke id,
//! events are emitted in arrival order.

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::app::Apdu;
use crate::datalink::{DataLink, DataLinkAddress, DataLinkError};
use crate::network::Npdu;

/// Default time to wait for a confirmation before retransmitting.
pub const DEFAULT_APDU_TIMEOUT_MS: u32 = 3000;
/// Default number of retransmissions after the first attempt.
pub const DEFAULT_APDU_RETRIES: u8 = 3;
/// Default time to wait for the next segment of a segmented confirmation.
pub const DEFAULT_SEGMENT_TIMEOUT_MS: u32 = 2000;
/// Default number of simultaneously live transactions.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 16;

/// Transaction configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TsmConfig {
    pub apdu_timeout_ms: u32,
    pub apdu_retries: u8,
    pub segment_timeout_ms: u32,
    pub max_transactions: usize,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            apdu_timeout_ms: DEFAULT_APDU_TIMEOUT_MS,
            apdu_retries: DEFAULT_APDU_RETRIES,
            segment_timeout_ms: DEFAULT_SEGMENT_TIMEOUT_MS,
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
        }
    }
}

/// Why `begin` could not start a transaction.
#[derive(Debug)]
pub enum TsmError {
    /// Every transaction slot is live; try again after one completes.
    Busy,
    /// The data link refused the request.
    Link(DataLinkError),
}

impl fmt::Display for TsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsmError::Busy => write!(f, "no free invoke id"),
            TsmError::Link(e) => write!(f, "data link error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TsmError {}

impl From<DataLinkError> for TsmError {
    fn from(error: DataLinkError) -> Self {
        TsmError::Link(error)
    }
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Slot free; owns no peer data.
    Idle,
    /// Request sent, waiting for any confirmation.
    AwaitConfirmation,
    /// Server side: request received, response being produced.
    AwaitResponse,
    /// Sending a segmented request, waiting for SegmentAcks.
    SegmentedRequest,
    /// Receiving a segmented confirmation.
    SegmentedConfirmation,
}

/// What a transaction produced. Forwarded by the dispatcher to the
/// handlers registered for each kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsmEvent {
    SimpleAck {
        invoke_id: u8,
        peer: DataLinkAddress,
        service_choice: u8,
    },
    ComplexAck {
        invoke_id: u8,
        peer: DataLinkAddress,
        service_choice: u8,
        service_data: Vec<u8>,
    },
    Error {
        invoke_id: u8,
        peer: DataLinkAddress,
        service_choice: u8,
        error_class: u8,
        error_code: u8,
    },
    Reject {
        invoke_id: u8,
        peer: DataLinkAddress,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        peer: DataLinkAddress,
        reason: u8,
    },
    /// All retries exhausted without any answer.
    Timeout {
        invoke_id: u8,
        peer: DataLinkAddress,
    },
}

impl TsmEvent {
    pub fn invoke_id(&self) -> u8 {
        match self {
            TsmEvent::SimpleAck { invoke_id, .. }
            | TsmEvent::ComplexAck { invoke_id, .. }
            | TsmEvent::Error { invoke_id, .. }
            | TsmEvent::Reject { invoke_id, .. }
            | TsmEvent::Abort { invoke_id, .. }
            | TsmEvent::Timeout { invoke_id, .. } => *invoke_id,
        }
    }
}

/// One invoke id's worth of state.
#[derive(Debug)]
struct TransactionRecord {
    invoke_id: u8,
    state: TransactionState,
    peer: Option<DataLinkAddress>,
    /// Whole NPDU (header + APDU), kept for retransmission.
    request: Vec<u8>,
    retries_left: u8,
    apdu_timer_ms: u32,
    segment_timer_ms: u32,
    /// Reassembly buffer for a segmented confirmation.
    segments: Vec<u8>,
    segment_service_choice: u8,
    next_sequence: u8,
    /// Set when the transaction ended in timeout; cleared on reuse/free.
    failed: bool,
}

impl TransactionRecord {
    fn idle() -> Self {
        Self {
            invoke_id: 0,
            state: TransactionState::Idle,
            peer: None,
            request: Vec::new(),
            retries_left: 0,
            apdu_timer_ms: 0,
            segment_timer_ms: 0,
            segments: Vec::new(),
            segment_service_choice: 0,
            next_sequence: 0,
            failed: false,
        }
    }

    fn is_live(&self) -> bool {
        self.state != TransactionState::Idle
    }

    /// Return to IDLE. An idle record owns no peer data.
    fn release(&mut self) -> DataLinkAddress {
        let peer = self.peer.take().unwrap_or(DataLinkAddress::Broadcast);
        self.state = TransactionState::Idle;
        self.request = Vec::new();
        self.segments = Vec::new();
        self.next_sequence = 0;
        peer
    }
}

/// The per-port transaction table.
pub struct TransactionStateMachine {
    config: TsmConfig,
    records: Vec<TransactionRecord>,
    next_invoke_id: u8,
}

impl TransactionStateMachine {
    pub fn new(config: TsmConfig) -> Self {
        let mut records = Vec::with_capacity(config.max_transactions);
        records.resize_with(config.max_transactions, TransactionRecord::idle);
        Self {
            config,
            records,
            next_invoke_id: 0,
        }
    }

    /// Start a confirmed transaction: allocate an invoke id, stamp it into
    /// the APDU, transmit, and arm the retry timer.
    ///
    /// `apdu` must be a [`Apdu::ConfirmedRequest`]; its `invoke_id` field
    /// is overwritten with the allocated one.
    pub fn begin(
        &mut self,
        peer: DataLinkAddress,
        npdu: &Npdu,
        mut apdu: Apdu,
        link: &mut dyn DataLink,
    ) -> Result<u8, TsmError> {
        let invoke_id = self.allocate_invoke_id()?;
        let slot = self
            .records
            .iter_mut()
            .find(|r| !r.is_live())
            .ok_or(TsmError::Busy)?;

        match &mut apdu {
            Apdu::ConfirmedRequest {
                invoke_id: field, ..
            } => *field = invoke_id,
            _ => {
                return Err(TsmError::Link(DataLinkError::InvalidFrame));
            }
        }

        let mut request = npdu.encode();
        request.extend_from_slice(&apdu.encode());
        if request.len() > link.max_npdu() {
            return Err(TsmError::Link(DataLinkError::FrameTooLong));
        }

        link.send_frame(&request, &peer)?;
        debug!("tsm: begin invoke {} to {:?}", invoke_id, peer);

        slot.invoke_id = invoke_id;
        slot.state = TransactionState::AwaitConfirmation;
        slot.peer = Some(peer);
        slot.request = request;
        slot.retries_left = self.config.apdu_retries;
        slot.apdu_timer_ms = self.config.apdu_timeout_ms;
        slot.failed = false;

        Ok(invoke_id)
    }

    /// Feed a confirmation-class APDU received from `peer`.
    ///
    /// Matching transactions move toward IDLE and produce the
    /// corresponding event; anything unmatched (including a second copy of
    /// an ack already processed) is dropped silently and returns `None`.
    pub fn on_ack(
        &mut self,
        peer: &DataLinkAddress,
        apdu: &Apdu,
        link: &mut dyn DataLink,
    ) -> Option<TsmEvent> {
        let invoke_id = apdu.invoke_id()?;
        let index = self.records.iter().position(|r| {
            r.is_live() && r.invoke_id == invoke_id && r.peer.as_ref() == Some(peer)
        })?;

        match apdu {
            Apdu::SimpleAck { service_choice, .. } => {
                let peer = self.records[index].release();
                Some(TsmEvent::SimpleAck {
                    invoke_id,
                    peer,
                    service_choice: *service_choice,
                })
            }

            Apdu::ComplexAck {
                segmented: false,
                service_choice,
                service_data,
                ..
            } => {
                let peer = self.records[index].release();
                Some(TsmEvent::ComplexAck {
                    invoke_id,
                    peer,
                    service_choice: *service_choice,
                    service_data: service_data.clone(),
                })
            }

            Apdu::ComplexAck {
                segmented: true,
                more_follows,
                sequence_number,
                service_choice,
                service_data,
                ..
            } => self.on_segment(
                index,
                *more_follows,
                (*sequence_number).unwrap_or(0),
                *service_choice,
                service_data,
                link,
            ),

            Apdu::Error {
                service_choice,
                error_class,
                error_code,
                ..
            } => {
                let peer = self.records[index].release();
                Some(TsmEvent::Error {
                    invoke_id,
                    peer,
                    service_choice: *service_choice,
                    error_class: *error_class,
                    error_code: *error_code,
                })
            }

            Apdu::Reject { reject_reason, .. } => {
                let peer = self.records[index].release();
                Some(TsmEvent::Reject {
                    invoke_id,
                    peer,
                    reason: *reject_reason,
                })
            }

            Apdu::Abort { abort_reason, .. } => {
                let peer = self.records[index].release();
                Some(TsmEvent::Abort {
                    invoke_id,
                    peer,
                    reason: *abort_reason,
                })
            }

            // SegmentAcks matter only when sending segmented requests,
            // which this machine does not originate.
            Apdu::SegmentAck { .. } => {
                trace!("tsm: ignoring SegmentAck for invoke {}", invoke_id);
                None
            }

            _ => None,
        }
    }

    /// Advance all timers by `elapsed_ms`. Expired transactions either
    /// retransmit or die with a [`TsmEvent::Timeout`].
    pub fn tick(&mut self, elapsed_ms: u32, link: &mut dyn DataLink) -> Vec<TsmEvent> {
        let mut events = Vec::new();

        for record in &mut self.records {
            match record.state {
                TransactionState::AwaitConfirmation => {
                    record.apdu_timer_ms = record.apdu_timer_ms.saturating_sub(elapsed_ms);
                    if record.apdu_timer_ms > 0 {
                        continue;
                    }
                    if record.retries_left > 0 {
                        record.retries_left -= 1;
                        record.apdu_timer_ms = self.config.apdu_timeout_ms;
                        let peer = record.peer.clone().unwrap_or(DataLinkAddress::Broadcast);
                        debug!(
                            "tsm: invoke {} unanswered, retransmitting ({} retries left)",
                            record.invoke_id, record.retries_left
                        );
                        if let Err(e) = link.send_frame(&record.request, &peer) {
                            warn!("tsm: retransmit failed: {}", e);
                        }
                    } else {
                        let invoke_id = record.invoke_id;
                        let peer = record.release();
                        record.failed = true;
                        debug!("tsm: invoke {} timed out", invoke_id);
                        events.push(TsmEvent::Timeout { invoke_id, peer });
                    }
                }
                TransactionState::SegmentedConfirmation => {
                    record.segment_timer_ms = record.segment_timer_ms.saturating_sub(elapsed_ms);
                    if record.segment_timer_ms == 0 {
                        let invoke_id = record.invoke_id;
                        let peer = record.release();
                        record.failed = true;
                        debug!("tsm: invoke {} segment window expired", invoke_id);
                        events.push(TsmEvent::Timeout { invoke_id, peer });
                    }
                }
                _ => {}
            }
        }

        events
    }

    /// Abandon a transaction. The slot is reclaimed immediately.
    pub fn free(&mut self, invoke_id: u8) {
        for record in &mut self.records {
            if record.invoke_id == invoke_id {
                record.release();
                record.failed = false;
            }
        }
    }

    /// True when no live transaction uses this invoke id.
    pub fn is_free(&self, invoke_id: u8) -> bool {
        !self
            .records
            .iter()
            .any(|r| r.is_live() && r.invoke_id == invoke_id)
    }

    /// True when the last transaction under this invoke id timed out and
    /// has not been freed or reused since.
    pub fn is_failed(&self, invoke_id: u8) -> bool {
        self.records
            .iter()
            .any(|r| r.invoke_id == invoke_id && r.failed)
    }

    /// Live transaction count, for diagnostics.
    pub fn active(&self) -> usize {
        self.records.iter().filter(|r| r.is_live()).count()
    }

    /// Round-robin allocation over the whole invoke id space.
    fn allocate_invoke_id(&mut self) -> Result<u8, TsmError> {
        for _ in 0..=u8::MAX as usize {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            if self.is_free(candidate) {
                return Ok(candidate);
            }
        }
        Err(TsmError::Busy)
    }

    /// Handle one segment of a segmented ComplexAck.
    fn on_segment(
        &mut self,
        index: usize,
        more_follows: bool,
        sequence_number: u8,
        service_choice: u8,
        service_data: &[u8],
        link: &mut dyn DataLink,
    ) -> Option<TsmEvent> {
        let record = &mut self.records[index];
        let peer = record.peer.clone()?;
        let invoke_id = record.invoke_id;

        match record.state {
            TransactionState::AwaitConfirmation if sequence_number == 0 => {
                record.state = TransactionState::SegmentedConfirmation;
                record.segments = service_data.to_vec();
                record.segment_service_choice = service_choice;
                record.next_sequence = 1;
            }
            TransactionState::SegmentedConfirmation
                if sequence_number == record.next_sequence =>
            {
                record.segments.extend_from_slice(service_data);
                record.next_sequence = record.next_sequence.wrapping_add(1);
            }
            _ => {
                // Out-of-window segment: negative-ack the last good one.
                warn!(
                    "tsm: invoke {} segment {} out of order (expected {})",
                    invoke_id, sequence_number, record.next_sequence
                );
                let nack = Apdu::SegmentAck {
                    negative: true,
                    server: false,
                    invoke_id,
                    sequence_number: record.next_sequence.wrapping_sub(1),
                    actual_window_size: 1,
                };
                send_segment_ack(&peer, nack, link);
                return None;
            }
        }

        record.segment_timer_ms = self.config.segment_timeout_ms;

        let ack = Apdu::SegmentAck {
            negative: false,
            server: false,
            invoke_id,
            sequence_number,
            actual_window_size: 1,
        };

        let finished = !more_follows;
        let event = if finished {
            let service_data = core::mem::take(&mut record.segments);
            let service_choice = record.segment_service_choice;
            let peer = record.release();
            Some(TsmEvent::ComplexAck {
                invoke_id,
                peer,
                service_choice,
                service_data,
            })
        } else {
            None
        };

        send_segment_ack(&peer, ack, link);
        event
    }
}

fn send_segment_ack(peer: &DataLinkAddress, ack: Apdu, link: &mut dyn DataLink) {
    let mut message = Npdu::new().encode();
    message.extend_from_slice(&ack.encode());
    if let Err(e) = link.send_frame(&message, peer) {
        warn!("tsm: segment ack transmit failed: {}", e);
    }
}

impl Default for TransactionStateMachine {
    fn default() -> Self {
        Self::new(TsmConfig::default())
    }
}
