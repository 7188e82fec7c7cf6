//! MS/TP (Master-Slave/Token-Passing) data link (ASHRAE 135 Clause 9)
//!
//! MS/TP runs multi-drop, half-duplex communication over an EIA-485 bus.
//! Masters circulate a token; only the token holder may originate data
//! frames, and every station answers frames addressed to it. This module
//! implements the three Clause 9 state machines on top of the
//! [`Rs485Driver`](rs485::Rs485Driver) capability set:
//!
//! - the **receive state machine**, which assembles octets into frames and
//!   verifies both check sequences incrementally,
//! - the **master node state machine**, which holds, uses, passes, and if
//!   necessary regenerates the token,
//! - the **slave node state machine**, which only ever answers requests.
//!
//! Two optional extensions are carried from the reference stack: automatic
//! address assignment ("zero-config", claiming a free address in 64-127)
//! and automatic baud detection.
//!
//! The port is polled cooperatively: call [`MstpPort::poll`] at least once
//! per bit time (or whenever the driver signals activity), and exchange
//! NPDUs through the [`DataLink`] trait like any other back-end.

#[cfg(feature = "std")]
use std::collections::VecDeque;

#[cfg(not(feature = "std"))]
use alloc::{collections::VecDeque, vec::Vec};

use core::mem;

use log::{debug, info, trace, warn};

use crate::app::Apdu;
use crate::datalink::{DataLink, DataLinkAddress, DataLinkError, DataLinkType, Result};
use crate::network::Npdu;

pub mod crc;
pub mod frame;
pub mod rs485;

use self::crc::{data_crc, header_crc_update, HEADER_CRC_INITIAL, HEADER_CRC_RESIDUE};
use self::frame::{
    FrameType, MstpFrame, BROADCAST_ADDRESS, MAX_DATA_LENGTH, MAX_MASTER_ADDRESS, PREAMBLE_55,
    PREAMBLE_FF,
};
use self::rs485::{check_baud_rate, Rs485Driver};

/// Silence before a node declares loss of token: 500 ms.
pub const T_NO_TOKEN: u32 = 500;
/// Maximum wait for the first octet of a reply to DataExpectingReply.
pub const T_REPLY_TIMEOUT: u32 = 295;
/// Maximum time a node may take to begin its reply or postpone it.
pub const T_REPLY_DELAY: u32 = 250;
/// Maximum wait for a station to begin using a token or answer a poll.
pub const T_USAGE_TIMEOUT: u32 = 95;
/// Width of one address slot in the token-claim backoff.
pub const T_SLOT: u32 = 10;
/// Silence that aborts a frame mid-reception.
pub const T_FRAME_ABORT: u32 = 60;
/// Token holds between poll-for-master maintenance probes.
pub const N_POLL: u8 = 50;
/// Retries when a passed token is not picked up.
pub const N_RETRY_TOKEN: u8 = 1;

/// Lowest address the zero-config claim process will take.
pub const ZERO_CONFIG_STATION_MIN: u8 = 64;
/// Highest address the zero-config claim process will take.
pub const ZERO_CONFIG_STATION_MAX: u8 = 127;

/// Consecutive clean token passes before a zero-config claim is final.
const ZERO_CONFIG_CONFIRM_TOKENS: u8 = 3;

/// Dwell time per candidate baud rate during auto-baud.
const AUTO_BAUD_DWELL_MS: u32 = 2000;
/// Valid frames required to lock a candidate baud rate.
const AUTO_BAUD_LOCK_FRAMES: u8 = 2;

/// Bound on the outbound and inbound PDU queues.
const PDU_QUEUE_LIMIT: usize = 16;

/// What to do with vendor-proprietary frame types 128-255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProprietaryFramePolicy {
    /// Count and discard (default).
    #[default]
    Drop,
    /// Deliver as an opaque [`MstpEvent::ProprietaryFrame`].
    Deliver,
}

/// MS/TP port configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MstpConfig {
    /// This node's station address (0-127 master, 128-254 slave).
    pub mac_address: u8,
    /// Highest master address polled on this segment (<= 127).
    pub max_master: u8,
    /// Data frames the node may send per token hold (>= 1).
    pub max_info_frames: u8,
    /// Link baud rate; must be in the enumerated MS/TP set.
    pub baud_rate: u32,
    /// Operate as a slave: never hold the token, only answer.
    pub slave_mode: bool,
    /// Claim a free master address in 64-127 automatically.
    pub zero_config_enabled: bool,
    /// Address preferred by the zero-config claim process.
    pub preferred_station: Option<u8>,
    /// Hunt for the segment's baud rate before joining.
    pub auto_baud_enabled: bool,
    /// Disposition of proprietary frame types 128-255.
    pub proprietary_frames: ProprietaryFramePolicy,
}

impl Default for MstpConfig {
    fn default() -> Self {
        Self {
            mac_address: 127,
            max_master: MAX_MASTER_ADDRESS,
            max_info_frames: 1,
            baud_rate: rs485::DEFAULT_BAUD_RATE,
            slave_mode: false,
            zero_config_enabled: false,
            preferred_station: None,
            auto_baud_enabled: false,
            proprietary_frames: ProprietaryFramePolicy::Drop,
        }
    }
}

/// Per-port traffic and error counters.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MstpStatistics {
    /// Complete frames that passed both check sequences.
    pub valid_frames_rx: u64,
    /// Frames discarded for any reason.
    pub invalid_frames_rx: u64,
    /// Frames transmitted, including tokens and polls.
    pub frames_tx: u64,
    /// NPDUs handed to the application.
    pub pdus_rx: u64,
    /// NPDUs transmitted for the application.
    pub pdus_tx: u64,
    /// Header check failures.
    pub header_crc_errors: u64,
    /// Data check failures.
    pub data_crc_errors: u64,
    /// Receptions abandoned after silence mid-frame.
    pub frames_aborted: u64,
    /// UART framing/overrun/break events.
    pub receive_errors: u64,
    /// Tokens received by this station.
    pub tokens_rx: u64,
    /// Times the ring went silent and the token had to be regenerated.
    pub lost_tokens: u64,
    /// Replies that never arrived inside the reply window.
    pub reply_timeouts: u64,
}

/// Out-of-band happenings the application may want to observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MstpEvent {
    /// A vendor-proprietary frame arrived and the policy is `Deliver`.
    ProprietaryFrame {
        frame_type: u8,
        source: u8,
        data: Vec<u8>,
    },
}

/// Receive state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Idle,
    Preamble,
    Header,
    Data,
}

/// Master node state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Initialize,
    Idle,
    UseToken,
    WaitForReply,
    DoneWithToken,
    PassToken,
    NoToken,
    PollForMaster,
    AnswerDataRequest,
}

/// Slave node state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlaveState {
    Idle,
    Respond,
}

/// An NPDU queued for transmission on a future token hold.
#[derive(Debug)]
struct OutboundPdu {
    destination: u8,
    expecting_reply: bool,
    data: Vec<u8>,
}

/// A DataExpectingReply we have not answered yet.
#[derive(Debug)]
struct PendingReply {
    source: u8,
    request: Vec<u8>,
}

/// Zero-config claim progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZeroConfigStage {
    /// Observe the ring for one full token cycle.
    Listen,
    /// Probe the candidate address for an occupant.
    Probe,
    /// Tentatively claimed; waiting for clean token passes.
    Confirm,
}

#[derive(Debug)]
struct ZeroConfig {
    stage: ZeroConfigStage,
    preferred_station: Option<u8>,
    candidate: u8,
    probe_step: u8,
    cycle_anchor: Option<u8>,
    confirm_tokens: u8,
    in_use: [u64; 4],
}

impl ZeroConfig {
    fn new(preferred_station: Option<u8>) -> Self {
        Self {
            stage: ZeroConfigStage::Listen,
            preferred_station,
            candidate: ZERO_CONFIG_STATION_MIN,
            probe_step: 0,
            cycle_anchor: None,
            confirm_tokens: 0,
            in_use: [0; 4],
        }
    }

    fn mark_in_use(&mut self, station: u8) {
        self.in_use[usize::from(station >> 6)] |= 1u64 << (station & 0x3F);
    }

    fn is_in_use(&self, station: u8) -> bool {
        self.in_use[usize::from(station >> 6)] & (1u64 << (station & 0x3F)) != 0
    }

    /// Preferred address if free, else the first free address in the
    /// zero-config range. None if every address is taken.
    fn pick_candidate(&self) -> Option<u8> {
        if let Some(preferred) = self.preferred_station {
            if (ZERO_CONFIG_STATION_MIN..=ZERO_CONFIG_STATION_MAX).contains(&preferred)
                && !self.is_in_use(preferred)
            {
                return Some(preferred);
            }
        }
        (ZERO_CONFIG_STATION_MIN..=ZERO_CONFIG_STATION_MAX).find(|&s| !self.is_in_use(s))
    }
}

/// Auto-baud hunt progress.
#[derive(Debug)]
struct AutoBaud {
    index: usize,
    valid_frames: u8,
    invalid_frames: u8,
}

/// An MS/TP port: one RS-485 segment, one station address, three state
/// machines.
pub struct MstpPort<D: Rs485Driver> {
    driver: D,

    this_station: u8,
    max_master: u8,
    max_info_frames: u8,
    slave_mode: bool,
    proprietary_frames: ProprietaryFramePolicy,

    // receive FSM
    receive_state: ReceiveState,
    header_index: u8,
    header_crc_acc: u8,
    rx_frame_type: u8,
    rx_destination: u8,
    rx_source: u8,
    rx_data_length: u16,
    input: Vec<u8>,
    received_valid_frame: bool,
    received_invalid_frame: bool,

    // master FSM
    master_state: MasterState,
    slave_state: SlaveState,
    next_station: u8,
    poll_station: u8,
    token_count: u8,
    frame_count: u8,
    retry_count: u8,
    sole_master: bool,
    pfm_sweep: bool,
    reply_pending: Option<PendingReply>,

    tx_queue: VecDeque<OutboundPdu>,
    rx_queue: VecDeque<(Vec<u8>, u8)>,
    events: VecDeque<MstpEvent>,

    zero_config: Option<ZeroConfig>,
    auto_baud: Option<AutoBaud>,

    stats: MstpStatistics,
}

impl<D: Rs485Driver> MstpPort<D> {
    /// Create a port and initialize the driver.
    pub fn new(mut driver: D, config: MstpConfig) -> Result<Self> {
        if config.zero_config_enabled && config.auto_baud_enabled {
            return Err(DataLinkError::ConfigConflict(
                "zero-config and auto-baud both wait on observed traffic; \
                 on a silent segment they deadlock each other",
            ));
        }
        if config.max_master > MAX_MASTER_ADDRESS {
            return Err(DataLinkError::AddressError(
                "max_master above 127".into(),
            ));
        }
        if config.max_info_frames == 0 {
            return Err(DataLinkError::AddressError(
                "max_info_frames must be at least 1".into(),
            ));
        }
        if config.mac_address == BROADCAST_ADDRESS {
            return Err(DataLinkError::AddressError(
                "broadcast address is not a valid station".into(),
            ));
        }
        if !config.slave_mode
            && !config.zero_config_enabled
            && !frame::is_master_address(config.mac_address)
        {
            return Err(DataLinkError::AddressError(
                "master operation requires an address in 0-127".into(),
            ));
        }
        check_baud_rate(config.baud_rate)?;

        driver.set_baud_rate(config.baud_rate)?;
        driver.init()?;

        // A zero-config node comes up at station 0 and stays passive until
        // its claim completes.
        let this_station = if config.zero_config_enabled {
            0
        } else {
            config.mac_address
        };

        Ok(Self {
            driver,
            this_station,
            max_master: config.max_master,
            max_info_frames: config.max_info_frames,
            slave_mode: config.slave_mode,
            proprietary_frames: config.proprietary_frames,
            receive_state: ReceiveState::Idle,
            header_index: 0,
            header_crc_acc: HEADER_CRC_INITIAL,
            rx_frame_type: 0,
            rx_destination: 0,
            rx_source: 0,
            rx_data_length: 0,
            input: Vec::with_capacity(MAX_DATA_LENGTH + 2),
            received_valid_frame: false,
            received_invalid_frame: false,
            master_state: MasterState::Initialize,
            slave_state: SlaveState::Idle,
            next_station: this_station,
            poll_station: this_station,
            token_count: 0,
            frame_count: 0,
            retry_count: 0,
            sole_master: false,
            pfm_sweep: false,
            reply_pending: None,
            tx_queue: VecDeque::new(),
            rx_queue: VecDeque::new(),
            events: VecDeque::new(),
            zero_config: config
                .zero_config_enabled
                .then(|| ZeroConfig::new(config.preferred_station)),
            auto_baud: config.auto_baud_enabled.then(|| AutoBaud {
                index: rs485::VALID_BAUD_RATES
                    .iter()
                    .position(|&b| b == config.baud_rate)
                    .unwrap_or(0),
                valid_frames: 0,
                invalid_frames: 0,
            }),
            stats: MstpStatistics::default(),
        })
    }

    /// Run the receive machinery and whichever node state machine applies.
    ///
    /// Must be called at least once per bit time when traffic is possible;
    /// between calls the driver buffers received octets.
    pub fn poll(&mut self) {
        if !self.received_valid_frame && !self.received_invalid_frame {
            self.receive_fsm();
        }

        if self.auto_baud.is_some() {
            self.auto_baud_fsm();
            return;
        }
        if self.zero_config.is_some() {
            self.zero_config_fsm();
            return;
        }
        if self.slave_mode {
            self.slave_node_fsm();
            return;
        }
        if self.master_ready_to_run() {
            while self.master_node_fsm() {}
        }
    }

    /// This node's station address.
    pub fn station_address(&self) -> u8 {
        self.this_station
    }

    /// Change the station address. Takes effect immediately.
    pub fn set_station_address(&mut self, address: u8) -> Result<()> {
        if address == BROADCAST_ADDRESS {
            return Err(DataLinkError::AddressError(
                "broadcast address is not a valid station".into(),
            ));
        }
        self.this_station = address;
        self.master_state = MasterState::Initialize;
        Ok(())
    }

    /// Highest master address this node polls.
    pub fn max_master(&self) -> u8 {
        self.max_master
    }

    /// Lower or raise the polled address range.
    ///
    /// If the current successor falls outside the new range the successor
    /// is forgotten and a poll-for-master sweep is forced on the next
    /// token hold, so the ring heals instead of polling dead air.
    pub fn set_max_master(&mut self, max_master: u8) -> Result<()> {
        if max_master > MAX_MASTER_ADDRESS {
            return Err(DataLinkError::AddressError("max_master above 127".into()));
        }
        self.max_master = max_master;
        if self.next_station > max_master {
            self.next_station = self.this_station.wrapping_add(1) % (max_master + 1);
            self.token_count = N_POLL;
        }
        Ok(())
    }

    /// Data frames allowed per token hold.
    pub fn max_info_frames(&self) -> u8 {
        self.max_info_frames
    }

    pub fn set_max_info_frames(&mut self, max_info_frames: u8) -> Result<()> {
        if max_info_frames == 0 {
            return Err(DataLinkError::AddressError(
                "max_info_frames must be at least 1".into(),
            ));
        }
        self.max_info_frames = max_info_frames;
        Ok(())
    }

    /// Current link baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.driver.baud_rate()
    }

    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        check_baud_rate(baud)?;
        self.driver.set_baud_rate(baud)
    }

    /// True once a full poll sweep found no other master.
    pub fn is_sole_master(&self) -> bool {
        self.sole_master
    }

    /// Station the token is passed to.
    pub fn next_station(&self) -> u8 {
        self.next_station
    }

    /// Current master state, for diagnostics.
    pub fn master_state(&self) -> MasterState {
        self.master_state
    }

    /// Snapshot of the port counters.
    pub fn statistics(&self) -> MstpStatistics {
        self.stats.clone()
    }

    /// Next out-of-band event, if any.
    pub fn take_event(&mut self) -> Option<MstpEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // receive state machine
    // ------------------------------------------------------------------

    fn receive_fsm(&mut self) {
        // Silence mid-frame means the transmitter gave up; so do we.
        if self.receive_state != ReceiveState::Idle
            && self.driver.silence_ms() >= T_FRAME_ABORT
        {
            trace!("mstp: frame aborted after silence in {:?}", self.receive_state);
            self.stats.frames_aborted += 1;
            self.stats.invalid_frames_rx += 1;
            self.receive_state = ReceiveState::Idle;
            self.received_invalid_frame = true;
            return;
        }

        while !self.received_valid_frame && !self.received_invalid_frame {
            let status = self.driver.line_status();
            if !status.is_empty() {
                self.stats.receive_errors += 1;
                if self.receive_state != ReceiveState::Idle {
                    self.stats.invalid_frames_rx += 1;
                    self.receive_state = ReceiveState::Idle;
                    self.received_invalid_frame = true;
                }
                continue;
            }
            let Some(octet) = self.driver.byte_available() else {
                break;
            };
            self.receive_octet(octet);
        }
    }

    fn receive_octet(&mut self, octet: u8) {
        match self.receive_state {
            ReceiveState::Idle => {
                if octet == PREAMBLE_55 {
                    self.receive_state = ReceiveState::Preamble;
                }
            }
            ReceiveState::Preamble => {
                if octet == PREAMBLE_FF {
                    self.receive_state = ReceiveState::Header;
                    self.header_index = 0;
                    self.header_crc_acc = HEADER_CRC_INITIAL;
                } else if octet != PREAMBLE_55 {
                    // repeated 0x55 keeps us here; anything else is noise
                    self.receive_state = ReceiveState::Idle;
                }
            }
            ReceiveState::Header => {
                self.header_crc_acc = header_crc_update(self.header_crc_acc, octet);
                let index = self.header_index;
                self.header_index += 1;
                match index {
                    0 => self.rx_frame_type = octet,
                    1 => self.rx_destination = octet,
                    2 => self.rx_source = octet,
                    3 => self.rx_data_length = u16::from(octet) << 8,
                    4 => self.rx_data_length |= u16::from(octet),
                    _ => self.finish_header(),
                }
            }
            ReceiveState::Data => {
                self.input.push(octet);
                if self.input.len() == usize::from(self.rx_data_length) + 2 {
                    self.finish_data();
                }
            }
        }
    }

    fn finish_header(&mut self) {
        self.receive_state = ReceiveState::Idle;
        if self.header_crc_acc != HEADER_CRC_RESIDUE {
            self.stats.header_crc_errors += 1;
            self.stats.invalid_frames_rx += 1;
            self.received_invalid_frame = true;
        } else if self.rx_source == BROADCAST_ADDRESS {
            self.stats.invalid_frames_rx += 1;
            self.received_invalid_frame = true;
        } else if usize::from(self.rx_data_length) > MAX_DATA_LENGTH {
            self.stats.invalid_frames_rx += 1;
            self.received_invalid_frame = true;
        } else if self.rx_data_length == 0 {
            self.input.clear();
            self.stats.valid_frames_rx += 1;
            self.received_valid_frame = true;
        } else {
            self.input.clear();
            self.receive_state = ReceiveState::Data;
        }
    }

    fn finish_data(&mut self) {
        self.receive_state = ReceiveState::Idle;
        let payload_len = usize::from(self.rx_data_length);
        let received =
            u16::from_le_bytes([self.input[payload_len], self.input[payload_len + 1]]);
        self.input.truncate(payload_len);
        if data_crc(&self.input) == received {
            self.stats.valid_frames_rx += 1;
            self.received_valid_frame = true;
        } else {
            self.stats.data_crc_errors += 1;
            self.stats.invalid_frames_rx += 1;
            self.received_invalid_frame = true;
        }
    }

    // ------------------------------------------------------------------
    // frame transmission
    // ------------------------------------------------------------------

    fn transmit_frame(&mut self, frame_type: FrameType, destination: u8, data: &[u8]) {
        let frame = match MstpFrame::new(frame_type, destination, self.this_station, data.to_vec())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("mstp: refusing to transmit malformed frame: {}", e);
                return;
            }
        };
        trace!(
            "mstp: tx {} {} -> {} ({} octets)",
            frame.frame_type,
            frame.source,
            frame.destination,
            frame.data.len()
        );
        if let Err(e) = self.driver.send(&frame.encode()) {
            warn!("mstp: driver send failed: {}", e);
            return;
        }
        self.stats.frames_tx += 1;
    }

    fn deliver_pdu(&mut self, data: Vec<u8>, source: u8) {
        if self.rx_queue.len() >= PDU_QUEUE_LIMIT {
            warn!("mstp: inbound queue full, dropping pdu from {}", source);
            return;
        }
        debug!("mstp: rx pdu from {}: {}", source, hex::encode(&data));
        self.stats.pdus_rx += 1;
        self.rx_queue.push_back((data, source));
    }

    fn handle_proprietary(&mut self) {
        match self.proprietary_frames {
            ProprietaryFramePolicy::Drop => {}
            ProprietaryFramePolicy::Deliver => {
                if self.events.len() < PDU_QUEUE_LIMIT {
                    let data = mem::take(&mut self.input);
                    self.events.push_back(MstpEvent::ProprietaryFrame {
                        frame_type: self.rx_frame_type,
                        source: self.rx_source,
                        data,
                    });
                }
            }
        }
    }

    /// First reply in the outbound queue that answers the pending request:
    /// same peer, matching invoke id and service choice.
    fn find_matching_reply(&mut self) -> Option<OutboundPdu> {
        let pending = self.reply_pending.as_ref()?;
        let index = self.tx_queue.iter().position(|pdu| {
            pdu.destination == pending.source && reply_matches(&pending.request, &pdu.data)
        })?;
        self.tx_queue.remove(index)
    }

    // ------------------------------------------------------------------
    // master node state machine
    // ------------------------------------------------------------------

    /// Timer gate mirroring the reference receive loop: the master state
    /// machine only needs cycles when a frame event is pending or the
    /// state's governing timer can have expired.
    fn master_ready_to_run(&self) -> bool {
        if self.received_valid_frame || self.received_invalid_frame {
            return true;
        }
        let silence = self.driver.silence_ms();
        match self.master_state {
            MasterState::Idle => silence >= T_NO_TOKEN,
            MasterState::WaitForReply => silence >= T_REPLY_TIMEOUT,
            MasterState::PollForMaster | MasterState::PassToken => silence >= T_USAGE_TIMEOUT,
            MasterState::NoToken => silence >= self.no_token_slot(),
            _ => true,
        }
    }

    fn no_token_slot(&self) -> u32 {
        T_NO_TOKEN + (u32::from(self.this_station) + 1) * T_SLOT
    }

    /// One step of the master node state machine. Returns true if a state
    /// transition occurred and the machine should run again immediately.
    fn master_node_fsm(&mut self) -> bool {
        let before = self.master_state;
        let transitioned = match self.master_state {
            MasterState::Initialize => {
                self.next_station = self.this_station;
                self.poll_station = self.this_station;
                self.token_count = 0;
                self.frame_count = 0;
                self.retry_count = 0;
                self.sole_master = false;
                self.pfm_sweep = false;
                self.reply_pending = None;
                self.master_state = MasterState::Idle;
                true
            }
            MasterState::Idle => self.master_idle(),
            MasterState::UseToken => self.master_use_token(),
            MasterState::WaitForReply => self.master_wait_for_reply(),
            MasterState::DoneWithToken => self.master_done_with_token(),
            MasterState::PassToken => self.master_pass_token(),
            MasterState::NoToken => self.master_no_token(),
            MasterState::PollForMaster => self.master_poll_for_master(),
            MasterState::AnswerDataRequest => self.master_answer_data_request(),
        };
        if transitioned && before != self.master_state {
            trace!("mstp: master {:?} -> {:?}", before, self.master_state);
        }
        transitioned
    }

    fn master_idle(&mut self) -> bool {
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            false
        } else if self.received_valid_frame {
            self.master_idle_frame()
        } else if self.driver.silence_ms() >= T_NO_TOKEN {
            debug!(
                "mstp: station {} saw {} ms of silence, regenerating token",
                self.this_station,
                self.driver.silence_ms()
            );
            self.stats.lost_tokens += 1;
            self.master_state = MasterState::NoToken;
            true
        } else {
            false
        }
    }

    /// Dispatch a received frame while in IDLE.
    fn master_idle_frame(&mut self) -> bool {
        self.received_valid_frame = false;
        let frame_type = FrameType::from(self.rx_frame_type);
        let source = self.rx_source;
        let for_us = self.rx_destination == self.this_station;
        let broadcast = self.rx_destination == BROADCAST_ADDRESS;

        match frame_type {
            FrameType::Token => {
                if for_us {
                    self.stats.tokens_rx += 1;
                    self.token_count = self.token_count.saturating_add(1);
                    self.frame_count = 0;
                    self.sole_master = false;
                    self.master_state = MasterState::UseToken;
                    return true;
                }
            }
            FrameType::PollForMaster => {
                if for_us {
                    self.transmit_frame(FrameType::ReplyToPollForMaster, source, &[]);
                }
            }
            FrameType::TestRequest => {
                // Broadcast test requests are heard but never answered.
                if for_us {
                    let payload = mem::take(&mut self.input);
                    self.transmit_frame(FrameType::TestResponse, source, &payload);
                }
            }
            FrameType::DataExpectingReply => {
                if for_us {
                    let payload = mem::take(&mut self.input);
                    self.deliver_pdu(payload.clone(), source);
                    self.reply_pending = Some(PendingReply {
                        source,
                        request: payload,
                    });
                    self.master_state = MasterState::AnswerDataRequest;
                    return true;
                } else if broadcast {
                    let payload = mem::take(&mut self.input);
                    self.deliver_pdu(payload, source);
                }
            }
            FrameType::DataNotExpectingReply => {
                if for_us || broadcast {
                    let payload = mem::take(&mut self.input);
                    self.deliver_pdu(payload, source);
                }
            }
            FrameType::TestResponse
            | FrameType::ReplyToPollForMaster
            | FrameType::ReplyPostponed => {}
            FrameType::Proprietary(_) => {
                if for_us || broadcast {
                    self.handle_proprietary();
                }
            }
            FrameType::Reserved(value) => {
                trace!("mstp: dropping reserved frame type {}", value.value());
            }
        }
        false
    }

    fn master_use_token(&mut self) -> bool {
        if self.frame_count >= self.max_info_frames {
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        match self.tx_queue.pop_front() {
            None => {
                self.master_state = MasterState::DoneWithToken;
                true
            }
            Some(pdu) => {
                let frame_type = if pdu.expecting_reply {
                    FrameType::DataExpectingReply
                } else {
                    FrameType::DataNotExpectingReply
                };
                self.transmit_frame(frame_type, pdu.destination, &pdu.data);
                self.stats.pdus_tx += 1;
                self.frame_count += 1;
                if pdu.expecting_reply && pdu.destination != BROADCAST_ADDRESS {
                    self.master_state = MasterState::WaitForReply;
                }
                true
            }
        }
    }

    fn master_wait_for_reply(&mut self) -> bool {
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        if self.received_valid_frame {
            let frame_type = FrameType::from(self.rx_frame_type);
            let for_us = self.rx_destination == self.this_station;
            // Negative list: only frames that definitely are not replies
            // throw us out; everything else addressed to us counts as the
            // reply, including proprietary types.
            let not_a_reply = matches!(
                frame_type,
                FrameType::Token
                    | FrameType::PollForMaster
                    | FrameType::ReplyToPollForMaster
                    | FrameType::TestRequest
            );
            if !for_us || not_a_reply {
                warn!(
                    "mstp: unexpected {} while waiting for reply",
                    frame_type
                );
                // Leave the frame pending; IDLE knows what to do with it.
                self.master_state = MasterState::Idle;
                return true;
            }
            self.received_valid_frame = false;
            let source = self.rx_source;
            match frame_type {
                FrameType::ReplyPostponed => {}
                FrameType::Proprietary(_) => self.handle_proprietary(),
                FrameType::TestResponse => {}
                _ => {
                    let payload = mem::take(&mut self.input);
                    self.deliver_pdu(payload, source);
                }
            }
            // The reply arrived in time; spend the rest of the token hold.
            self.master_state = MasterState::UseToken;
            return true;
        }
        if self.driver.silence_ms() >= T_REPLY_TIMEOUT {
            debug!("mstp: reply timeout, station {} unresponsive", self.next_station);
            self.stats.reply_timeouts += 1;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        false
    }

    fn master_done_with_token(&mut self) -> bool {
        if self.token_count >= N_POLL {
            // Maintenance: look for masters that joined since the last sweep.
            self.token_count = 0;
            self.pfm_sweep = false;
            self.poll_station = self.next_station.wrapping_add(1) % (self.max_master + 1);
            if self.poll_station == self.this_station {
                self.pass_token();
            } else {
                self.transmit_frame(FrameType::PollForMaster, self.poll_station, &[]);
                self.master_state = MasterState::PollForMaster;
            }
            true
        } else if self.next_station == self.this_station {
            if self.sole_master {
                // Nobody to pass to. Keep cycling, paced so an appearing
                // master can get a word in.
                if !self.tx_queue.is_empty() || self.driver.silence_ms() >= T_USAGE_TIMEOUT {
                    self.transmit_frame(FrameType::Token, self.this_station, &[]);
                    self.token_count = self.token_count.saturating_add(1);
                    self.frame_count = 0;
                    self.master_state = MasterState::UseToken;
                    true
                } else {
                    false
                }
            } else {
                // Successor unknown: find one before the token can move on.
                self.pfm_sweep = true;
                self.poll_station = self.this_station.wrapping_add(1) % (self.max_master + 1);
                if self.poll_station == self.this_station {
                    self.become_sole_master();
                } else {
                    self.transmit_frame(FrameType::PollForMaster, self.poll_station, &[]);
                    self.master_state = MasterState::PollForMaster;
                }
                true
            }
        } else {
            self.pass_token();
            true
        }
    }

    fn pass_token(&mut self) {
        self.retry_count = 0;
        self.transmit_frame(FrameType::Token, self.next_station, &[]);
        self.master_state = MasterState::PassToken;
    }

    fn master_pass_token(&mut self) -> bool {
        if self.received_valid_frame {
            // Any traffic means the token went somewhere; leave the frame
            // for IDLE to dispatch.
            self.retry_count = 0;
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.received_invalid_frame {
            // Garbled activity still proves someone is transmitting.
            self.received_invalid_frame = false;
            self.retry_count = 0;
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.driver.silence_ms() >= T_USAGE_TIMEOUT {
            if self.retry_count < N_RETRY_TOKEN {
                self.retry_count += 1;
                debug!("mstp: token to {} unanswered, retrying", self.next_station);
                self.transmit_frame(FrameType::Token, self.next_station, &[]);
                return false;
            }
            // Successor is gone; search for a new one.
            debug!("mstp: station {} dropped off the ring", self.next_station);
            self.retry_count = 0;
            self.pfm_sweep = true;
            self.poll_station = self.next_station.wrapping_add(1) % (self.max_master + 1);
            self.next_station = self.this_station;
            if self.poll_station == self.this_station {
                self.become_sole_master();
            } else {
                self.transmit_frame(FrameType::PollForMaster, self.poll_station, &[]);
                self.master_state = MasterState::PollForMaster;
            }
            return true;
        }
        false
    }

    fn master_no_token(&mut self) -> bool {
        if self.received_valid_frame {
            // Another station claimed the token first.
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            return false;
        }
        if self.driver.silence_ms() >= self.no_token_slot() {
            info!(
                "mstp: station {} claiming token after silent ring",
                self.this_station
            );
            self.next_station = self.this_station;
            self.pfm_sweep = true;
            self.poll_station = self.this_station.wrapping_add(1) % (self.max_master + 1);
            if self.poll_station == self.this_station {
                self.become_sole_master();
            } else {
                self.transmit_frame(FrameType::PollForMaster, self.poll_station, &[]);
                self.master_state = MasterState::PollForMaster;
            }
            return true;
        }
        false
    }

    fn master_poll_for_master(&mut self) -> bool {
        if self.received_valid_frame {
            let frame_type = FrameType::from(self.rx_frame_type);
            if frame_type == FrameType::ReplyToPollForMaster
                && self.rx_destination == self.this_station
            {
                self.received_valid_frame = false;
                self.next_station = self.rx_source;
                self.sole_master = false;
                self.token_count = 0;
                debug!("mstp: found master at {}", self.next_station);
                self.pass_token();
            } else {
                // Live traffic that is not our answer; fall back to IDLE
                // with the frame still pending.
                self.master_state = MasterState::Idle;
            }
            return true;
        }
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            return false;
        }
        if self.driver.silence_ms() >= T_USAGE_TIMEOUT {
            if self.pfm_sweep {
                // Searching for any successor: walk the whole address space.
                self.poll_station = self.poll_station.wrapping_add(1) % (self.max_master + 1);
                if self.poll_station == self.this_station {
                    self.become_sole_master();
                    return true;
                }
                self.transmit_frame(FrameType::PollForMaster, self.poll_station, &[]);
                return false;
            }
            // Maintenance probe of a single address came up empty.
            if self.sole_master {
                self.frame_count = 0;
                self.master_state = MasterState::UseToken;
            } else {
                self.pass_token();
            }
            return true;
        }
        false
    }

    fn become_sole_master(&mut self) {
        info!(
            "mstp: station {} found no other masters, operating as sole master",
            self.this_station
        );
        self.sole_master = true;
        self.pfm_sweep = false;
        self.next_station = self.this_station;
        self.token_count = 0;
        self.frame_count = 0;
        self.master_state = MasterState::UseToken;
    }

    fn master_answer_data_request(&mut self) -> bool {
        if let Some(reply) = self.find_matching_reply() {
            self.transmit_frame(FrameType::DataNotExpectingReply, reply.destination, &reply.data);
            self.stats.pdus_tx += 1;
            self.reply_pending = None;
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.driver.silence_ms() >= T_REPLY_DELAY {
            if let Some(pending) = self.reply_pending.take() {
                debug!(
                    "mstp: no reply ready for {} within {} ms, postponing",
                    pending.source, T_REPLY_DELAY
                );
                self.transmit_frame(FrameType::ReplyPostponed, pending.source, &[]);
            }
            self.master_state = MasterState::Idle;
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // slave node state machine
    // ------------------------------------------------------------------

    fn slave_node_fsm(&mut self) {
        match self.slave_state {
            SlaveState::Idle => {
                if self.received_invalid_frame {
                    self.received_invalid_frame = false;
                    return;
                }
                if !self.received_valid_frame {
                    return;
                }
                self.received_valid_frame = false;
                let frame_type = FrameType::from(self.rx_frame_type);
                let source = self.rx_source;
                let for_us = self.rx_destination == self.this_station;
                let broadcast = self.rx_destination == BROADCAST_ADDRESS;
                match frame_type {
                    FrameType::TestRequest if for_us => {
                        let payload = mem::take(&mut self.input);
                        self.transmit_frame(FrameType::TestResponse, source, &payload);
                    }
                    FrameType::DataExpectingReply if for_us => {
                        let payload = mem::take(&mut self.input);
                        self.deliver_pdu(payload.clone(), source);
                        self.reply_pending = Some(PendingReply {
                            source,
                            request: payload,
                        });
                        self.slave_state = SlaveState::Respond;
                    }
                    FrameType::DataExpectingReply | FrameType::DataNotExpectingReply
                        if for_us || broadcast =>
                    {
                        let payload = mem::take(&mut self.input);
                        self.deliver_pdu(payload, source);
                    }
                    FrameType::Proprietary(_) if for_us || broadcast => {
                        self.handle_proprietary();
                    }
                    _ => {}
                }
            }
            SlaveState::Respond => {
                if let Some(reply) = self.find_matching_reply() {
                    self.transmit_frame(
                        FrameType::DataNotExpectingReply,
                        reply.destination,
                        &reply.data,
                    );
                    self.stats.pdus_tx += 1;
                    self.reply_pending = None;
                    self.slave_state = SlaveState::Idle;
                } else if self.received_valid_frame {
                    // The bus moved on; a late reply would collide.
                    self.reply_pending = None;
                    self.slave_state = SlaveState::Idle;
                } else if self.driver.silence_ms() >= T_REPLY_DELAY {
                    // A slave has no token to answer with later, so the
                    // request simply dies here.
                    warn!("mstp: slave reply window expired");
                    self.reply_pending = None;
                    self.slave_state = SlaveState::Idle;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // zero-config address assignment
    // ------------------------------------------------------------------

    fn zero_config_fsm(&mut self) {
        let Some(mut zc) = self.zero_config.take() else {
            return;
        };

        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            self.zero_config = Some(zc);
            return;
        }

        let frame = if self.received_valid_frame {
            self.received_valid_frame = false;
            let frame_type = FrameType::from(self.rx_frame_type);
            zc.mark_in_use(self.rx_source);
            if frame_type == FrameType::Token && self.rx_destination <= MAX_MASTER_ADDRESS {
                zc.mark_in_use(self.rx_destination);
            }
            Some((frame_type, self.rx_source))
        } else {
            None
        };

        match zc.stage {
            ZeroConfigStage::Listen => {
                if let Some((FrameType::Token, source)) = frame {
                    match zc.cycle_anchor {
                        None => zc.cycle_anchor = Some(source),
                        Some(anchor) if anchor == source => {
                            // The token came back around: one full cycle seen.
                            self.zero_config_start_probe(&mut zc);
                        }
                        Some(_) => {}
                    }
                } else if frame.is_none() && self.driver.silence_ms() >= 2 * T_NO_TOKEN {
                    // Dead wire; claim without waiting for a cycle.
                    self.zero_config_start_probe(&mut zc);
                }
            }
            ZeroConfigStage::Probe => {
                if let Some((_, source)) = frame {
                    if source == zc.candidate {
                        // Someone lives there after all.
                        self.zero_config_start_probe(&mut zc);
                    }
                } else if self.driver.silence_ms() >= T_USAGE_TIMEOUT {
                    match zc.probe_step {
                        0 => {
                            self.transmit_frame(FrameType::TestRequest, zc.candidate, &[]);
                            zc.probe_step = 1;
                        }
                        1 => {
                            self.transmit_frame(FrameType::PollForMaster, zc.candidate, &[]);
                            zc.probe_step = 2;
                        }
                        _ => {
                            debug!(
                                "mstp: zero-config claiming station {} tentatively",
                                zc.candidate
                            );
                            zc.confirm_tokens = 0;
                            zc.stage = ZeroConfigStage::Confirm;
                        }
                    }
                }
            }
            ZeroConfigStage::Confirm => {
                match frame {
                    Some((_, source)) if source == zc.candidate => {
                        // Collision: the address answered someone.
                        self.zero_config_start_probe(&mut zc);
                    }
                    Some((FrameType::Token, _)) => {
                        zc.confirm_tokens += 1;
                        if zc.confirm_tokens >= ZERO_CONFIG_CONFIRM_TOKENS {
                            self.zero_config_adopt(zc);
                            return;
                        }
                    }
                    Some(_) => {}
                    None => {
                        if self.driver.silence_ms() >= 2 * T_NO_TOKEN {
                            // Nobody around to collide with.
                            self.zero_config_adopt(zc);
                            return;
                        }
                    }
                }
            }
        }

        self.zero_config = Some(zc);
    }

    /// Pick the next free candidate and open the probe with a poll.
    fn zero_config_start_probe(&mut self, zc: &mut ZeroConfig) {
        match zc.pick_candidate() {
            Some(candidate) => {
                zc.candidate = candidate;
                zc.probe_step = 0;
                zc.stage = ZeroConfigStage::Probe;
                self.transmit_frame(FrameType::PollForMaster, candidate, &[]);
            }
            None => {
                warn!("mstp: zero-config found no free station in 64-127");
                zc.cycle_anchor = None;
                zc.stage = ZeroConfigStage::Listen;
            }
        }
    }

    fn zero_config_adopt(&mut self, zc: ZeroConfig) {
        info!("mstp: zero-config claimed station {}", zc.candidate);
        self.this_station = zc.candidate;
        self.zero_config = None;
        self.master_state = MasterState::Initialize;
    }

    // ------------------------------------------------------------------
    // auto-baud
    // ------------------------------------------------------------------

    fn auto_baud_fsm(&mut self) {
        let Some(mut ab) = self.auto_baud.take() else {
            return;
        };

        if self.received_valid_frame {
            self.received_valid_frame = false;
            ab.valid_frames += 1;
            if ab.valid_frames >= AUTO_BAUD_LOCK_FRAMES {
                info!("mstp: auto-baud locked at {} baud", self.driver.baud_rate());
                self.master_state = MasterState::Initialize;
                // leaving auto_baud as None ends the hunt
                return;
            }
        } else if self.received_invalid_frame {
            self.received_invalid_frame = false;
            ab.invalid_frames += 1;
            if ab.invalid_frames >= 2 {
                self.auto_baud_advance(&mut ab);
            }
        } else if self.driver.silence_ms() >= AUTO_BAUD_DWELL_MS {
            self.auto_baud_advance(&mut ab);
        }

        self.auto_baud = Some(ab);
    }

    fn auto_baud_advance(&mut self, ab: &mut AutoBaud) {
        ab.index = (ab.index + 1) % rs485::VALID_BAUD_RATES.len();
        ab.valid_frames = 0;
        ab.invalid_frames = 0;
        let baud = rs485::VALID_BAUD_RATES[ab.index];
        debug!("mstp: auto-baud trying {} baud", baud);
        if let Err(e) = self.driver.set_baud_rate(baud) {
            warn!("mstp: auto-baud rate change failed: {}", e);
        }
        self.driver.silence_reset();
    }
}

impl<D: Rs485Driver + Send> DataLink for MstpPort<D> {
    fn send_frame(&mut self, frame: &[u8], dest: &DataLinkAddress) -> Result<()> {
        let destination = match dest {
            DataLinkAddress::MsTP(mac) => *mac,
            DataLinkAddress::Broadcast => BROADCAST_ADDRESS,
            #[cfg(feature = "std")]
            DataLinkAddress::Ip(_) => {
                return Err(DataLinkError::AddressError(
                    "IP address on an MS/TP link".into(),
                ))
            }
        };
        if frame.len() > MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLong);
        }
        if self.tx_queue.len() >= PDU_QUEUE_LIMIT {
            return Err(DataLinkError::QueueFull);
        }

        // The NPDU control octet says whether the peer is expected to
        // answer, which selects the frame type on the wire.
        let expecting_reply = Npdu::decode(frame)
            .map(|(npdu, _)| npdu.control.expecting_reply)
            .unwrap_or(false);

        self.tx_queue.push_back(OutboundPdu {
            destination,
            expecting_reply,
            data: frame.to_vec(),
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<(Vec<u8>, DataLinkAddress)> {
        self.poll();
        match self.rx_queue.pop_front() {
            Some((data, source)) => Ok((data, DataLinkAddress::MsTP(source))),
            None => Err(DataLinkError::WouldBlock),
        }
    }

    fn link_type(&self) -> DataLinkType {
        DataLinkType::MsTP
    }

    fn local_address(&self) -> DataLinkAddress {
        DataLinkAddress::MsTP(self.this_station)
    }

    fn max_npdu(&self) -> usize {
        MAX_DATA_LENGTH
    }
}

/// Check whether `reply` answers `request` (both whole NPDUs): not a
/// network message on either side, matching invoke ids, and matching
/// service choices where the reply kind carries one.
fn reply_matches(request: &[u8], reply: &[u8]) -> bool {
    let Ok((request_npdu, request_offset)) = Npdu::decode(request) else {
        return false;
    };
    let Ok((reply_npdu, reply_offset)) = Npdu::decode(reply) else {
        return false;
    };
    if request_npdu.is_network_message() || reply_npdu.is_network_message() {
        return false;
    }
    let Ok(request_apdu) = Apdu::decode(&request[request_offset..]) else {
        return false;
    };
    let Ok(reply_apdu) = Apdu::decode(&reply[reply_offset..]) else {
        return false;
    };
    let Apdu::ConfirmedRequest {
        invoke_id,
        service_choice,
        ..
    } = request_apdu
    else {
        return false;
    };

    match reply_apdu {
        Apdu::SimpleAck {
            invoke_id: reply_id,
            service_choice: reply_choice,
        } => reply_id == invoke_id && reply_choice == service_choice,
        Apdu::ComplexAck {
            invoke_id: reply_id,
            service_choice: reply_choice,
            ..
        } => reply_id == invoke_id && reply_choice == service_choice,
        Apdu::Error {
            invoke_id: reply_id,
            service_choice: reply_choice,
            ..
        } => reply_id == invoke_id && reply_choice == service_choice,
        Apdu::Reject {
            invoke_id: reply_id, ..
        }
        | Apdu::Abort {
            invoke_id: reply_id, ..
        }
        | Apdu::SegmentAck {
            invoke_id: reply_id, ..
        } => reply_id == invoke_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::crc::header_crc;
    use super::rs485::SimulatedRs485;
    use super::*;
    use crate::app::{MaxApduSize, MaxSegments};

    fn master_port(station: u8) -> MstpPort<SimulatedRs485> {
        let config = MstpConfig {
            mac_address: station,
            ..Default::default()
        };
        MstpPort::new(SimulatedRs485::new(), config).unwrap()
    }

    fn wire(frame_type: FrameType, dest: u8, src: u8, data: &[u8]) -> Vec<u8> {
        MstpFrame::new(frame_type, dest, src, data.to_vec())
            .unwrap()
            .encode()
    }

    fn inject(port: &mut MstpPort<SimulatedRs485>, octets: &[u8]) {
        port.driver.inject(octets);
    }

    fn confirmed_request_npdu(invoke_id: u8, service_choice: u8) -> Vec<u8> {
        let mut npdu = Npdu::new();
        npdu.control.expecting_reply = true;
        let mut message = npdu.encode();
        message.extend_from_slice(
            &Apdu::ConfirmedRequest {
                segmented: false,
                more_follows: false,
                segmented_response_accepted: false,
                max_segments: MaxSegments::Unspecified,
                max_response_size: MaxApduSize::Up480,
                invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice,
                service_data: vec![0x0C, 0x00, 0x00, 0x00, 0x01],
            }
            .encode(),
        );
        message
    }

    fn complex_ack_npdu(invoke_id: u8, service_choice: u8) -> Vec<u8> {
        let mut message = Npdu::new().encode();
        message.extend_from_slice(
            &Apdu::ComplexAck {
                segmented: false,
                more_follows: false,
                invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice,
                service_data: vec![0x3E, 0x44, 0x42, 0x28, 0x00, 0x00, 0x3F],
            }
            .encode(),
        );
        message
    }

    #[test]
    fn token_receipt_enters_use_token_then_passes() {
        let mut port = master_port(5);
        inject(&mut port, &wire(FrameType::Token, 5, 2, &[]));
        port.poll();

        // Empty queue, unknown successor: the port starts polling for one.
        let sent = port.driver.take_transmitted();
        assert_eq!(sent.len(), 1);
        let pfm = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(pfm.frame_type, FrameType::PollForMaster);
        assert_eq!(pfm.destination, 6);
        assert_eq!(port.statistics().tokens_rx, 1);
    }

    #[test]
    fn header_crc_error_counted_and_dropped() {
        let mut port = master_port(5);
        let mut frame = wire(FrameType::Token, 5, 2, &[]);
        frame[3] ^= 0x01;
        inject(&mut port, &frame);
        port.poll();

        let stats = port.statistics();
        assert_eq!(stats.header_crc_errors, 1);
        assert_eq!(stats.invalid_frames_rx, 1);
        assert_eq!(stats.valid_frames_rx, 0);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn data_crc_error_counted_and_dropped() {
        let mut port = master_port(5);
        let mut frame = wire(FrameType::DataNotExpectingReply, 5, 2, &[1, 2, 3, 4]);
        let len = frame.len();
        frame[len - 3] ^= 0xFF;
        inject(&mut port, &frame);
        port.poll();

        let stats = port.statistics();
        assert_eq!(stats.data_crc_errors, 1);
        assert_eq!(stats.valid_frames_rx, 0);
        assert!(port.receive_frame().is_err());
    }

    #[test]
    fn silence_aborts_partial_frame() {
        let mut port = master_port(5);
        let frame = wire(FrameType::DataNotExpectingReply, 5, 2, &[1, 2, 3, 4]);
        inject(&mut port, &frame[..10]);
        port.poll();
        assert_eq!(port.statistics().frames_aborted, 0);

        port.driver.advance(T_FRAME_ABORT);
        port.poll();
        assert_eq!(port.statistics().frames_aborted, 1);

        // The rest of the octets are noise now; no frame may emerge.
        inject(&mut port, &frame[10..]);
        port.poll();
        assert_eq!(port.statistics().valid_frames_rx, 0);
    }

    #[test]
    fn source_broadcast_rejected_by_receiver() {
        let mut port = master_port(5);
        let mut frame = wire(FrameType::Token, 5, 2, &[]);
        frame[4] = BROADCAST_ADDRESS;
        frame[7] = header_crc(&frame[2..7]);
        inject(&mut port, &frame);
        port.poll();

        assert_eq!(port.statistics().invalid_frames_rx, 1);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn lone_master_claims_ring_and_becomes_sole_master() {
        let mut port = master_port(5);

        // 500 ms of silence: token declared lost.
        port.driver.advance(T_NO_TOKEN);
        port.poll();
        assert_eq!(port.master_state(), MasterState::NoToken);

        // Slot for station 5 opens at 500 + 6 * 10 = 560 ms.
        port.driver.advance(port.no_token_slot() - T_NO_TOKEN);
        port.poll();
        assert_eq!(port.master_state(), MasterState::PollForMaster);

        let first = port.driver.take_transmitted();
        assert_eq!(MstpFrame::decode(&first[0]).unwrap().destination, 6);

        // Sweep the rest of the space: 7..=127 then 0..=4, nobody answers.
        let mut polled = Vec::new();
        loop {
            port.driver.advance(T_USAGE_TIMEOUT);
            port.poll();
            let sent = port.driver.take_transmitted();
            for octets in &sent {
                let frame = MstpFrame::decode(octets).unwrap();
                if frame.frame_type == FrameType::PollForMaster {
                    polled.push(frame.destination);
                }
            }
            if port.is_sole_master() {
                break;
            }
            assert!(polled.len() <= 130, "sweep never terminated");
        }

        let mut expected: Vec<u8> = (7..=127).collect();
        expected.extend(0..=4);
        assert_eq!(polled, expected);

        // Sole master services its queue: token to self, then the frame.
        let npdu = Npdu::new().encode();
        port.send_frame(&npdu, &DataLinkAddress::Broadcast).unwrap();
        port.poll();
        let sent = port.driver.take_transmitted();
        let kinds: Vec<FrameType> = sent
            .iter()
            .map(|o| MstpFrame::decode(o).unwrap().frame_type)
            .collect();
        assert!(kinds.contains(&FrameType::DataNotExpectingReply));
    }

    #[test]
    fn token_pass_is_not_retried_after_successor_talks() {
        let mut port = master_port(5);

        // Receive the token from station 7; queue one broadcast frame.
        let npdu = Npdu::new().encode();
        port.send_frame(&npdu, &DataLinkAddress::Broadcast).unwrap();
        inject(&mut port, &wire(FrameType::Token, 5, 7, &[]));
        port.poll();

        // Data frame went out, then the successor search started at 6.
        let sent = port.driver.take_transmitted();
        let kinds: Vec<(FrameType, u8)> = sent
            .iter()
            .map(|o| {
                let f = MstpFrame::decode(o).unwrap();
                (f.frame_type, f.destination)
            })
            .collect();
        assert_eq!(kinds[0], (FrameType::DataNotExpectingReply, BROADCAST_ADDRESS));
        assert_eq!(kinds[1], (FrameType::PollForMaster, 6));

        // 6 is silent; 7 answers the next poll.
        port.driver.advance(T_USAGE_TIMEOUT);
        port.poll();
        let sent = port.driver.take_transmitted();
        assert_eq!(MstpFrame::decode(&sent[0]).unwrap().destination, 7);

        inject(&mut port, &wire(FrameType::ReplyToPollForMaster, 5, 7, &[]));
        port.poll();
        let sent = port.driver.take_transmitted();
        let token = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(token.frame_type, FrameType::Token);
        assert_eq!(token.destination, 7);
        assert_eq!(port.next_station(), 7);

        // 7 uses the token within Tusage_timeout: no retry from us.
        inject(&mut port, &wire(FrameType::PollForMaster, 8, 7, &[]));
        port.poll();
        assert_eq!(port.driver.transmitted_count(), 0);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn token_hold_bounded_by_max_info_frames() {
        let config = MstpConfig {
            mac_address: 5,
            max_info_frames: 2,
            ..Default::default()
        };
        let mut port = MstpPort::new(SimulatedRs485::new(), config).unwrap();

        let npdu = Npdu::new().encode();
        for _ in 0..3 {
            port.send_frame(&npdu, &DataLinkAddress::Broadcast).unwrap();
        }
        inject(&mut port, &wire(FrameType::Token, 5, 7, &[]));
        port.poll();

        let sent = port.driver.take_transmitted();
        let data_frames = sent
            .iter()
            .filter(|o| MstpFrame::decode(o).unwrap().frame_type.is_data())
            .count();
        assert_eq!(data_frames, 2);
    }

    #[test]
    fn broadcast_frames_never_answered() {
        let mut port = master_port(5);
        inject(
            &mut port,
            &wire(FrameType::DataExpectingReply, BROADCAST_ADDRESS, 3, &[0x01, 0x00]),
        );
        port.poll();

        // Delivered locally, nothing transmitted, still IDLE.
        assert_eq!(port.driver.transmitted_count(), 0);
        assert_eq!(port.master_state(), MasterState::Idle);
        let (data, source) = port.receive_frame().unwrap();
        assert_eq!(data, vec![0x01, 0x00]);
        assert_eq!(source, DataLinkAddress::MsTP(3));

        // Broadcast test requests are not echoed either.
        inject(
            &mut port,
            &wire(FrameType::TestRequest, BROADCAST_ADDRESS, 3, &[0xAA]),
        );
        port.poll();
        assert_eq!(port.driver.transmitted_count(), 0);
    }

    #[test]
    fn poll_for_master_answered_from_idle() {
        let mut port = master_port(5);
        inject(&mut port, &wire(FrameType::PollForMaster, 5, 2, &[]));
        port.poll();

        let sent = port.driver.take_transmitted();
        let rpfm = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(rpfm.frame_type, FrameType::ReplyToPollForMaster);
        assert_eq!(rpfm.destination, 2);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn test_request_echoed() {
        let mut port = master_port(5);
        inject(&mut port, &wire(FrameType::TestRequest, 5, 9, &[0xDE, 0xAD]));
        port.poll();

        let sent = port.driver.take_transmitted();
        let echo = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(echo.frame_type, FrameType::TestResponse);
        assert_eq!(echo.destination, 9);
        assert_eq!(echo.data, vec![0xDE, 0xAD]);
    }

    #[test]
    fn answer_data_request_sends_matching_reply() {
        let mut port = master_port(5);
        let request = confirmed_request_npdu(42, 12);
        inject(&mut port, &wire(FrameType::DataExpectingReply, 5, 3, &request));
        port.poll();
        assert_eq!(port.master_state(), MasterState::AnswerDataRequest);

        // The application reads the request and queues the answer.
        let (pdu, source) = port.receive_frame().unwrap();
        assert_eq!(pdu, request);
        assert_eq!(source, DataLinkAddress::MsTP(3));

        let reply = complex_ack_npdu(42, 12);
        port.send_frame(&reply, &DataLinkAddress::MsTP(3)).unwrap();
        port.poll();

        let sent = port.driver.take_transmitted();
        let frame = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(frame.frame_type, FrameType::DataNotExpectingReply);
        assert_eq!(frame.destination, 3);
        assert_eq!(frame.data, reply);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn unmatched_reply_is_postponed() {
        let mut port = master_port(5);
        let request = confirmed_request_npdu(42, 12);
        inject(&mut port, &wire(FrameType::DataExpectingReply, 5, 3, &request));
        port.poll();

        // A queued PDU for a different invoke id is not the answer.
        let unrelated = complex_ack_npdu(43, 12);
        port.send_frame(&unrelated, &DataLinkAddress::MsTP(3)).unwrap();

        port.driver.advance(T_REPLY_DELAY);
        port.poll();

        let sent = port.driver.take_transmitted();
        let frame = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(frame.frame_type, FrameType::ReplyPostponed);
        assert_eq!(frame.destination, 3);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn slave_answers_but_never_initiates() {
        let config = MstpConfig {
            mac_address: 130,
            slave_mode: true,
            ..Default::default()
        };
        let mut port = MstpPort::new(SimulatedRs485::new(), config).unwrap();

        // A slave never reacts to ring silence.
        port.driver.advance(10 * T_NO_TOKEN);
        port.poll();
        assert_eq!(port.driver.transmitted_count(), 0);

        // It echoes test requests.
        inject(&mut port, &wire(FrameType::TestRequest, 130, 5, &[0x55, 0x01]));
        port.poll();
        let sent = port.driver.take_transmitted();
        assert_eq!(MstpFrame::decode(&sent[0]).unwrap().frame_type, FrameType::TestResponse);

        // And answers a confirmed request when the app provides the reply.
        let request = confirmed_request_npdu(7, 12);
        inject(&mut port, &wire(FrameType::DataExpectingReply, 130, 5, &request));
        port.poll();
        let _ = port.receive_frame().unwrap();
        let reply = complex_ack_npdu(7, 12);
        port.send_frame(&reply, &DataLinkAddress::MsTP(5)).unwrap();
        port.poll();
        let sent = port.driver.take_transmitted();
        let frame = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(frame.frame_type, FrameType::DataNotExpectingReply);
        assert_eq!(frame.data, reply);
    }

    #[test]
    fn proprietary_frames_dropped_by_default_delivered_on_request() {
        let mut port = master_port(5);
        inject(&mut port, &wire(FrameType::from(200u8), 5, 9, &[0x01, 0x99, 0x77]));
        port.poll();
        assert!(port.take_event().is_none());

        let config = MstpConfig {
            mac_address: 5,
            proprietary_frames: ProprietaryFramePolicy::Deliver,
            ..Default::default()
        };
        let mut port = MstpPort::new(SimulatedRs485::new(), config).unwrap();
        inject(&mut port, &wire(FrameType::from(200u8), 5, 9, &[0x01, 0x99, 0x77]));
        port.poll();
        assert_eq!(
            port.take_event(),
            Some(MstpEvent::ProprietaryFrame {
                frame_type: 200,
                source: 9,
                data: vec![0x01, 0x99, 0x77],
            })
        );
    }

    #[test]
    fn max_master_lowered_below_next_station_forces_sweep() {
        let mut port = master_port(5);
        port.next_station = 90;
        port.set_max_master(64).unwrap();
        assert!(port.next_station() <= 64);
        assert_eq!(port.token_count, N_POLL);
    }

    #[test]
    fn zero_config_and_auto_baud_conflict_rejected() {
        let config = MstpConfig {
            zero_config_enabled: true,
            auto_baud_enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            MstpPort::new(SimulatedRs485::new(), config),
            Err(DataLinkError::ConfigConflict(_))
        ));
    }

    #[test]
    fn zero_config_claims_free_station() {
        let config = MstpConfig {
            mac_address: 0,
            zero_config_enabled: true,
            preferred_station: Some(64),
            ..Default::default()
        };
        let mut port = MstpPort::new(SimulatedRs485::new(), config).unwrap();

        // One full token cycle: 2 -> 3 -> 2.
        inject(&mut port, &wire(FrameType::Token, 3, 2, &[]));
        port.poll();
        inject(&mut port, &wire(FrameType::Token, 2, 3, &[]));
        port.poll();
        inject(&mut port, &wire(FrameType::Token, 3, 2, &[]));
        port.poll();

        // Cycle observed: probe of station 64 begins with a poll.
        let sent = port.driver.take_transmitted();
        let probe = MstpFrame::decode(&sent[0]).unwrap();
        assert_eq!(probe.frame_type, FrameType::PollForMaster);
        assert_eq!(probe.destination, 64);

        // Station 64 answers: candidate advances to 65.
        inject(&mut port, &wire(FrameType::ReplyToPollForMaster, 0, 64, &[]));
        port.poll();
        let sent = port.driver.take_transmitted();
        assert_eq!(MstpFrame::decode(&sent[0]).unwrap().destination, 65);

        // 65 stays silent through the probe bracket.
        for _ in 0..3 {
            port.driver.advance(T_USAGE_TIMEOUT);
            port.poll();
        }
        port.driver.take_transmitted();

        // Three clean token passes confirm the claim.
        for _ in 0..3 {
            inject(&mut port, &wire(FrameType::Token, 3, 2, &[]));
            port.poll();
        }
        assert_eq!(port.station_address(), 65);
        assert_eq!(port.local_address(), DataLinkAddress::MsTP(65));
    }

    #[test]
    fn auto_baud_locks_after_two_valid_frames() {
        let config = MstpConfig {
            mac_address: 5,
            baud_rate: 9600,
            auto_baud_enabled: true,
            ..Default::default()
        };
        let mut port = MstpPort::new(SimulatedRs485::new(), config).unwrap();

        // Garbage twice: hunt advances to the next candidate rate.
        inject(&mut port, &[0x55, 0xFF, 0x00, 0x01, 0x02, 0x00, 0x00, 0xEE]);
        port.poll();
        inject(&mut port, &[0x55, 0xFF, 0x00, 0x01, 0x02, 0x00, 0x00, 0xEE]);
        port.poll();
        assert_eq!(port.baud_rate(), 19200);

        // Two clean frames lock the rate and start the node.
        inject(&mut port, &wire(FrameType::Token, 1, 2, &[]));
        port.poll();
        inject(&mut port, &wire(FrameType::Token, 2, 1, &[]));
        port.poll();
        assert_eq!(port.baud_rate(), 19200);

        // The node joins the ring on the next poll.
        port.poll();
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn oversized_send_rejected() {
        let mut port = master_port(5);
        let too_long = vec![0u8; MAX_DATA_LENGTH + 1];
        assert!(matches!(
            port.send_frame(&too_long, &DataLinkAddress::Broadcast),
            Err(DataLinkError::FrameTooLong)
        ));
    }

    #[test]
    fn reply_matching_requires_invoke_id_and_service() {
        let request = confirmed_request_npdu(42, 12);
        assert!(reply_matches(&request, &complex_ack_npdu(42, 12)));
        assert!(!reply_matches(&request, &complex_ack_npdu(41, 12)));
        assert!(!reply_matches(&request, &complex_ack_npdu(42, 15)));
        // A fresh request is not a reply to anything.
        assert!(!reply_matches(&request, &confirmed_request_npdu(42, 12)));
    }
}
