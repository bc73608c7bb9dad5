//! The LSS master session and confirmed-service state machines

use canlss_common::{
    lss::{
        BitTiming, InquireCs, LssCanId, LssFrame, LssIdentity, LssMode, LssRequest, LssResponse,
        LSS_REQ_ID,
    },
    traits::CanSender,
    NodeId,
};
use defmt_or_log::debug;
use snafu::Snafu;

use crate::fastscan::FastscanState;
use crate::mbox::LssMasterMbox;

/// Errors returned by the [`LssMaster`] service entry points
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssError {
    /// The expected slave reply did not arrive within the timeout window
    #[snafu(display("Timed out waiting for LSS slave response"))]
    Timeout,
    /// The requested service is not allowed in the current master state, or
    /// another service is already in flight
    #[snafu(display("Service not allowed in current LSS master state"))]
    InvalidState,
    /// An argument is out of range
    #[snafu(display("Illegal argument"))]
    IllegalArgument,
    /// No unconfigured slave responded to the fastscan presence check
    #[snafu(display("No unconfigured slave on the bus"))]
    ScanNoAck,
    /// Fastscan was aborted by an unexpected response or a missing
    /// verification
    #[snafu(display("Fastscan aborted"))]
    ScanFailed,
}

/// Progress of a polled LSS service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LssPoll<T> {
    /// The request is in flight; poll again with the elapsed time
    Pending,
    /// The service completed
    Done(T),
}

impl<T> LssPoll<T> {
    /// Return true while the service is still in flight
    pub fn is_pending(&self) -> bool {
        matches!(self, LssPoll::Pending)
    }
}

/// Outcome reported by a slave in a configuration confirm
///
/// All three variants complete the service; the non-`Ok` grades echo the
/// error byte the slave put in its confirm frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssConfirm {
    /// The slave accepted the request
    Ok,
    /// The slave rejected the request with a manufacturer specific code
    Manufacturer(u8),
    /// The slave rejected the request with a standardized error code
    IllegalArg(u8),
}

impl LssConfirm {
    fn from_codes(error: u8, spec_error: u8) -> Self {
        match error {
            0 => LssConfirm::Ok,
            0xFF => LssConfirm::Manufacturer(spec_error),
            code => LssConfirm::IllegalArg(code),
        }
    }

    /// Return true if the slave accepted the request
    pub fn is_ok(&self) -> bool {
        matches!(self, LssConfirm::Ok)
    }
}

/// Select state of the master session
///
/// Tracked in addition to the slaves' own mode so services which only make
/// sense with one (or all) slaves selected can be refused up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LssMasterState {
    /// No slave is in configuration mode
    Waiting,
    /// Exactly one slave was put into configuration mode
    ConfigSelective,
    /// All slaves were put into configuration mode
    ConfigGlobal,
}

/// Step of the chained identity inquiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InquireStep {
    Vendor,
    Product,
    Revision,
    Serial,
}

/// The service currently awaiting a slave reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    SwitchStateSelect,
    ConfigBitTiming,
    ConfigNodeId,
    ConfigStore,
    InquireIdentity(InquireStep),
    Inquire(InquireCs),
    Fastscan,
}

/// The LSS master
///
/// One instance manages one CAN interface; multiple masters on separate
/// buses are supported by creating one mailbox and master per bus. See the
/// crate docs for the polling contract.
pub struct LssMaster<'a, S> {
    sender: S,
    mbox: &'a LssMasterMbox,
    req_id: LssCanId,
    state: LssMasterState,
    command: Option<Command>,
    timeout_us: u32,
    timeout_timer: u32,
    pub(crate) fastscan: FastscanState,
    inquired: LssIdentity,
}

impl<'a, S: CanSender> LssMaster<'a, S> {
    /// Create a new master
    ///
    /// # Arguments
    /// - `sender`: transmit side of the CAN driver
    /// - `mbox`: the mailbox the receive path stores LSS responses into
    /// - `timeout_ms`: how long to wait for a slave reply. For fastscan this
    ///   also paces the scan, one window per probed bit.
    pub fn new(sender: S, mbox: &'a LssMasterMbox, timeout_ms: u16) -> Self {
        mbox.set_active(false);
        mbox.clear();
        Self {
            sender,
            mbox,
            req_id: LSS_REQ_ID,
            state: LssMasterState::Waiting,
            command: None,
            timeout_us: timeout_ms as u32 * 1000,
            timeout_timer: 0,
            fastscan: FastscanState::new(),
            inquired: LssIdentity::default(),
        }
    }

    /// Override the id request frames are sent on (default 0x7E5)
    pub fn set_request_id(&mut self, id: LssCanId) {
        self.req_id = id;
    }

    /// Change the reply timeout; takes effect from the next request
    pub fn change_timeout(&mut self, timeout_ms: u16) {
        self.timeout_us = timeout_ms as u32 * 1000;
    }

    /// Set a callback fired from the receive path whenever a reply is
    /// accepted, e.g. to wake the polling task
    pub fn set_wake_signal(&self, callback: &'static (dyn Fn() + Sync)) {
        self.mbox.set_notify_callback(callback);
    }

    /// Current select state of the session
    pub fn state(&self) -> LssMasterState {
        self.state
    }

    /// Switch one slave, or all slaves, into configuration mode
    ///
    /// With an identity, the four selective switch frames are emitted and
    /// the matching slave's confirmation is awaited (poll until not
    /// [`LssPoll::Pending`]). Without one, all slaves are switched globally;
    /// no confirmation exists for the global service, so it completes on the
    /// first call.
    pub fn switch_state_select(
        &mut self,
        delta_us: u32,
        identity: Option<&LssIdentity>,
    ) -> Result<LssPoll<()>, LssError> {
        match self.command {
            None if self.state == LssMasterState::Waiting => match identity {
                Some(identity) => {
                    self.state = LssMasterState::ConfigSelective;
                    self.begin(Command::SwitchStateSelect);
                    self.send(LssRequest::SwitchStateVendor {
                        vendor_id: identity.vendor_id,
                    });
                    self.send(LssRequest::SwitchStateProduct {
                        product_code: identity.product_code,
                    });
                    self.send(LssRequest::SwitchStateRevision {
                        revision: identity.revision,
                    });
                    self.send(LssRequest::SwitchStateSerial {
                        serial: identity.serial,
                    });
                    Ok(LssPoll::Pending)
                }
                None => {
                    self.state = LssMasterState::ConfigGlobal;
                    self.send(LssRequest::SwitchModeGlobal {
                        mode: LssMode::Configuring,
                    });
                    Ok(LssPoll::Done(()))
                }
            },
            Some(Command::SwitchStateSelect) => match self.take_reply() {
                Some(LssResponse::SwitchStateAck) => {
                    self.finish();
                    Ok(LssPoll::Done(()))
                }
                _ => self.pending_or_timeout(delta_us),
            },
            _ => Err(LssError::InvalidState),
        }
    }

    /// Switch all slaves back to the waiting mode and reset the session
    ///
    /// Always safe: slaves already waiting ignore the frame, and any command
    /// in flight is abandoned. This is the escape hatch from a stuck
    /// session.
    pub fn switch_state_deselect(&mut self) {
        self.state = LssMasterState::Waiting;
        self.command = None;
        self.timeout_timer = 0;
        self.mbox.set_active(false);
        self.send(LssRequest::SwitchModeGlobal {
            mode: LssMode::Waiting,
        });
    }

    /// Set the bit rate of the selected slave
    ///
    /// `kbit` must be one of the standard table rates (1000, 800, 500, 250,
    /// 125, 50, 20, 10) or 0 for automatic detection. The new rate only
    /// takes effect after [`activate_bit_timing`](Self::activate_bit_timing).
    pub fn configure_bit_timing(
        &mut self,
        delta_us: u32,
        kbit: u16,
    ) -> Result<LssPoll<LssConfirm>, LssError> {
        let timing = BitTiming::from_kbit(kbit).ok_or(LssError::IllegalArgument)?;
        match self.command {
            None => {
                if self.state != LssMasterState::ConfigSelective {
                    return Err(LssError::InvalidState);
                }
                self.begin(Command::ConfigBitTiming);
                self.send(LssRequest::ConfigureBitTiming {
                    table: 0,
                    index: timing.table_index(),
                });
                Ok(LssPoll::Pending)
            }
            Some(Command::ConfigBitTiming) => self.configure_wait(delta_us, |resp| match resp {
                LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                    Some((error, spec_error))
                }
                _ => None,
            }),
            _ => Err(LssError::InvalidState),
        }
    }

    /// Assign a node id to the selected slave
    ///
    /// [`NodeId::Unconfigured`] is only accepted in the globally-switched
    /// state, where it resets every slave on the bus to the unconfigured id
    /// in one request.
    pub fn configure_node_id(
        &mut self,
        delta_us: u32,
        node_id: NodeId,
    ) -> Result<LssPoll<LssConfirm>, LssError> {
        match self.command {
            None => {
                let allowed = match self.state {
                    LssMasterState::ConfigSelective => node_id.is_configured(),
                    LssMasterState::ConfigGlobal => node_id.is_unconfigured(),
                    LssMasterState::Waiting => false,
                };
                if !allowed {
                    return Err(LssError::InvalidState);
                }
                self.begin(Command::ConfigNodeId);
                self.send(LssRequest::ConfigureNodeId {
                    node_id: node_id.raw(),
                });
                Ok(LssPoll::Pending)
            }
            Some(Command::ConfigNodeId) => self.configure_wait(delta_us, |resp| match resp {
                LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                    Some((error, spec_error))
                }
                _ => None,
            }),
            _ => Err(LssError::InvalidState),
        }
    }

    /// Commit the selected slave's pending configuration to its non-volatile
    /// storage
    pub fn configure_store(&mut self, delta_us: u32) -> Result<LssPoll<LssConfirm>, LssError> {
        match self.command {
            None => {
                if self.state != LssMasterState::ConfigSelective {
                    return Err(LssError::InvalidState);
                }
                self.begin(Command::ConfigStore);
                self.send(LssRequest::StoreConfiguration);
                Ok(LssPoll::Pending)
            }
            Some(Command::ConfigStore) => self.configure_wait(delta_us, |resp| match resp {
                LssResponse::StoreConfigurationAck { error, spec_error } => {
                    Some((error, spec_error))
                }
                _ => None,
            }),
            _ => Err(LssError::InvalidState),
        }
    }

    /// Activate the configured bit timing on all slaves
    ///
    /// Non-confirmed; completes synchronously. Only allowed after a global
    /// switch, so that a lone selected slave cannot be moved to a bit rate
    /// the rest of the bus does not share. Each slave pauses `switch_delay_ms`
    /// before and after switching.
    pub fn activate_bit_timing(&mut self, switch_delay_ms: u16) -> Result<(), LssError> {
        if self.state != LssMasterState::ConfigGlobal || self.command.is_some() {
            return Err(LssError::InvalidState);
        }
        self.send(LssRequest::ActivateBitTiming {
            delay_ms: switch_delay_ms,
        });
        Ok(())
    }

    /// Read one identity component, or the active node id, from the
    /// selected slave
    pub fn inquire(&mut self, delta_us: u32, what: InquireCs) -> Result<LssPoll<u32>, LssError> {
        match self.command {
            None => {
                if !self.selected() {
                    return Err(LssError::InvalidState);
                }
                self.begin(Command::Inquire(what));
                self.send(LssRequest::Inquire(what));
                Ok(LssPoll::Pending)
            }
            // The reply is matched against the component captured at
            // initiation, not the current argument
            Some(Command::Inquire(awaiting)) => {
                let value = match (awaiting, self.take_reply()) {
                    (InquireCs::VendorId, Some(LssResponse::InquireVendorReply(v))) => Some(v),
                    (InquireCs::ProductCode, Some(LssResponse::InquireProductReply(v))) => Some(v),
                    (InquireCs::RevisionNumber, Some(LssResponse::InquireRevisionReply(v))) => {
                        Some(v)
                    }
                    (InquireCs::SerialNumber, Some(LssResponse::InquireSerialReply(v))) => Some(v),
                    (InquireCs::NodeId, Some(LssResponse::InquireNodeIdReply(id))) => {
                        Some(id as u32)
                    }
                    _ => None,
                };
                match value {
                    Some(v) => {
                        self.finish();
                        Ok(LssPoll::Done(v))
                    }
                    None => self.pending_or_timeout(delta_us),
                }
            }
            _ => Err(LssError::InvalidState),
        }
    }

    /// Read the full 128-bit identity of the selected slave
    ///
    /// Chains the four component inquiries (vendor, product, revision,
    /// serial) behind a single poll point.
    pub fn inquire_identity(&mut self, delta_us: u32) -> Result<LssPoll<LssIdentity>, LssError> {
        match self.command {
            None => {
                if !self.selected() {
                    return Err(LssError::InvalidState);
                }
                self.inquired = LssIdentity::default();
                self.begin(Command::InquireIdentity(InquireStep::Vendor));
                self.send(LssRequest::Inquire(InquireCs::VendorId));
                Ok(LssPoll::Pending)
            }
            Some(Command::InquireIdentity(step)) => {
                let value = match (step, self.take_reply()) {
                    (InquireStep::Vendor, Some(LssResponse::InquireVendorReply(v))) => Some(v),
                    (InquireStep::Product, Some(LssResponse::InquireProductReply(v))) => Some(v),
                    (InquireStep::Revision, Some(LssResponse::InquireRevisionReply(v))) => Some(v),
                    (InquireStep::Serial, Some(LssResponse::InquireSerialReply(v))) => Some(v),
                    _ => None,
                };
                let Some(value) = value else {
                    return self.pending_or_timeout(delta_us);
                };
                match step {
                    InquireStep::Vendor => {
                        self.inquired.vendor_id = value;
                        self.next_inquiry(InquireStep::Product, InquireCs::ProductCode);
                        Ok(LssPoll::Pending)
                    }
                    InquireStep::Product => {
                        self.inquired.product_code = value;
                        self.next_inquiry(InquireStep::Revision, InquireCs::RevisionNumber);
                        Ok(LssPoll::Pending)
                    }
                    InquireStep::Revision => {
                        self.inquired.revision = value;
                        self.next_inquiry(InquireStep::Serial, InquireCs::SerialNumber);
                        Ok(LssPoll::Pending)
                    }
                    InquireStep::Serial => {
                        self.inquired.serial = value;
                        self.finish();
                        Ok(LssPoll::Done(self.inquired))
                    }
                }
            }
            _ => Err(LssError::InvalidState),
        }
    }

    fn next_inquiry(&mut self, step: InquireStep, what: InquireCs) {
        self.command = Some(Command::InquireIdentity(step));
        self.timeout_timer = 0;
        self.send(LssRequest::Inquire(what));
    }

    fn selected(&self) -> bool {
        matches!(
            self.state,
            LssMasterState::ConfigSelective | LssMasterState::ConfigGlobal
        )
    }

    /// Common wait path of the three configure services
    fn configure_wait(
        &mut self,
        delta_us: u32,
        matcher: fn(LssResponse) -> Option<(u8, u8)>,
    ) -> Result<LssPoll<LssConfirm>, LssError> {
        match self.take_reply().and_then(matcher) {
            Some((error, spec_error)) => {
                self.finish();
                Ok(LssPoll::Done(LssConfirm::from_codes(error, spec_error)))
            }
            None => self.pending_or_timeout(delta_us),
        }
    }

    /// Advance the timeout clock; report Pending until the window expires
    fn pending_or_timeout<T>(&mut self, delta_us: u32) -> Result<LssPoll<T>, LssError> {
        if self.check_timeout(delta_us) {
            debug!("LSS request timed out");
            Err(self.fail(LssError::Timeout))
        } else {
            Ok(LssPoll::Pending)
        }
    }

    /// Accumulate elapsed time; true once per expired window
    pub(crate) fn check_timeout(&mut self, delta_us: u32) -> bool {
        self.timeout_timer = self.timeout_timer.saturating_add(delta_us);
        if self.timeout_timer >= self.timeout_us {
            self.timeout_timer = 0;
            true
        } else {
            false
        }
    }

    /// Stamp a new in-flight command and start its timeout window
    pub(crate) fn begin(&mut self, command: Command) {
        self.command = Some(command);
        self.timeout_timer = 0;
        self.mbox.set_active(true);
    }

    /// Clear the in-flight command after a completed service
    pub(crate) fn finish(&mut self) {
        self.command = None;
        self.timeout_timer = 0;
        self.mbox.set_active(false);
        self.mbox.clear();
    }

    /// Abort the in-flight command; errors always drop the session back to
    /// the waiting state (the slave side reverts on timeout as well)
    pub(crate) fn fail(&mut self, err: LssError) -> LssError {
        self.finish();
        self.state = LssMasterState::Waiting;
        err
    }

    /// Consume the mailbox frame, if any, decoded
    ///
    /// A frame that does not decode to a known response is discarded; the
    /// caller keeps waiting and the timeout clock keeps running, exactly as
    /// for a decodable reply to some other service.
    fn take_reply(&mut self) -> Option<LssResponse> {
        let data = self.mbox.take_frame()?;
        match LssResponse::try_from(&data[..]) {
            Ok(resp) => Some(resp),
            Err(_) => {
                debug!("Discarding undecodable LSS response, cs {}", data[0]);
                None
            }
        }
    }

    /// Consume the mailbox frame raw; fastscan needs to distinguish silence
    /// from a foreign command specifier
    pub(crate) fn take_raw_frame(&mut self) -> Option<[u8; 8]> {
        self.mbox.take_frame()
    }

    /// Emit a request, discarding any stale reply first
    pub(crate) fn send(&mut self, req: LssRequest) {
        self.mbox.clear();
        let frame = LssFrame {
            id: self.req_id,
            data: req.to_bytes(),
        };
        if self.sender.send(frame).is_err() {
            debug!("CAN driver rejected LSS request");
        }
    }

    /// Emit a fastscan request and restart the response window
    pub(crate) fn send_fastscan(&mut self, id: u32, bit_check: u8, sub: u8, next: u8) {
        self.timeout_timer = 0;
        self.send(LssRequest::FastScan {
            id,
            bit_check,
            sub,
            next,
        });
    }

    pub(crate) fn command(&self) -> Option<Command> {
        self.command
    }

    pub(crate) fn set_state(&mut self, state: LssMasterState) {
        self.state = state;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use canlss_common::lss::LSS_RESP_ID;
    use std::cell::RefCell;
    use std::rc::Rc;

    pub(crate) struct FrameLog(pub Rc<RefCell<Vec<LssFrame>>>);

    impl CanSender for FrameLog {
        fn send(&mut self, frame: LssFrame) -> Result<(), LssFrame> {
            self.0.borrow_mut().push(frame);
            Ok(())
        }
    }

    pub(crate) fn setup(
        mbox: &LssMasterMbox,
        timeout_ms: u16,
    ) -> (LssMaster<'_, FrameLog>, Rc<RefCell<Vec<LssFrame>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let master = LssMaster::new(FrameLog(log.clone()), mbox, timeout_ms);
        (master, log)
    }

    pub(crate) fn inject(mbox: &LssMasterMbox, resp: LssResponse) {
        assert!(mbox.store_frame(LSS_RESP_ID, &resp.to_bytes()));
    }

    #[test]
    fn selective_switch_emits_four_frames_and_completes() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);
        let identity = LssIdentity::new(0x11223344, 2, 3, 4);

        assert_eq!(
            master.switch_state_select(0, Some(&identity)),
            Ok(LssPoll::Pending)
        );
        {
            let frames = log.borrow();
            assert_eq!(frames.len(), 4);
            assert_eq!(frames[0].data, [0x40, 0x11, 0x22, 0x33, 0x44, 0, 0, 0]);
            assert_eq!(frames[1].data[0], 0x41);
            assert_eq!(frames[2].data[0], 0x42);
            assert_eq!(frames[3].data, [0x43, 0, 0, 0, 4, 0, 0, 0]);
            assert!(frames.iter().all(|f| f.id == LSS_REQ_ID));
        }

        inject(&mbox, LssResponse::SwitchStateAck);
        assert_eq!(
            master.switch_state_select(1000, Some(&identity)),
            Ok(LssPoll::Done(()))
        );
        assert_eq!(master.state(), LssMasterState::ConfigSelective);
    }

    #[test]
    fn selective_switch_timeout_reverts_to_waiting() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 1);
        let identity = LssIdentity::new(1, 2, 3, 4);

        let _ = master.switch_state_select(0, Some(&identity)).unwrap();
        assert_eq!(
            master.switch_state_select(999, Some(&identity)),
            Ok(LssPoll::Pending)
        );
        assert_eq!(
            master.switch_state_select(1, Some(&identity)),
            Err(LssError::Timeout)
        );
        assert_eq!(master.state(), LssMasterState::Waiting);
        assert_eq!(master.command(), None);
    }

    #[test]
    fn global_switch_completes_synchronously() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        assert_eq!(master.switch_state_select(0, None), Ok(LssPoll::Done(())));
        assert_eq!(master.state(), LssMasterState::ConfigGlobal);
        assert_eq!(log.borrow()[0].data, [0x04, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn deselect_is_idempotent() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        let _ = master.switch_state_select(0, None).unwrap();
        master.switch_state_deselect();
        master.switch_state_deselect();
        assert_eq!(master.state(), LssMasterState::Waiting);

        let frames = log.borrow();
        let deselects: Vec<_> = frames
            .iter()
            .filter(|f| f.data == [0x04, 0x00, 0, 0, 0, 0, 0, 0])
            .collect();
        assert_eq!(deselects.len(), 2);
    }

    #[test]
    fn configure_guards_reject_without_selection() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        assert_eq!(
            master.configure_bit_timing(0, 500),
            Err(LssError::InvalidState)
        );
        assert_eq!(
            master.configure_node_id(0, NodeId::new(5).unwrap()),
            Err(LssError::InvalidState)
        );
        assert_eq!(master.configure_store(0), Err(LssError::InvalidState));
        assert_eq!(master.activate_bit_timing(100), Err(LssError::InvalidState));
        // Nothing was transmitted
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn activate_bit_timing_requires_global_switch() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        let _ = master.switch_state_select(0, None).unwrap();
        assert_eq!(master.activate_bit_timing(100), Ok(()));
        let frames = log.borrow();
        assert_eq!(frames.last().unwrap().data, [0x15, 0, 0x64, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_bit_rate_is_rejected_before_transmitting() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);
        let _ = master.switch_state_select(0, None).unwrap();
        log.borrow_mut().clear();

        assert_eq!(
            master.configure_bit_timing(0, 123),
            Err(LssError::IllegalArgument)
        );
        assert!(log.borrow().is_empty());
        // The session is untouched by an argument error
        assert_eq!(master.state(), LssMasterState::ConfigGlobal);
    }

    #[test]
    fn mismatched_reply_is_discarded_until_timeout() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 1);
        let identity = LssIdentity::new(1, 2, 3, 4);

        let _ = master.switch_state_select(0, Some(&identity)).unwrap();
        inject(&mbox, LssResponse::SwitchStateAck);
        let _ = master.switch_state_select(100, Some(&identity)).unwrap();
        assert_eq!(master.state(), LssMasterState::ConfigSelective);

        // Awaiting a node id confirm; an inquire reply must not satisfy it
        let _ = master.configure_node_id(0, NodeId::new(0x10).unwrap()).unwrap();
        inject(&mbox, LssResponse::InquireVendorReply(0x1234));
        assert_eq!(
            master.configure_node_id(500, NodeId::new(0x10).unwrap()),
            Ok(LssPoll::Pending)
        );
        assert_eq!(
            master.configure_node_id(500, NodeId::new(0x10).unwrap()),
            Err(LssError::Timeout)
        );
    }

    #[test]
    fn second_service_is_refused_while_first_in_flight() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);
        let identity = LssIdentity::new(1, 2, 3, 4);

        let _ = master.switch_state_select(0, Some(&identity)).unwrap();
        let frames_before = log.borrow().len();
        assert_eq!(master.configure_store(0), Err(LssError::InvalidState));
        assert_eq!(master.inquire(0, InquireCs::VendorId), Err(LssError::InvalidState));
        assert_eq!(log.borrow().len(), frames_before);

        // The refused calls must not have disturbed the in-flight select
        inject(&mbox, LssResponse::SwitchStateAck);
        assert_eq!(
            master.switch_state_select(0, Some(&identity)),
            Ok(LssPoll::Done(()))
        );
    }

    #[test]
    fn node_id_confirm_grades() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);
        let identity = LssIdentity::new(1, 2, 3, 4);
        let node_id = NodeId::new(0x10).unwrap();

        for (error, spec_error, expected) in [
            (0x00, 0x00, LssConfirm::Ok),
            (0xFF, 0x42, LssConfirm::Manufacturer(0x42)),
            (0x01, 0x00, LssConfirm::IllegalArg(0x01)),
        ] {
            master.switch_state_deselect();
            let _ = master.switch_state_select(0, Some(&identity)).unwrap();
            inject(&mbox, LssResponse::SwitchStateAck);
            let _ = master.switch_state_select(0, Some(&identity)).unwrap();

            let _ = master.configure_node_id(0, node_id).unwrap();
            inject(&mbox, LssResponse::ConfigureNodeIdAck { error, spec_error });
            assert_eq!(
                master.configure_node_id(0, node_id),
                Ok(LssPoll::Done(expected))
            );
        }
    }

    #[test]
    fn global_node_id_reset_allowed_unconfigured_only() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);

        let _ = master.switch_state_select(0, None).unwrap();
        assert_eq!(
            master.configure_node_id(0, NodeId::new(5).unwrap()),
            Err(LssError::InvalidState)
        );
        assert_eq!(
            master.configure_node_id(0, NodeId::Unconfigured),
            Ok(LssPoll::Pending)
        );
    }

    #[test]
    fn selected_slave_cannot_be_unconfigured() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);
        let identity = LssIdentity::new(1, 2, 3, 4);

        let _ = master.switch_state_select(0, Some(&identity)).unwrap();
        inject(&mbox, LssResponse::SwitchStateAck);
        let _ = master.switch_state_select(0, Some(&identity)).unwrap();

        assert_eq!(
            master.configure_node_id(0, NodeId::Unconfigured),
            Err(LssError::InvalidState)
        );
    }

    #[test]
    fn timeout_fires_exactly_at_window() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 5);
        let identity = LssIdentity::new(1, 2, 3, 4);

        let _ = master.switch_state_select(0, Some(&identity)).unwrap();
        // 5 ms window; stay just under it
        for _ in 0..4 {
            assert_eq!(
                master.switch_state_select(999, Some(&identity)),
                Ok(LssPoll::Pending)
            );
        }
        assert_eq!(
            master.switch_state_select(1003, Some(&identity)),
            Ok(LssPoll::Pending)
        );
        assert_eq!(
            master.switch_state_select(1, Some(&identity)),
            Err(LssError::Timeout)
        );
    }

    #[test]
    fn inquire_chain_assembles_identity() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);
        let _ = master.switch_state_select(0, None).unwrap();

        let mut result = master.inquire_identity(0).unwrap();
        for resp in [
            LssResponse::InquireVendorReply(0xA),
            LssResponse::InquireProductReply(0xB),
            LssResponse::InquireRevisionReply(0xC),
            LssResponse::InquireSerialReply(0xD),
        ] {
            assert!(result.is_pending());
            inject(&mbox, resp);
            result = master.inquire_identity(100).unwrap();
        }
        assert_eq!(result, LssPoll::Done(LssIdentity::new(0xA, 0xB, 0xC, 0xD)));
    }

    #[test]
    fn inquire_node_id_widens_byte() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);
        let _ = master.switch_state_select(0, None).unwrap();

        let _ = master.inquire(0, InquireCs::NodeId).unwrap();
        inject(&mbox, LssResponse::InquireNodeIdReply(0x21));
        assert_eq!(master.inquire(0, InquireCs::NodeId), Ok(LssPoll::Done(0x21)));
    }
}
