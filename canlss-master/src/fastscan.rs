//! The fastscan identification engine
//!
//! Fastscan determines the 128-bit identity of a single unconfigured slave
//! by binary search, 32 bits at a time. Each probe carries a candidate value
//! and a bit index; slaves whose identity matches the candidate above that
//! bit acknowledge, and silence proves the probed bit is set. The end of the
//! response window is therefore a data point, not a failure: the engine
//! always sits out the full window before reading the verdict.

use canlss_common::{
    lss::{
        LssCommandSpecifier, LssIdentity, LSS_FASTSCAN_CONFIRM, LSS_SUB_VENDOR,
    },
    traits::CanSender,
};
use defmt_or_log::debug;

use crate::master::{Command, LssError, LssMaster, LssMasterState, LssPoll};

/// What to do with one component of the address during a fastscan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FastscanDirective {
    /// Binary-search the component on the bus
    Scan,
    /// Take this value as given, skipping the search but still verifying it
    /// against the slave
    Match(u32),
    /// Leave the component out of the selection entirely
    Skip,
}

/// Directives for the four address components, indexed vendor id, product
/// code, revision number, serial number
///
/// The vendor id must not be skipped, and at least two components must
/// participate, otherwise the selection would be ambiguous.
pub type FastscanPlan = [FastscanDirective; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastscanPhase {
    Check,
    Scan,
    Verify,
}

/// Progress of an in-flight fastscan
#[derive(Debug, Clone, Copy)]
pub(crate) struct FastscanState {
    phase: FastscanPhase,
    /// Candidate value of the component currently being determined
    id_number: u32,
    /// Bit probed by the outstanding request, counting down from 31
    bit_checked: u8,
    /// Component currently being determined
    sub: usize,
    /// Verified components
    found: [u32; 4],
}

impl FastscanState {
    pub(crate) fn new() -> Self {
        Self {
            phase: FastscanPhase::Check,
            id_number: 0,
            bit_checked: 0,
            sub: LSS_SUB_VENDOR,
            found: [0; 4],
        }
    }
}

impl<S: CanSender> LssMaster<'_, S> {
    /// Identify a single unconfigured slave and select it
    ///
    /// Runs the fastscan procedure: a presence check, then per component of
    /// `plan` a 32-step binary search (or the caller's `Match` value) and a
    /// verification which moves the slave's own sub-state machine forward in
    /// lockstep. One poll performs at most one phase step, and each emitted
    /// probe consumes a full response window, so a complete scan of all four
    /// components takes 133 windows.
    ///
    /// On completion the identified slave is in configuration mode, the
    /// session behaves as after a successful selective switch, and the
    /// verified identity is returned (skipped components read as zero).
    ///
    /// `plan` must be the same on every poll of one scan.
    pub fn identify_fastscan(
        &mut self,
        delta_us: u32,
        plan: &FastscanPlan,
    ) -> Result<LssPoll<LssIdentity>, LssError> {
        if plan[LSS_SUB_VENDOR] == FastscanDirective::Skip {
            return Err(LssError::IllegalArgument);
        }
        let skips = plan
            .iter()
            .filter(|d| matches!(d, FastscanDirective::Skip))
            .count();
        if skips > 2 {
            return Err(LssError::IllegalArgument);
        }

        match self.command() {
            None => {
                if self.state() != LssMasterState::Waiting {
                    return Err(LssError::InvalidState);
                }
                self.begin(Command::Fastscan);
                self.fastscan = FastscanState::new();
                // Reset all unconfigured slaves' scan machines; any
                // acknowledgment proves at least one is listening
                self.send_fastscan(0, LSS_FASTSCAN_CONFIRM, 0, 0);
                Ok(LssPoll::Pending)
            }
            Some(Command::Fastscan) => {
                if !self.check_timeout(delta_us) {
                    return Ok(LssPoll::Pending);
                }
                // Window expired; read the verdict. Some(true) is the
                // acknowledgment, Some(false) a foreign command specifier,
                // None silence.
                let ack = self
                    .take_raw_frame()
                    .map(|data| data[0] == LssCommandSpecifier::IdentifySlave as u8);
                self.fastscan_step(ack, plan)
            }
            Some(_) => Err(LssError::InvalidState),
        }
    }

    fn fastscan_step(
        &mut self,
        ack: Option<bool>,
        plan: &FastscanPlan,
    ) -> Result<LssPoll<LssIdentity>, LssError> {
        match self.fastscan.phase {
            FastscanPhase::Check => match ack {
                Some(true) => {
                    self.fastscan.found = [0; 4];
                    self.scan_initiate(plan, LSS_SUB_VENDOR)
                }
                _ => Err(self.fail(LssError::ScanNoAck)),
            },
            FastscanPhase::Scan => match ack {
                Some(false) => {
                    debug!("Fastscan: unexpected response during bit scan");
                    Err(self.fail(LssError::ScanFailed))
                }
                _ => {
                    if ack.is_none() {
                        // Silence refutes the candidate; the probed bit is set
                        self.fastscan.id_number |= 1u32 << self.fastscan.bit_checked;
                    }
                    if self.fastscan.bit_checked == 0 {
                        // All 32 bits determined
                        self.verify_initiate(plan, self.fastscan.id_number)
                    } else {
                        self.fastscan.bit_checked -= 1;
                        let sub = self.fastscan.sub as u8;
                        self.send_fastscan(
                            self.fastscan.id_number,
                            self.fastscan.bit_checked,
                            sub,
                            sub,
                        );
                        Ok(LssPoll::Pending)
                    }
                }
            },
            FastscanPhase::Verify => match ack {
                Some(true) => {
                    self.fastscan.found[self.fastscan.sub] = self.fastscan.id_number;
                    let next = self.next_sub(plan);
                    if next == LSS_SUB_VENDOR {
                        // No components remain; the verification frame has
                        // switched the slave into configuration mode
                        self.set_state(LssMasterState::ConfigSelective);
                        self.finish();
                        let found = self.fastscan.found;
                        Ok(LssPoll::Done(LssIdentity::new(
                            found[0], found[1], found[2], found[3],
                        )))
                    } else {
                        self.scan_initiate(plan, next)
                    }
                }
                _ => {
                    debug!("Fastscan: verification of component {} failed", self.fastscan.sub as u8);
                    Err(self.fail(LssError::ScanFailed))
                }
            },
        }
    }

    /// Start determining one component, per its directive
    fn scan_initiate(
        &mut self,
        plan: &FastscanPlan,
        sub: usize,
    ) -> Result<LssPoll<LssIdentity>, LssError> {
        self.fastscan.sub = sub;
        self.fastscan.id_number = 0;
        match plan[sub] {
            FastscanDirective::Scan => {
                self.fastscan.phase = FastscanPhase::Scan;
                self.fastscan.bit_checked = 31;
                self.send_fastscan(0, 31, sub as u8, sub as u8);
                Ok(LssPoll::Pending)
            }
            FastscanDirective::Match(value) => self.verify_initiate(plan, value),
            FastscanDirective::Skip => Err(self.fail(LssError::ScanFailed)),
        }
    }

    /// Probe the completed candidate and ask matching slaves to move on to
    /// the next component
    fn verify_initiate(
        &mut self,
        plan: &FastscanPlan,
        value: u32,
    ) -> Result<LssPoll<LssIdentity>, LssError> {
        self.fastscan.id_number = value;
        self.fastscan.phase = FastscanPhase::Verify;
        self.fastscan.bit_checked = 0;
        let next = self.next_sub(plan);
        self.send_fastscan(value, 0, self.fastscan.sub as u8, next as u8);
        Ok(LssPoll::Pending)
    }

    /// The next participating component after the current one; the vendor id
    /// index doubles as the "none remain" marker
    fn next_sub(&self, plan: &FastscanPlan) -> usize {
        ((self.fastscan.sub + 1)..4)
            .find(|&i| plan[i] != FastscanDirective::Skip)
            .unwrap_or(LSS_SUB_VENDOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::tests::{inject, setup};
    use crate::mbox::LssMasterMbox;
    use canlss_common::lss::LssResponse;

    const WINDOW_US: u32 = 10_000;
    const ALL_SCAN: FastscanPlan = [FastscanDirective::Scan; 4];

    #[test]
    fn directive_validation() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        let vendor_skipped = [
            FastscanDirective::Skip,
            FastscanDirective::Scan,
            FastscanDirective::Scan,
            FastscanDirective::Scan,
        ];
        assert_eq!(
            master.identify_fastscan(0, &vendor_skipped),
            Err(LssError::IllegalArgument)
        );

        let too_many_skips = [
            FastscanDirective::Scan,
            FastscanDirective::Skip,
            FastscanDirective::Skip,
            FastscanDirective::Skip,
        ];
        assert_eq!(
            master.identify_fastscan(0, &too_many_skips),
            Err(LssError::IllegalArgument)
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn requires_waiting_state() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);
        let _ = master.switch_state_select(0, None).unwrap();
        assert_eq!(
            master.identify_fastscan(0, &ALL_SCAN),
            Err(LssError::InvalidState)
        );
    }

    #[test]
    fn silent_bus_reports_noack() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        assert_eq!(master.identify_fastscan(0, &ALL_SCAN), Ok(LssPoll::Pending));
        assert_eq!(log.borrow()[0].data, [0x51, 0, 0, 0, 0, 0x80, 0, 0]);
        assert_eq!(
            master.identify_fastscan(WINDOW_US / 2, &ALL_SCAN),
            Ok(LssPoll::Pending)
        );
        assert_eq!(
            master.identify_fastscan(WINDOW_US / 2, &ALL_SCAN),
            Err(LssError::ScanNoAck)
        );
        // Only the presence check was emitted, and the session is reusable
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(master.state(), LssMasterState::Waiting);
        assert_eq!(master.identify_fastscan(0, &ALL_SCAN), Ok(LssPoll::Pending));
    }

    #[test]
    fn foreign_reply_during_scan_fails() {
        let mbox = LssMasterMbox::new();
        let (mut master, _log) = setup(&mbox, 10);

        let _ = master.identify_fastscan(0, &ALL_SCAN).unwrap();
        inject(&mbox, LssResponse::IdentifySlave);
        // Check passed, first scan probe is out
        let _ = master.identify_fastscan(WINDOW_US, &ALL_SCAN).unwrap();

        inject(
            &mbox,
            LssResponse::ConfigureNodeIdAck {
                error: 0,
                spec_error: 0,
            },
        );
        assert_eq!(
            master.identify_fastscan(WINDOW_US, &ALL_SCAN),
            Err(LssError::ScanFailed)
        );
        assert_eq!(master.state(), LssMasterState::Waiting);
    }

    #[test]
    fn silent_verification_fails() {
        let mbox = LssMasterMbox::new();
        let (mut master, log) = setup(&mbox, 10);

        // Match directives go straight to verification of the given values
        let plan = [
            FastscanDirective::Match(0xDEAD_BEEF),
            FastscanDirective::Match(0x0000_0001),
            FastscanDirective::Skip,
            FastscanDirective::Skip,
        ];
        let _ = master.identify_fastscan(0, &plan).unwrap();
        inject(&mbox, LssResponse::IdentifySlave);
        let _ = master.identify_fastscan(WINDOW_US, &plan).unwrap();
        assert_eq!(
            log.borrow().last().unwrap().data,
            [0x51, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 1]
        );

        assert_eq!(
            master.identify_fastscan(WINDOW_US, &plan),
            Err(LssError::ScanFailed)
        );
    }
}
