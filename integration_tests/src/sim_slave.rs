//! A simulated LSS slave for exercising the master end-to-end

use canlss_common::lss::{
    InquireCs, LssIdentity, LssMode, LssRequest, LssResponse, LSS_FASTSCAN_CONFIRM,
};

/// A bus-attached LSS slave
///
/// Implements the slave half of the services the master drives: global and
/// selective mode switching, fastscan participation, the configuration
/// confirms, and identity inquiry. Confirm error codes can be injected per
/// service to exercise the master's error reporting.
pub struct SimSlave {
    identity: LssIdentity,
    mode: LssMode,
    /// How many leading components of a selective switch have matched
    select_progress: u8,
    /// The component this slave expects the next fastscan request to probe
    fastscan_sub: u8,
    node_id: Option<u8>,
    bit_timing: Option<(u8, u8)>,
    stored: bool,
    activate_delay: Option<u16>,
    /// (error, spec_error) returned in configure-node-id confirms
    pub node_id_reply: (u8, u8),
    /// (error, spec_error) returned in configure-bit-timing confirms
    pub bit_timing_reply: (u8, u8),
    /// (error, spec_error) returned in store confirms
    pub store_reply: (u8, u8),
}

impl SimSlave {
    /// Create an unconfigured slave with the given identity
    pub fn new(identity: LssIdentity) -> Self {
        Self {
            identity,
            mode: LssMode::Waiting,
            select_progress: 0,
            fastscan_sub: 0,
            node_id: None,
            bit_timing: None,
            stored: false,
            activate_delay: None,
            node_id_reply: (0, 0),
            bit_timing_reply: (0, 0),
            store_reply: (0, 0),
        }
    }

    pub fn identity(&self) -> LssIdentity {
        self.identity
    }

    pub fn mode(&self) -> LssMode {
        self.mode
    }

    pub fn node_id(&self) -> Option<u8> {
        self.node_id
    }

    pub fn bit_timing(&self) -> Option<(u8, u8)> {
        self.bit_timing
    }

    pub fn stored(&self) -> bool {
        self.stored
    }

    pub fn activate_delay(&self) -> Option<u16> {
        self.activate_delay
    }

    /// Process a request from the master, producing the slave's response if
    /// the service is confirmed and this slave is addressed
    pub fn handle_request(&mut self, request: LssRequest) -> Option<LssResponse> {
        match request {
            LssRequest::SwitchModeGlobal { mode } => {
                self.mode = mode;
                self.select_progress = 0;
                self.fastscan_sub = 0;
                None
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.select_progress =
                    (self.mode == LssMode::Waiting && vendor_id == self.identity.vendor_id) as u8;
                None
            }
            LssRequest::SwitchStateProduct { product_code } => {
                self.select_progress =
                    if self.select_progress == 1 && product_code == self.identity.product_code {
                        2
                    } else {
                        0
                    };
                None
            }
            LssRequest::SwitchStateRevision { revision } => {
                self.select_progress =
                    if self.select_progress == 2 && revision == self.identity.revision {
                        3
                    } else {
                        0
                    };
                None
            }
            LssRequest::SwitchStateSerial { serial } => {
                let matched = self.select_progress == 3 && serial == self.identity.serial;
                self.select_progress = 0;
                if matched {
                    self.mode = LssMode::Configuring;
                    Some(LssResponse::SwitchStateAck)
                } else {
                    None
                }
            }
            LssRequest::ConfigureNodeId { node_id } => {
                if self.mode != LssMode::Configuring {
                    return None;
                }
                let (error, spec_error) = self.node_id_reply;
                if error == 0 {
                    self.node_id = (node_id != 255).then_some(node_id);
                }
                Some(LssResponse::ConfigureNodeIdAck { error, spec_error })
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                if self.mode != LssMode::Configuring {
                    return None;
                }
                let (error, spec_error) = self.bit_timing_reply;
                if error == 0 {
                    self.bit_timing = Some((table, index));
                }
                Some(LssResponse::ConfigureBitTimingAck { error, spec_error })
            }
            LssRequest::ActivateBitTiming { delay_ms } => {
                self.activate_delay = Some(delay_ms);
                None
            }
            LssRequest::StoreConfiguration => {
                if self.mode != LssMode::Configuring {
                    return None;
                }
                let (error, spec_error) = self.store_reply;
                if error == 0 {
                    self.stored = true;
                }
                Some(LssResponse::StoreConfigurationAck { error, spec_error })
            }
            LssRequest::Inquire(what) => {
                if self.mode != LssMode::Configuring {
                    return None;
                }
                Some(match what {
                    InquireCs::VendorId => {
                        LssResponse::InquireVendorReply(self.identity.vendor_id)
                    }
                    InquireCs::ProductCode => {
                        LssResponse::InquireProductReply(self.identity.product_code)
                    }
                    InquireCs::RevisionNumber => {
                        LssResponse::InquireRevisionReply(self.identity.revision)
                    }
                    InquireCs::SerialNumber => {
                        LssResponse::InquireSerialReply(self.identity.serial)
                    }
                    InquireCs::NodeId => {
                        LssResponse::InquireNodeIdReply(self.node_id.unwrap_or(255))
                    }
                })
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                // Only unconfigured slaves in the waiting mode participate
                if self.mode != LssMode::Waiting || self.node_id.is_some() {
                    return None;
                }
                if bit_check == LSS_FASTSCAN_CONFIRM {
                    self.fastscan_sub = 0;
                    return Some(LssResponse::IdentifySlave);
                }
                if bit_check >= 32 || sub > 3 || self.fastscan_sub != sub {
                    return None;
                }
                let mask = 0xFFFF_FFFFu32 << bit_check;
                if self.identity.by_sub(sub) & mask == id & mask {
                    self.fastscan_sub = next;
                    if bit_check == 0 && next < sub {
                        // Scan complete over all participating components
                        self.mode = LssMode::Configuring;
                    }
                    Some(LssResponse::IdentifySlave)
                } else {
                    None
                }
            }
        }
    }
}
