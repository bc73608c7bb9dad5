//! A synchronous simulated CAN bus
//!
//! Frames sent by the master are delivered to every attached slave in order;
//! slave responses are stored into the master's mailbox the way a receive
//! interrupt would. Every master frame is also logged so tests can assert on
//! the exact wire transcript.

use std::cell::RefCell;
use std::rc::Rc;

use canlss_common::{
    lss::{LssFrame, LssRequest, LSS_RESP_ID},
    traits::CanSender,
};
use canlss_master::LssMasterMbox;

use crate::sim_slave::SimSlave;

/// A bus connecting one LSS master to a set of simulated slaves
pub struct SimBus<'a> {
    slaves: Rc<RefCell<Vec<SimSlave>>>,
    log: Rc<RefCell<Vec<LssFrame>>>,
    mbox: &'a LssMasterMbox,
}

impl<'a> SimBus<'a> {
    /// Create a bus delivering slave responses into `mbox`
    pub fn new(mbox: &'a LssMasterMbox, slaves: Vec<SimSlave>) -> Self {
        Self {
            slaves: Rc::new(RefCell::new(slaves)),
            log: Rc::new(RefCell::new(Vec::new())),
            mbox,
        }
    }

    /// Create the sender handle to construct the master with
    pub fn sender(&self) -> SimBusSender<'a> {
        SimBusSender {
            slaves: self.slaves.clone(),
            log: self.log.clone(),
            mbox: self.mbox,
        }
    }

    /// Inspect a slave
    pub fn slave<R>(&self, idx: usize, f: impl FnOnce(&SimSlave) -> R) -> R {
        f(&self.slaves.borrow()[idx])
    }

    /// Mutate a slave, e.g. to inject confirm error codes
    pub fn slave_mut<R>(&self, idx: usize, f: impl FnOnce(&mut SimSlave) -> R) -> R {
        f(&mut self.slaves.borrow_mut()[idx])
    }

    /// All frames the master has sent so far
    pub fn sent_frames(&self) -> Vec<LssFrame> {
        self.log.borrow().clone()
    }

    /// Drain the transcript
    pub fn take_frames(&self) -> Vec<LssFrame> {
        self.log.borrow_mut().drain(..).collect()
    }
}

/// The master-side transmit handle of a [`SimBus`]
pub struct SimBusSender<'a> {
    slaves: Rc<RefCell<Vec<SimSlave>>>,
    log: Rc<RefCell<Vec<LssFrame>>>,
    mbox: &'a LssMasterMbox,
}

impl CanSender for SimBusSender<'_> {
    fn send(&mut self, frame: LssFrame) -> Result<(), LssFrame> {
        self.log.borrow_mut().push(frame);
        if let Ok(req) = LssRequest::try_from(&frame.data[..]) {
            for slave in self.slaves.borrow_mut().iter_mut() {
                if let Some(resp) = slave.handle_request(req) {
                    // When several slaves answer, the mailbox keeps the
                    // first response and counts the rest as dropped
                    self.mbox.store_frame(LSS_RESP_ID, &resp.to_bytes());
                }
            }
        }
        Ok(())
    }
}
