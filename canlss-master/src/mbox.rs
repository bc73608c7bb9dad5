//! Receive mailbox shared between the CAN driver and the master

use core::cell::Cell;

use canlss_common::lss::{LssCanId, LSS_RESP_ID};
use critical_section::Mutex;
use defmt_or_log::debug;

/// Mailbox state, kept in one record so every operation is a single short
/// critical section copying the record in and out
#[derive(Clone, Copy)]
struct Shared {
    /// Receive filter; `None` falls back to the default response id
    resp_id: Option<LssCanId>,
    /// True only while the master has a request outstanding
    active: bool,
    /// The single frame slot
    frame: Option<[u8; 8]>,
    /// Count of frames discarded on the response id
    dropped: u32,
    /// Wake callback, fired after a frame is accepted
    notify: Option<&'static (dyn Fn() + Sync)>,
}

/// A single-slot mailbox for LSS response frames
///
/// The structure sits between the receiving context (e.g. a CAN controller
/// IRQ) and the polled [`LssMaster`](crate::LssMaster). Incoming frames are
/// offered to [`store_frame`](LssMasterMbox::store_frame); the master
/// consumes them on its next poll.
///
/// Because the master never has more than one request outstanding, a second
/// frame arriving before the first was consumed cannot be the awaited reply;
/// it is dropped rather than overwriting the slot. Frames arriving while no
/// request is outstanding, and frames shorter than the 8 bytes every LSS
/// service uses, are dropped for the same reason. Dropped frames are counted
/// in a diagnostic counter.
///
/// All state lives behind a `critical_section` mutex, which gives the two
/// orderings the design needs: frame bytes written by the receive path are
/// visible to the poll that observes the slot occupied, and the poll's
/// consumption of the slot happens before the next copy-in. `new` is const
/// so the mailbox can be placed in a static and shared with an interrupt
/// handler.
pub struct LssMasterMbox {
    shared: Mutex<Cell<Shared>>,
}

impl LssMasterMbox {
    /// Create a new mailbox listening on the default response id (0x7E4)
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(Cell::new(Shared {
                resp_id: None,
                active: false,
                frame: None,
                dropped: 0,
                notify: None,
            })),
        }
    }

    /// Run `f` on the shared record inside a critical section
    fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.shared.borrow(cs);
            let mut state = cell.get();
            let result = f(&mut state);
            cell.set(state);
            result
        })
    }

    /// Override the response id this mailbox accepts
    pub fn set_response_id(&self, id: LssCanId) {
        self.with_shared(|s| s.resp_id = Some(id));
    }

    /// The response id this mailbox accepts
    pub fn response_id(&self) -> LssCanId {
        self.with_shared(|s| s.resp_id).unwrap_or(LSS_RESP_ID)
    }

    /// Set a callback to be invoked whenever a frame is accepted
    ///
    /// Use this to wake the task which polls the master. It runs in the
    /// receiving context and must be short. It must be static; where a heap
    /// is available, `Box::leak` can turn a closure into one.
    pub fn set_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.with_shared(|s| s.notify = Some(callback));
    }

    /// Number of frames discarded so far
    ///
    /// Counts frames on the response id that were short, unexpected, or
    /// arrived while the slot was still occupied.
    pub fn dropped_count(&self) -> u32 {
        self.with_shared(|s| s.dropped)
    }

    /// Offer a received frame
    ///
    /// To be called from the receive path for every candidate frame. Returns
    /// false if `id` is not this mailbox's response id, so the caller can
    /// route the frame elsewhere; true means the frame was for this mailbox,
    /// whether it was stored or discarded.
    pub fn store_frame(&self, id: LssCanId, data: &[u8]) -> bool {
        let mut buf = [0u8; 8];
        let full = data.len() == 8;
        if full {
            buf.copy_from_slice(data);
        }

        let mut occupied = false;
        let outcome = self.with_shared(|s| {
            if id != s.resp_id.unwrap_or(LSS_RESP_ID) {
                return Err(false);
            }
            // Not awaiting a reply, or a short frame: discard and count
            if !full || !s.active {
                s.dropped += 1;
                return Err(true);
            }
            if s.frame.is_some() {
                // Slot still occupied; the frame cannot be the awaited reply
                occupied = true;
                s.dropped += 1;
                return Err(true);
            }
            s.frame = Some(buf);
            Ok(s.notify)
        });
        match outcome {
            Ok(notify) => {
                if let Some(cb) = notify {
                    cb();
                }
                true
            }
            Err(mine) => {
                if occupied {
                    debug!("LSS response dropped: mailbox occupied");
                }
                mine
            }
        }
    }

    /// Consume the pending frame, if any
    pub(crate) fn take_frame(&self) -> Option<[u8; 8]> {
        self.with_shared(|s| s.frame.take())
    }

    /// Discard any pending frame
    pub(crate) fn clear(&self) {
        self.with_shared(|s| s.frame = None);
    }

    /// Mark whether a request is outstanding
    ///
    /// While inactive, incoming frames are discarded without being stored.
    pub(crate) fn set_active(&self, active: bool) {
        self.with_shared(|s| s.active = active);
    }
}

impl Default for LssMasterMbox {
    fn default() -> Self {
        Self::new()
    }
}
