//! A nonblocking LSS (CiA 305) master
//!
//! LSS is the CANopen service suite for assigning node ids and bit rates to
//! slaves over the bus, addressed by their 128-bit identity instead of a
//! node id. This crate implements the master side as a set of polled state
//! machines suitable for microcontrollers: no heap allocation, no blocking
//! waits, `no_std` by default.
//!
//! # Usage
//!
//! Create an [`LssMasterMbox`] where the CAN receive path (typically the
//! receive interrupt) can reach it, and offer every frame received on the
//! LSS response id to [`LssMasterMbox::store_frame`]. Construct an
//! [`LssMaster`] with a [`CanSender`](common::traits::CanSender)
//! implementation for your driver and a reference to the mailbox.
//!
//! Every service is driven by calling its entry point periodically with the
//! number of microseconds elapsed since the previous call, until it reports
//! something other than [`LssPoll::Pending`]:
//!
//! ```ignore
//! let mut master = LssMaster::new(tx, &LSS_MBOX, 1000);
//! loop {
//!     match master.switch_state_select(delta_us, Some(&identity))? {
//!         LssPoll::Pending => yield_to_scheduler(),
//!         LssPoll::Done(()) => break,
//!     }
//! }
//! ```
//!
//! The master keeps at most one request outstanding; starting a service
//! while another is in flight returns
//! [`LssError::InvalidState`]. [`LssMaster::switch_state_deselect`] is the
//! unconditional escape hatch back to the waiting state.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod fastscan;
mod master;
mod mbox;

pub use canlss_common as common;

pub use fastscan::{FastscanDirective, FastscanPlan};
pub use master::{LssConfirm, LssError, LssMaster, LssMasterState, LssPoll};
pub use mbox::LssMasterMbox;
