//! Common functionality shared among the canlss crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `canlss-master`.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod lss;
pub mod node_id;
pub mod traits;

pub use lss::{LssCanId, LssFrame, LssIdentity};
pub use node_id::NodeId;
