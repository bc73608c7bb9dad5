//! Traits abstracting the CAN driver

use crate::lss::LssFrame;

/// A sink for outgoing LSS frames
///
/// Implementations must not block; a frame that cannot be queued is
/// returned to the caller.
pub trait CanSender {
    /// Queue a frame for transmission
    fn send(&mut self, frame: LssFrame) -> Result<(), LssFrame>;
}

impl<T: CanSender + ?Sized> CanSender for &mut T {
    fn send(&mut self, frame: LssFrame) -> Result<(), LssFrame> {
        (**self).send(frame)
    }
}
