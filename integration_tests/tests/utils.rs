#![allow(dead_code)]
use canlss_master::{LssError, LssPoll};

/// Poll a service entry point to completion, advancing time 1 ms per call
pub fn drive<T>(mut poll: impl FnMut(u32) -> Result<LssPoll<T>, LssError>) -> Result<T, LssError> {
    drive_windows(1000, &mut poll)
}

/// Poll a service entry point to completion, advancing a full `window_us`
/// per call; fastscan performs one phase step per window
pub fn drive_windows<T>(
    window_us: u32,
    mut poll: impl FnMut(u32) -> Result<LssPoll<T>, LssError>,
) -> Result<T, LssError> {
    if let LssPoll::Done(v) = poll(0)? {
        return Ok(v);
    }
    for _ in 0..2000 {
        if let LssPoll::Done(v) = poll(window_us)? {
            return Ok(v);
        }
    }
    panic!("LSS service did not complete");
}
