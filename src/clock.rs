// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of the current wall-clock time.
///
/// Everything that stamps a time into a token or a certificate takes one of
/// these so that tests can pin it.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(SystemTime::now)
}

/// Seconds since the UNIX epoch, saturating at zero for times before it.
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
pub fn fixed_clock(time: SystemTime) -> Clock {
    Arc::new(move || time)
}
