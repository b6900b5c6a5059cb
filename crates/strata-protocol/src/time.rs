// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Microsecond timestamps used for deadlines and document update times.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Current UTC time in microseconds.
///
/// Values returned within one process are strictly increasing, so two
/// writes in the same microsecond still get distinct update times.
pub fn now_micros() -> u64 {
    let wall = Utc::now().timestamp_micros().max(0) as u64;
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if wall > last { wall } else { last + 1 };
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Absolute deadline `duration` from now.
pub fn micros_after(duration: Duration) -> u64 {
    let delta = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    now_micros().saturating_add(delta)
}

/// Time left until `deadline_micros`, or `None` if it already passed.
pub fn remaining_until(deadline_micros: u64) -> Option<Duration> {
    let now = now_micros();
    if deadline_micros <= now {
        None
    } else {
        Some(Duration::from_micros(deadline_micros - now))
    }
}
