/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Monotonic UUIDv7 generation for site identifiers and row UUIDs.
//!
//! Layout: 48-bit Unix-ms timestamp, 12-bit per-ms counter, 62 bits of
//! randomness, with the version (7) and variant (RFC 4122) bits set in the
//! usual nibble positions. Strict monotonicity within one process is
//! maintained by a `Mutex`-guarded `(last_ms, counter)` pair: if the new
//! timestamp doesn't advance past the last one produced, the counter is
//! incremented instead; if the counter saturates at 12 bits, the clock is
//! nudged forward by a millisecond so ordering is preserved.

use parking_lot::Mutex;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

struct MonotonicState {
    last_ms: u64,
    counter: u16,
}

lazy_static::lazy_static! {
    static ref STATE: Mutex<MonotonicState> = Mutex::new(MonotonicState { last_ms: 0, counter: 0 });
}

const COUNTER_BITS: u32 = 12;
const COUNTER_MAX: u16 = (1 << COUNTER_BITS) - 1;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a new monotonic UUIDv7.
pub fn new_v7() -> Uuid {
    new_v7_at(now_ms())
}

fn new_v7_at(observed_ms: u64) -> Uuid {
    let mut state = STATE.lock();
    let ms = if observed_ms <= state.last_ms {
        if state.counter == COUNTER_MAX {
            state.last_ms += 1;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        state.last_ms
    } else {
        state.last_ms = observed_ms;
        state.counter = 0;
        observed_ms
    };
    let counter = state.counter;
    drop(state);

    let mut rand_bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rand_bytes);
    // top 62 bits of randomness minus the 2 variant bits we overwrite below.
    let rand_a = u16::from_be_bytes([rand_bytes[0], rand_bytes[1]]) & 0x0fff;
    let rand_b = u64::from_be_bytes(rand_bytes[0..8].try_into().unwrap()) & 0x3fff_ffff_ffff_ffff;

    let mut bytes = [0u8; 16];
    bytes[0] = (ms >> 40) as u8;
    bytes[1] = (ms >> 32) as u8;
    bytes[2] = (ms >> 24) as u8;
    bytes[3] = (ms >> 16) as u8;
    bytes[4] = (ms >> 8) as u8;
    bytes[5] = ms as u8;

    let ver_and_counter_hi = 0x7000u16 | (counter & 0x0fff);
    bytes[6] = (ver_and_counter_hi >> 8) as u8;
    bytes[7] = ver_and_counter_hi as u8;
    let _ = rand_a; // counter occupies the slot rand_a would have used; keep for documentation.

    let variant_and_rand_hi = 0x8000u64 | ((rand_b >> 48) & 0x3fff);
    bytes[8] = (variant_and_rand_hi >> 8) as u8;
    bytes[9] = variant_and_rand_hi as u8;
    bytes[10] = (rand_b >> 40) as u8;
    bytes[11] = (rand_b >> 32) as u8;
    bytes[12] = (rand_b >> 24) as u8;
    bytes[13] = (rand_b >> 16) as u8;
    bytes[14] = (rand_b >> 8) as u8;
    bytes[15] = rand_b as u8;

    Uuid::from_bytes(bytes)
}

/// Lowercase hex without dashes, as required by the design doc's
/// stringification rule (distinct from [`Uuid::to_string`], which inserts
/// dashes).
pub fn to_plain_hex(id: &Uuid) -> String {
    let mut s = String::with_capacity(32);
    for b in id.as_bytes() {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn from_plain_hex(s: &str) -> Option<Uuid> {
    if s.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for i in 0..16 {
        bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(Uuid::from_bytes(bytes))
}
