//! Sizing and multiplicative hashing shared by [`SubMatrix`](crate::SubMatrix)
//! and [`Mapping`](crate::Mapping).
//!
//! A table with `shift` has `1 << (32 - shift)` slots. Thresholds are
//! fractions of 2^32 so that `THRESHOLD >> shift` is that fraction of the
//! slot count.

use crate::MatrixError;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Grow when occupancy (tombstones included) passes 2/3.
pub const THRESHOLD_UP: u32 = ((1u64 << 32) * 2 / 3) as u32;
/// Shrink when payload drops below 2/9.
pub const THRESHOLD_DOWN: u32 = ((1u64 << 32) * 2 / 9) as u32;
/// Target fill right after allocation: 5/9.
pub const THRESHOLD_ALLOC_UP: u32 = ((1u64 << 32) * 5 / 9) as u32;

pub const MAX_SHIFT: u32 = 29;
pub const MIN_LENGTH: usize = 1 << (32 - MAX_SHIFT);

/// Fixes the hash seed, for reproducible layouts in tests.
pub const SEED_ENV: &str = "BASALT_HASHING_SEED";

const MAGIC: i32 = 0xB463_94CD_u32 as i32;

static SEED: OnceLock<AtomicI32> = OnceLock::new();

fn initial_seed() -> i32 {
    if let Some(seed) = std::env::var(SEED_ENV).ok().and_then(|s| s.trim().parse::<i32>().ok()) {
        return seed;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i32)
        .unwrap_or(0x1234_5678)
}

fn next_seed() -> i32 {
    let seed = SEED.get_or_init(|| AtomicI32::new(initial_seed()));
    let mut cur = seed.load(Ordering::Relaxed);
    loop {
        let next = cur.wrapping_mul(MAGIC).wrapping_add(1);
        match seed.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => cur = actual,
        }
    }
}

/// Smallest table (largest shift) that holds `capacity` entries below the allocation threshold.
pub fn get_shift(capacity: usize) -> Result<u32, MatrixError> {
    let mut shift = MAX_SHIFT;
    while ((THRESHOLD_ALLOC_UP >> shift) as usize) < capacity && shift > 1 {
        shift -= 1;
    }
    if shift <= 1 {
        return Err(MatrixError::CapacityTooLarge { capacity });
    }
    Ok(shift)
}

/// Pseudo-random odd multiplier that differs from `prev_magic` in every 8-bit window.
pub fn next_magic(prev_magic: i32) -> i32 {
    let mut magic = next_seed() | 1;
    // no run of four equal bits; starts at bit 30 so the top two bits differ too
    let mut i: i32 = 30;
    while i >= 0 {
        let bits = (magic >> i) & 0x0F;
        if bits == 0 || bits == 0x0F {
            magic ^= 1 << i;
            i -= 2;
        }
        i -= 1;
    }
    if magic & 1 == 0 {
        magic ^= 3;
    }
    let mut i: i32 = 24;
    while i >= 0 {
        if ((magic ^ prev_magic) >> i) & 0xFF == 0 {
            magic ^= ((magic ^ (magic << 1)) & (4 << i)) ^ (2 << i);
            i -= 6;
        }
        i -= 1;
    }
    magic
}

/// Picks the best of several candidates for larger tables.
pub fn next_magic_for(prev_magic: i32, capacity: usize) -> i32 {
    let mut magic = next_magic(prev_magic);
    if capacity < 32 {
        return magic;
    }
    let mut eval = evaluate_continued_fraction(magic);
    let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
    let attempts = 30u32.saturating_sub(capacity.leading_zeros());
    for _ in 0..attempts {
        let m = next_magic(prev_magic);
        let e = evaluate_continued_fraction(m);
        if e > eval {
            magic = m;
            eval = e;
        }
    }
    magic
}

/// Worst normalized distance between `magic / 2^32` and its continued
/// fraction convergents. Larger is better.
pub fn evaluate_continued_fraction(magic: i32) -> f64 {
    let x = (magic as u32) as f64 / (1u64 << 32) as f64;
    let mut rem = x;
    let (mut p2, mut q2, mut p1, mut q1) = (1i64, 0i64, 0i64, 1i64);
    let mut grade = x;
    for _ in 0..20 {
        rem = 1.0 / rem;
        let a = rem as i64;
        rem -= a as f64;
        let p = a * p1 + p2;
        let q = a * q1 + q2;
        p2 = p1;
        q2 = q1;
        p1 = p;
        q1 = q;
        grade = grade.min((x * q as f64 - p as f64).abs() * q as f64);
        if grade < 1e-6 || rem < 1e-6 || q > (1 << 20) {
            break;
        }
    }
    grade
}

pub fn need_rehash(shift: u32, overall_size: usize, payload_size: usize, max_shift: u32) -> bool {
    overall_size > (THRESHOLD_UP >> shift) as usize
        || (payload_size < (THRESHOLD_DOWN >> shift) as usize && shift < max_shift)
}
