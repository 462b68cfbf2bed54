//! Wheel of fate
//!
//! Kernel-wide gambling ledger. Wins and losses are monotonic counters;
//! callers (syscalls, the user-copy guards) award outcomes and the ledger
//! renders a verdict once the loss threshold is crossed. The wheel also
//! owns the kernel PRNG that backs `roulette_spin` and `random_next`.

use core::sync::atomic::{AtomicU64, Ordering};

use log::warn;

/// Losses a task community can absorb before the wheel turns on it.
const DEFAULT_LOSS_THRESHOLD: u64 = 100;

static WINS: AtomicU64 = AtomicU64::new(0);
static LOSSES: AtomicU64 = AtomicU64::new(0);
static LOSS_THRESHOLD: AtomicU64 = AtomicU64::new(DEFAULT_LOSS_THRESHOLD);

/// xorshift64* state. Never zero.
static RNG_STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Verdict returned for each recorded loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelVerdict {
    /// Below the threshold; play continues.
    Fine,
    /// The threshold has been crossed.
    Doomed,
}

/// Ledger snapshot for `roulette_result` and `sys_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelStats {
    pub wins: u64,
    pub losses: u64,
    pub threshold: u64,
}

/// Configure the loss threshold. Zero is rejected (the wheel always grants
/// at least one spin).
pub fn set_loss_threshold(threshold: u64) {
    if threshold == 0 {
        return;
    }
    LOSS_THRESHOLD.store(threshold, Ordering::Relaxed);
}

/// Seed the PRNG. A zero seed is remapped so xorshift never locks up.
pub fn seed(seed: u64) {
    let seed = if seed == 0 { 0xDEAD_BEEF_0BAD_F00D } else { seed };
    RNG_STATE.store(seed, Ordering::Relaxed);
}

/// Next PRNG value (xorshift64*).
pub fn rand_next() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    RNG_STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Spin the wheel: produces the landing pocket (0..=36, roulette style) and
/// records the outcome. Pocket 0 is the house; everything else pays the
/// caller a win.
pub fn spin() -> u64 {
    let pocket = rand_next() % 37;
    if pocket == 0 {
        record_loss();
    } else {
        record_win();
    }
    pocket
}

/// Record a win.
pub fn record_win() {
    WINS.fetch_add(1, Ordering::Relaxed);
}

/// Record a loss and report whether the threshold has been crossed.
pub fn record_loss() -> WheelVerdict {
    let losses = LOSSES.fetch_add(1, Ordering::Relaxed) + 1;
    let threshold = LOSS_THRESHOLD.load(Ordering::Relaxed);
    if losses >= threshold {
        warn!("wheel of fate: {} losses (threshold {})", losses, threshold);
        WheelVerdict::Doomed
    } else {
        WheelVerdict::Fine
    }
}

/// Current ledger snapshot.
pub fn stats() -> WheelStats {
    WheelStats {
        wins: WINS.load(Ordering::Relaxed),
        losses: LOSSES.load(Ordering::Relaxed),
        threshold: LOSS_THRESHOLD.load(Ordering::Relaxed),
    }
}
