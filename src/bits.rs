//! Word-level rank and select.
//!
//! Bit 0 is the LSB, so slot `i` of a block maps to bit `i` of its bitmap
//! word. Select reports positions and uses 64 as the "no such bit" sentinel,
//! which keeps the navigation loops free of option plumbing.

/// Number of set bits of `w` at positions `0..=i`.
#[inline]
pub fn rank(w: u64, i: u64) -> u64 {
    debug_assert!(i < 64);
    popcount(w & (u64::MAX >> (63 - i)))
}

/// Number of set bits of `w` at positions `lo..hi`.
#[inline]
pub fn rank_range(w: u64, lo: u64, hi: u64) -> u64 {
    debug_assert!(lo <= hi && hi <= 64);
    popcount(w & (mask_upto(hi - lo) << lo))
}

/// Number of set bits of `w` at positions `lo..`.
#[inline]
pub fn rank_from(w: u64, lo: u64) -> u64 {
    debug_assert!(lo < 64);
    popcount(w >> lo)
}

/// Position of the n'th (0 based) set bit of `w`, 64 when `w` has no such bit.
#[inline]
pub fn select(w: u64, n: u64) -> u64 {
    if n >= 64 {
        return 64;
    }

    #[cfg(target_arch = "x86_64")]
    if std::is_x86_feature_detected!("bmi2") {
        // PDEP deposits a lone bit at the n'th set position of w and TZCNT
        // turns it into an index, already yielding 64 when the bit is absent.
        // SAFETY: bmi2 support was just verified.
        let deposited = unsafe { std::arch::x86_64::_pdep_u64(1 << n, w) };
        return deposited.trailing_zeros() as u64;
    }

    let mut rest = w;
    for _ in 0..n {
        rest &= rest.wrapping_sub(1); // strip the lowest set bit
    }
    if rest == 0 {
        64
    } else {
        rest.trailing_zeros() as u64
    }
}

/// Like [`select`], but only considers bits at positions `lo..`.
#[inline]
pub fn select_from(w: u64, lo: u64, n: u64) -> u64 {
    debug_assert!(lo < 64);
    select(w >> lo << lo, n)
}

/// Shifts the bits of `word` inside `lo..hi` up by `n`, dropping bits pushed
/// past `hi` and pulling the top `n` bits of `carry` in at the bottom of the
/// word. Callers pass a zero `carry` when `lo > 0`.
#[inline]
pub fn shift_window_up(word: u64, carry: u64, n: u64, lo: u64, hi: u64) -> u64 {
    debug_assert!(n > 0 && n < 64 && lo <= hi && hi <= 64);
    let window = mask_upto(hi - lo) << lo;
    let moved = ((word & window) << n) & window;
    (word & !window) | moved | (carry >> (64 - n))
}

/// Bits `0..n` set.
#[inline]
fn mask_upto(n: u64) -> u64 {
    u64::MAX.checked_shr((64 - n) as u32).unwrap_or(0)
}

#[cfg(all(
    target_arch = "x86_64",
    not(feature = "legacy_x86_64_support"),
    not(target_feature = "popcnt")
))]
#[inline]
fn popcount(v: u64) -> u64 {
    // count_ones() only lowers to the popcnt instruction when the feature is
    // enabled at compile time; emit it directly and leave pre-2008 CPUs to
    // the runtime check in the filter constructor.
    // SAFETY: popcnt availability is asserted when a filter is created.
    unsafe { std::arch::x86_64::_popcnt64(v as i64) as u64 }
}

#[cfg(any(
    not(target_arch = "x86_64"),
    feature = "legacy_x86_64_support",
    target_feature = "popcnt"
))]
#[inline]
fn popcount(v: u64) -> u64 {
    v.count_ones() as u64
}
