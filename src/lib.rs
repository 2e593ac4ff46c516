//! Approximate Membership Query Filter ([AMQ-Filter](https://en.wikipedia.org/wiki/Approximate_Membership_Query_Filter))
//! based on the [Rank Select Quotient Filter (RSQF)](https://dl.acm.org/doi/pdf/10.1145/3035918.3035963).
//!
//! The filter stores, for every admitted item, a short fingerprint derived from a
//! 64-bit hash. The high bits of the fingerprint (the quotient) address a home slot
//! and the low bits (the remainder) are packed into cache friendly 64-slot blocks.
//! Colliding remainders are displaced into a linear run whose boundaries are tracked
//! by two per-block bitmaps, navigated with rank and select over 64-bit words.
//!
//! Lookups can return false positives, bounded by the error rate (1/512 for the
//! default construction), but never false negatives. The slot universe is fixed at
//! construction: the filter does not resize, and an insert reports
//! [`Error::Overflow`] once clustering reaches past the last slot.
//!
//! ### Example
//!
//! ```rust
//! let mut f = rsqf::Filter::new(10000.0).unwrap();
//! for i in 0..1000u64 {
//!     f.insert(i).unwrap();
//! }
//! for i in 0..1000u64 {
//!     assert!(f.contains(i));
//! }
//! ```
//!
//! ### Hasher
//!
//! Items are hashed with [FNV-1a](https://crates.io/crates/fnv), which is cheap for
//! the short keys a filter typically sees and has a stable, well-known definition.
//! The filter also accepts pre-computed 64-bit hashes directly through the
//! `_fingerprint` methods, in which case the hash function choice is entirely the
//! caller's.
//!
//! ### Legacy x86_64 CPUs support
//!
//! The implementation assumes the `popcnt` instruction (equivalent to `integer.count_ones()`)
//! is present when compiling for x86_64 targets. This is theoretically not guaranteed as the
//! instruction is only available on AMD/Intel CPUs released after 2007/2008. If that's not
//! the case the Filter constructor will panic.
//!
//! Support for such legacy x86_64 CPUs can be optionally enabled with the
//! `legacy_x86_64_support` feature which incurs a small performance penalty.

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    num::{NonZeroU64, NonZeroU8},
};

use fnv::FnvHasher;

mod bits;

/// Error rate of filters built with [`Filter::new`], 1/512.
pub const DEFAULT_ERROR_RATE: f64 = 1.0 / 512.0;

const DEFAULT_REMAINDER_BITS: u8 = 9; // log2(1 / DEFAULT_ERROR_RATE)

/// Approximate membership filter with a fixed slot universe.
///
/// The filter is a flat array of 64-slot blocks. Each block packs one offset byte,
/// the occupieds and runends bitmap words and 64 r-bit remainder lanes, so the
/// whole structure lives in one contiguous allocation sized at construction.
///
/// Inserts and lookups take a 64-bit hash; the low `q + r` bits form the
/// fingerprint. Two items whose fingerprints collide are indistinguishable to the
/// filter, which is the only source of false positives.
#[derive(Clone)]
pub struct Filter {
    buffer: Box<[u8]>,
    len: u64,
    qbits: NonZeroU8,
    rbits: NonZeroU8,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// No free slot between the insertion point and the last slot; the filter
    /// is full or clustering reached past the end.
    Overflow,
    /// The requested geometry cannot be addressed with 64 bit hashes
    /// or yields less than one block worth of slots.
    NotEnoughFingerprintBits,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
struct Block {
    offset: u64,
    occupieds: u64,
    runends: u64,
}

trait CastNonZeroU8 {
    fn u64(&self) -> u64;
    fn usize(&self) -> usize;
}

impl CastNonZeroU8 for NonZeroU8 {
    #[inline]
    fn u64(&self) -> u64 {
        self.get() as u64
    }

    #[inline]
    fn usize(&self) -> usize {
        self.get() as usize
    }
}

/// 64-bit FNV-1a fingerprint of `data`.
///
/// Every byte of the input is fed through the hasher, so the empty input hashes
/// to the FNV offset basis:
///
/// ```
/// assert_eq!(rsqf::fingerprint(b""), 0xCBF29CE484222325);
/// ```
pub fn fingerprint(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}

impl Filter {
    /// Creates a filter sized for `n` expected insertions at the default
    /// error rate of 1/512.
    ///
    /// The fingerprint gets `ceil(log2(n * 512))` bits, 9 of which form the
    /// remainder. Errors if that leaves fewer quotient bits than one block
    /// worth of slots or needs more than 64 fingerprint bits.
    pub fn new(n: f64) -> Result<Self, Error> {
        let p = (n.max(1.0) / DEFAULT_ERROR_RATE).log2().ceil() as u32;
        let rbits = DEFAULT_REMAINDER_BITS as u32;
        if p <= rbits || p > 64 {
            return Err(Error::NotEnoughFingerprintBits);
        }
        let qbits = (p - rbits) as u8;
        Self::with_qr(
            qbits.try_into().unwrap(),
            DEFAULT_REMAINDER_BITS.try_into().unwrap(),
        )
    }

    /// Creates a filter with `2^qbits` slots storing `rbits` wide remainders.
    ///
    /// The false positive rate when full is `2^-rbits`. Requires
    /// `qbits + rbits <= 64` and at least one block worth of slots (`qbits >= 6`).
    pub fn with_qr(qbits: NonZeroU8, rbits: NonZeroU8) -> Result<Filter, Error> {
        Self::check_cpu_support();
        if qbits.get() as u32 + rbits.get() as u32 > 64 || qbits.get() < 6 {
            return Err(Error::NotEnoughFingerprintBits);
        }
        let num_slots = 1u64 << qbits.get();
        let num_blocks = num_slots / 64;
        let block_bytes_size = 1 + 16 + 64 * rbits.u64() / 8;
        let buffer_bytes = num_blocks * block_bytes_size;
        let buffer = vec![0u8; buffer_bytes.try_into().unwrap()].into_boxed_slice();
        Ok(Self {
            buffer,
            len: 0,
            qbits,
            rbits,
        })
    }

    fn check_cpu_support() {
        #[cfg(all(
            target_arch = "x86_64",
            not(feature = "legacy_x86_64_support"),
            not(target_feature = "popcnt")
        ))]
        assert!(
            std::is_x86_feature_detected!("popcnt"),
            "CPU doesn't support the popcnt instruction"
        );
    }

    /// The fingerprint size in bits (quotient + remainder).
    #[inline]
    pub fn fingerprint_bits(&self) -> u8 {
        self.qbits.get() + self.rbits.get()
    }

    /// Number of hash bits addressing the home slot.
    #[inline]
    pub fn quotient_bits(&self) -> u8 {
        self.qbits.get()
    }

    /// Number of hash bits stored as the slot remainder.
    #[inline]
    pub fn remainder_bits(&self) -> u8 {
        self.rbits.get()
    }

    /// Mask selecting the quotient bits of a hash.
    #[inline]
    pub fn quotient_mask(&self) -> u64 {
        (u64::MAX >> (64 - self.fingerprint_bits() as u32)) ^ self.remainder_mask()
    }

    /// Mask selecting the remainder bits of a hash.
    #[inline]
    pub fn remainder_mask(&self) -> u64 {
        (1u64 << self.rbits.get()) - 1
    }

    /// Whether the filter is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of fingerprints admitted to the filter.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Resets/Clears the filter.
    pub fn clear(&mut self) {
        self.buffer.fill(0);
        self.len = 0;
    }

    /// False positive rate with every slot in use.
    pub fn max_error_ratio(&self) -> f64 {
        2f64.powi(-(self.rbits.get() as i32))
    }

    #[inline]
    fn block_byte_size(&self) -> usize {
        1 + 8 + 8 + 64 * self.rbits.usize() / 8
    }

    #[inline]
    fn set_block_runends(&mut self, block_num: u64, runends: u64) {
        let block_start = block_num as usize * self.block_byte_size();
        let block_bytes: &mut [u8; 1 + 8 + 8] = (&mut self.buffer[block_start..][..1 + 8 + 8])
            .try_into()
            .unwrap();
        block_bytes[1 + 8..1 + 8 + 8].copy_from_slice(&runends.to_le_bytes());
    }

    #[inline]
    fn raw_block(&self, block_num: u64) -> Block {
        let block_start = block_num as usize * self.block_byte_size();
        let block_bytes: &[u8; 1 + 8 + 8] =
            &self.buffer[block_start..][..1 + 8 + 8].try_into().unwrap();
        Block {
            offset: block_bytes[0] as u64,
            occupieds: u64::from_le_bytes(block_bytes[1..1 + 8].try_into().unwrap()),
            runends: u64::from_le_bytes(block_bytes[1 + 8..1 + 8 + 8].try_into().unwrap()),
        }
    }

    #[inline]
    fn block(&self, block_num: u64) -> Block {
        let block_start = block_num as usize * self.block_byte_size();
        let block_bytes: &[u8; 1 + 8 + 8] = &self.buffer[block_start..block_start + 1 + 8 + 8]
            .try_into()
            .unwrap();
        let offset = {
            if block_bytes[0] < u8::MAX {
                block_bytes[0] as u64
            } else {
                // saturated cache, fall back to a scan
                self.calc_offset(block_num)
            }
        };
        Block {
            offset,
            occupieds: u64::from_le_bytes(block_bytes[1..1 + 8].try_into().unwrap()),
            runends: u64::from_le_bytes(block_bytes[1 + 8..1 + 8 + 8].try_into().unwrap()),
        }
    }

    #[inline]
    fn inc_block_offset(&mut self, block_num: u64) {
        let block_start = block_num as usize * self.block_byte_size();
        let offset = &mut self.buffer[block_start];
        *offset = offset.saturating_add(1);
    }

    #[inline]
    fn inc_offsets(&mut self, start_bucket: u64, end_bucket: u64) {
        for b in start_bucket / 64 + 1..=end_bucket / 64 {
            self.inc_block_offset(b);
        }
    }

    #[cfg(any(fuzzing, test))]
    fn validate_offsets(&self, first_block: u64, last_block: u64) {
        for b in first_block..=last_block {
            let raw_offset = self.raw_block(b).offset;
            let offset = self.calc_offset(b);
            debug_assert!(
                (raw_offset >= u8::MAX as u64 && offset >= u8::MAX as u64)
                    || (offset == raw_offset),
                "block {} offset {} calc {}",
                b,
                raw_offset,
                offset,
            );
        }
    }

    #[inline(always)]
    fn is_occupied(&self, bucket_idx: u64) -> bool {
        let block_start = (bucket_idx / 64) as usize * self.block_byte_size();
        let occupieds = u64::from_le_bytes(
            self.buffer[block_start + 1..block_start + 1 + 8]
                .try_into()
                .unwrap(),
        );
        occupieds & (1 << (bucket_idx % 64)) != 0
    }

    #[inline(always)]
    fn set_occupied(&mut self, bucket_idx: u64, value: bool) {
        let block_start = (bucket_idx / 64) as usize * self.block_byte_size();
        let mut occupieds = u64::from_le_bytes(
            self.buffer[block_start + 1..block_start + 1 + 8]
                .try_into()
                .unwrap(),
        );
        if value {
            occupieds |= 1 << (bucket_idx % 64);
        } else {
            occupieds &= !(1 << (bucket_idx % 64));
        }
        self.buffer[block_start + 1..block_start + 1 + 8].copy_from_slice(&occupieds.to_le_bytes());
    }

    #[inline(always)]
    fn is_runend(&self, bucket_idx: u64) -> bool {
        let block_start = (bucket_idx / 64) as usize * self.block_byte_size();
        let runends = u64::from_le_bytes(
            self.buffer[block_start + 1 + 8..block_start + 1 + 8 + 8]
                .try_into()
                .unwrap(),
        );
        runends & (1 << (bucket_idx % 64)) != 0
    }

    #[inline(always)]
    fn set_runend(&mut self, bucket_idx: u64, value: bool) {
        let block_start = (bucket_idx / 64) as usize * self.block_byte_size();
        let mut runends = u64::from_le_bytes(
            self.buffer[block_start + 1 + 8..block_start + 1 + 8 + 8]
                .try_into()
                .unwrap(),
        );
        if value {
            runends |= 1 << (bucket_idx % 64);
        } else {
            runends &= !(1 << (bucket_idx % 64));
        }
        self.buffer[block_start + 1 + 8..block_start + 1 + 8 + 8]
            .copy_from_slice(&runends.to_le_bytes());
    }

    #[inline(always)]
    fn get_remainder(&self, bucket_idx: u64) -> u64 {
        debug_assert!(self.rbits.get() > 0 && self.rbits.get() < 64);
        let remainders_start = (bucket_idx / 64) as usize * self.block_byte_size() + 1 + 8 + 8;
        let start_bit_idx = self.rbits.usize() * (bucket_idx % 64) as usize;
        let end_bit_idx = start_bit_idx + self.rbits.usize();
        let start_u64 = start_bit_idx / 64;
        let num_rem_parts = 1 + (end_bit_idx > (start_u64 + 1) * 64) as usize;
        let rem_parts_bytes = &self.buffer[remainders_start + start_u64 * 8..][..num_rem_parts * 8];
        let extra_low = start_bit_idx - start_u64 * 64;
        let extra_high = ((start_u64 + 1) * 64).saturating_sub(end_bit_idx);
        let rem_part = u64::from_le_bytes(rem_parts_bytes[..8].try_into().unwrap());
        // zero high bits & truncate low bits
        let mut remainder = (rem_part << extra_high) >> (extra_high + extra_low);
        if let Some(rem_part) = rem_parts_bytes.get(8..16) {
            let remaining_bits = end_bit_idx - (start_u64 + 1) * 64;
            let rem_part = u64::from_le_bytes(rem_part.try_into().unwrap());
            remainder |=
                (rem_part & !(u64::MAX << remaining_bits)) << (self.rbits.usize() - remaining_bits);
        }
        debug_assert!(remainder.leading_zeros() >= 64 - self.rbits.get() as u32);
        remainder
    }

    /// Overwrites the whole r-bit lane of `bucket_idx`, zero bits included.
    #[inline(always)]
    fn set_remainder(&mut self, bucket_idx: u64, remainder: u64) {
        debug_assert!(self.rbits.get() > 0 && self.rbits.get() < 64);
        debug_assert!(remainder.leading_zeros() >= 64 - self.rbits.get() as u32);
        let remainders_start = (bucket_idx / 64) as usize * self.block_byte_size() + 1 + 8 + 8;
        let start_bit_idx = self.rbits.usize() * (bucket_idx % 64) as usize;
        let end_bit_idx = start_bit_idx + self.rbits.usize();
        let start_u64 = start_bit_idx / 64;
        let num_rem_parts = 1 + (end_bit_idx > (start_u64 + 1) * 64) as usize;
        let rem_parts_bytes =
            &mut self.buffer[remainders_start + start_u64 * 8..][..num_rem_parts * 8];
        let mut rem_part = u64::from_le_bytes(rem_parts_bytes[..8].try_into().unwrap());
        let extra_low = start_bit_idx - start_u64 * 64;
        let extra_high = ((start_u64 + 1) * 64).saturating_sub(end_bit_idx);
        // zero region we'll copy remainder bits in
        rem_part &= !((u64::MAX << extra_low) & (u64::MAX >> extra_high));
        let low_bits_to_copy = 64 - extra_high - extra_low;
        rem_part |= (remainder & !(u64::MAX << low_bits_to_copy)) << extra_low;
        rem_parts_bytes[..8].copy_from_slice(&rem_part.to_le_bytes());
        if rem_parts_bytes.len() < 16 {
            return;
        }

        let remaining_bits = end_bit_idx - (start_u64 + 1) * 64;
        rem_part = u64::from_le_bytes(rem_parts_bytes[8..16].try_into().unwrap());
        // zero region we'll copy remainder bits in
        rem_part &= u64::MAX << remaining_bits;
        rem_part |= remainder >> (self.rbits.usize() - remaining_bits);
        rem_parts_bytes[8..16].copy_from_slice(&rem_part.to_le_bytes());
    }

    #[inline]
    fn get_rem_u64(&self, rem_u64: u64) -> u64 {
        let rbits = NonZeroU64::from(self.rbits);
        let block_idx = rem_u64 / rbits;
        let block_rem_u64 = (rem_u64 % rbits) as usize;
        let block_rem_start = (block_idx as usize * self.block_byte_size()) + 1 + 8 + 8;
        u64::from_le_bytes(
            self.buffer[block_rem_start + block_rem_u64 * 8..][..8]
                .try_into()
                .unwrap(),
        )
    }

    #[inline]
    fn set_rem_u64(&mut self, rem_u64: u64, rem: u64) {
        let rbits = NonZeroU64::from(self.rbits);
        let block_idx = rem_u64 / rbits;
        let block_rem_u64 = (rem_u64 % rbits) as usize;
        let block_rem_start = (block_idx as usize * self.block_byte_size()) + 1 + 8 + 8;
        self.buffer[block_rem_start + block_rem_u64 * 8..][..8]
            .copy_from_slice(&rem.to_le_bytes());
    }

    /// Shifts the remainder lanes in `[start, end_inc]` one slot to the right.
    /// The lane at `end_inc` must be empty; `start`'s lane is left zeroed.
    fn shift_remainders_by_1(&mut self, start: u64, end_inc: u64) {
        let rbits = self.rbits.u64();
        let end = end_inc + 1;
        let mut end_u64 = end * rbits / 64;
        let mut bend = end * rbits % 64;
        let start_u64 = start * rbits / 64;
        let bstart = start * rbits % 64;
        // The lane at end_inc holds no remainder, so a window ending exactly on
        // a word boundary carries nothing into the following word. Skipping it
        // also keeps the window inside the buffer when end_inc is the last slot.
        if bend == 0 {
            end_u64 -= 1;
            bend = 64;
        }
        while end_u64 != start_u64 {
            let carry = self.get_rem_u64(end_u64 - 1);
            let shifted = bits::shift_window_up(self.get_rem_u64(end_u64), carry, rbits, 0, bend);
            self.set_rem_u64(end_u64, shifted);
            end_u64 -= 1;
            bend = 64;
        }
        let shifted = bits::shift_window_up(self.get_rem_u64(start_u64), 0, rbits, bstart, bend);
        self.set_rem_u64(start_u64, shifted);
    }

    /// Shifts the runend bits in `[start, end_inc]` one slot to the right.
    /// Slot `end_inc` must be empty; `start`'s bit is left cleared.
    fn shift_runends_by_1(&mut self, start: u64, end_inc: u64) {
        let end = end_inc + 1;
        let mut end_block = end / 64;
        let mut bend = end % 64;
        let start_block = start / 64;
        let bstart = start % 64;
        // Slot end_inc carries no runend bit, see shift_remainders_by_1
        if bend == 0 {
            end_block -= 1;
            bend = 64;
        }
        while end_block != start_block {
            let carry = self.raw_block(end_block - 1).runends;
            let shifted =
                bits::shift_window_up(self.raw_block(end_block).runends, carry, 1, 0, bend);
            self.set_block_runends(end_block, shifted);
            end_block -= 1;
            bend = 64;
        }
        let shifted = bits::shift_window_up(self.raw_block(start_block).runends, 0, 1, bstart, bend);
        self.set_block_runends(start_block, shifted);
    }

    #[cold]
    #[inline(never)]
    fn calc_offset(&self, block_num: u64) -> u64 {
        // The block offset can be calculated as the difference between its position and runstart.
        let block_start = block_num * 64;
        if block_start == 0 {
            return 0;
        }
        self.run_start(block_start) - block_start
    }

    /// Start idx of the run (inclusive).
    #[inline]
    fn run_start(&self, bucket_idx: u64) -> u64 {
        // runstart is equivalent to the runend of the previous bucket + 1
        if bucket_idx == 0 {
            0
        } else {
            self.run_end(bucket_idx - 1) + 1
        }
    }

    /// End idx of the run (inclusive).
    fn run_end(&self, bucket_idx: u64) -> u64 {
        let bucket_block_idx = bucket_idx / 64;
        let bucket_intrablock_offset = bucket_idx % 64;
        let bucket_block = self.block(bucket_block_idx);
        let bucket_intrablock_rank = bits::rank(bucket_block.occupieds, bucket_intrablock_offset);
        // No occupied buckets all the way to bucket_intrablock_offset
        // which also means bucket_idx isn't occupied
        if bucket_intrablock_rank == 0 {
            return if bucket_block.offset <= bucket_intrablock_offset {
                // bucket_idx points to an empty bucket unaffected by the block offset,
                // thus end == start
                bucket_idx
            } else {
                // bucket_idx falls within the section covered by the block offset,
                // thus end == last bucket of the offset section
                bucket_block_idx * 64 + bucket_block.offset - 1
            };
        }

        // Search the runends for the runend_rank'th set bit (0 based), starting
        // past the slots the block offset proves belong to earlier blocks
        let mut runend_block_idx = bucket_block_idx + bucket_block.offset / 64;
        let mut runend_ignore_bits = bucket_block.offset % 64;
        let mut runend_rank = bucket_intrablock_rank - 1;
        loop {
            let runends = self.raw_block(runend_block_idx).runends;
            let runend_block_offset = bits::select_from(runends, runend_ignore_bits, runend_rank);
            if runend_block_offset != 64 {
                let runend_idx = runend_block_idx * 64 + runend_block_offset;
                return runend_idx.max(bucket_idx);
            }
            // not enough runend bits in this block, discount them and move on
            runend_rank -= bits::rank_from(runends, runend_ignore_bits);
            runend_block_idx += 1;
            debug_assert!(runend_block_idx < self.total_blocks().get());
            runend_ignore_bits = 0;
        }
    }

    /// Lower bound of the distance from `bucket_idx` to the first empty slot at
    /// or after it. 0 iff the slot is empty and not covered by any run.
    #[inline]
    fn offset_lower_bound(&self, bucket_idx: u64) -> u64 {
        let bucket_block_idx = bucket_idx / 64;
        let bucket_intrablock_offset = bucket_idx % 64;
        let bucket_block = self.raw_block(bucket_block_idx);
        let num_occupied = bits::rank(bucket_block.occupieds, bucket_intrablock_offset);
        if bucket_block.offset <= bucket_intrablock_offset {
            num_occupied
                - bits::rank_range(
                    bucket_block.runends,
                    bucket_block.offset,
                    bucket_intrablock_offset,
                )
        } else {
            bucket_block.offset + num_occupied - bucket_intrablock_offset
        }
    }

    /// First empty slot at or after `bucket_idx`, or None when the remaining
    /// slots are all taken. Runs never wrap around the last slot.
    fn find_first_empty_slot(&self, mut bucket_idx: u64) -> Option<u64> {
        loop {
            if bucket_idx >= self.total_buckets().get() {
                return None;
            }
            let olb = self.offset_lower_bound(bucket_idx);
            if olb == 0 {
                return Some(bucket_idx);
            }
            bucket_idx += olb;
        }
    }

    /// Returns whether `item` is present (probabilistically) in the filter.
    pub fn contains<T: Hash>(&self, item: T) -> bool {
        self.contains_fingerprint(self.hash(item))
    }

    /// Returns whether the fingerprint of `hash` is present (probabilistically)
    /// in the filter. A `true` result is wrong with probability bounded by
    /// [`Self::max_error_ratio`]; `false` results are exact.
    pub fn contains_fingerprint(&self, hash: u64) -> bool {
        let (bucket_idx, remainder) = self.calc_qr(hash);
        if !self.is_occupied(bucket_idx) {
            return false;
        }
        let mut runstart_idx = self.run_start(bucket_idx);
        loop {
            if remainder == self.get_remainder(runstart_idx) {
                return true;
            }
            if self.is_runend(runstart_idx) {
                return false;
            }
            runstart_idx += 1;
        }
    }

    /// Inserts `item` in the filter if it's not already present (probabilistically).
    ///
    /// Returns `Ok(true)` if the item was added to the filter.
    /// Returns `Ok(false)` if the item is already contained (probabilistically) in the filter.
    /// Returns `Err(Error::Overflow)` if the filter cannot admit the new item,
    /// in which case it is left unchanged.
    pub fn insert<T: Hash>(&mut self, item: T) -> Result<bool, Error> {
        self.insert_fingerprint(self.hash(item))
    }

    /// Inserts the fingerprint of `hash` in the filter.
    ///
    /// Returns `Ok(true)` if the fingerprint was added to the filter.
    /// Returns `Ok(false)` if the fingerprint is already contained in the filter.
    /// Returns `Err(Error::Overflow)` if there is no free slot left between the
    /// insertion point and the last slot, in which case the filter is left
    /// unchanged. Overflow means the capacity estimate was too low for the
    /// observed clustering; the remedy is a new filter sized for a larger `n`.
    pub fn insert_fingerprint(&mut self, hash: u64) -> Result<bool, Error> {
        enum Operation {
            NewRun,
            BeforeRunend,
            NewRunend,
        }

        let (bucket_idx, remainder) = self.calc_qr(hash);
        if self.offset_lower_bound(bucket_idx) == 0 {
            // Unobstructed home slot, the fingerprint starts its own run there
            debug_assert!(!self.is_occupied(bucket_idx));
            debug_assert!(!self.is_runend(bucket_idx));
            self.set_occupied(bucket_idx, true);
            self.set_runend(bucket_idx, true);
            self.set_remainder(bucket_idx, remainder);
            self.len += 1;
            return Ok(true);
        }

        let mut runstart_idx = self.run_start(bucket_idx);
        let runend_idx = self.run_end(bucket_idx);
        let insert_idx;
        let operation;
        if self.is_occupied(bucket_idx) {
            // Runs are stored sorted by remainder
            while runstart_idx <= runend_idx {
                match self.get_remainder(runstart_idx).cmp(&remainder) {
                    Ordering::Less => (),
                    Ordering::Equal => return Ok(false),
                    Ordering::Greater => break,
                }

                runstart_idx += 1;
            }

            if runstart_idx > runend_idx {
                /* new remainder is > any remainder in the run */
                operation = Operation::NewRunend;
            } else {
                /* there are larger remainders already in the run */
                operation = Operation::BeforeRunend;
            }
            insert_idx = runstart_idx;
        } else {
            insert_idx = runend_idx + 1;
            operation = Operation::NewRun; /* Insert into empty bucket */
        }

        // Overflow must surface before the shift region is mutated
        let Some(empty_slot_idx) = self.find_first_empty_slot(runend_idx + 1) else {
            return Err(Error::Overflow);
        };
        if insert_idx != empty_slot_idx {
            self.shift_remainders_by_1(insert_idx, empty_slot_idx);
            self.shift_runends_by_1(insert_idx, empty_slot_idx);
        }
        self.set_remainder(insert_idx, remainder);
        match operation {
            Operation::NewRun => {
                /* Insert into empty bucket */
                self.set_runend(insert_idx, true);
                self.set_occupied(bucket_idx, true);
            }
            Operation::NewRunend => {
                /* the old runend is no longer the last of its run */
                self.set_runend(insert_idx - 1, false);
                self.set_runend(insert_idx, true);
            }
            Operation::BeforeRunend => { /* the runend bit moved along with the shift */ }
        }

        self.inc_offsets(bucket_idx, empty_slot_idx);
        self.len += 1;
        Ok(true)
    }

    #[inline]
    fn hash<T: Hash>(&self, item: T) -> u64 {
        let mut hasher = FnvHasher::default();
        item.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn calc_qr(&self, hash: u64) -> (u64, u64) {
        let bucket_idx = (hash & self.quotient_mask()) >> self.rbits.get();
        let remainder = hash & self.remainder_mask();
        (bucket_idx, remainder)
    }

    #[inline]
    fn total_blocks(&self) -> NonZeroU64 {
        // The way this is calculated ensures the compilers sees that the result is both != 0 and a power of 2,
        // both of which allow the optimizer to generate much faster division/remainder code.
        #[cfg(any(debug_assertions, fuzzing))]
        {
            NonZeroU64::new((1u64 << self.qbits.get()) / 64).unwrap()
        }
        #[cfg(not(any(debug_assertions, fuzzing)))]
        {
            // Safety: All filters have at least 1 block (which have 64 slots each)
            unsafe { NonZeroU64::new_unchecked((1u64 << self.qbits.get()) / 64) }
        }
    }

    #[inline]
    fn total_buckets(&self) -> NonZeroU64 {
        NonZeroU64::new(1 << self.qbits.get()).unwrap()
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn printout(&self) {
        eprintln!("=== q {} r {} len {} ===", self.qbits, self.rbits, self.len);
        for b in 0..self.total_blocks().get() {
            let block = self.raw_block(b);
            eprintln!(
                "block {} offset {:?}\noccup {:064b}\nrunen {:064b}",
                b, block.offset, block.occupieds, block.runends
            );
            eprintln!(
                "      3210987654321098765432109876543210987654321098765432109876543210 {}",
                b * 64
            );
            eprint!("rem   ");
            for i in (0..64).rev() {
                let r = self.get_remainder(b * 64 + i);
                eprint!("{}", r % 100 / 10);
            }
            eprint!("\nrem   ");
            for i in (0..64).rev() {
                let r = self.get_remainder(b * 64 + i);
                eprint!("{}", r % 10);
            }
            println!();
        }
        eprintln!("===");
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("buffer", &"[..]")
            .field("len", &self.len)
            .field("qbits", &self.qbits)
            .field("rbits", &self.rbits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_vectors() {
        let f = Filter::new(100000.0).unwrap();
        assert_eq!(f.fingerprint_bits(), 26);
        assert_eq!(f.quotient_bits(), 17);
        assert_eq!(f.remainder_bits(), 9);
        assert_eq!(f.remainder_mask(), 0x1FF);
        assert_eq!(f.quotient_mask(), 0x3FFFE00);
        assert_eq!(f.total_blocks().get(), 2048);
        assert_eq!(f.total_buckets().get(), 1 << 17);
        assert_eq!(f.len(), 0);
        assert!(f.is_empty());
        assert!(f.buffer.iter().all(|&b| b == 0));

        // larger entries of the sizing progression; 1e8/1e9 follow the same
        // formula but would allocate hundreds of MB here
        for (n, p, q) in [(1e5, 26, 17), (1e6, 29, 20), (1e7, 33, 24)] {
            let f = Filter::new(n).unwrap();
            assert_eq!(f.fingerprint_bits() as u32, p);
            assert_eq!(f.quotient_bits() as u32, q);
            assert_eq!(f.total_blocks().get(), (1u64 << q) / 64);
        }
    }

    #[test]
    fn construction_rejects_bad_geometry() {
        assert!(matches!(
            Filter::new(1.0),
            Err(Error::NotEnoughFingerprintBits)
        ));
        assert!(matches!(
            Filter::new(f64::INFINITY),
            Err(Error::NotEnoughFingerprintBits)
        ));
        // quotient + remainder must fit in a 64 bit hash
        assert!(matches!(
            Filter::with_qr(60u8.try_into().unwrap(), 9u8.try_into().unwrap()),
            Err(Error::NotEnoughFingerprintBits)
        ));
        // less than one block worth of slots
        assert!(matches!(
            Filter::with_qr(5u8.try_into().unwrap(), 9u8.try_into().unwrap()),
            Err(Error::NotEnoughFingerprintBits)
        ));
    }

    #[test]
    fn packed_block_layout() {
        let f = Filter::new(100000.0).unwrap();
        // 1 offset byte + occupieds word + runends word + 64 9-bit lanes,
        // with no padding anywhere
        assert_eq!(f.block_byte_size(), 1 + 8 + 8 + 64 * 9 / 8);
        assert_eq!(f.buffer.len(), 2048 * f.block_byte_size());
    }

    #[test]
    fn fingerprint_vectors() {
        assert_eq!(fingerprint(b""), 0xCBF29CE484222325);
        assert_eq!(fingerprint(b"Hello world"), 0x2713F785A33764C7);

        let f = Filter::new(100000.0).unwrap();
        let (q, r) = f.calc_qr(fingerprint(b"Hello world"));
        assert_eq!(q, 0x19BB2);
        assert_eq!(r, 0xC7);
    }

    #[test]
    fn rank_vectors() {
        assert_eq!(bits::rank(u64::MAX, 63), 64);
        assert_eq!(bits::rank(0xEE, 63), 6);
        assert_eq!(bits::rank(0xF, 1), 2);
        assert_eq!(bits::rank(0, 0), 0);
        assert_eq!(bits::rank(1, 0), 1);
        assert_eq!(bits::rank_range(0xF0, 4, 8), 4);
        assert_eq!(bits::rank_range(0xF0, 5, 5), 0);
        assert_eq!(bits::rank_from(0xF0, 7), 1);
    }

    #[test]
    fn select_vectors() {
        assert_eq!(bits::select(0x1, 0), 0);
        assert_eq!(bits::select(0x3, 1), 1);
        assert_eq!(bits::select(0x8800_0000_0000_0000, 1), 63);
        assert_eq!(bits::select(0, 0), 64);
        assert_eq!(bits::select(u64::MAX, 64), 64);
        assert_eq!(bits::select_from(0x0101, 1, 0), 8);
    }

    #[test]
    fn rank_select_laws() {
        let mut w = 0x9E3779B97F4A7C15u64;
        for _ in 0..1000 {
            // xorshift64
            w ^= w << 13;
            w ^= w >> 7;
            w ^= w << 17;

            for i in 0..64u64 {
                let mask = ((1u128 << (i + 1)) - 1) as u64;
                assert_eq!(bits::rank(w, i), (w & mask).count_ones() as u64);
            }
            let ones = w.count_ones() as u64;
            for k in 0..ones {
                let p = bits::select(w, k);
                assert!(p < 64);
                assert!(w & (1 << p) != 0);
                assert_eq!(bits::rank(w, p), k + 1);
                assert_eq!(bits::select(w, bits::rank(w, p) - 1), p);
            }
            assert_eq!(bits::select(w, ones), 64);
        }
    }

    #[test]
    fn find_first_empty_slot_vectors() {
        // (occupieds, runends, query) -> first empty slot
        let table: [(u64, u64, u64, u64); 10] = [
            (0, 0, 0, 0),
            (1, 1, 0, 1),
            (1, 8, 0, 4),
            (1, 2, 1, 2),
            (1, 2, 0, 2),
            (1, 4, 0, 3),
            (2, 2, 2, 2),
            (2, 4, 2, 3),
            (0x0F, 0x0F, 3, 4),
            (0, 0, 0x80, 0x80),
        ];
        for (occupieds, runends, query, expected) in table {
            let mut f = Filter::new(100000.0).unwrap();
            for i in 0..64u64 {
                f.set_occupied(i, occupieds >> i & 1 != 0);
                f.set_runend(i, runends >> i & 1 != 0);
            }
            assert_eq!(
                f.find_first_empty_slot(query),
                Some(expected),
                "occupieds {occupieds:#x} runends {runends:#x} query {query:#x}",
            );
        }
    }

    #[test]
    fn run_end_tracks_abutting_runs() {
        let mut f = Filter::new(200.0).unwrap();
        // a lone single-slot run
        f.set_occupied(20, true);
        f.set_runend(20, true);
        assert_eq!(f.run_end(19), 19);
        assert_eq!(f.run_end(20), 20);
        assert_eq!(f.run_end(21), 21);

        // the run grows to cover slots 20..=22
        f.set_runend(20, false);
        f.set_runend(22, true);
        assert_eq!(f.run_end(19), 19);
        assert_eq!(f.run_end(20), 22);
        // covered but unoccupied slots resolve to the end of the covering run
        assert_eq!(f.run_end(21), 22);

        // a second home queues its run right behind the first
        f.set_occupied(23, true);
        f.set_runend(25, true);
        assert_eq!(f.run_end(20), 22);
        assert_eq!(f.run_end(23), 25);

        // a home displaced past its own slot by the runs before it
        f.set_occupied(24, true);
        f.set_runend(26, true);
        assert_eq!(f.run_end(23), 25);
        assert_eq!(f.run_end(24), 26);
        assert_eq!(f.run_end(27), 27);
    }

    #[test]
    fn run_end_at_filter_end() {
        let mut f = Filter::new(50.0).unwrap();
        assert_eq!(f.total_buckets().get(), 64);
        f.set_occupied(63, true);
        f.set_runend(63, true);
        assert_eq!(f.run_end(62), 62);
        assert_eq!(f.run_end(63), 63);
        assert_eq!(f.find_first_empty_slot(62), Some(62));
        // runs never wrap past the last slot
        assert_eq!(f.find_first_empty_slot(63), None);
    }

    #[test]
    fn run_end_across_blocks() {
        let mut f = Filter::new(200.0).unwrap();
        assert_eq!(f.total_buckets().get(), 256);
        // home 62's run spills 3 slots into block 1
        f.set_occupied(62, true);
        f.set_runend(66, true);
        for _ in 0..3 {
            f.inc_block_offset(1);
        }
        assert_eq!(f.run_end(62), 66);
        assert_eq!(f.run_end(63), 66);
        assert_eq!(f.run_end(64), 66);
        assert_eq!(f.run_end(65), 66);
        assert_eq!(f.run_end(70), 70);
        assert_eq!(f.find_first_empty_slot(62), Some(67));
        f.validate_offsets(0, f.total_blocks().get() - 1);
    }

    #[test]
    fn remainder_lane_round_trip() {
        let mut f = Filter::new(200.0).unwrap();
        for j in 0..256u64 {
            f.set_remainder(j, (j * 0x9E) & 0x1FF);
        }
        for j in 0..256u64 {
            assert_eq!(f.get_remainder(j), (j * 0x9E) & 0x1FF);
        }
        // a second write fully replaces the lane, zero bits included
        for j in 0..256u64 {
            f.set_remainder(j, 0x155 ^ (j & 0xFF));
        }
        for j in 0..256u64 {
            assert_eq!(f.get_remainder(j), 0x155 ^ (j & 0xFF));
        }
    }

    #[test]
    fn shift_opens_one_lane() {
        let mut f = Filter::new(50.0).unwrap();
        for j in 0..40u64 {
            f.set_remainder(j, 0x100 | j);
            f.set_runend(j, j % 3 == 0);
        }
        f.shift_remainders_by_1(5, 40);
        f.shift_runends_by_1(5, 40);
        for j in 0..5u64 {
            assert_eq!(f.get_remainder(j), 0x100 | j);
            assert_eq!(f.is_runend(j), j % 3 == 0);
        }
        assert_eq!(f.get_remainder(5), 0);
        assert!(!f.is_runend(5));
        for j in 6..=40u64 {
            assert_eq!(f.get_remainder(j), 0x100 | (j - 1));
            assert_eq!(f.is_runend(j), (j - 1) % 3 == 0);
        }
    }

    #[test]
    fn shift_into_last_slot_stays_in_bounds() {
        let mut f = Filter::new(50.0).unwrap();
        for j in 60..63u64 {
            f.set_remainder(j, 0x1F0 | j);
            f.set_runend(j, true);
        }
        f.shift_remainders_by_1(60, 63);
        f.shift_runends_by_1(60, 63);
        assert_eq!(f.get_remainder(60), 0);
        assert!(!f.is_runend(60));
        for j in 61..=63u64 {
            assert_eq!(f.get_remainder(j), 0x1F0 | (j - 1));
            assert!(f.is_runend(j));
        }
    }

    #[test]
    fn insert_on_empty_home_slot() {
        let mut f = Filter::new(100000.0).unwrap();
        let hash = (0x1F << 9) | 0x1F0;
        assert!(f.insert_fingerprint(hash).unwrap());
        let block = f.raw_block(0);
        assert_eq!(block.occupieds, 1 << 0x1F);
        assert_eq!(block.runends, 1 << 0x1F);
        assert_eq!(f.get_remainder(0x1F), 0x1F0);
        assert_eq!(f.len(), 1);
        assert!(f.contains_fingerprint(hash));
        assert!(!f.contains_fingerprint((0x1F << 9) | 0x1F1));
    }

    #[test]
    fn insert_colliding_quotients() {
        let mut f = Filter::new(100000.0).unwrap();
        let h0 = 0x1F;
        assert!(f.insert_fingerprint((h0 << 9) | 0x55).unwrap());
        assert!(f.insert_fingerprint((h0 << 9) | 0x10).unwrap());
        let block = f.raw_block(0);
        assert_eq!(block.occupieds, 1 << h0);
        assert_eq!(block.runends, 1 << (h0 + 1));
        let mut stored = [f.get_remainder(h0), f.get_remainder(h0 + 1)];
        stored.sort_unstable();
        assert_eq!(stored, [0x10, 0x55]);
        assert!(f.contains_fingerprint((h0 << 9) | 0x55));
        assert!(f.contains_fingerprint((h0 << 9) | 0x10));
        assert!(!f.contains_fingerprint((h0 << 9) | 0x123));
        assert_eq!(f.len(), 2);
        // an already stored fingerprint is not admitted twice
        assert!(!f.insert_fingerprint((h0 << 9) | 0x55).unwrap());
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn run_extends_under_one_home() {
        let mut f = Filter::new(50.0).unwrap();
        for r in 0..20u64 {
            assert!(f.insert_fingerprint((7 << 9) | r).unwrap());
        }
        assert_eq!(f.len(), 20);
        let block = f.raw_block(0);
        assert_eq!(block.occupieds, 1 << 7);
        assert_eq!(block.runends, 1 << 26);
        for r in 0..20u64 {
            assert!(f.contains_fingerprint((7 << 9) | r));
        }
        for r in 20..40u64 {
            assert!(!f.contains_fingerprint((7 << 9) | r));
        }
    }

    #[test]
    fn new_run_inside_cluster() {
        let mut f = Filter::new(50.0).unwrap();
        // home 8's run covers slots 8..=10, homes 9 and 10 queue up behind it
        for r in [1u64, 2, 3] {
            f.insert_fingerprint((8 << 9) | r).unwrap();
        }
        f.insert_fingerprint((9 << 9) | 1).unwrap();
        f.insert_fingerprint((10 << 9) | 1).unwrap();
        let block = f.raw_block(0);
        assert_eq!(block.occupieds, 0b111 << 8);
        assert_eq!(block.runends, (1 << 10) | (1 << 11) | (1 << 12));
        for (q, r) in [(8u64, 1u64), (8, 2), (8, 3), (9, 1), (10, 1)] {
            assert!(f.contains_fingerprint((q << 9) | r));
        }
        assert!(!f.contains_fingerprint((9 << 9) | 2));
        f.validate_offsets(0, 0);
    }

    #[test]
    fn overflow_at_filter_end() {
        let mut f = Filter::new(50.0).unwrap();
        assert!(f.insert_fingerprint((63 << 9) | 1).unwrap());
        assert!(matches!(
            f.insert_fingerprint((63 << 9) | 2),
            Err(Error::Overflow)
        ));
        // the failed insert must leave the filter untouched
        assert_eq!(f.len(), 1);
        assert!(f.contains_fingerprint((63 << 9) | 1));
        assert!(!f.contains_fingerprint((63 << 9) | 2));
        let block = f.raw_block(0);
        assert_eq!(block.occupieds, 1 << 63);
        assert_eq!(block.runends, 1 << 63);
    }

    #[test]
    fn overflow_when_full() {
        let mut f = Filter::new(50.0).unwrap();
        for i in 0..64u64 {
            assert!(f.insert_fingerprint((i << 9) | i).unwrap());
        }
        assert_eq!(f.len(), 64);
        assert!(matches!(f.insert_fingerprint(0x1FF), Err(Error::Overflow)));
        for i in 0..64u64 {
            assert!(f.contains_fingerprint((i << 9) | i));
        }
    }

    #[test]
    fn parametric_remainder_width() {
        for rbits in [5u8, 9, 13] {
            let mut f = Filter::with_qr(7u8.try_into().unwrap(), rbits.try_into().unwrap()).unwrap();
            assert_eq!(f.remainder_bits(), rbits);
            assert_eq!(f.max_error_ratio(), 2f64.powi(-(rbits as i32)));
            let rmask = f.remainder_mask();
            for q in 0..128u64 {
                assert!(f.insert_fingerprint((q << rbits) | (q & rmask)).unwrap());
            }
            for q in 0..128u64 {
                assert!(f.contains_fingerprint((q << rbits) | (q & rmask)));
            }
            assert_eq!(f.len(), 128);
        }
    }

    #[test]
    fn insert_and_contains_items() {
        let mut f = Filter::new(1000.0).unwrap();
        for i in 0..500u64 {
            f.insert(i).unwrap();
        }
        for i in 0..500u64 {
            assert!(f.contains(i));
        }
        assert!(!f.is_empty());
    }

    #[test]
    fn clear_resets() {
        let mut f = Filter::new(50.0).unwrap();
        for i in 0..10u64 {
            f.insert_fingerprint((i << 9) | i).unwrap();
        }
        assert_eq!(f.len(), 10);
        f.clear();
        assert!(f.is_empty());
        for i in 0..10u64 {
            assert!(!f.contains_fingerprint((i << 9) | i));
        }
        assert!(f.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn membership_properties() {
        let mut f = Filter::new(100000.0).unwrap();
        let mut inserted = Vec::new();
        let mut homes = std::collections::HashSet::new();
        for i in 0u64..100_000 {
            let hash = fingerprint(&i.to_le_bytes());
            match f.insert_fingerprint(hash) {
                Ok(_) => {
                    inserted.push(hash);
                    homes.insert(f.calc_qr(hash).0);
                }
                // clustering reached the last slot for this quotient, skip
                Err(Error::Overflow) => (),
                Err(e) => panic!("{e}"),
            }
        }
        assert!(inserted.len() >= 99_990);
        f.validate_offsets(0, f.total_blocks().get() - 1);

        // no false negatives, ever
        for hash in &inserted {
            assert!(f.contains_fingerprint(*hash));
        }

        // every home has exactly one run and one runend
        let mut occupieds = 0u64;
        let mut runends = 0u64;
        for b in 0..f.total_blocks().get() {
            let block = f.raw_block(b);
            occupieds += block.occupieds.count_ones() as u64;
            runends += block.runends.count_ones() as u64;
        }
        assert_eq!(occupieds, runends);
        assert_eq!(occupieds, homes.len() as u64);

        // false positive rate over unrelated lookups stays within the target
        let lookups = 10 * f.total_buckets().get();
        let mut false_positives = 0u64;
        for i in 0..lookups {
            let hash = fingerprint(&(1_000_000 + i).to_le_bytes());
            false_positives += f.contains_fingerprint(hash) as u64;
        }
        let rate = false_positives as f64 / lookups as f64;
        assert!(
            rate <= DEFAULT_ERROR_RATE,
            "observed false positive rate {rate}"
        );
    }
}
