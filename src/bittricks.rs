// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
alignment arithmetic.

Offsets and sizes in the loader are plain `u64` byte counts.  Everything that rounds goes through
here so overflow is checked in one place instead of being scattered across pointer math.
*/

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` may be any non-zero value, not only powers of two (row pitches on some devices are
/// multiples of odd block sizes).  Returns `None` on overflow.
pub fn checked_round_up(value: u64, alignment: u64) -> Option<u64> {
    assert!(alignment > 0, "alignment must be non-zero");
    let remainder = value % alignment;
    if remainder == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - remainder)
    }
}

/// Least common multiple, used when two alignment requirements apply to the same offset.
pub fn lcm(a: u64, b: u64) -> u64 {
    fn gcd(mut a: u64, mut b: u64) -> u64 {
        while b != 0 {
            let t = a % b;
            a = b;
            b = t;
        }
        a
    }
    if a == 0 || b == 0 {
        return a.max(b);
    }
    a / gcd(a, b) * b
}
