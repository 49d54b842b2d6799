//! # Denomination Splitter
//!
//! Every amount in the system is a sum of distinct powers of two. A proof
//! worth 13 sats doesn't exist; three proofs worth 1, 4 and 8 do.
//!
//! The canonical decomposition is just the binary representation of the
//! amount: bit `i` set means one token of `2^i`. It is minimal (no shorter
//! multiset of powers of two sums to the same value) and unique, which is
//! what lets the ledger reject any output set that isn't exactly it.

use crate::config::MAX_ORDER;

/// Decompose `amount` into ascending powers of two, one per set bit.
///
/// ```
/// use ecash_protocol::amount::amount_split;
///
/// assert_eq!(amount_split(13), vec![1, 4, 8]);
/// assert_eq!(amount_split(0), Vec::<u64>::new());
/// ```
pub fn amount_split(amount: u64) -> Vec<u64> {
    (0..MAX_ORDER)
        .map(|i| 1u64 << i)
        .filter(|bit| amount & bit != 0)
        .collect()
}

/// True if `amount` is a power of two no larger than `2^(MAX_ORDER-1)`.
pub fn is_valid_denomination(amount: u64) -> bool {
    amount.is_power_of_two() && amount.trailing_zeros() < MAX_ORDER
}

/// Sum a sequence of amounts, returning `None` on overflow.
///
/// Callers turn `None` into an `InvalidAmount` error: a request whose
/// inputs don't fit in a u64 is malformed, not merely large.
pub fn checked_sum<I>(amounts: I) -> Option<u64>
where
    I: IntoIterator<Item = u64>,
{
    amounts
        .into_iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(amount))
}
