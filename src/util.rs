//! Size arithmetic shared across the crate.

/// Returns the smallest multiple of `step` that is greater or equal to `x`,
/// or `None` if no such value fits in a `usize`.
///
/// Block sizes, chunk footprints and frontier addresses all round through
/// here, so `step` is the size granularity or the arena size in practice.
///
/// # Panics
/// Panics if `step` is 0.
#[inline]
pub(crate) fn round_up(x: usize, step: usize) -> Option<usize> {
    match x % step {
        0 => Some(x),
        rem => x.checked_add(step - rem),
    }
}
