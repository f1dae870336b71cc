//! Sharder implementation.

/// Maps an arbitrary string to a point in `[0, 1)` (roughly; see [`RollingHashSharder`]).
///
/// Implementations must be pure: the same input always yields the same point.
pub trait Sharder {
    fn bucket(&self, input: &str) -> f64;
}

/// The default sharder.
///
/// Computes the classic `hash * 31 + unit` rolling hash over UTF-16 code units with signed 32-bit
/// wrap-around, then normalizes its absolute value by `i32::MAX`. The only input that lands
/// outside of `[0, 1)` is a hash of `i32::MIN` (normalized slightly above 1), which is never
/// included in an experiment.
///
/// The hash is not uniform under adversarial input. It must stay unchanged nonetheless: changing
/// it would re-bucket every visitor that was already assigned.
pub struct RollingHashSharder;

impl Sharder for RollingHashSharder {
    fn bucket(&self, input: &str) -> f64 {
        (rolling_hash(input) as i64).abs() as f64 / i32::MAX as f64
    }
}

pub(crate) fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, f64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn bucket(&self, input: &str) -> f64 {
        self.0.get(input).copied().unwrap_or(0.0)
    }
}
