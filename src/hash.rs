//! Deterministic visitor bucketing.
use crate::definitions::BucketRange;

/// 32-bit FNV-1a over UTF-16 code units, so hashes agree with JavaScript SDKs for non-ASCII
/// input.
fn fnv1a32(input: &str) -> u32 {
    input.encode_utf16().fold(0x811c_9dc5_u32, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(0x0100_0193)
    })
}

/// Hash `value` with `seed` into the `0..1` range.
///
/// Returns `None` for unknown hash versions.
pub fn hash(seed: &str, value: &str, version: u32) -> Option<f64> {
    match version {
        1 => {
            let n = fnv1a32(&format!("{value}{seed}"));
            Some(f64::from(n % 1000) / 1000.0)
        }
        2 => {
            let n = fnv1a32(&fnv1a32(&format!("{seed}{value}")).to_string());
            Some(f64::from(n % 10_000) / 10_000.0)
        }
        _ => None,
    }
}

/// Split the `0..1` space between `num_variations` according to `weights`, keeping only the
/// first `coverage` share of every variation's slice.
///
/// Weights are ignored (equal split is used instead) if they don't match the number of variations
/// or don't add up to 1.
pub fn bucket_ranges(
    num_variations: usize,
    coverage: Option<f64>,
    weights: Option<&[f64]>,
) -> Vec<BucketRange> {
    if num_variations == 0 {
        return Vec::new();
    }

    let coverage = coverage.unwrap_or(1.0).clamp(0.0, 1.0);

    let equal = vec![1.0 / num_variations as f64; num_variations];
    let weights = match weights {
        Some(weights) if weights.len() == num_variations => {
            let total: f64 = weights.iter().sum();
            if (0.99..=1.01).contains(&total) {
                weights.to_vec()
            } else {
                equal
            }
        }
        _ => equal,
    };

    let mut cumulative = 0.0;
    weights
        .into_iter()
        .map(|weight| {
            let start = cumulative;
            cumulative += weight;
            (start, start + coverage * weight)
        })
        .collect()
}

/// Index of the range that contains `n`, if any.
pub fn choose_variation(n: f64, ranges: &[BucketRange]) -> Option<usize> {
    ranges.iter().position(|range| in_range(n, *range))
}

/// Returns `true` if `n` is within `[start, end)`.
pub fn in_range(n: f64, (start, end): BucketRange) -> bool {
    n >= start && n < end
}
