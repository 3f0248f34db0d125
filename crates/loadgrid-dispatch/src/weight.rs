//! Weighted user distribution.
//!
//! Given declared classes with relative weights and a total desired user
//! count, compute an integer occurrence count per class that best
//! approximates the weight ratios. The result always sums to the total
//! exactly, and every declared class appears as a key.

use loadgrid_core::{OccurrenceMap, UserClass};

/// Compute per-class occurrence counts for `total` users.
///
/// - `total <= classes.len()`: the `total` highest-weight classes (ties
///   broken by name, ascending) get exactly one occurrence each.
/// - Otherwise every class gets at least one occurrence, the rest follow
///   the weight ratios, and any rounding drift is repaired by the smallest
///   set of ±1 adjustments that keeps the percentage distribution closest
///   to the ideal one.
pub fn weight_users(classes: &[UserClass], total: u64) -> OccurrenceMap {
    if classes.is_empty() {
        return OccurrenceMap::new();
    }

    // Name-sorted view so every downstream decision is deterministic.
    let mut sorted: Vec<&UserClass> = classes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    if total <= sorted.len() as u64 {
        return pick_heaviest(&sorted, total);
    }

    let weight_sum: f64 = sorted.iter().map(|c| c.weight).sum();
    let mut counts: Vec<u64> = sorted
        .iter()
        .map(|c| {
            let ideal = total as f64 * c.weight / weight_sum;
            (ideal.round() as u64).max(1)
        })
        .collect();

    let rounded_sum: u64 = counts.iter().sum();
    let drift = total as i64 - rounded_sum as i64;
    if drift != 0 {
        apply_best_adjustment(&sorted, &mut counts, total, weight_sum, drift);
    }

    sorted
        .iter()
        .zip(counts)
        .map(|(c, n)| (c.name.clone(), n))
        .collect()
}

/// Small-total case: one occurrence each for the heaviest classes.
fn pick_heaviest(sorted: &[&UserClass], total: u64) -> OccurrenceMap {
    let mut by_weight: Vec<usize> = (0..sorted.len()).collect();
    // Weight descending; the underlying order is already name-ascending,
    // so equal weights fall back to name order.
    by_weight.sort_by(|&a, &b| {
        sorted[b]
            .weight
            .partial_cmp(&sorted[a].weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(sorted[a].name.cmp(&sorted[b].name))
    });

    let mut map: OccurrenceMap = sorted.iter().map(|c| (c.name.clone(), 0)).collect();
    for &idx in by_weight.iter().take(total as usize) {
        map.insert(sorted[idx].name.clone(), 1);
    }
    map
}

/// Repair rounding drift with the minimal-cardinality multiset of ±1
/// adjustments that minimizes the Euclidean distance to the ideal
/// percentage distribution.
///
/// The adjustment magnitude `|drift|` is small, so enumerating every
/// combination with repetition over the class list stays cheap. Exact
/// distance ties keep the first combination seen, which is deterministic
/// because the class list is name-sorted.
fn apply_best_adjustment(
    sorted: &[&UserClass],
    counts: &mut [u64],
    total: u64,
    weight_sum: f64,
    drift: i64,
) {
    let magnitude = drift.unsigned_abs() as usize;
    let step: i64 = drift.signum();

    let ideal_pct: Vec<f64> = sorted
        .iter()
        .map(|c| c.weight / weight_sum * 100.0)
        .collect();

    let mut best: Option<(f64, Vec<usize>)> = None;
    let mut combo = vec![0usize; magnitude];
    enumerate_combinations(sorted.len(), magnitude, 0, &mut combo, 0, &mut |combo| {
        let mut candidate: Vec<i64> = counts.iter().map(|&n| n as i64).collect();
        for &idx in combo {
            candidate[idx] += step;
        }
        // Shrinking a class below one occurrence would violate minimum
        // coverage for total > classes.len().
        if candidate.iter().any(|&n| n < 1) {
            return;
        }
        let distance: f64 = candidate
            .iter()
            .zip(&ideal_pct)
            .map(|(&n, &ideal)| {
                let pct = n as f64 / total as f64 * 100.0;
                (pct - ideal).powi(2)
            })
            .sum::<f64>()
            .sqrt();
        if best.as_ref().is_none_or(|(d, _)| distance < *d) {
            best = Some((distance, combo.to_vec()));
        }
    });

    if let Some((_, combo)) = best {
        for idx in combo {
            counts[idx] = (counts[idx] as i64 + step) as u64;
        }
    }
}

/// Visit every combination with repetition of `size` indices out of `n`,
/// as non-decreasing index sequences.
fn enumerate_combinations(
    n: usize,
    size: usize,
    depth: usize,
    combo: &mut Vec<usize>,
    start: usize,
    visit: &mut impl FnMut(&[usize]),
) {
    if depth == size {
        visit(combo);
        return;
    }
    for idx in start..n {
        combo[depth] = idx;
        enumerate_combinations(n, size, depth + 1, combo, idx, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgrid_core::total_occurrences;

    fn classes(spec: &[(&str, f64)]) -> Vec<UserClass> {
        spec.iter().map(|(n, w)| UserClass::new(*n, *w)).collect()
    }

    #[test]
    fn empty_classes_yield_empty_map() {
        assert!(weight_users(&[], 10).is_empty());
    }

    #[test]
    fn total_zero_gives_all_zero_entries() {
        let result = weight_users(&classes(&[("a", 1.0), ("b", 2.0)]), 0);
        assert_eq!(result.get("a"), Some(&0));
        assert_eq!(result.get("b"), Some(&0));
        assert_eq!(total_occurrences(&result), 0);
    }

    #[test]
    fn small_total_picks_heaviest_classes() {
        let result = weight_users(&classes(&[("a", 1.0), ("b", 3.0), ("c", 2.0)]), 2);
        assert_eq!(result.get("b"), Some(&1));
        assert_eq!(result.get("c"), Some(&1));
        assert_eq!(result.get("a"), Some(&0));
    }

    #[test]
    fn small_total_weight_ties_break_by_name() {
        let result = weight_users(&classes(&[("zeta", 1.0), ("alpha", 1.0), ("mid", 1.0)]), 1);
        assert_eq!(result.get("alpha"), Some(&1));
        assert_eq!(result.get("mid"), Some(&0));
        assert_eq!(result.get("zeta"), Some(&0));
    }

    #[test]
    fn even_split_is_exact() {
        // Reference scenario: weights 1:3 at total 100 divide evenly.
        let result = weight_users(&classes(&[("a", 1.0), ("b", 3.0)]), 100);
        assert_eq!(result.get("a"), Some(&25));
        assert_eq!(result.get("b"), Some(&75));
    }

    #[test]
    fn single_user_goes_to_heaviest() {
        let result = weight_users(&classes(&[("a", 1.0), ("b", 3.0)]), 1);
        assert_eq!(result.get("a"), Some(&0));
        assert_eq!(result.get("b"), Some(&1));
    }

    #[test]
    fn sum_is_conserved_across_awkward_totals() {
        let cls = classes(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        for total in 0..50 {
            let result = weight_users(&cls, total);
            assert_eq!(total_occurrences(&result), total, "total={total}");
        }
    }

    #[test]
    fn sum_is_conserved_with_skewed_weights() {
        let cls = classes(&[("a", 0.3), ("b", 7.0), ("c", 2.5), ("d", 0.1)]);
        for total in [5, 7, 11, 23, 97, 1000] {
            let result = weight_users(&cls, total);
            assert_eq!(total_occurrences(&result), total, "total={total}");
        }
    }

    #[test]
    fn every_class_covered_once_total_exceeds_class_count() {
        let cls = classes(&[("a", 100.0), ("b", 1.0), ("c", 1.0)]);
        for total in 4..40 {
            let result = weight_users(&cls, total);
            assert!(
                result.values().all(|&n| n >= 1),
                "total={total}, result={result:?}"
            );
        }
    }

    #[test]
    fn distribution_tracks_weights() {
        let result = weight_users(&classes(&[("a", 1.0), ("b", 1.0), ("c", 2.0)]), 100);
        assert_eq!(result.get("a"), Some(&25));
        assert_eq!(result.get("b"), Some(&25));
        assert_eq!(result.get("c"), Some(&50));
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let cls = classes(&[("a", 1.3), ("b", 2.7), ("c", 0.9)]);
        let first = weight_users(&cls, 17);
        for _ in 0..5 {
            assert_eq!(weight_users(&cls, 17), first);
        }
    }
}
