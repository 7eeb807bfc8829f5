//! Weighted replica scheduling.
//!
//! Distributes a total replica count across the member clusters
//! selected by a placement, honoring per-cluster min/max bounds and
//! relative weights. Integer apportionment uses largest-remainder
//! rounding so assignments always sum to the intended total; remainder
//! ties break by cluster name ascending.

use std::collections::BTreeMap;

use crate::api::{
    ClusterOverride, ClusterPreferences, OverrideSpec, ReplicaSchedulingPreferenceSpec, WILDCARD,
};
use crate::{Error, Result};

/// Per-cluster replica assignment.
pub type Assignment = BTreeMap<String, u64>;

/// Compute the per-cluster replica distribution for one scheduling
/// preference against the current placement target set.
///
/// `previous` is the assignment currently in effect (parsed from the
/// existing override); it is only consulted when `rebalance` is false,
/// in which case the plan changes the fewest already-running counts.
pub fn plan(
    preference: &ReplicaSchedulingPreferenceSpec,
    placement: &[String],
    previous: Option<&Assignment>,
) -> Result<Assignment> {
    if preference.total_replicas < 1 {
        return Err(Error::validation("totalReplicas must be >= 1"));
    }

    let eligible = eligible_clusters(preference, placement);
    if eligible.is_empty() {
        return Ok(Assignment::new());
    }

    let total = u64::from(preference.total_replicas);
    let sum_min: u64 = eligible.values().map(|p| p.min_replicas).sum();

    // Degenerate case: the minimums alone exceed the total. Clamp each
    // cluster to its relative share of the minimums so the sum equals
    // the total; bounds cannot all hold here.
    if sum_min > total {
        let mins: BTreeMap<&str, u64> = eligible
            .iter()
            .map(|(name, p)| (name.as_str(), p.min_replicas))
            .collect();
        return Ok(apportion(&mins, total)
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect());
    }

    if !preference.rebalance {
        if let Some(previous) = previous {
            return Ok(minimal_diff_plan(&eligible, previous, total));
        }
    }

    Ok(weighted_plan(&eligible, total, sum_min))
}

/// Target clusters with their effective preferences: explicit entries,
/// with the `"*"` entry (or an equal-weight default when the map is
/// empty) filling in for clusters without one.
fn eligible_clusters(
    preference: &ReplicaSchedulingPreferenceSpec,
    placement: &[String],
) -> BTreeMap<String, ClusterPreferences> {
    let wildcard = if preference.clusters.is_empty() {
        // No preference entries at all: every placed cluster shares equally
        Some(ClusterPreferences {
            min_replicas: 0,
            max_replicas: None,
            weight: 1,
        })
    } else {
        preference.clusters.get(WILDCARD).cloned()
    };

    let mut eligible = BTreeMap::new();
    for cluster in placement {
        if cluster == WILDCARD {
            continue;
        }
        if let Some(prefs) = preference.clusters.get(cluster) {
            eligible.insert(cluster.clone(), prefs.clone());
        } else if let Some(default) = &wildcard {
            eligible.insert(cluster.clone(), default.clone());
        }
    }
    eligible
}

/// Fresh weighted distribution: minimums first, then the remainder in
/// proportion to weight, re-apportioning whenever a cluster saturates
/// at its maximum.
fn weighted_plan(
    eligible: &BTreeMap<String, ClusterPreferences>,
    total: u64,
    sum_min: u64,
) -> Assignment {
    let mut assigned: Assignment = eligible
        .iter()
        .map(|(name, p)| (name.clone(), p.min_replicas))
        .collect();
    let mut remainder = total - sum_min;

    let mut pool: Vec<&String> = eligible
        .iter()
        .filter(|(name, p)| headroom(p, assigned[name.as_str()]) > 0)
        .map(|(name, _)| name)
        .collect();

    while remainder > 0 && !pool.is_empty() {
        let weights: BTreeMap<&str, u64> = pool
            .iter()
            .map(|name| (name.as_str(), eligible[*name].weight))
            .collect();
        if weights.values().all(|w| *w == 0) {
            // Nothing to guess a split from; the remainder stays
            // undistributed rather than inventing a default weight.
            break;
        }

        let shares = apportion(&weights, remainder);
        for (name, share) in shares {
            let count = assigned
                .get_mut(name)
                .map(|count| {
                    let room = headroom(&eligible[name], *count);
                    let add = share.min(room);
                    *count += add;
                    add
                })
                .unwrap_or(0);
            remainder -= count;
        }

        pool.retain(|name| headroom(&eligible[name.as_str()], assigned[name.as_str()]) > 0);
    }

    assigned
}

/// Distribution that changes the fewest already-running counts: start
/// from the previous assignment clamped into the current bounds, then
/// place the surplus into (or drain the deficit from) the fewest
/// clusters, greedy by headroom with name-ascending tiebreak.
fn minimal_diff_plan(
    eligible: &BTreeMap<String, ClusterPreferences>,
    previous: &Assignment,
    total: u64,
) -> Assignment {
    let mut assigned: Assignment = eligible
        .iter()
        .map(|(name, p)| {
            let prev = previous.get(name).copied().unwrap_or(p.min_replicas);
            let clamped = prev
                .max(p.min_replicas)
                .min(p.max_replicas.unwrap_or(u64::MAX));
            (name.clone(), clamped)
        })
        .collect();

    let current: u64 = assigned.values().sum();

    if current < total {
        let mut surplus = total - current;
        let mut order: Vec<&String> = eligible
            .iter()
            .filter(|(name, p)| p.weight > 0 && headroom(p, assigned[name.as_str()]) > 0)
            .map(|(name, _)| name)
            .collect();
        order.sort_by(|a, b| {
            let room = |name: &str| headroom(&eligible[name], assigned[name]);
            room(b.as_str()).cmp(&room(a.as_str())).then(a.cmp(b))
        });
        for name in order {
            if surplus == 0 {
                break;
            }
            let add = surplus.min(headroom(&eligible[name], assigned[name]));
            if let Some(count) = assigned.get_mut(name) {
                *count += add;
                surplus -= add;
            }
        }
    } else if current > total {
        let mut deficit = current - total;
        let mut order: Vec<&String> = eligible.keys().collect();
        order.sort_by(|a, b| {
            let slack = |name: &str| assigned[name].saturating_sub(eligible[name].min_replicas);
            slack(b.as_str()).cmp(&slack(a.as_str())).then(a.cmp(b))
        });
        for name in order {
            if deficit == 0 {
                break;
            }
            let take = deficit.min(assigned[name].saturating_sub(eligible[name].min_replicas));
            if let Some(count) = assigned.get_mut(name) {
                *count -= take;
                deficit -= take;
            }
        }
    }

    assigned
}

fn headroom(prefs: &ClusterPreferences, current: u64) -> u64 {
    prefs
        .max_replicas
        .map_or(u64::MAX, |max| max.saturating_sub(current))
}

/// Largest-remainder apportionment of `total` across `weights`; the
/// result sums exactly to `total` whenever any weight is positive.
/// Remainder ties break by name ascending.
fn apportion<'a>(weights: &BTreeMap<&'a str, u64>, total: u64) -> BTreeMap<&'a str, u64> {
    let weight_sum: u128 = weights.values().map(|w| u128::from(*w)).sum();
    if weight_sum == 0 {
        return weights.keys().map(|name| (*name, 0)).collect();
    }

    let mut shares: BTreeMap<&str, u64> = BTreeMap::new();
    let mut remainders: Vec<(u128, &str)> = Vec::new();
    let mut allocated: u64 = 0;

    for (name, weight) in weights {
        let exact = u128::from(total) * u128::from(*weight);
        let base = (exact / weight_sum) as u64;
        shares.insert(*name, base);
        remainders.push((exact % weight_sum, *name));
        allocated += base;
    }

    // Highest remainder first, name ascending on ties
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
    let mut leftover = total - allocated;
    for (_, name) in remainders {
        if leftover == 0 {
            break;
        }
        if let Some(share) = shares.get_mut(name) {
            *share += 1;
            leftover -= 1;
        }
    }

    shares
}

/// Render an assignment as the override the propagation engine consumes.
pub fn override_entries(assignment: &Assignment) -> OverrideSpec {
    OverrideSpec {
        overrides: assignment
            .iter()
            .map(|(cluster, replicas)| ClusterOverride {
                cluster_name: cluster.clone(),
                replicas: Some(*replicas as i64),
                patch: None,
            })
            .collect(),
    }
}

/// Recover the assignment currently in effect from an existing
/// override. First entry per cluster wins, matching apply order.
pub fn previous_assignment(overrides: &OverrideSpec) -> Assignment {
    let mut assignment = Assignment::new();
    for entry in &overrides.overrides {
        if let Some(replicas) = entry.replicas {
            assignment
                .entry(entry.cluster_name.clone())
                .or_insert(replicas.max(0) as u64);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs(min: u64, max: Option<u64>, weight: u64) -> ClusterPreferences {
        ClusterPreferences {
            min_replicas: min,
            max_replicas: max,
            weight,
        }
    }

    fn preference(
        total: u32,
        rebalance: bool,
        clusters: &[(&str, ClusterPreferences)],
    ) -> ReplicaSchedulingPreferenceSpec {
        ReplicaSchedulingPreferenceSpec {
            target_kind: "Deployment".into(),
            total_replicas: total,
            rebalance,
            clusters: clusters
                .iter()
                .map(|(name, p)| (name.to_string(), p.clone()))
                .collect(),
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn weighted_split_with_minimums_matches_the_worked_example() {
        // total=10, a{min:2,w:1}, b{min:2,w:3}: the remaining 6 split
        // 1:3 with the rounding tie going to "a".
        let pref = preference(
            10,
            true,
            &[("a", prefs(2, None, 1)), ("b", prefs(2, None, 3))],
        );
        let assignment = plan(&pref, &names(&["a", "b"]), None).unwrap();
        assert_eq!(assignment["a"], 4);
        assert_eq!(assignment["b"], 6);
    }

    #[test]
    fn assignments_sum_to_total_whenever_minimums_fit() {
        for total in [1u32, 3, 7, 10, 97] {
            let pref = preference(
                total,
                true,
                &[
                    ("a", prefs(0, None, 2)),
                    ("b", prefs(0, None, 5)),
                    ("c", prefs(0, None, 3)),
                ],
            );
            let assignment = plan(&pref, &names(&["a", "b", "c"]), None).unwrap();
            let sum: u64 = assignment.values().sum();
            assert_eq!(sum, u64::from(total), "total {total}");
        }
    }

    #[test]
    fn assignments_respect_min_and_max_bounds() {
        let pref = preference(
            20,
            true,
            &[
                ("a", prefs(1, Some(3), 10)),
                ("b", prefs(2, Some(8), 1)),
                ("c", prefs(0, None, 1)),
            ],
        );
        let assignment = plan(&pref, &names(&["a", "b", "c"]), None).unwrap();
        assert!(assignment["a"] >= 1 && assignment["a"] <= 3);
        assert!(assignment["b"] >= 2 && assignment["b"] <= 8);
        let sum: u64 = assignment.values().sum();
        assert_eq!(sum, 20);
    }

    #[test]
    fn excess_over_a_maximum_redistributes_to_the_remaining_pool() {
        // Equal weights would give 5 each, but a caps at 2
        let pref = preference(
            10,
            true,
            &[("a", prefs(0, Some(2), 1)), ("b", prefs(0, None, 1))],
        );
        let assignment = plan(&pref, &names(&["a", "b"]), None).unwrap();
        assert_eq!(assignment["a"], 2);
        assert_eq!(assignment["b"], 8);
    }

    #[test]
    fn minimums_exceeding_total_clamp_proportionally() {
        let pref = preference(
            4,
            true,
            &[("a", prefs(5, None, 1)), ("b", prefs(3, None, 1))],
        );
        let assignment = plan(&pref, &names(&["a", "b"]), None).unwrap();
        // 4 split 5:3 with the tie to "a"
        assert_eq!(assignment["a"], 3);
        assert_eq!(assignment["b"], 1);
    }

    #[test]
    fn zero_weights_leave_the_remainder_undistributed() {
        let pref = preference(
            10,
            true,
            &[("a", prefs(2, None, 0)), ("b", prefs(2, None, 0))],
        );
        let assignment = plan(&pref, &names(&["a", "b"]), None).unwrap();
        assert_eq!(assignment["a"], 2);
        assert_eq!(assignment["b"], 2);
    }

    #[test]
    fn wildcard_entry_supplies_defaults_for_unlisted_clusters() {
        let pref = preference(9, true, &[("*", prefs(0, None, 1))]);
        let assignment = plan(&pref, &names(&["a", "b", "c"]), None).unwrap();
        assert_eq!(assignment["a"], 3);
        assert_eq!(assignment["b"], 3);
        assert_eq!(assignment["c"], 3);
    }

    #[test]
    fn an_empty_preference_map_splits_equally_across_the_placement() {
        let pref = preference(4, true, &[]);
        let assignment = plan(&pref, &names(&["a", "b"]), None).unwrap();
        assert_eq!(assignment["a"], 2);
        assert_eq!(assignment["b"], 2);
    }

    #[test]
    fn eligibility_is_the_intersection_of_preference_keys_and_placement() {
        let pref = preference(
            6,
            true,
            &[("a", prefs(0, None, 1)), ("b", prefs(0, None, 1))],
        );
        // "a" is not placed, "c" has no preference entry and no wildcard
        let assignment = plan(&pref, &names(&["b", "c"]), None).unwrap();
        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment["b"], 6);
    }

    #[test]
    fn no_eligible_clusters_yields_an_empty_plan() {
        let pref = preference(6, true, &[("a", prefs(0, None, 1))]);
        let assignment = plan(&pref, &names(&["z"]), None).unwrap();
        assert!(assignment.is_empty());
    }

    #[test]
    fn without_rebalance_a_settled_assignment_is_left_alone() {
        let pref = preference(
            10,
            false,
            &[("a", prefs(2, None, 1)), ("b", prefs(2, None, 3))],
        );
        // A previous split that weighted apportionment would not choose
        let previous = Assignment::from([("a".to_string(), 5), ("b".to_string(), 5)]);
        let assignment = plan(&pref, &names(&["a", "b"]), Some(&previous)).unwrap();
        assert_eq!(assignment["a"], 5);
        assert_eq!(assignment["b"], 5);
    }

    #[test]
    fn without_rebalance_growth_lands_on_the_fewest_clusters() {
        let pref = preference(
            12,
            false,
            &[("a", prefs(0, None, 1)), ("b", prefs(0, None, 1))],
        );
        let previous = Assignment::from([("a".to_string(), 4), ("b".to_string(), 6)]);
        let assignment = plan(&pref, &names(&["a", "b"]), Some(&previous)).unwrap();
        // Both have unlimited headroom; the name tiebreak sends the
        // whole surplus to "a" rather than splitting it.
        assert_eq!(assignment["a"], 6);
        assert_eq!(assignment["b"], 6);
    }

    #[test]
    fn without_rebalance_shrink_drains_the_cluster_with_most_slack() {
        let pref = preference(
            7,
            false,
            &[("a", prefs(2, None, 1)), ("b", prefs(2, None, 1))],
        );
        let previous = Assignment::from([("a".to_string(), 4), ("b".to_string(), 6)]);
        let assignment = plan(&pref, &names(&["a", "b"]), Some(&previous)).unwrap();
        // b has 4 replicas of slack over its minimum, a only 2
        assert_eq!(assignment["a"], 4);
        assert_eq!(assignment["b"], 3);
    }

    #[test]
    fn without_rebalance_a_departed_cluster_frees_its_replicas() {
        let pref = preference(
            10,
            false,
            &[("a", prefs(0, None, 1)), ("b", prefs(0, None, 1))],
        );
        let previous = Assignment::from([("a".to_string(), 4), ("b".to_string(), 6)]);
        // b left the placement; its share must move to a
        let assignment = plan(&pref, &names(&["a"]), Some(&previous)).unwrap();
        assert_eq!(assignment.len(), 1);
        assert_eq!(assignment["a"], 10);
    }

    #[test]
    fn rebalance_ignores_the_previous_assignment() {
        let pref = preference(
            10,
            true,
            &[("a", prefs(2, None, 1)), ("b", prefs(2, None, 3))],
        );
        let previous = Assignment::from([("a".to_string(), 9), ("b".to_string(), 1)]);
        let assignment = plan(&pref, &names(&["a", "b"]), Some(&previous)).unwrap();
        assert_eq!(assignment["a"], 4);
        assert_eq!(assignment["b"], 6);
    }

    #[test]
    fn zero_total_replicas_is_rejected() {
        let pref = preference(0, true, &[("a", prefs(0, None, 1))]);
        match plan(&pref, &names(&["a"]), None) {
            Err(Error::Validation(msg)) => assert!(msg.contains("totalReplicas")),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn override_round_trip_preserves_the_assignment() {
        let assignment = Assignment::from([("a".to_string(), 4), ("b".to_string(), 6)]);
        let overrides = override_entries(&assignment);
        assert_eq!(overrides.overrides.len(), 2);
        assert_eq!(previous_assignment(&overrides), assignment);
    }
}
