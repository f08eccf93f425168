//! Dynamic group sizing (§4.5): picks `groupSize ∈ {2, 3, 5, 10}` as a pure
//! function of the participant count, then derives the groups themselves and
//! the settlement rotation mapping from `{groupSize, groupCount, n}` alone.

use serde::{Deserialize, Serialize};

const CANDIDATE_SIZES: [u32; 4] = [2, 3, 5, 10];

fn factorial(n: u32) -> u64 {
    (1..=n as u64).product::<u64>().max(1)
}

/// The chosen group shape for a pool of `n` participants, plus enough of the
/// reasoning to explain the choice in logs or a UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSizeStrategy {
    pub group_size: u32,
    pub group_count: u32,
    pub anonymity_per_group: u64,
    pub recommended_rounds: u32,
    pub reasoning: String,
}

/// Number of groups a given `group_size` produces for `n` participants.
/// Size 2 uses circular adjacent pairs, so every participant anchors one
/// group: `group_count == n`. Larger sizes partition into contiguous,
/// wrap-around slices, so `group_count == ceil(n / group_size)`.
fn group_count_for(group_size: u32, n: u32) -> u32 {
    if group_size == 2 {
        n
    } else {
        n.div_ceil(group_size)
    }
}

/// Select `groupSize` to maximize `anonymityPerGroup * groupCount`, subject to
/// `groupSize <= n`. Ties keep the earlier (smaller) candidate, which is what
/// makes the choice a pure, deterministic function of `n` alone.
pub fn choose_group_size_strategy(n: u32) -> Option<GroupSizeStrategy> {
    let mut best: Option<(u32, u64)> = None;
    for &size in CANDIDATE_SIZES.iter() {
        if size > n {
            continue;
        }
        let group_count = group_count_for(size, n);
        let product = factorial(size) * group_count as u64;
        if best.map(|(_, best_product)| product > best_product).unwrap_or(true) {
            best = Some((size, product));
        }
    }
    let (group_size, _) = best?;
    let group_count = group_count_for(group_size, n);
    Some(GroupSizeStrategy {
        group_size,
        group_count,
        anonymity_per_group: factorial(group_size),
        // This pool runs a single setup+settlement cycle rather than iterated
        // remixing, so one round covers the whole pool regardless of shape.
        recommended_rounds: 1,
        reasoning: format!(
            "n={n}: groupSize={group_size} maximizes anonymityPerGroup({}) * groupCount({group_count})",
            factorial(group_size)
        ),
    })
}

/// Build the groups themselves: each entry is the list of participant indices
/// belonging to that group, in group order.
pub fn build_groups(strategy: &GroupSizeStrategy, n: u32) -> Vec<Vec<usize>> {
    let n = n as usize;
    if strategy.group_size == 2 {
        (0..n).map(|i| vec![i, (i + 1) % n]).collect()
    } else {
        let size = strategy.group_size as usize;
        (0..strategy.group_count as usize)
            .map(|g| {
                let start = g * size;
                (0..size).map(|offset| (start + offset) % n).collect()
            })
            .collect()
    }
}

/// The settlement rotation: shared output of group `g` pays the participant
/// at the returned index. Public, deterministic, and derivable from
/// `{groupSize, groupCount, n}` alone, per §4.5.
pub fn settlement_destination(strategy: &GroupSizeStrategy, groups: &[Vec<usize>], g: usize, n: u32) -> usize {
    if strategy.group_size == 2 {
        (g + 1) % n as usize
    } else {
        let next_group = (g + 1) % strategy.group_count as usize;
        groups[next_group][0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_participants_choose_group_size_two() {
        let strategy = choose_group_size_strategy(3).unwrap();
        assert_eq!(strategy.group_size, 2);
        assert_eq!(strategy.group_count, 3);
    }

    #[test]
    fn three_participant_groups_are_circular_pairs() {
        let strategy = choose_group_size_strategy(3).unwrap();
        let groups = build_groups(&strategy, 3);
        assert_eq!(groups, vec![vec![0, 1], vec![1, 2], vec![2, 0]]);
    }

    #[test]
    fn three_participant_rotation_matches_spec_example() {
        let strategy = choose_group_size_strategy(3).unwrap();
        let groups = build_groups(&strategy, 3);
        let rotation: Vec<usize> = (0..3)
            .map(|g| settlement_destination(&strategy, &groups, g, 3))
            .collect();
        assert_eq!(rotation, vec![1, 2, 0]);
    }

    #[test]
    fn larger_pool_can_prefer_a_bigger_group_size() {
        // size 3: groupCount = ceil(4/3) = 2, product = 6*2 = 12
        // size 2: groupCount = 4, product = 2*4 = 8
        let strategy = choose_group_size_strategy(4).unwrap();
        assert_eq!(strategy.group_size, 3);
        assert_eq!(strategy.group_count, 2);
    }

    #[test]
    fn contiguous_groups_wrap_when_not_evenly_divisible() {
        let strategy = choose_group_size_strategy(4).unwrap();
        let groups = build_groups(&strategy, 4);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1, 2]);
        assert_eq!(groups[1], vec![3, 0, 1]);
    }

    #[test]
    fn insufficient_participants_yields_no_strategy() {
        assert!(choose_group_size_strategy(1).is_none());
        assert!(choose_group_size_strategy(0).is_none());
    }

    #[test]
    fn ten_participants_choose_largest_candidate() {
        // size 10: groupCount=1, product=10!*1 huge; dominates smaller candidates.
        let strategy = choose_group_size_strategy(10).unwrap();
        assert_eq!(strategy.group_size, 10);
        assert_eq!(strategy.group_count, 1);
    }
}
