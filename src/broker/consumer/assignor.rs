use std::collections::BTreeMap;

/// Range assignment of `partitions` over `members`.
///
/// Members keep the order they are given in (the coordinator passes join
/// order). Each member receives a contiguous range; the first
/// `partitions % members` members get one extra partition. Every member
/// appears in the result, idle members with an empty range. The function is
/// pure: identical inputs always produce an identical assignment.
///
/// # Examples
///
/// ```
/// use rust_broker_core::broker::consumer::assignor::assign;
///
/// let members = vec!["a".to_string(), "b".to_string()];
/// let assignment = assign(&[0, 1, 2, 3], &members);
/// assert_eq!(assignment["a"], vec![0, 1]);
/// assert_eq!(assignment["b"], vec![2, 3]);
/// ```
pub fn assign<P: Clone>(partitions: &[P], members: &[String]) -> BTreeMap<String, Vec<P>> {
    let mut assignment = BTreeMap::new();
    if members.is_empty() {
        return assignment;
    }

    let per_member = partitions.len() / members.len();
    let extra = partitions.len() % members.len();
    let mut start = 0;
    for (i, member) in members.iter().enumerate() {
        let count = per_member + usize::from(i < extra);
        assignment.insert(member.clone(), partitions[start..start + count].to_vec());
        start += count;
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("consumer_{}", i)).collect()
    }

    fn sizes(assignment: &BTreeMap<String, Vec<u32>>) -> Vec<usize> {
        let mut sizes: Vec<usize> = assignment.values().map(Vec::len).collect();
        sizes.sort_unstable();
        sizes
    }

    #[test]
    fn test_four_partitions_two_members() {
        let assignment = assign(&[0u32, 1, 2, 3], &members(2));
        assert_eq!(assignment["consumer_0"], vec![0, 1]);
        assert_eq!(assignment["consumer_1"], vec![2, 3]);
    }

    #[test]
    fn test_more_members_than_partitions_leaves_one_idle() {
        let assignment = assign(&[0u32, 1, 2, 3], &members(5));
        assert_eq!(assignment.len(), 5);
        assert_eq!(sizes(&assignment), vec![0, 1, 1, 1, 1]);
        assert!(assignment["consumer_4"].is_empty());
    }

    #[test]
    fn test_single_member_owns_everything() {
        let assignment = assign(&[0u32, 1, 2, 3], &members(1));
        assert_eq!(assignment["consumer_0"], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_no_members() {
        assert!(assign(&[0u32, 1], &[]).is_empty());
    }

    #[test]
    fn test_uneven_split_differs_by_at_most_one() {
        let partitions: Vec<u32> = (0..7).collect();
        let assignment = assign(&partitions, &members(3));
        assert_eq!(assignment["consumer_0"], vec![0, 1, 2]);
        assert_eq!(assignment["consumer_1"], vec![3, 4]);
        assert_eq!(assignment["consumer_2"], vec![5, 6]);
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let partitions: Vec<u32> = (0..10).collect();
        let first = assign(&partitions, &members(4));
        let second = assign(&partitions, &members(4));
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_partition_assigned_exactly_once() {
        for n_members in 1..6 {
            for n_partitions in 0..12u32 {
                let partitions: Vec<u32> = (0..n_partitions).collect();
                let assignment = assign(&partitions, &members(n_members));
                let mut all: Vec<u32> = assignment.values().flatten().copied().collect();
                all.sort_unstable();
                assert_eq!(all, partitions);
                let sizes = sizes(&assignment);
                assert!(sizes[sizes.len() - 1] - sizes[0] <= 1);
            }
        }
    }
}
