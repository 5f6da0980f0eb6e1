//! # Desired-state diff.
//!
//! [`filter`] compares the parameters of running agents with a new desired
//! snapshot and splits IDs into three sorted lists.
//!
//! ```text
//! running  {a, b, c}      desired {b, c', d}
//!   to_stop    = [a]      (running only)
//!   to_restart = [c]      (in both, params differ)
//!   to_start   = [d]      (desired only)
//!   b untouched
//! ```

use std::collections::HashMap;

/// Result of comparing running and desired agents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub to_start: Vec<String>,
    pub to_restart: Vec<String>,
    pub to_stop: Vec<String>,
}

impl Plan {
    /// True if nothing has to change.
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_restart.is_empty() && self.to_stop.is_empty()
    }
}

/// Diffs `running` against `desired` by key and by `==` on values.
pub fn filter<P, Q>(running: &HashMap<String, P>, desired: &HashMap<String, Q>) -> Plan
where
    P: PartialEq<Q>,
{
    let mut plan = Plan::default();

    for (id, current) in running {
        match desired.get(id) {
            None => plan.to_stop.push(id.clone()),
            Some(next) if current != next => plan.to_restart.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in desired.keys() {
        if !running.contains_key(id) {
            plan.to_start.push(id.clone());
        }
    }

    plan.to_start.sort_unstable();
    plan.to_restart.sort_unstable();
    plan.to_stop.sort_unstable();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn map(pairs: &[(&str, u8)]) -> HashMap<String, u8> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_filter() {
        let running = map(&[("a", 1), ("b", 1), ("c", 1), ("z", 1)]);
        let desired = map(&[("b", 1), ("c", 2), ("e", 1), ("d", 1)]);
        let plan = filter(&running, &desired);
        assert_eq!(plan.to_stop, vec!["a", "z"]);
        assert_eq!(plan.to_restart, vec!["c"]);
        assert_eq!(plan.to_start, vec!["d", "e"]);
    }

    #[test]
    fn test_filter_same_state_is_empty() {
        let state = map(&[("a", 1), ("b", 2)]);
        assert!(filter(&state, &state.clone()).is_empty());
        assert!(filter::<u8, u8>(&HashMap::new(), &HashMap::new()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_plan_partitions_keys(
            a in proptest::collection::hash_map("[a-f]", 0u8..3, 0..6),
            b in proptest::collection::hash_map("[a-f]", 0u8..3, 0..6),
        ) {
            let plan = filter(&a, &b);

            let stop: HashSet<_> = plan.to_stop.iter().cloned().collect();
            let start: HashSet<_> = plan.to_start.iter().cloned().collect();
            let restart: HashSet<_> = plan.to_restart.iter().cloned().collect();

            let ka: HashSet<_> = a.keys().cloned().collect();
            let kb: HashSet<_> = b.keys().cloned().collect();

            let only_a: HashSet<String> = ka.difference(&kb).cloned().collect();
            let only_b: HashSet<String> = kb.difference(&ka).cloned().collect();
            prop_assert_eq!(&stop, &only_a);
            prop_assert_eq!(&start, &only_b);
            let changed: HashSet<String> = ka
                .intersection(&kb)
                .filter(|k| a[*k] != b[*k])
                .cloned()
                .collect();
            prop_assert_eq!(&restart, &changed);

            let mut sorted = plan.to_start.clone();
            sorted.sort();
            prop_assert_eq!(sorted, plan.to_start);
        }
    }
}
