//! Round-robin selection

use super::{PolicyKind, Result, SelectionError, SelectionPolicy};
use parking_lot::Mutex;

struct State<T> {
    local: Vec<T>,
    remote: Vec<T>,
    /// Next index into `local`
    local_cursor: usize,
    /// Next index into `local ++ remote`
    all_cursor: usize,
}

impl<T: Clone> State<T> {
    fn combined(&self) -> Vec<T> {
        self.local.iter().chain(self.remote.iter()).cloned().collect()
    }
}

/// Cycles through instances in list order. When local-preferring and local
/// instances exist, only the local list is cycled.
pub struct RoundRobinPolicy<T> {
    service_type: String,
    prefer_local: bool,
    state: Mutex<State<T>>,
}

impl<T> RoundRobinPolicy<T> {
    pub fn new(service_type: impl Into<String>, prefer_local: bool) -> Self {
        Self {
            service_type: service_type.into(),
            prefer_local,
            state: Mutex::new(State {
                local: Vec::new(),
                remote: Vec::new(),
                local_cursor: 0,
                all_cursor: 0,
            }),
        }
    }
}

fn rotated<T: Clone>(list: &[T], start: usize) -> Vec<T> {
    let start = start % list.len().max(1);
    list[start..].iter().chain(list[..start].iter()).cloned().collect()
}

impl<T> SelectionPolicy<T> for RoundRobinPolicy<T>
where
    T: Clone + Send + Sync,
{
    fn next_instance(&self) -> Result<T> {
        let mut state = self.state.lock();

        if self.prefer_local && !state.local.is_empty() {
            let index = state.local_cursor % state.local.len();
            state.local_cursor = (index + 1) % state.local.len();
            return Ok(state.local[index].clone());
        }

        let total = state.local.len() + state.remote.len();
        if total == 0 {
            return Err(SelectionError::service_not_found(&self.service_type));
        }
        let index = state.all_cursor % total;
        state.all_cursor = (index + 1) % total;
        let local_len = state.local.len();
        Ok(if index < local_len {
            state.local[index].clone()
        } else {
            state.remote[index - local_len].clone()
        })
    }

    fn instances(&self) -> Result<Vec<T>> {
        let state = self.state.lock();

        if self.prefer_local && !state.local.is_empty() {
            let mut ordered = rotated(&state.local, state.local_cursor);
            ordered.extend(state.remote.iter().cloned());
            return Ok(ordered);
        }

        let combined = state.combined();
        if combined.is_empty() {
            return Err(SelectionError::service_not_found(&self.service_type));
        }
        Ok(rotated(&combined, state.all_cursor))
    }

    fn update_services(&self, local: Vec<T>, remote: Vec<T>) {
        let mut state = self.state.lock();

        if local.len() != state.local.len() {
            state.local_cursor = 0;
        }
        if local.len() + remote.len() != state.local.len() + state.remote.len() {
            state.all_cursor = 0;
        }
        state.local = local;
        state.remote = remote;
    }

    fn kind(&self) -> PolicyKind {
        if self.prefer_local {
            PolicyKind::RoundRobinLocal
        } else {
            PolicyKind::RoundRobin
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn policy(local: &[&'static str], remote: &[&'static str], prefer_local: bool) -> RoundRobinPolicy<&'static str> {
        let policy = RoundRobinPolicy::new("Query", prefer_local);
        policy.update_services(local.to_vec(), remote.to_vec());
        policy
    }

    #[test]
    fn test_empty_policy_reports_not_found() {
        let policy = policy(&[], &[], false);
        assert!(matches!(
            policy.next_instance(),
            Err(SelectionError::ServiceNotFound { .. })
        ));
        assert!(policy.instances().is_err());

        let local_first = self::policy(&[], &[], true);
        assert!(local_first.next_instance().is_err());
    }

    #[test]
    fn test_local_and_remote_cycle() {
        let policy = policy(&["A", "B"], &["C"], false);
        let picks: Vec<_> = (0..4).map(|_| policy.next_instance().unwrap()).collect();
        assert_eq!(picks, vec!["A", "B", "C", "A"]);

        for window in picks.windows(3) {
            let distinct: HashSet<_> = window.iter().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_prefer_local_only_cycles_locals() {
        let policy = policy(&["A", "B"], &["C"], true);
        let picks: Vec<_> = (0..4).map(|_| policy.next_instance().unwrap()).collect();
        assert_eq!(picks, vec!["A", "B", "A", "B"]);
        // Remote instances still reachable for fan-out
        assert_eq!(policy.instances().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_prefer_local_falls_back_to_remote() {
        let policy = policy(&[], &["C", "D"], true);
        assert_eq!(policy.next_instance().unwrap(), "C");
        assert_eq!(policy.next_instance().unwrap(), "D");
    }

    #[test]
    fn test_instances_start_at_cursor() {
        let policy = policy(&["A", "B"], &["C"], false);
        policy.next_instance().unwrap();
        assert_eq!(policy.instances().unwrap(), vec!["B", "C", "A"]);
        // Listing does not advance
        assert_eq!(policy.next_instance().unwrap(), "B");
    }

    #[test]
    fn test_cursor_resets_when_length_changes() {
        let policy = policy(&["A", "B"], &["C"], false);
        policy.next_instance().unwrap();
        policy.next_instance().unwrap();

        policy.update_services(vec!["A", "B"], vec!["D"]);
        assert_eq!(policy.next_instance().unwrap(), "D");

        policy.update_services(vec!["A"], vec![]);
        assert_eq!(policy.next_instance().unwrap(), "A");
    }

    proptest! {
        #[test]
        fn prop_each_instance_once_per_cycle(size in 1usize..12, split in 0usize..12, offset in 0usize..30) {
            let split = split.min(size);
            let all: Vec<usize> = (0..size).collect();
            let policy = RoundRobinPolicy::new("Query", false);
            policy.update_services(all[..split].to_vec(), all[split..].to_vec());

            for _ in 0..offset {
                policy.next_instance().unwrap();
            }
            let cycle: HashSet<usize> = (0..size).map(|_| policy.next_instance().unwrap()).collect();
            prop_assert_eq!(cycle.len(), size);
        }
    }
}
