//! Key layouts shared by the lock, election and queue recipes.
//!
//! ```text
//! /lock/<key>/<lease-hex>                               lock waiter
//! <election-key>/<lease-hex>                            election candidate
//! /priorityQueue/<name>/<priority:05>/<sequence:016>    queue entry
//! __/priorityQueue/<name>/<priority:05>                 queue name registry
//! ```
//!
//! Zero-padded decimal segments make lexicographic key order equal to
//! (priority, sequence) order.

use corral_core::LeaseId;
use corral_core::Revision;
use corral_core::constants::LOCK_PREFIX;
use corral_core::constants::PRIORITY_QUEUE_PREFIX;
use corral_core::constants::PRIORITY_QUEUE_REGISTRY_PREFIX;
use corral_core::constants::PRIORITY_WIDTH;
use corral_core::constants::SEQUENCE_WIDTH;

/// Directory holding every waiter of a lock.
#[inline]
pub fn lock_prefix(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}/")
}

/// Waiter key of a session on a lock.
#[inline]
pub fn lock_waiter_key(key: &str, lease: LeaseId) -> String {
    format!("{}{lease:x}", lock_prefix(key))
}

/// Directory holding every candidate of an election.
#[inline]
pub fn election_prefix(key: &str) -> String {
    format!("{key}/")
}

/// Candidate key of a session in an election.
#[inline]
pub fn election_candidate_key(key: &str, lease: LeaseId) -> String {
    format!("{key}/{lease:x}")
}

/// Directory holding every entry of a queue.
#[inline]
pub fn queue_prefix(name: &str) -> String {
    format!("{PRIORITY_QUEUE_PREFIX}{name}/")
}

/// Entry key for `priority` at `sequence`.
#[inline]
pub fn queue_entry_key(name: &str, priority: u16, sequence: Revision) -> String {
    format!(
        "{}{priority:0pw$}/{sequence:0sw$}",
        queue_prefix(name),
        pw = PRIORITY_WIDTH,
        sw = SEQUENCE_WIDTH
    )
}

/// Directory holding the registry entries of a queue.
#[inline]
pub fn queue_registry_prefix(name: &str) -> String {
    format!("{PRIORITY_QUEUE_REGISTRY_PREFIX}{name}/")
}

/// Registry key recording that `name` has used `priority`.
#[inline]
pub fn queue_registry_key(name: &str, priority: u16) -> String {
    format!("{}{priority:0pw$}", queue_registry_prefix(name), pw = PRIORITY_WIDTH)
}

/// Parse `(priority, sequence)` out of an entry key of queue `name`.
pub fn parse_queue_entry_key(name: &str, key: &str) -> Option<(u16, Revision)> {
    let rest = key.strip_prefix(&queue_prefix(name))?;
    let (priority, sequence) = rest.split_once('/')?;
    if priority.len() != PRIORITY_WIDTH || sequence.len() != SEQUENCE_WIDTH {
        return None;
    }
    Some((priority.parse().ok()?, sequence.parse().ok()?))
}

/// Queue name a registry key belongs to.
pub fn queue_name_from_registry_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(PRIORITY_QUEUE_REGISTRY_PREFIX)?;
    let (name, priority) = rest.split_once('/')?;
    if name.is_empty() || priority.len() != PRIORITY_WIDTH {
        return None;
    }
    Some(name)
}

/// Registry prefix scanned when listing queues under `namespace`.
#[inline]
pub fn queue_registry_namespace(namespace: &str) -> String {
    format!("{PRIORITY_QUEUE_REGISTRY_PREFIX}{namespace}")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn lock_and_election_keys() {
        assert_eq!(lock_waiter_key("jobs", 0x694d), "/lock/jobs/694d");
        assert_eq!(election_candidate_key("/election/api", 255), "/election/api/ff");
        assert!(election_candidate_key("/e", 1).starts_with(&election_prefix("/e")));
    }

    #[test]
    fn queue_keys_are_zero_padded() {
        assert_eq!(queue_entry_key("jobs", 1, 42), "/priorityQueue/jobs/00001/0000000000000042");
        assert_eq!(queue_registry_key("jobs", 1), "__/priorityQueue/jobs/00001");
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(parse_queue_entry_key("jobs", "/priorityQueue/jobs/00003/0000000000000007"), Some((3, 7)));
        assert_eq!(parse_queue_entry_key("jobs", "/priorityQueue/other/00003/0000000000000007"), None);
        assert_eq!(parse_queue_entry_key("jobs", "/priorityQueue/jobs/3/7"), None);
    }

    #[test]
    fn registry_key_yields_queue_name() {
        assert_eq!(queue_name_from_registry_key("__/priorityQueue/jobs/00001"), Some("jobs"));
        assert_eq!(queue_name_from_registry_key("__/priorityQueue/team/a/00001"), None);
        assert_eq!(queue_name_from_registry_key("__/priorityQueue/00001"), None);
        assert_eq!(queue_name_from_registry_key("/priorityQueue/jobs/00001"), None);
    }

    proptest! {
        #[test]
        fn entry_key_order_matches_priority_then_sequence(
            a in (any::<u16>(), 0i64..1_000_000_000_000),
            b in (any::<u16>(), 0i64..1_000_000_000_000),
        ) {
            let key_a = queue_entry_key("q", a.0, a.1);
            let key_b = queue_entry_key("q", b.0, b.1);
            prop_assert_eq!(key_a.cmp(&key_b), a.cmp(&b));
        }

        #[test]
        fn entry_key_parses_back(priority in any::<u16>(), sequence in 0i64..1_000_000_000_000) {
            let key = queue_entry_key("q", priority, sequence);
            prop_assert_eq!(parse_queue_entry_key("q", &key), Some((priority, sequence)));
        }
    }
}
