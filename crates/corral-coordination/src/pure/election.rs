//! Leader observation.

/// What one leader query revealed, from this node's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderObservation {
    /// No candidate holds the election.
    NoLeader,
    /// The oldest candidate carries this node's name.
    Elected,
    /// Another node leads.
    Following {
        /// Name written by the leader.
        leader: String,
    },
}

/// Classify the value of the oldest candidate key.
///
/// Leadership is decided by name, not by lease: a node restarted under the
/// same name recognises a candidate key left behind by its previous incarnation.
#[inline]
pub fn observe_leader(leader_value: Option<&str>, node_name: &str) -> LeaderObservation {
    match leader_value {
        None => LeaderObservation::NoLeader,
        Some(value) if value == node_name => LeaderObservation::Elected,
        Some(value) => LeaderObservation::Following {
            leader: value.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_election_has_no_leader() {
        assert_eq!(observe_leader(None, "node-a"), LeaderObservation::NoLeader);
    }

    #[test]
    fn own_name_is_elected() {
        assert_eq!(observe_leader(Some("node-a"), "node-a"), LeaderObservation::Elected);
    }

    #[test]
    fn other_name_is_followed() {
        assert_eq!(observe_leader(Some("node-b"), "node-a"), LeaderObservation::Following {
            leader: "node-b".to_string()
        });
    }

    proptest! {
        #[test]
        fn any_name_recognises_itself(node in "[a-z0-9-]{1,24}") {
            prop_assert_eq!(observe_leader(Some(&node), &node), LeaderObservation::Elected);
            prop_assert_eq!(observe_leader(None, &node), LeaderObservation::NoLeader);
        }

        #[test]
        fn distinct_names_follow_the_leader(leader in "[a-z0-9-]{1,24}", node in "[a-z0-9-]{1,24}") {
            prop_assume!(leader != node);
            prop_assert_eq!(
                observe_leader(Some(&leader), &node),
                LeaderObservation::Following { leader: leader.clone() }
            );
        }
    }
}
