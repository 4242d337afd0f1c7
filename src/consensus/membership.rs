//! Consenter-set reconciliation: diffing the stored membership against a
//! proposed one and turning the difference into raft configuration changes.

use std::collections::BTreeMap;

use raft::eraftpb::{ConfChange, ConfChangeType, ConfState};

use crate::types::metadata::{Consenter, RaftMetadata};

/// Difference between the active consenter set and a proposed one. Config
/// updates are admitted only while the total change count stays at one.
#[derive(Clone, Debug, Default)]
pub struct MembershipChanges {
    pub added: Vec<Consenter>,
    pub removed: Vec<Consenter>,
}

impl MembershipChanges {
    pub fn compute(current: &BTreeMap<u64, Consenter>, proposed: &[Consenter]) -> Self {
        let added = proposed
            .iter()
            .filter(|consenter| !current.values().any(|c| c == *consenter))
            .cloned()
            .collect();
        let removed = current
            .values()
            .filter(|consenter| !proposed.iter().any(|c| c == *consenter))
            .cloned()
            .collect();
        MembershipChanges { added, removed }
    }

    pub fn total_changes(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// Folds the change into `metadata` and returns the raft ConfChange to
    /// propose: an added consenter is assigned a freshly minted node id, a
    /// removed one gives up its existing id. Returns `None` when the sets
    /// already match.
    pub fn update_raft_metadata_and_conf_change(
        &self,
        metadata: &mut RaftMetadata,
    ) -> Option<ConfChange> {
        if let Some(consenter) = self.added.first() {
            let node_id = metadata.next_consenter_id;
            metadata.consenters.insert(node_id, consenter.clone());
            metadata.next_consenter_id += 1;

            let mut cc = ConfChange::default();
            cc.node_id = node_id;
            cc.set_change_type(ConfChangeType::AddNode);
            return Some(cc);
        }

        if let Some(consenter) = self.removed.first() {
            let node_id = metadata
                .consenters
                .iter()
                .find(|(_, c)| *c == consenter)
                .map(|(id, _)| *id)?;
            metadata.consenters.remove(&node_id);

            let mut cc = ConfChange::default();
            cc.node_id = node_id;
            cc.set_change_type(ConfChangeType::RemoveNode);
            return Some(cc);
        }

        None
    }
}

/// Synthesizes the ConfChange that reconciles the live raft configuration
/// with the consenter mapping stored in the latest config block. Used by a
/// newly elected leader to resume an interrupted membership change; since at
/// most one node is added or removed per config block, a cardinality
/// difference pinpoints the outstanding change.
pub fn conf_change(metadata: &RaftMetadata, conf_state: &ConfState) -> ConfChange {
    let mut cc = ConfChange::default();
    if conf_state.voters.len() < metadata.consenters.len() {
        cc.set_change_type(ConfChangeType::AddNode);
        for &id in metadata.consenters.keys() {
            if !conf_state.voters.contains(&id) {
                cc.node_id = id;
            }
        }
    } else {
        cc.set_change_type(ConfChangeType::RemoveNode);
        for &id in &conf_state.voters {
            if !metadata.consenters.contains_key(&id) {
                cc.node_id = id;
            }
        }
    }
    cc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consenter(host: &str) -> Consenter {
        Consenter {
            host: host.to_string(),
            port: 7050,
            server_tls_cert: Vec::new(),
            client_tls_cert: host.as_bytes().to_vec(),
        }
    }

    fn consenter_map(hosts: &[&str]) -> BTreeMap<u64, Consenter> {
        hosts
            .iter()
            .enumerate()
            .map(|(i, host)| (i as u64 + 1, consenter(host)))
            .collect()
    }

    #[test]
    fn no_changes_for_identical_sets() {
        let current = consenter_map(&["a", "b", "c"]);
        let proposed: Vec<_> = current.values().cloned().collect();
        let changes = MembershipChanges::compute(&current, &proposed);
        assert_eq!(changes.total_changes(), 0);

        let mut metadata = RaftMetadata::new(current);
        assert!(changes
            .update_raft_metadata_and_conf_change(&mut metadata)
            .is_none());
    }

    #[test]
    fn detects_single_addition() {
        let current = consenter_map(&["a", "b"]);
        let mut proposed: Vec<_> = current.values().cloned().collect();
        proposed.push(consenter("c"));

        let changes = MembershipChanges::compute(&current, &proposed);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.removed.len(), 0);

        let mut metadata = RaftMetadata::new(current);
        let cc = changes
            .update_raft_metadata_and_conf_change(&mut metadata)
            .unwrap();
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
        assert_eq!(cc.node_id, 3);
        assert_eq!(metadata.next_consenter_id, 4);
        assert_eq!(metadata.consenters.len(), 3);
    }

    #[test]
    fn detects_single_removal() {
        let current = consenter_map(&["a", "b", "c"]);
        let proposed: Vec<_> = current
            .values()
            .filter(|c| c.host != "b")
            .cloned()
            .collect();

        let changes = MembershipChanges::compute(&current, &proposed);
        assert_eq!(changes.removed.len(), 1);

        let mut metadata = RaftMetadata::new(current);
        let cc = changes
            .update_raft_metadata_and_conf_change(&mut metadata)
            .unwrap();
        assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);
        assert_eq!(cc.node_id, 2);
        assert!(!metadata.consenters.contains_key(&2));
    }

    #[test]
    fn replacement_counts_as_two_changes() {
        let current = consenter_map(&["a", "b"]);
        let proposed = vec![consenter("a"), consenter("c")];
        let changes = MembershipChanges::compute(&current, &proposed);
        assert_eq!(changes.total_changes(), 2);
    }

    #[test]
    fn synthesizes_pending_addition() {
        let metadata = RaftMetadata::new(consenter_map(&["a", "b", "c"]));
        let mut conf_state = ConfState::default();
        conf_state.voters = vec![1, 2];

        let cc = conf_change(&metadata, &conf_state);
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
        assert_eq!(cc.node_id, 3);
    }

    #[test]
    fn synthesizes_pending_removal() {
        let metadata = RaftMetadata::new(consenter_map(&["a", "b"]));
        let mut conf_state = ConfState::default();
        conf_state.voters = vec![1, 2, 3];

        let cc = conf_change(&metadata, &conf_state);
        assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);
        assert_eq!(cc.node_id, 3);
    }
}
