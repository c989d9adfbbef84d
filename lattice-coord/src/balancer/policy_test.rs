use std::collections::BTreeMap;

use crate::balancer::policy::{policy_for, BalancePolicy, VChannelFairPolicy};
use crate::models::{AccessMode, AssignmentHistory, ChannelState, PChannelMeta};

fn channel(name: &str, node: i64, state: ChannelState, vchannels: u32) -> PChannelMeta {
    PChannelMeta {
        name: name.into(),
        term: if state == ChannelState::Uninitialized { 0 } else { 1 },
        node_id: node,
        state: state as i32,
        vchannel_count: vchannels,
        ..Default::default()
    }
}

fn channel_map(channels: Vec<PChannelMeta>) -> BTreeMap<String, PChannelMeta> {
    channels.into_iter().map(|meta| (meta.name.clone(), meta)).collect()
}

#[test]
fn unknown_policy_name_is_a_validation_error() {
    let res = policy_for("round_robin", 0.2);
    assert!(res.is_err(), "expected an error for an unknown policy name");
}

#[test]
fn rebalance_with_no_nodes_is_empty() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![channel("c1", -1, ChannelState::Uninitialized, 1)]);
    let desired = policy.rebalance(&channels, &[]);
    assert!(desired.is_empty(), "expected no placements without nodes, got {:?}", desired);
}

#[test]
fn fresh_channels_spread_across_nodes() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![
        channel("c1", -1, ChannelState::Uninitialized, 1),
        channel("c2", -1, ChannelState::Uninitialized, 1),
    ]);
    let desired = policy.rebalance(&channels, &[1, 2]);
    assert_eq!(desired.len(), 2, "expected both channels to be placed, got {:?}", desired);
    let nodes: Vec<i64> = desired.values().map(|(_, node)| *node).collect();
    assert!(nodes.contains(&1) && nodes.contains(&2), "expected channels spread over both nodes, got {:?}", nodes);
}

#[test]
fn node_join_moves_exactly_one_of_three_channels() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![
        channel("c1", 1, ChannelState::Assigned, 1),
        channel("c2", 1, ChannelState::Assigned, 1),
        channel("c3", 1, ChannelState::Assigned, 1),
    ]);
    let desired = policy.rebalance(&channels, &[1, 2]);
    let moved: Vec<&String> = desired.iter().filter(|(_, (_, node))| *node == 2).map(|(name, _)| name).collect();
    assert_eq!(moved.len(), 1, "expected exactly one channel to move to node 2, got {:?}", moved);
}

#[test]
fn balanced_layout_is_left_untouched() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![
        channel("c1", 1, ChannelState::Assigned, 1),
        channel("c2", 2, ChannelState::Assigned, 1),
    ]);
    let desired = policy.rebalance(&channels, &[1, 2]);
    assert_eq!(desired.get("c1").map(|(_, n)| *n), Some(1), "expected c1 to stay on node 1");
    assert_eq!(desired.get("c2").map(|(_, n)| *n), Some(2), "expected c2 to stay on node 2");
}

#[test]
fn placement_prefers_historical_assignee_on_ties() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let mut orphan = channel("c1", 9, ChannelState::Assigned, 1);
    orphan.histories.push(AssignmentHistory {
        term: 1,
        node_id: 2,
        access_mode: AccessMode::ReadOnly as i32,
    });
    let channels = channel_map(vec![orphan]);
    // Node 9 is gone; nodes 1 and 2 are both empty, so affinity must win over the lower ID.
    let desired = policy.rebalance(&channels, &[1, 2]);
    assert_eq!(
        desired.get("c1").map(|(_, n)| *n),
        Some(2),
        "expected placement to prefer the historical assignee, got {:?}",
        desired
    );
}

#[test]
fn placement_falls_back_to_lowest_node_id() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![channel("c1", -1, ChannelState::Uninitialized, 1)]);
    let desired = policy.rebalance(&channels, &[5, 3, 4]);
    assert_eq!(desired.get("c1").map(|(_, n)| *n), Some(3), "expected the lowest node ID, got {:?}", desired);
}

#[test]
fn zero_vchannel_channels_are_not_placed() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![channel("c1", -1, ChannelState::Unavailable, 0)]);
    let desired = policy.rebalance(&channels, &[1]);
    assert!(desired.is_empty(), "expected retired channels to be skipped, got {:?}", desired);
}

#[test]
fn unavailable_channel_with_vchannels_is_recreated() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![channel("c1", 1, ChannelState::Unavailable, 1)]);
    let desired = policy.rebalance(&channels, &[1, 2]);
    assert_eq!(desired.len(), 1, "expected the unavailable channel to be re-placed, got {:?}", desired);
}

#[test]
fn heavier_channels_dominate_placement() {
    let policy = VChannelFairPolicy { rebalance_threshold: 0.2 };
    let channels = channel_map(vec![
        channel("heavy", -1, ChannelState::Uninitialized, 4),
        channel("light-a", -1, ChannelState::Uninitialized, 1),
        channel("light-b", -1, ChannelState::Uninitialized, 1),
    ]);
    let desired = policy.rebalance(&channels, &[1, 2]);
    let heavy_node = desired.get("heavy").map(|(_, n)| *n).expect("expected heavy channel placed");
    for name in ["light-a", "light-b"] {
        let node = desired.get(name).map(|(_, n)| *n).expect("expected light channel placed");
        assert_ne!(node, heavy_node, "expected {} to avoid the node holding the heavy channel", name);
    }
}
