//! Channel balance policies.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use lattice_core::AppError;

use crate::models::{AccessMode, ChannelState, PChannelMeta};

/// The name of the default vchannel-fair policy.
pub const POLICY_VCHANNEL_FAIR: &str = "vchannel_fair";

/// A pluggable policy computing the desired channel layout over a node set.
///
/// The balancer diffs the desired layout against the current layout to produce an assignment
/// batch, so a policy only has to describe the end state.
pub trait BalancePolicy: Send + 'static {
    /// The registered name of this policy.
    fn name(&self) -> &'static str;

    /// Compute the desired `channel -> (access_mode, node)` layout.
    fn rebalance(&self, channels: &BTreeMap<String, PChannelMeta>, nodes: &[i64]) -> HashMap<String, (AccessMode, i64)>;
}

/// Instantiate the policy registered under the given name.
pub fn policy_for(name: &str, rebalance_threshold: f64) -> Result<Box<dyn BalancePolicy>> {
    match name {
        POLICY_VCHANNEL_FAIR => Ok(Box::new(VChannelFairPolicy { rebalance_threshold })),
        _ => Err(AppError::InvalidInput(format!("unknown balance policy `{}`", name)).into()),
    }
}

/// The vchannel-fair balance policy.
///
/// A channel's weight is the number of virtual channels riding it (minimum 1) and the goal is to
/// minimize the maximum node weight. The formulation is deterministic:
///
/// 1. Channels already assigned (or assigning) on a live node are sticky and keep their node.
/// 2. Channels without a live assignee are placed heaviest-first onto the least loaded node.
/// 3. While the most loaded node exceeds the mean weight by more than `rebalance_threshold`,
///    the lightest channel of that node is moved to the least loaded node, stopping as soon as
///    a move would no longer strictly reduce the imbalance.
///
/// Placement ties prefer the channel's most recent historical assignee to reduce WAL re-tailing,
/// then the lowest node ID. Channels with zero virtual channels are being retired and are not
/// placed at all.
pub struct VChannelFairPolicy {
    /// The relative load threshold above which channels are moved.
    pub rebalance_threshold: f64,
}

impl BalancePolicy for VChannelFairPolicy {
    fn name(&self) -> &'static str {
        POLICY_VCHANNEL_FAIR
    }

    fn rebalance(&self, channels: &BTreeMap<String, PChannelMeta>, nodes: &[i64]) -> HashMap<String, (AccessMode, i64)> {
        let mut desired = HashMap::new();
        if nodes.is_empty() {
            return desired;
        }
        let mut loads: HashMap<i64, u64> = nodes.iter().map(|id| (*id, 0)).collect();

        // Sticky placement for channels already riding a live node.
        let mut unplaced = Vec::new();
        for meta in channels.values() {
            if meta.vchannel_count == 0 {
                continue;
            }
            let live = loads.contains_key(&meta.node_id);
            match meta.channel_state() {
                ChannelState::Assigned | ChannelState::Assigning if live => {
                    *loads.entry(meta.node_id).or_default() += weight(meta);
                    desired.insert(meta.name.clone(), (meta.channel_access_mode(), meta.node_id));
                }
                _ => unplaced.push(meta),
            }
        }

        // Place the remainder heaviest-first onto the least loaded nodes.
        unplaced.sort_by(|a, b| weight(b).cmp(&weight(a)).then_with(|| a.name.cmp(&b.name)));
        for meta in unplaced {
            let node = pick_least_loaded(&loads, meta);
            *loads.entry(node).or_default() += weight(meta);
            desired.insert(meta.name.clone(), (meta.channel_access_mode(), node));
        }

        // Relieve overloaded nodes while the imbalance exceeds the threshold.
        let total: u64 = loads.values().sum();
        let mean = total as f64 / nodes.len() as f64;
        for _ in 0..channels.len() {
            let (max_node, max_load) = match loads.iter().max_by_key(|(id, load)| (**load, std::cmp::Reverse(**id))) {
                Some((id, load)) => (*id, *load),
                None => break,
            };
            if (max_load as f64) <= mean * (1.0 + self.rebalance_threshold) {
                break;
            }
            let (min_node, min_load) = match loads.iter().min_by_key(|(id, load)| (**load, **id)) {
                Some((id, load)) => (*id, *load),
                None => break,
            };
            // Lightest channel currently desired on the most loaded node.
            let candidate = desired
                .iter()
                .filter(|(_, (_, node))| *node == max_node)
                .filter_map(|(name, _)| channels.get(name))
                .min_by(|a, b| weight(a).cmp(&weight(b)).then_with(|| a.name.cmp(&b.name)));
            let candidate = match candidate {
                Some(meta) => meta,
                None => break,
            };
            let moved = weight(candidate);
            if min_load + moved >= max_load {
                break;
            }
            desired.insert(candidate.name.clone(), (candidate.channel_access_mode(), min_node));
            *loads.entry(max_node).or_default() -= moved;
            *loads.entry(min_node).or_default() += moved;
        }

        desired
    }
}

/// The balance weight of a channel.
fn weight(meta: &PChannelMeta) -> u64 {
    meta.vchannel_count.max(1) as u64
}

/// Pick the least loaded node, preferring the channel's most recent historical assignee among
/// equally loaded candidates, then the lowest node ID.
fn pick_least_loaded(loads: &HashMap<i64, u64>, meta: &PChannelMeta) -> i64 {
    let min_load = loads.values().copied().min().unwrap_or(0);
    let affinity = meta.histories.last().map(|entry| entry.node_id);
    let mut candidates: Vec<i64> = loads
        .iter()
        .filter(|(_, load)| **load == min_load)
        .map(|(id, _)| *id)
        .collect();
    candidates.sort_unstable();
    if let Some(affinity) = affinity {
        if candidates.contains(&affinity) {
            return affinity;
        }
    }
    candidates.first().copied().unwrap_or(-1)
}
