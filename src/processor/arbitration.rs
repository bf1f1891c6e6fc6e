use std::collections::HashMap;

use chrono::{DateTime, TimeZone};
use tracing::trace;

use crate::{
    data_model::{EpochMs, LibraryFile, NodeId, ProcessingNode},
    executors::NodeBlacklist,
    utils::is_version_compatible,
};

/// Cluster state a single arbitration pass looks at.
pub struct ArbitrationContext<'a, Tz: TimeZone> {
    pub now: &'a DateTime<Tz>,
    pub now_ms: EpochMs,
    pub server_version: &'a str,
    pub stale_after_ms: u64,
    pub runner_counts: &'a HashMap<NodeId, u32>,
    pub blacklist: &'a NodeBlacklist,
}

impl<Tz: TimeZone> ArbitrationContext<'_, Tz> {
    fn runners(&self, node: &NodeId) -> u32 {
        self.runner_counts.get(node).copied().unwrap_or(0)
    }

    /// Whether `other` could take `file` right now.
    fn can_compete(&self, other: &ProcessingNode, file: &LibraryFile) -> bool {
        if !other.enabled || file.is_sticky_to(&other.uid) {
            return false;
        }
        if self.blacklist.is_blocked(&other.uid, self.now_ms) {
            return false;
        }
        if !other.is_in_schedule(self.now)
            || !is_version_compatible(&other.version, self.server_version)
            || other.is_stale(self.now_ms, self.stale_after_ms)
            || !other.libraries.allows(&file.library_uid)
            || !other.accepts_size(file.size)
        {
            return false;
        }
        self.runners(&other.uid) < other.flow_runners
    }
}

/// Effective priority is the configured priority minus the active runners.
pub fn effective_priority(node: &ProcessingNode, runners: u32) -> i64 {
    i64::from(node.priority) - i64::from(runners)
}

/// Returns true when another node is better placed to process `file` than
/// `requesting`, in which case the file stays queued for that node's poll.
pub fn should_defer<Tz: TimeZone>(
    requesting: &ProcessingNode,
    file: &LibraryFile,
    all_nodes: &[ProcessingNode],
    ctx: &ArbitrationContext<'_, Tz>,
) -> bool {
    let requesting_runners = ctx.runners(&requesting.uid);
    let requesting_priority = effective_priority(requesting, requesting_runners);

    for other in all_nodes {
        if other.uid == requesting.uid || !ctx.can_compete(other, file) {
            continue;
        }
        let other_runners = ctx.runners(&other.uid);
        let other_priority = effective_priority(other, other_runners);

        if other_priority < requesting_priority {
            continue;
        }
        if other_priority == requesting_priority {
            // Equal standing keeps the file when the requester is not busier.
            if requesting_runners <= other_runners {
                continue;
            }
            trace!(
                file_uid = %file.uid,
                other_node = %other.uid,
                requesting_runners,
                other_runners,
                "deferring to less loaded node of equal priority"
            );
            return true;
        }
        trace!(
            file_uid = %file.uid,
            other_node = %other.uid,
            other_priority,
            requesting_priority,
            "deferring to higher priority node"
        );
        return true;
    }
    false
}
