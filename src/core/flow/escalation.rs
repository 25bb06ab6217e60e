//! Escalation tables and handler resolution.

use crate::core::failure::{FailureKinds, KindId};

use super::NodeId;

/// One escalation edge: failures of `kind` (or a descendant) go to `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationEntry {
    /// Kind the entry was registered for.
    pub kind: KindId,
    /// Handler node.
    pub handler: NodeId,
}

/// Ordered escalation edges of a node, a flow, or a process.
#[derive(Debug, Clone, Default)]
pub struct EscalationTable {
    entries: Vec<EscalationEntry>,
}

impl EscalationTable {
    /// Empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append an entry. Declaration order is the tie-break.
    pub fn push(&mut self, kind: KindId, handler: NodeId) {
        self.entries.push(EscalationEntry { kind, handler });
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[EscalationEntry] {
        &self.entries
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler for a failure of kind `actual`.
    ///
    /// The most specific entry wins: the one whose kind is the closest
    /// ancestor of `actual` (`actual` itself being closest). Among entries at
    /// the same distance, the first declared wins.
    #[must_use]
    pub fn resolve(&self, kinds: &FailureKinds, actual: KindId) -> Option<NodeId> {
        let mut best: Option<(usize, NodeId)> = None;
        for entry in &self.entries {
            let Some(distance) = kinds.distance(actual, entry.kind) else {
                continue;
            };
            // Strict comparison keeps the earlier entry on ties.
            if best.is_none_or(|(closest, _)| distance < closest) {
                best = Some((distance, entry.handler));
            }
        }
        best.map(|(_, handler)| handler)
    }
}
