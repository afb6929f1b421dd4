//! The DAG node model (§3.5): operator kinds, lifecycle states, and the
//! [`Graph`] that tracks parent/child edges, per-edge `consume` flags,
//! and topological staging.

use std::collections::{HashMap, VecDeque};

use dfcore_error::{DiagId, Error, Result};
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Unique identifier for a DAG node, stable for the node's lifetime.
    pub struct NodeId;
}

impl NodeId {
    /// Converts to the opaque id carried by fatal diagnostics (§7).
    pub fn diag_id(self) -> DiagId {
        use slotmap::Key;
        DiagId(self.data().as_ffi())
    }
}

/// The four node kinds of §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// No parents; emits items into its children.
    Source,
    /// Single-parent transformation fused into its parent's chain; never
    /// materializes and is never separately staged (§4.6).
    Local,
    /// Output is a shuffle or collective; materializes into a Stream or
    /// File and gets its own topological stage.
    Distributed,
    /// A sink that drives execution; has no children.
    Action,
}

/// Lifecycle states a node passes through (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Ready,
    Executing,
    Executed,
    PushingData,
    Disposed,
}

struct NodeRecord {
    kind: NodeKind,
    parents: Vec<NodeId>,
    /// Outgoing edges as `(child, consume)`; `consume` edges must be
    /// drained before this node can be disposed.
    children: Vec<(NodeId, bool)>,
    /// Number of outgoing `consume = true` edges not yet consumed.
    consumers_remaining: usize,
    memory_weight: usize,
    /// Set when any consumer reads with `keep` semantics, or the caller
    /// explicitly requests caching; such nodes materialize to a
    /// re-readable File instead of being consumed exactly once.
    cached: bool,
    state: NodeState,
}

/// The operator DAG (§3.5, §4.5). Tracks node kinds, parent/child
/// edges with per-edge `consume` flags, and lifecycle state; does not
/// itself run any operator code (see `dfcore_dag::scheduler`).
#[derive(Default)]
pub struct Graph {
    nodes: SlotMap<NodeId, NodeRecord>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: SlotMap::with_key() }
    }

    pub fn add_source(&mut self, memory_weight: usize) -> NodeId {
        self.insert(NodeKind::Source, Vec::new(), memory_weight)
    }

    /// Adds a fused local transform over `parent`. `consume` matches
    /// §4.6: an LOp forwards its parent's consumption semantics, since
    /// it never materializes on its own.
    pub fn add_local(&mut self, parent: NodeId, consume: bool) -> Result<NodeId> {
        let weight = self.memory_weight(parent)?;
        let id = self.insert(NodeKind::Local, vec![parent], weight);
        self.link(parent, id, consume)?;
        Ok(id)
    }

    /// Adds a distributed operator (shuffle/collective) with one or more
    /// parents, each with its own `consume` flag (multi-parent DOps
    /// register a flag per parent per Design Notes §9).
    pub fn add_distributed(&mut self, parents: &[(NodeId, bool)], memory_weight: usize) -> Result<NodeId> {
        if parents.is_empty() {
            return Err(Error::logic("a distributed node needs at least one parent"));
        }
        let parent_ids: Vec<NodeId> = parents.iter().map(|&(p, _)| p).collect();
        let id = self.insert(NodeKind::Distributed, parent_ids, memory_weight);
        for &(parent, consume) in parents {
            self.link(parent, id, consume)?;
        }
        Ok(id)
    }

    pub fn add_action(&mut self, parents: &[(NodeId, bool)]) -> Result<NodeId> {
        if parents.is_empty() {
            return Err(Error::logic("an action needs at least one parent"));
        }
        let parent_ids: Vec<NodeId> = parents.iter().map(|&(p, _)| p).collect();
        let id = self.insert(NodeKind::Action, parent_ids, 0);
        for &(parent, consume) in parents {
            self.link(parent, id, consume)?;
        }
        Ok(id)
    }

    fn insert(&mut self, kind: NodeKind, parents: Vec<NodeId>, memory_weight: usize) -> NodeId {
        self.nodes.insert(NodeRecord {
            kind,
            parents,
            children: Vec::new(),
            consumers_remaining: 0,
            memory_weight,
            cached: false,
            state: NodeState::New,
        })
    }

    fn link(&mut self, parent: NodeId, child: NodeId, consume: bool) -> Result<()> {
        let parent_rec = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::logic("edge references an unknown parent node"))?;
        parent_rec.children.push((child, consume));
        if consume {
            parent_rec.consumers_remaining += 1;
        }
        Ok(())
    }

    pub fn kind(&self, id: NodeId) -> Result<NodeKind> {
        self.rec(id).map(|r| r.kind)
    }

    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        self.rec(id).map(|r| r.state)
    }

    pub fn memory_weight(&self, id: NodeId) -> Result<usize> {
        self.rec(id).map(|r| r.memory_weight)
    }

    pub fn is_cached(&self, id: NodeId) -> Result<bool> {
        self.rec(id).map(|r| r.cached)
    }

    /// Marks a node `cached`: a consumer reads it with `keep` semantics,
    /// or the caller explicitly requested caching (§4.5 "Cache
    /// semantics"). Its materialized File becomes re-consumable.
    pub fn mark_cached(&mut self, id: NodeId) -> Result<()> {
        self.rec_mut(id)?.cached = true;
        Ok(())
    }

    fn rec(&self, id: NodeId) -> Result<&NodeRecord> {
        self.nodes.get(id).ok_or_else(|| Error::logic("unknown node id"))
    }

    fn rec_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        self.nodes.get_mut(id).ok_or_else(|| Error::logic("unknown node id"))
    }

    pub(crate) fn set_state(&mut self, id: NodeId, state: NodeState) -> Result<()> {
        self.rec_mut(id)?.state = state;
        Ok(())
    }

    /// A node enters `EXECUTING` only once every parent is at least
    /// `EXECUTED` (§3.5 invariant).
    pub(crate) fn parents_at_least_executed(&self, id: NodeId) -> Result<bool> {
        let rec = self.rec(id)?;
        for &parent in &rec.parents {
            let state = self.state(parent)?;
            if matches!(state, NodeState::New | NodeState::Ready | NodeState::Executing) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decrements `node`'s remaining-consumer count for each outgoing
    /// `consume = true` edge to `consumer`; returns `true` if the count
    /// just reached zero (the caller should dispose `node`).
    pub(crate) fn record_consumed(&mut self, node: NodeId, consumer: NodeId) -> Result<bool> {
        let rec = self.rec_mut(node)?;
        let mut hit = false;
        for &(child, consume) in &rec.children {
            if child == consumer && consume {
                hit = true;
            }
        }
        if !hit {
            return Ok(false);
        }
        rec.consumers_remaining = rec.consumers_remaining.saturating_sub(1);
        Ok(rec.consumers_remaining == 0)
    }

    /// The direct parents of a node (with no fusion skipping applied).
    pub fn parents(&self, id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.rec(id)?.parents.clone())
    }

    fn edge_consume(&self, parent: NodeId, child: NodeId) -> Result<bool> {
        Ok(self
            .rec(parent)?
            .children
            .iter()
            .find(|&&(c, _)| c == child)
            .map(|&(_, consume)| consume)
            .unwrap_or(false))
    }

    /// Every staged ancestor of `node` together with the *effective*
    /// consume flag of the path leading to it, resolved *through* fused
    /// `Local` nodes (§4.6: an LOp chain is not separately staged; its
    /// nearest `Source`/`Distributed` ancestor is, and a path only
    /// consumes that ancestor if every hop along the fused chain does).
    pub(crate) fn staged_parent_edges(&self, id: NodeId) -> Result<Vec<(NodeId, bool)>> {
        let mut out = Vec::new();
        let mut stack: Vec<(NodeId, bool)> = self
            .rec(id)?
            .parents
            .iter()
            .map(|&p| Ok((p, self.edge_consume(p, id)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut seen = std::collections::HashSet::new();
        while let Some((p, consume_acc)) = stack.pop() {
            if !seen.insert(p) {
                continue;
            }
            match self.kind(p)? {
                NodeKind::Local => {
                    for &gp in &self.rec(p)?.parents {
                        let edge = self.edge_consume(gp, p)?;
                        stack.push((gp, consume_acc && edge));
                    }
                }
                NodeKind::Source | NodeKind::Distributed => out.push((p, consume_acc)),
                NodeKind::Action => {
                    return Err(Error::logic("an action node cannot be an ancestor of another node"))
                }
            }
        }
        Ok(out)
    }

    /// Walks back from `action`, collecting its required Source/DOp
    /// ancestors, and groups them into topological stages: stage `k`
    /// contains every ancestor whose longest dependency chain from a
    /// source has length `k`. Within a stage, nodes are ordered by id
    /// for determinism (§4.5 "Triggering").
    pub fn stages_for_action(&self, action: NodeId) -> Result<Vec<Vec<NodeId>>> {
        if self.kind(action)? != NodeKind::Action {
            return Err(Error::logic("stages_for_action requires an Action node"));
        }

        let mut required: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        let mut queue: VecDeque<NodeId> = self
            .staged_parent_edges(action)?
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        while let Some(n) = queue.pop_front() {
            if !required.insert(n) {
                continue;
            }
            for (parent, _) in self.staged_parent_edges(n)? {
                queue.push_back(parent);
            }
        }

        let mut level: HashMap<NodeId, usize> = HashMap::new();
        let mut remaining: Vec<NodeId> = required.iter().copied().collect();
        remaining.sort_by_key(|id| format!("{id:?}"));

        // Iterative fixed-point: a node's level is one past the max
        // level of its required staged parents (0 if it has none). The
        // required set is finite and acyclic (cycles are rejected at
        // edge-construction time by the caller's own bookkeeping), so
        // this converges in at most `required.len()` passes.
        for _ in 0..=required.len() {
            let mut changed = false;
            for &n in &remaining {
                let parents: Vec<NodeId> = self.staged_parent_edges(n)?.into_iter().map(|(p, _)| p).collect();
                let relevant: Vec<usize> = parents
                    .iter()
                    .filter(|p| required.contains(p))
                    .filter_map(|p| level.get(p).copied())
                    .collect();
                let ready = parents.iter().all(|p| !required.contains(p) || level.contains_key(p));
                if !ready {
                    continue;
                }
                let new_level = relevant.into_iter().max().map(|m| m + 1).unwrap_or(0);
                if level.get(&n) != Some(&new_level) {
                    level.insert(n, new_level);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        if level.len() != required.len() {
            return Err(Error::logic("cyclic dependency detected while staging DAG"));
        }

        let max_level = level.values().copied().max().unwrap_or(0);
        let mut stages: Vec<Vec<NodeId>> = vec![Vec::new(); max_level + 1];
        for (n, lvl) in level {
            stages[lvl].push(n);
        }
        for stage in &mut stages {
            stage.sort_by_key(|id| format!("{id:?}"));
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_action_has_one_stage() {
        let mut g = Graph::new();
        let src = g.add_source(100);
        let action = g.add_action(&[(src, true)]).unwrap();
        let stages = g.stages_for_action(action).unwrap();
        assert_eq!(stages, vec![vec![src]]);
    }

    #[test]
    fn local_ops_are_fused_out_of_staging() {
        let mut g = Graph::new();
        let src = g.add_source(100);
        let mapped = g.add_local(src, true).unwrap();
        let filtered = g.add_local(mapped, true).unwrap();
        let action = g.add_action(&[(filtered, true)]).unwrap();
        let stages = g.stages_for_action(action).unwrap();
        assert_eq!(stages, vec![vec![src]]);
    }

    #[test]
    fn two_stage_shuffle_chain_orders_by_dependency() {
        let mut g = Graph::new();
        let src = g.add_source(100);
        let shuffle1 = g.add_distributed(&[(src, true)], 50).unwrap();
        let shuffle2 = g.add_distributed(&[(shuffle1, true)], 50).unwrap();
        let action = g.add_action(&[(shuffle2, true)]).unwrap();
        let stages = g.stages_for_action(action).unwrap();
        assert_eq!(stages, vec![vec![src], vec![shuffle1], vec![shuffle2]]);
    }

    #[test]
    fn consume_edge_dispose_fires_once_all_consumers_drain() {
        let mut g = Graph::new();
        let src = g.add_source(10);
        let a = g.add_distributed(&[(src, true)], 10).unwrap();
        let b = g.add_distributed(&[(src, true)], 10).unwrap();
        assert!(!g.record_consumed(src, a).unwrap());
        assert!(g.record_consumed(src, b).unwrap());
    }

    #[test]
    fn multi_parent_distributed_node_tracks_both_parents() {
        let mut g = Graph::new();
        let left = g.add_source(10);
        let right = g.add_source(10);
        let join = g.add_distributed(&[(left, true), (right, true)], 20).unwrap();
        let action = g.add_action(&[(join, true)]).unwrap();
        let stages = g.stages_for_action(action).unwrap();
        assert_eq!(stages.len(), 2);
        let mut stage0 = stages[0].clone();
        stage0.sort_by_key(|id| format!("{id:?}"));
        let mut expected = vec![left, right];
        expected.sort_by_key(|id| format!("{id:?}"));
        assert_eq!(stage0, expected);
        assert_eq!(stages[1], vec![join]);
    }
}
