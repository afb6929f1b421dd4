//! The stage scheduler (C5, §4.5): runs one [`Graph`] stage at a time,
//! driving each staged node through `pre_op` → push delivery → `main_op`
//! → dispose bookkeeping, and enforcing the per-stage memory budget.

use std::collections::HashMap;

use async_trait::async_trait;
use dfcore_config::Configuration;
use dfcore_error::{Error, JobError, Result};
use tracing::debug;

use crate::node::{Graph, NodeId, NodeState};

/// The operator behavior a `Source` or `Distributed` node plugs into the
/// scheduler. Concrete operators (readers, shuffles, joins, ...) are out
/// of scope for this crate; this trait is the seam they implement
/// against (§4.5 "Stage loop").
#[async_trait]
pub trait StageOp: Send {
    /// Runs before any data moves in this stage, e.g. opening readers.
    async fn pre_op(&mut self) -> Result<()> {
        Ok(())
    }

    /// Does the node's actual work: pulls from parents' push chains (or
    /// a Source reads from storage) and pushes into children.
    async fn main_op(&mut self) -> Result<()>;

    /// Releases whatever resources this node was holding once every
    /// `consume = true` child has read it (§3.5: `PUSHING_DATA` →
    /// `DISPOSED`). Cached nodes are never disposed this way.
    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives one [`Graph`] through the stages required to satisfy a given
/// `Action`, per §4.5. Operators are registered per node id; a node
/// with no registered op (e.g. a test graph exercising only staging
/// logic) is driven through its state transitions with no-op behavior.
pub struct Scheduler {
    graph: Graph,
    ops: HashMap<NodeId, Box<dyn StageOp>>,
    config: Configuration,
}

impl Scheduler {
    pub fn new(graph: Graph, config: Configuration) -> Self {
        Scheduler {
            graph,
            ops: HashMap::new(),
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn register(&mut self, id: NodeId, op: Box<dyn StageOp>) {
        self.ops.insert(id, op);
    }

    /// Runs every stage required to materialize `action`'s inputs, then
    /// `action` itself, per the §4.5 stage loop:
    /// 1. `pre_op` + transition to `EXECUTING`
    /// 2. push-chain delivery happens inside `main_op` itself (C6 is
    ///    embedded in the op, not the scheduler)
    /// 3. `main_op`, then transition to `EXECUTED`
    /// 4. for each parent this node consumes, decrement its remaining-
    ///    consumer count; dispose it once that count reaches zero
    /// 5. proceed to the next stage once every node in this one is
    ///    `EXECUTED` or `DISPOSED`
    ///
    /// The first error observed anywhere in the loop is fatal to the
    /// whole job (§4.5 "Failure semantics", §7): it is wrapped as a
    /// [`JobError`] carrying the id of the node that failed, rather than
    /// surfaced as a bare [`Error`].
    pub async fn run_action(&mut self, action: NodeId) -> std::result::Result<(), JobError> {
        self.run_action_inner(action).await.map_err(|(err, node)| {
            JobError::new(err, node.map(NodeId::diag_id))
        })
    }

    async fn run_action_inner(&mut self, action: NodeId) -> std::result::Result<(), (Error, Option<NodeId>)> {
        let mut stages = self
            .graph
            .stages_for_action(action)
            .map_err(|e| (e, None))?;
        stages.push(vec![action]);

        for (stage_index, stage) in stages.iter().enumerate() {
            debug!(stage = stage_index, nodes = stage.len(), "starting stage");
            let total_weight: usize = stage
                .iter()
                .map(|&n| self.graph.memory_weight(n).unwrap_or(0))
                .sum();
            if total_weight > self.config.stage_mem {
                let err = Error::out_of_memory(
                    false,
                    format!(
                        "stage requires {total_weight} bytes but the budget is {} bytes",
                        self.config.stage_mem
                    ),
                );
                tracing::error!(%err, stage = stage_index, "stage rejected");
                return Err((err, stage.first().copied()));
            }

            for &node in stage {
                self.graph.set_state(node, NodeState::Ready).map_err(|e| (e, Some(node)))?;
            }

            for &node in stage {
                if !self
                    .graph
                    .parents_at_least_executed(node)
                    .map_err(|e| (e, Some(node)))?
                {
                    return Err((
                        Error::logic("a stage started before one of its parents finished"),
                        Some(node),
                    ));
                }

                self.graph.set_state(node, NodeState::Executing).map_err(|e| (e, Some(node)))?;
                if let Some(op) = self.ops.get_mut(&node) {
                    op.pre_op().await.map_err(|e| (e, Some(node)))?;
                    op.main_op().await.map_err(|e| (e, Some(node)))?;
                }
                self.graph.set_state(node, NodeState::Executed).map_err(|e| (e, Some(node)))?;
                self.graph.set_state(node, NodeState::PushingData).map_err(|e| (e, Some(node)))?;

                for (parent, consumes) in self.graph.staged_parent_edges(node).map_err(|e| (e, Some(node)))? {
                    if !consumes {
                        continue;
                    }
                    if self
                        .graph
                        .record_consumed(parent, node)
                        .map_err(|e| (e, Some(node)))?
                        && !self.graph.is_cached(parent).map_err(|e| (e, Some(node)))?
                    {
                        if let Some(op) = self.ops.get_mut(&parent) {
                            op.dispose().await.map_err(|e| (e, Some(parent)))?;
                        }
                        self.graph.set_state(parent, NodeState::Disposed).map_err(|e| (e, Some(node)))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingOp {
        ran: Arc<AtomicUsize>,
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageOp for CountingOp {
        async fn main_op(&mut self) -> Result<()> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dispose(&mut self) -> Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_every_staged_node_exactly_once_and_disposes_consumed_parents() {
        let mut graph = Graph::new();
        let src = graph.add_source(10);
        let shuffle = graph.add_distributed(&[(src, true)], 10).unwrap();
        let action = graph.add_action(&[(shuffle, true)]).unwrap();

        let mut scheduler = Scheduler::new(graph, Configuration::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        scheduler.register(
            src,
            Box::new(CountingOp { ran: ran.clone(), disposed: disposed.clone() }),
        );
        scheduler.register(
            shuffle,
            Box::new(CountingOp { ran: ran.clone(), disposed: disposed.clone() }),
        );
        scheduler.register(
            action,
            Box::new(CountingOp { ran: ran.clone(), disposed: disposed.clone() }),
        );

        scheduler.run_action(action).await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        // Every node in the chain has exactly one `consume = true` child
        // and gets disposed once that child has run: src (by shuffle)
        // and shuffle (by action).
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.graph().state(src).unwrap(), NodeState::Disposed);
        assert_eq!(scheduler.graph().state(shuffle).unwrap(), NodeState::Disposed);
    }

    #[tokio::test]
    async fn stage_exceeding_memory_budget_is_rejected() {
        let mut graph = Graph::new();
        let src = graph.add_source(10 * 1024 * 1024 * 1024);
        let action = graph.add_action(&[(src, true)]).unwrap();
        let mut scheduler = Scheduler::new(graph, Configuration::default());
        let err = scheduler.run_action(action).await.unwrap_err();
        assert!(matches!(err.source, Error::OutOfMemory { .. }));
        assert_eq!(err.failing_node, Some(src.diag_id()));
    }

    #[tokio::test]
    async fn cached_parent_is_not_disposed_after_being_consumed() {
        let mut graph = Graph::new();
        let src = graph.add_source(10);
        graph.mark_cached(src).unwrap();
        let action = graph.add_action(&[(src, true)]).unwrap();
        let mut scheduler = Scheduler::new(graph, Configuration::default());
        scheduler.run_action(action).await.unwrap();
        assert_eq!(scheduler.graph().state(src).unwrap(), NodeState::PushingData);
    }
}
