use std::collections::HashMap;

use crate::error::EngineResult;
use crate::graph::Graph;
use crate::types::NodeId;

/// Produces an ordered sequence of groups of Nodes to run. Nodes within
/// one group may run concurrently with each other; a later group never
/// starts before every Node in an earlier group has finished.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;
    fn plan(&self, graph: &Graph) -> EngineResult<Vec<Vec<NodeId>>>;
}

/// Kahn order, one Node per group: fully serial, deterministic.
#[derive(Debug, Default)]
pub struct TopologicalScheduler;

impl Scheduler for TopologicalScheduler {
    fn name(&self) -> &str {
        "topological"
    }

    fn plan(&self, graph: &Graph) -> EngineResult<Vec<Vec<NodeId>>> {
        Ok(graph.topological_sort()?.into_iter().map(|id| vec![id]).collect())
    }
}

/// Level-partitions the DAG: a Node's level is one more than the
/// deepest level of any Node that produces one of its inputs. Nodes
/// sharing a level have no edge between them and can fan out across a
/// worker pool; a barrier separates levels.
#[derive(Debug, Default)]
pub struct ParallelScheduler;

impl Scheduler for ParallelScheduler {
    fn name(&self) -> &str {
        "parallel"
    }

    fn plan(&self, graph: &Graph) -> EngineResult<Vec<Vec<NodeId>>> {
        let order = graph.topological_sort()?;
        let depth = compute_depths(graph, &order);

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_depth + 1];
        for &node_id in &order {
            levels[depth[&node_id]].push(node_id);
        }
        Ok(levels)
    }
}

/// A Node's level is one more than the deepest level of any Node that
/// produces one of its inputs, same as [`ParallelScheduler`] computes —
/// shared so [`PipelineScheduler`] can use it as a hard group boundary.
fn compute_depths(graph: &Graph, order: &[NodeId]) -> HashMap<NodeId, usize> {
    let mut depth: HashMap<NodeId, usize> = HashMap::new();
    for &node_id in order {
        let node = graph.node(node_id).expect("topological_sort returned a live node id");
        let mut d = 0usize;
        for &input_id in &node.inputs {
            if let Some(producer) = graph.value(input_id).and_then(|v| v.producer) {
                d = d.max(depth.get(&producer).copied().unwrap_or(0) + 1);
            }
        }
        depth.insert(node_id, d);
    }
    depth
}

/// Packs the topological order into up to `stage_count` contiguous
/// groups, splitting on the same dependency-depth boundaries
/// [`ParallelScheduler`] uses rather than on a fixed chunk size. A group
/// never mixes two different depth levels: [`Executor::run`] only
/// writes a group's outputs back to the graph after every Node in it
/// has finished, so a group that let a later-depth Node share a chunk
/// with its own producer would see that producer's output missing at
/// compute time. `stage_count` is a target, not a guarantee — a
/// dependency depth bigger than the target chunk size is itself split
/// across more than `stage_count` groups, which is always safe because
/// Nodes at the same depth carry no edge between them.
#[derive(Debug)]
pub struct PipelineScheduler {
    pub stage_count: usize,
}

impl PipelineScheduler {
    pub fn new(stage_count: usize) -> Self {
        Self { stage_count: stage_count.max(1) }
    }
}

impl Default for PipelineScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Scheduler for PipelineScheduler {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn plan(&self, graph: &Graph) -> EngineResult<Vec<Vec<NodeId>>> {
        let order = graph.topological_sort()?;
        if order.is_empty() {
            return Ok(Vec::new());
        }
        let depth = compute_depths(graph, &order);
        let chunk_target = order.len().div_ceil(self.stage_count).max(1);

        let mut groups: Vec<Vec<NodeId>> = Vec::new();
        let mut current: Vec<NodeId> = Vec::new();
        let mut current_depth = depth[&order[0]];

        for &node_id in &order {
            let d = depth[&node_id];
            if (d != current_depth || current.len() >= chunk_target) && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current_depth = d;
            current.push(node_id);
        }
        if !current.is_empty() {
            groups.push(current);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeBag;

    fn diamond() -> Graph {
        let mut graph = Graph::new();
        let a = graph.add_value();
        graph.push_declared_input(a);
        let b = graph.add_value();
        graph.add_node("Relu", "b", &[a], &[b], AttributeBag::new()).unwrap();
        let c = graph.add_value();
        graph.add_node("Sigmoid", "c", &[a], &[c], AttributeBag::new()).unwrap();
        let d = graph.add_value();
        graph.add_node("Add", "d", &[b, c], &[d], AttributeBag::new()).unwrap();
        graph.push_declared_output(d);
        graph
    }

    #[test]
    fn parallel_scheduler_groups_independent_nodes_together() {
        let graph = diamond();
        let levels = ParallelScheduler.plan(&graph).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
        assert_eq!(levels[1].len(), 1);
    }

    #[test]
    fn topological_scheduler_is_fully_serial() {
        let graph = diamond();
        let groups = TopologicalScheduler.plan(&graph).unwrap();
        assert!(groups.iter().all(|g| g.len() == 1));
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn pipeline_scheduler_splits_independent_work_into_at_most_stage_count_groups() {
        let graph = diamond();
        let groups = PipelineScheduler::new(2).plan(&graph).unwrap();
        assert!(groups.len() <= 2);
    }

    fn chain(len: usize) -> Graph {
        let mut graph = Graph::new();
        let mut prev = graph.add_value();
        graph.push_declared_input(prev);
        for i in 0..len {
            let next = graph.add_value();
            graph.add_node("Relu", &format!("r{i}"), &[prev], &[next], AttributeBag::new()).unwrap();
            prev = next;
        }
        graph.push_declared_output(prev);
        graph
    }

    #[test]
    fn pipeline_scheduler_never_puts_a_producer_and_its_consumer_in_the_same_group() {
        // A naive ceil(N/stage_count)-sized contiguous chunking of a
        // 3-node linear chain with stage_count=2 produces [[r0,r1],[r2]],
        // putting r1 in the same group as r0, the producer of its only
        // input — exactly the bug this scheduler must not have.
        let graph = chain(3);
        let groups = PipelineScheduler::new(2).plan(&graph).unwrap();

        for group in &groups {
            for (i, &a) in group.iter().enumerate() {
                for &b in &group[i + 1..] {
                    let node_a = graph.node(a).unwrap();
                    let node_b = graph.node(b).unwrap();
                    assert!(
                        !node_a.outputs.iter().any(|o| node_b.inputs.contains(o)),
                        "group {group:?} puts producer {a} and consumer {b} together"
                    );
                    assert!(
                        !node_b.outputs.iter().any(|o| node_a.inputs.contains(o)),
                        "group {group:?} puts producer {b} and consumer {a} together"
                    );
                }
            }
        }
    }

    #[test]
    fn pipeline_scheduler_splits_a_chain_deeper_than_stage_count_into_one_group_per_node() {
        // Every node in a straight chain is its own dependency depth, so
        // no group may ever legally hold more than one of them regardless
        // of how small `stage_count` asks for.
        let graph = chain(6);
        let groups = PipelineScheduler::new(2).plan(&graph).unwrap();
        assert_eq!(groups.len(), 6);
        assert!(groups.iter().all(|g| g.len() == 1));
    }
}
