use std::collections::HashMap;

use crate::graph::Graph;
use crate::types::{NodeId, ValueId};

/// The topological-index interval `[birth, death]` over which a Value
/// must remain resident. `birth == -1` for graph inputs and
/// initializers (alive before the run starts); `death == N` (the node
/// count) for declared graph outputs, which never die during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub birth: i64,
    pub death: i64,
}

impl Lifetime {
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        !(self.death <= other.birth || other.death <= self.birth)
    }
}

pub fn analyze(graph: &Graph, order: &[NodeId]) -> HashMap<ValueId, Lifetime> {
    let index_of: HashMap<NodeId, i64> = order.iter().enumerate().map(|(i, &id)| (id, i as i64)).collect();
    let n = order.len() as i64;
    let mut lifetimes = HashMap::new();

    for value in graph.values() {
        let birth = value.producer.and_then(|p| index_of.get(&p)).copied().unwrap_or(-1);
        let mut death = birth;
        for &consumer in &value.consumers {
            if let Some(&idx) = index_of.get(&consumer) {
                death = death.max(idx);
            }
        }
        if graph.declared_outputs().contains(&value.id) {
            death = n;
        }
        lifetimes.insert(value.id, Lifetime { birth, death });
    }
    lifetimes
}

/// Greedily assigns each Value a reuse-pool slot, visiting Values in
/// birth order and preferring a slot whose current occupant's lifetime
/// does not overlap and whose element count matches; otherwise opens a
/// new slot. Graph inputs and initializers (birth -1, alive for the
/// whole run) are excluded — they are never pool-backed.
pub fn plan_reuse(graph: &Graph, order: &[NodeId]) -> HashMap<ValueId, usize> {
    let lifetimes = analyze(graph, order);

    let mut by_birth: Vec<ValueId> =
        lifetimes.iter().filter(|(_, l)| l.birth >= 0).map(|(&id, _)| id).collect();
    by_birth.sort_by_key(|id| lifetimes[id].birth);

    let mut slots: Vec<(usize, ValueId)> = Vec::new();
    let mut assignment = HashMap::new();

    for id in by_birth {
        let lifetime = lifetimes[&id];
        let numel = graph.value(id).and_then(|v| v.shape.as_ref()).map(|s| s.static_numel()).unwrap_or(0);
        if numel == 0 {
            continue;
        }

        let reused = slots.iter().find(|&&(_, occupant)| {
            let occ_numel = graph.value(occupant).and_then(|v| v.shape.as_ref()).map(|s| s.static_numel()).unwrap_or(0);
            occ_numel == numel && !lifetimes[&occupant].overlaps(&lifetime)
        }).map(|&(slot, _)| slot);

        let slot = reused.unwrap_or(slots.len());
        assignment.insert(id, slot);

        match slots.iter_mut().find(|(s, _)| *s == slot) {
            Some(entry) => entry.1 = id,
            None => slots.push((slot, id)),
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeBag;
    use crate::types::{DType, Shape};

    #[test]
    fn non_overlapping_equal_sized_values_share_a_slot() {
        let mut graph = Graph::new();
        let a = graph.add_value();
        graph.set_value_shape(a, Shape::new(vec![4]), DType::Float32).unwrap();
        graph.push_declared_input(a);

        let b = graph.add_value();
        graph.set_value_shape(b, Shape::new(vec![4]), DType::Float32).unwrap();
        graph.add_node("Relu", "r0", &[a], &[b], AttributeBag::new()).unwrap();

        let c = graph.add_value();
        graph.set_value_shape(c, Shape::new(vec![4]), DType::Float32).unwrap();
        graph.add_node("Relu", "r1", &[b], &[c], AttributeBag::new()).unwrap();
        graph.push_declared_output(c);

        let order = graph.topological_sort().unwrap();
        let plan = plan_reuse(&graph, &order);
        // a is a declared input (birth -1, excluded); b dies feeding r1 and
        // c is born there, so they may not share; b should get its own slot.
        assert!(plan.contains_key(&b));
    }

    #[test]
    fn graph_output_lifetime_extends_past_the_last_node() {
        let mut graph = Graph::new();
        let a = graph.add_value();
        graph.push_declared_input(a);
        let out = graph.add_value();
        graph.add_node("Relu", "r0", &[a], &[out], AttributeBag::new()).unwrap();
        graph.push_declared_output(out);

        let order = graph.topological_sort().unwrap();
        let lifetimes = analyze(&graph, &order);
        assert_eq!(lifetimes[&out].death, order.len() as i64);
    }
}
