//! Pass Manager: holds a set of named passes, orders them by declared
//! dependencies, and runs the sequence once over a Graph.

pub mod constant_folding;
pub mod dce;
pub mod fusion;
pub mod memory_layout;
pub mod subgraph_replace;

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::graph::Graph;

/// A single optimization pass. `run` may mutate the graph in place;
/// passes that iterate to a fixpoint (fusion, subgraph replacement)
/// manage their own iteration cap internally and
/// report the net result of every internal iteration as one `run` call.
pub trait Pass: Send + Sync {
    fn name(&self) -> &str;

    /// Names of passes that must run before this one. A name with no
    /// matching registered pass is a load-time error, not a panic.
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn run(&self, graph: &mut Graph) -> anyhow::Result<()>;
}

/// Orders and runs a fixed set of passes.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    /// The default pipeline: Constant Folding, Dead Code Elimination,
    /// Subgraph Replacement, Operator Fusion, Memory Layout — each
    /// depending on the one before it, matching the order a reference
    /// optimizer pipeline runs them in.
    pub fn default_pipeline() -> Self {
        Self::new(vec![
            Box::new(constant_folding::ConstantFolding),
            Box::new(dce::DeadCodeElimination),
            Box::new(subgraph_replace::SubgraphReplacement::default()),
            Box::new(fusion::OperatorFusion::default()),
            Box::new(memory_layout::MemoryLayout),
        ])
    }

    /// Topologically orders passes by declared dependency names
    /// (independent passes keep declaration order), then runs each in
    /// turn, converting internal `anyhow` failures to `EngineError` at
    /// this boundary.
    pub fn run_all(&self, graph: &mut Graph) -> EngineResult<()> {
        let order = self.dependency_order()?;
        for idx in order {
            let pass = &self.passes[idx];
            info!(pass = pass.name(), "running optimization pass");
            pass.run(graph).map_err(EngineError::from_anyhow)?;
        }
        Ok(())
    }

    fn dependency_order(&self) -> EngineResult<Vec<usize>> {
        let name_to_idx: HashMap<&str, usize> =
            self.passes.iter().enumerate().map(|(i, p)| (p.name(), i)).collect();

        for pass in &self.passes {
            for dep in pass.dependencies() {
                if !name_to_idx.contains_key(dep) {
                    return Err(EngineError::invalid_model(format!(
                        "pass '{}' declares a dependency on unregistered pass '{dep}'",
                        pass.name()
                    )));
                }
            }
        }

        let mut visited = vec![false; self.passes.len()];
        let mut in_progress = vec![false; self.passes.len()];
        let mut order = Vec::with_capacity(self.passes.len());

        fn visit(
            idx: usize,
            passes: &[Box<dyn Pass>],
            name_to_idx: &HashMap<&str, usize>,
            visited: &mut [bool],
            in_progress: &mut [bool],
            order: &mut Vec<usize>,
        ) -> EngineResult<()> {
            if visited[idx] {
                return Ok(());
            }
            if in_progress[idx] {
                return Err(EngineError::invalid_model(format!(
                    "pass dependency cycle detected at '{}'",
                    passes[idx].name()
                )));
            }
            in_progress[idx] = true;
            for dep in passes[idx].dependencies() {
                let dep_idx = name_to_idx[dep];
                visit(dep_idx, passes, name_to_idx, visited, in_progress, order)?;
            }
            in_progress[idx] = false;
            visited[idx] = true;
            order.push(idx);
            Ok(())
        }

        for idx in 0..self.passes.len() {
            visit(idx, &self.passes, &name_to_idx, &mut visited, &mut in_progress, &mut order)?;
        }

        let seen: HashSet<usize> = order.iter().copied().collect();
        debug_assert_eq!(seen.len(), self.passes.len());
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpPass {
        pass_name: &'static str,
        deps: Vec<&'static str>,
    }

    impl Pass for NoOpPass {
        fn name(&self) -> &str {
            self.pass_name
        }
        fn dependencies(&self) -> &[&str] {
            &self.deps
        }
        fn run(&self, _graph: &mut Graph) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn missing_dependency_is_a_load_time_error() {
        let manager = PassManager::new(vec![Box::new(NoOpPass { pass_name: "a", deps: vec!["ghost"] })]);
        let mut graph = Graph::new();
        assert!(manager.run_all(&mut graph).is_err());
    }

    #[test]
    fn independent_passes_keep_declaration_order() {
        let manager = PassManager::new(vec![
            Box::new(NoOpPass { pass_name: "first", deps: vec![] }),
            Box::new(NoOpPass { pass_name: "second", deps: vec![] }),
        ]);
        let order = manager.dependency_order().unwrap();
        assert_eq!(order, vec![0, 1]);
    }
}
