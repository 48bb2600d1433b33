//! Plan module: compile a wired graph into resolved module sizes.
//!
//! Compilation validates the wiring (one first and one last module, every
//! module reachable, sane thread counts and sizes), orders the modules
//! topologically and computes the expanded batch size.

use crate::graph::Graph;
use crate::invariant_ppt::{
    assert_invariant, CHUNK_DIVIDES_ASSIGNMENT, GRAPH_REACHABLE, GRAPH_SHAPE, THREAD_BOUNDS,
};
use crate::module::{InputSize, ModuleId, MAX_THREADS};
use num_integer::Integer;
use std::collections::VecDeque;

/// Sizes and edges of one module after compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModule {
    pub assignment_size: u32,
    pub chunk_size: u32,
    pub num_threads: u8,
    pub inputs: Vec<ModuleId>,
    pub outputs: Vec<ModuleId>,
}

/// The compiled plan: execution order and per-module sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub expanded_batch_size: u32,
    pub execution_order: Vec<ModuleId>,
    pub modules: Vec<ResolvedModule>,
}

impl Plan {
    /// Create a plan for `batch_size` slots from a wired graph.
    pub fn compile(graph: &Graph, batch_size: u32) -> Self {
        let context = graph.name();
        assert_invariant(
            GRAPH_SHAPE,
            batch_size > 0,
            "batch size must be positive",
            Some(context),
        );
        assert_invariant(
            GRAPH_SHAPE,
            !graph.defs.is_empty(),
            "graph has no modules",
            Some(context),
        );
        let (Some(first), Some(last)) = (graph.first, graph.last) else {
            assert_invariant(
                GRAPH_SHAPE,
                false,
                "graph needs exactly one first and one last module",
                Some(context),
            );
            unreachable!()
        };

        let n = graph.defs.len();
        let mut inputs = vec![Vec::new(); n];
        let mut outputs = vec![Vec::new(); n];
        for &(from, to) in &graph.edges {
            outputs[from.0].push(to);
            inputs[to.0].push(from);
        }
        assert_invariant(
            GRAPH_SHAPE,
            inputs[first.0].is_empty(),
            "first module cannot have inputs",
            Some(context),
        );
        assert_invariant(
            GRAPH_SHAPE,
            outputs[last.0].is_empty(),
            "last module cannot have outputs",
            Some(context),
        );

        let reachable = reachable_from(first, &outputs);
        assert_invariant(
            GRAPH_REACHABLE,
            reachable.iter().all(|&r| r),
            "every module must be reachable from the first module",
            Some(context),
        );

        let execution_order = topo_sort(&inputs, &outputs);
        assert_invariant(
            GRAPH_SHAPE,
            execution_order.len() == n,
            "graph contains a cycle",
            Some(context),
        );

        let min_slot = graph.generator.min_slot_size();
        let declared = graph
            .defs
            .iter()
            .flat_map(|d| [d.assignment_size, d.chunk_size]);
        let expanded_batch_size = expand_batch_size(batch_size, declared, min_slot);

        let modules = graph
            .defs
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let num_threads = def
                    .num_threads
                    .unwrap_or(graph.generator.default_num_threads());
                assert_invariant(
                    THREAD_BOUNDS,
                    (1..=MAX_THREADS).contains(&num_threads),
                    "module thread count must be between 1 and 64",
                    Some(def.name.as_str()),
                );

                let assignment_size = match def.assignment_size {
                    0 => expanded_batch_size,
                    size => size,
                };
                let chunk_size = match def.chunk_size {
                    0 => assignment_size,
                    size => size,
                };
                assert_invariant(
                    CHUNK_DIVIDES_ASSIGNMENT,
                    chunk_size >= min_slot && assignment_size % chunk_size == 0,
                    "chunk size must divide assignment size and cover the minimum slot size",
                    Some(def.name.as_str()),
                );
                if let InputSize::Custom(size) = def.input_size {
                    assert_invariant(
                        CHUNK_DIVIDES_ASSIGNMENT,
                        size > 0 && chunk_size % size == 0,
                        "custom input size must divide chunk size",
                        Some(def.name.as_str()),
                    );
                }

                ResolvedModule {
                    assignment_size,
                    chunk_size,
                    num_threads,
                    inputs: std::mem::take(&mut inputs[i]),
                    outputs: std::mem::take(&mut outputs[i]),
                }
            })
            .collect();

        Self {
            expanded_batch_size,
            execution_order,
            modules,
        }
    }
}

/// Smallest multiple of the LCM of every non-zero declared size and the
/// minimum slot size that holds `batch_size` slots. Sizes whose expansion
/// does not fit a `u32` are a wiring fault.
pub fn expand_batch_size<I>(batch_size: u32, sizes: I, min_slot_size: u32) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let start = u64::from(min_slot_size.max(1));
    let expanded = sizes
        .into_iter()
        .filter(|&s| s > 0)
        .try_fold(start, |acc, s| {
            let lcm = acc.lcm(&u64::from(s));
            (lcm <= u64::from(u32::MAX)).then_some(lcm)
        })
        .and_then(|lcm| u32::try_from(u64::from(batch_size).div_ceil(lcm) * lcm).ok());
    match expanded {
        Some(size) => size,
        None => {
            let context = format!("batch {}, min slot {}", batch_size, min_slot_size);
            assert_invariant(
                GRAPH_SHAPE,
                false,
                "expanded batch size overflows u32",
                Some(context.as_str()),
            );
            unreachable!()
        }
    }
}

fn reachable_from(start: ModuleId, outputs: &[Vec<ModuleId>]) -> Vec<bool> {
    let mut seen = vec![false; outputs.len()];
    let mut queue = VecDeque::from([start]);
    seen[start.0] = true;
    while let Some(m) = queue.pop_front() {
        for &next in &outputs[m.0] {
            if !seen[next.0] {
                seen[next.0] = true;
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Topological sort of modules (Kahn). Shorter than the module count on a cycle.
fn topo_sort(inputs: &[Vec<ModuleId>], outputs: &[Vec<ModuleId>]) -> Vec<ModuleId> {
    let mut in_degree: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut queue: VecDeque<ModuleId> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| ModuleId(i))
        .collect();

    let mut order = Vec::with_capacity(inputs.len());
    while let Some(m) = queue.pop_front() {
        order.push(m);
        for &next in &outputs[m.0] {
            in_degree[next.0] -= 1;
            if in_degree[next.0] == 0 {
                queue.push_back(next);
            }
        }
    }
    order
}
