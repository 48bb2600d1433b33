//! Graph module: wiring, building and running a phase's module DAG.
//!
//! A [`Graph`] is wired once (modules and edges), built at a batch size,
//! linked to a round buffer and then run. Running spawns the module worker
//! threads; input arrives through [`Graph::send`] and finished chunks leave
//! through the synthetic output sink read by [`Graph::get_output`].

use crate::assignment::AssignmentList;
use crate::chunk::Chunk;
use crate::dispatch::{run_worker, Dispatch, ModuleFailure, Terminator};
use crate::error::GraphError;
use crate::invariant_ppt::{assert_invariant, CLOSED_QUEUE_SEND, GRAPH_LIFECYCLE, GRAPH_SHAPE};
use crate::module::{InputSize, Module, ModuleDef, ModuleId};
use crate::plan::Plan;
use crate::queue::TryRecv;
use crate::round_buffer::RoundBuffer;
use crate::stream::{LinkContext, Stream};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use crate::dispatch::ErrorHandler;

/// Lifecycle of a graph. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GraphState {
    Unbuilt = 0,
    Built = 1,
    Linked = 2,
    Running = 3,
    Terminated = 4,
}

impl GraphState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GraphState::Unbuilt,
            1 => GraphState::Built,
            2 => GraphState::Linked,
            3 => GraphState::Running,
            _ => GraphState::Terminated,
        }
    }
}

/// Shared settings for every graph a node creates.
#[derive(Clone)]
pub struct GraphGenerator {
    min_slot_size: u32,
    default_num_threads: u8,
    output_threshold: f32,
    error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for GraphGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphGenerator")
            .field("min_slot_size", &self.min_slot_size)
            .field("default_num_threads", &self.default_num_threads)
            .field("output_threshold", &self.output_threshold)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl GraphGenerator {
    pub fn new(min_slot_size: u32, default_num_threads: u8, output_threshold: f32) -> Self {
        assert_invariant(
            GRAPH_SHAPE,
            min_slot_size > 0,
            "minimum slot size must be positive",
            Some("GraphGenerator::new"),
        );
        Self {
            min_slot_size,
            default_num_threads,
            output_threshold,
            error_handler: None,
        }
    }

    /// Install a callback invoked whenever a kernel fails.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn min_slot_size(&self) -> u32 {
        self.min_slot_size
    }

    pub fn default_num_threads(&self) -> u8 {
        self.default_num_threads
    }

    pub fn output_threshold(&self) -> f32 {
        self.output_threshold
    }

    pub fn new_graph(&self, name: impl Into<String>, stream: Arc<dyn Stream>) -> Graph {
        Graph {
            name: name.into(),
            generator: self.clone(),
            stream,
            defs: Vec::new(),
            edges: Vec::new(),
            first: None,
            last: None,
            state: AtomicU8::new(GraphState::Unbuilt as u8),
            plan: None,
            dispatch: None,
            workers: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            acks: unbounded(),
        }
    }
}

/// A DAG of modules computing over one stream.
pub struct Graph {
    name: String,
    pub(crate) generator: GraphGenerator,
    stream: Arc<dyn Stream>,
    pub(crate) defs: Vec<ModuleDef>,
    pub(crate) edges: Vec<(ModuleId, ModuleId)>,
    pub(crate) first: Option<ModuleId>,
    pub(crate) last: Option<ModuleId>,
    state: AtomicU8,
    plan: Option<Plan>,
    dispatch: Option<Arc<Dispatch>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    kills: Mutex<Vec<Sender<()>>>,
    acks: (Sender<()>, Receiver<()>),
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("stream", &self.stream.name())
            .field("modules", &self.defs)
            .field("edges", &self.edges)
            .field("state", &self.state())
            .finish()
    }
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GraphState {
        GraphState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    pub fn add_module(&mut self, def: ModuleDef) -> ModuleId {
        self.expect_state(GraphState::Unbuilt, "add_module");
        let id = ModuleId(self.defs.len());
        self.defs.push(def);
        id
    }

    /// Add an edge `from -> to`, rejecting unknown modules, repeats and cycles.
    pub fn connect(&mut self, from: ModuleId, to: ModuleId) -> Result<(), GraphError> {
        self.expect_state(GraphState::Unbuilt, "connect");
        for id in [from, to] {
            if id.0 >= self.defs.len() {
                return Err(GraphError::InvalidModule(id.0));
            }
        }
        if self.edges.contains(&(from, to)) {
            return Err(GraphError::DuplicateEdge {
                from: from.0,
                to: to.0,
            });
        }
        let mut visited = vec![false; self.defs.len()];
        if self.dfs(to, from, &mut visited) {
            return Err(GraphError::CycleDetected {
                from: from.0,
                to: to.0,
            });
        }
        self.edges.push((from, to));
        Ok(())
    }

    fn dfs(&self, current: ModuleId, target: ModuleId, visited: &mut [bool]) -> bool {
        if current == target {
            return true;
        }
        if visited[current.0] {
            return false;
        }
        visited[current.0] = true;
        self.edges
            .iter()
            .filter(|(f, _)| *f == current)
            .any(|&(_, t)| self.dfs(t, target, visited))
    }

    /// Mark the module fed by [`Graph::send`].
    pub fn first(&mut self, id: ModuleId) {
        assert_invariant(
            GRAPH_SHAPE,
            self.first.is_none() && id.0 < self.defs.len(),
            "first module set twice or unknown",
            Some(self.name.as_str()),
        );
        self.first = Some(id);
    }

    /// Mark the module whose output feeds the output sink.
    pub fn last(&mut self, id: ModuleId) {
        assert_invariant(
            GRAPH_SHAPE,
            self.last.is_none() && id.0 < self.defs.len(),
            "last module set twice or unknown",
            Some(self.name.as_str()),
        );
        self.last = Some(id);
    }

    /// Compile the wiring for `batch_size` slots and allocate every module.
    pub fn build(&mut self, batch_size: u32) {
        self.expect_state(GraphState::Unbuilt, "build");
        let mut plan = Plan::compile(self, batch_size);
        let expanded = plan.expanded_batch_size;
        let min_slot = self.generator.min_slot_size;
        let output = ModuleId(self.defs.len());
        let last = self.last.unwrap_or(output);
        plan.modules[last.0].outputs.push(output);

        let mut modules: Vec<Module> = self
            .defs
            .iter()
            .zip(&plan.modules)
            .enumerate()
            .map(|(i, (def, resolved))| {
                let assignments = AssignmentList::new(
                    expanded,
                    resolved.assignment_size,
                    resolved.chunk_size,
                    resolved.inputs.len(),
                    def.start_threshold,
                );
                Module::new(
                    ModuleId(i),
                    def.name.clone(),
                    Some(Arc::clone(&def.kernel)),
                    resolved.assignment_size,
                    resolved.chunk_size,
                    def.input_size,
                    resolved.num_threads,
                    resolved.inputs.clone(),
                    resolved.outputs.clone(),
                    assignments,
                )
            })
            .collect();
        modules.push(Module::new(
            output,
            "output".to_string(),
            None,
            min_slot,
            min_slot,
            InputSize::Chunk,
            0,
            vec![last],
            vec![],
            AssignmentList::new(expanded, min_slot, min_slot, 1, self.generator.output_threshold),
        ));

        tracing::debug!(
            graph = %self.name,
            batch_size,
            expanded_batch_size = expanded,
            modules = modules.len(),
            "graph built"
        );

        self.dispatch = Some(Arc::new(Dispatch::new(
            self.name.clone(),
            modules,
            output,
            Arc::clone(&self.stream),
            self.generator.error_handler.clone(),
        )));
        self.plan = Some(plan);
        self.state.store(GraphState::Built as u8, Ordering::Release);
    }

    /// Expanded batch size, zero before [`Graph::build`].
    pub fn expanded_batch_size(&self) -> u32 {
        self.plan.as_ref().map_or(0, |p| p.expanded_batch_size)
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Built module by id; the output sink follows the wired modules.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.dispatch.as_ref().and_then(|d| d.modules.get(id.0))
    }

    /// Bind the stream to the round buffer at the expanded batch size.
    pub fn link(&self, buffer: Arc<RoundBuffer>) {
        self.expect_state(GraphState::Built, "link");
        assert_invariant(
            GRAPH_SHAPE,
            buffer.expanded_batch_size() >= self.expanded_batch_size(),
            "round buffer shorter than the expanded batch",
            Some(self.name.as_str()),
        );
        self.stream.link(&LinkContext {
            expanded_batch_size: self.expanded_batch_size(),
            buffer,
        });
        self.state.store(GraphState::Linked as u8, Ordering::Release);
    }

    /// Spawn the worker threads of every module.
    ///
    /// A graph killed before it ran stays stopped and spawns nothing.
    pub fn run(&self) -> io::Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            GraphState::Linked as u8,
            GraphState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            if GraphState::from_u8(actual) == GraphState::Terminated {
                tracing::debug!(graph = %self.name, "run after kill ignored");
                return Ok(());
            }
            self.expect_state(GraphState::Linked, "run");
        }
        let dispatch = self.dispatcher();
        let mut workers = self.workers.lock();
        let mut kills = self.kills.lock();

        for module in dispatch.modules.iter().filter(|m| m.kernel.is_some()) {
            for index in 0..module.num_threads {
                let (kill_tx, kill_rx) = bounded(1);
                let terminator = Terminator {
                    kill: kill_rx,
                    ack: self.acks.0.clone(),
                };
                let worker = Arc::clone(&dispatch);
                let id = module.id;
                module.mark_alive(index);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}-{}", self.name, module.name, index))
                    .spawn(move || run_worker(worker, id, index, terminator));
                match spawned {
                    Ok(handle) => {
                        workers.push(handle);
                        kills.push(kill_tx);
                    }
                    Err(e) => {
                        module.mark_dead(index);
                        return Err(e);
                    }
                }
            }
        }

        tracing::debug!(graph = %self.name, threads = workers.len(), "graph running");
        Ok(())
    }

    /// Feed a chunk of input to the first module.
    ///
    /// Returns true once the first module has received its whole input.
    /// Input arriving after the graph was killed is dropped.
    pub fn send(&self, chunk: Chunk) -> bool {
        let dispatch = self.dispatcher();
        if dispatch.is_terminated() {
            tracing::debug!(graph = %self.name, %chunk, "input dropped after termination");
            return false;
        }
        let first = self.first.unwrap_or(ModuleId(0));
        assert_invariant(
            CLOSED_QUEUE_SEND,
            !dispatch.module(first).queue.is_closed(),
            "input sent after the first module completed",
            Some(self.name.as_str()),
        );
        dispatch.prime(first, chunk)
    }

    /// Block for the next output chunk. `None` once the graph is complete or
    /// terminated and the sink has drained.
    pub fn get_output(&self) -> Option<Chunk> {
        self.dispatcher().output_module().queue.recv()
    }

    /// Like [`Graph::get_output`] with a deadline.
    pub fn get_output_timeout(&self, timeout: Duration) -> Result<Chunk, RecvTimeoutError> {
        self.dispatcher().output_module().queue.recv_timeout(timeout)
    }

    pub fn try_get_output(&self) -> TryRecv {
        self.dispatcher().output_module().queue.try_recv()
    }

    /// True once every assignment of the output sink has been released.
    pub fn is_complete(&self) -> bool {
        self.dispatch.as_ref().is_some_and(|d| d.is_complete())
    }

    pub fn is_terminated(&self) -> bool {
        self.dispatch.as_ref().is_some_and(|d| d.is_terminated())
    }

    /// First kernel failure, if any.
    pub fn error(&self) -> Option<ModuleFailure> {
        self.dispatch.as_ref().and_then(|d| d.failure())
    }

    /// Stop every worker and wait up to `timeout` for them to exit.
    ///
    /// A completed graph is left alone and reports success. Returns false if
    /// some worker was still alive at the deadline.
    pub fn kill(&self, timeout: Duration) -> bool {
        let Some(dispatch) = self.dispatch.as_ref() else {
            return true;
        };
        if dispatch.is_complete() {
            return true;
        }
        dispatch.terminate();
        self.state.store(GraphState::Terminated as u8, Ordering::Release);
        for kill in self.kills.lock().iter() {
            let _ = kill.try_send(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if dispatch.modules.iter().all(|m| m.alive_threads() == 0) {
                tracing::debug!(graph = %self.name, "graph killed");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(graph = %self.name, ?timeout, "workers still alive after kill");
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(10));
            let _ = self.acks.1.recv_timeout(wait);
        }
    }

    /// Join every worker thread. Returns once all have exited.
    pub fn wait(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(graph = %self.name, "worker thread panicked");
            }
        }
    }

    fn dispatcher(&self) -> Arc<Dispatch> {
        match &self.dispatch {
            Some(d) => Arc::clone(d),
            None => {
                assert_invariant(
                    GRAPH_LIFECYCLE,
                    false,
                    "graph used before build",
                    Some(self.name.as_str()),
                );
                unreachable!()
            }
        }
    }

    fn expect_state(&self, expected: GraphState, operation: &str) {
        let state = self.state();
        if state != expected {
            let context = format!("{}: {} while {:?}", self.name, operation, state);
            assert_invariant(
                GRAPH_LIFECYCLE,
                false,
                "graph operation out of lifecycle order",
                Some(context.as_str()),
            );
        }
    }
}
