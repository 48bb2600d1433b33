//! Modules: graph workers wrapping a kernel with sizing, threading and a
//! start threshold.

use crate::assignment::AssignmentList;
use crate::kernel::Kernel;
use crate::queue::ChunkQueue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound on worker threads per module; one bit each in the state word.
pub const MAX_THREADS: u8 = 64;

/// Unique identifier for a module within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How many slots the kernel is handed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSize {
    /// One call per received assignment.
    Assignment,
    /// One call per `chunk_size` piece.
    #[default]
    Chunk,
    /// Calls of exactly this many slots; must divide `chunk_size`.
    Custom(u32),
}

/// Declarative module description, handed to [`crate::graph::Graph::add_module`].
#[derive(Clone)]
pub struct ModuleDef {
    pub name: String,
    pub kernel: Arc<dyn Kernel>,
    /// Zero means one assignment spanning the whole expanded batch.
    pub assignment_size: u32,
    /// Zero means equal to the assignment size.
    pub chunk_size: u32,
    pub input_size: InputSize,
    /// Fraction of assignments that must be ready before any is released.
    pub start_threshold: f32,
    /// `None` takes the graph generator's default.
    pub num_threads: Option<u8>,
}

impl fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDef")
            .field("name", &self.name)
            .field("kernel", &self.kernel.name())
            .field("assignment_size", &self.assignment_size)
            .field("chunk_size", &self.chunk_size)
            .field("input_size", &self.input_size)
            .field("start_threshold", &self.start_threshold)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl ModuleDef {
    pub fn new(name: impl Into<String>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            name: name.into(),
            kernel,
            assignment_size: 0,
            chunk_size: 0,
            input_size: InputSize::Chunk,
            start_threshold: 0.0,
            num_threads: None,
        }
    }

    pub fn assignment_size(mut self, size: u32) -> Self {
        self.assignment_size = size;
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn input_size(mut self, input_size: InputSize) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn start_threshold(mut self, threshold: f32) -> Self {
        self.start_threshold = threshold;
        self
    }

    pub fn threads(mut self, n: u8) -> Self {
        self.num_threads = Some(n);
        self
    }
}

/// A built module: resolved sizes, assignment accounting and input queue.
pub struct Module {
    pub(crate) id: ModuleId,
    pub(crate) name: String,
    pub(crate) kernel: Option<Arc<dyn Kernel>>,
    pub(crate) assignment_size: u32,
    pub(crate) chunk_size: u32,
    pub(crate) input_size: InputSize,
    pub(crate) num_threads: u8,
    pub(crate) inputs: Vec<ModuleId>,
    pub(crate) outputs: Vec<ModuleId>,
    pub(crate) assignments: AssignmentList,
    pub(crate) queue: ChunkQueue,
    thread_state: AtomicU64,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("assignment_size", &self.assignment_size)
            .field("chunk_size", &self.chunk_size)
            .field("num_threads", &self.num_threads)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Module {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ModuleId,
        name: String,
        kernel: Option<Arc<dyn Kernel>>,
        assignment_size: u32,
        chunk_size: u32,
        input_size: InputSize,
        num_threads: u8,
        inputs: Vec<ModuleId>,
        outputs: Vec<ModuleId>,
        assignments: AssignmentList,
    ) -> Self {
        // Every assignment is queued at most once, so this never blocks.
        let queue = ChunkQueue::new(assignments.len());
        Self {
            id,
            name,
            kernel,
            assignment_size,
            chunk_size,
            input_size,
            num_threads,
            inputs,
            outputs,
            assignments,
            queue,
            thread_state: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn assignment_size(&self) -> u32 {
        self.assignment_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn num_threads(&self) -> u8 {
        self.num_threads
    }

    pub fn inputs(&self) -> &[ModuleId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ModuleId] {
        &self.outputs
    }

    pub fn assignments(&self) -> &AssignmentList {
        &self.assignments
    }

    pub fn queue(&self) -> &ChunkQueue {
        &self.queue
    }

    /// Slots handed to the kernel per call.
    pub(crate) fn call_size(&self) -> u32 {
        match self.input_size {
            InputSize::Assignment => self.assignment_size,
            InputSize::Chunk => self.chunk_size,
            InputSize::Custom(n) => n,
        }
    }

    pub(crate) fn mark_alive(&self, thread: u8) {
        self.thread_state.fetch_or(1 << thread, Ordering::AcqRel);
    }

    pub(crate) fn mark_dead(&self, thread: u8) {
        self.thread_state.fetch_and(!(1 << thread), Ordering::AcqRel);
    }

    pub fn is_alive(&self, thread: u8) -> bool {
        self.thread_state.load(Ordering::Acquire) & (1 << thread) != 0
    }

    pub fn alive_threads(&self) -> u32 {
        self.thread_state.load(Ordering::Acquire).count_ones()
    }
}
