//! Dispatch: the worker-thread loop that drives modules over chunks.
//!
//! Each module thread pulls a chunk from its input queue, runs the kernel
//! over it and primes every downstream module with the pieces it finished.
//! A downstream queue is closed once all of its assignments have been
//! queued, which is how completion propagates to the output sink.

use crate::chunk::Chunk;
use crate::error::KernelError;
use crate::invariant_ppt::{assert_invariant, CLOSED_QUEUE_SEND};
use crate::module::{InputSize, Module, ModuleId};
use crate::stream::Stream;
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Called with (graph name, module name, error) when a kernel fails.
pub type ErrorHandler = Arc<dyn Fn(&str, &str, &KernelError) + Send + Sync>;

/// A kernel failure recorded by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: String,
    pub error: KernelError,
}

/// Runtime state shared by every worker of one graph.
pub(crate) struct Dispatch {
    pub(crate) graph_name: String,
    pub(crate) modules: Vec<Module>,
    pub(crate) output: ModuleId,
    pub(crate) stream: Arc<dyn Stream>,
    error_handler: Option<ErrorHandler>,
    complete: AtomicBool,
    terminated: AtomicBool,
    failure: Mutex<Option<ModuleFailure>>,
}

/// Per-thread termination signal and its acknowledgement.
pub(crate) struct Terminator {
    pub(crate) kill: Receiver<()>,
    pub(crate) ack: Sender<()>,
}

impl Dispatch {
    pub(crate) fn new(
        graph_name: String,
        modules: Vec<Module>,
        output: ModuleId,
        stream: Arc<dyn Stream>,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        Self {
            graph_name,
            modules,
            output,
            stream,
            error_handler,
            complete: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub(crate) fn output_module(&self) -> &Module {
        self.module(self.output)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn failure(&self) -> Option<ModuleFailure> {
        self.failure.lock().clone()
    }

    /// Stop all work and unblock every queue. No-op once complete.
    pub(crate) fn terminate(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        for module in &self.modules {
            module.queue.close();
        }
        true
    }

    fn fail(&self, module: &Module, error: KernelError) {
        tracing::warn!(
            graph = %self.graph_name,
            module = %module.name,
            error = %error,
            "kernel failed, terminating graph"
        );
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(ModuleFailure {
                    module: module.name.clone(),
                    error: error.clone(),
                });
            }
        }
        if let Some(handler) = &self.error_handler {
            handler(&self.graph_name, &module.name, &error);
        }
        self.terminate();
    }

    /// Prime `target` with `piece`, queue whatever became ready and close the
    /// target once it has everything. Returns true on that closing call.
    pub(crate) fn prime(&self, target: ModuleId, piece: Chunk) -> bool {
        let module = self.module(target);
        let (ready, released) = module.assignments.prime_outputs(piece);
        for chunk in ready {
            if module.queue.send(chunk).is_err() {
                if self.is_terminated() {
                    return false;
                }
                assert_invariant(
                    CLOSED_QUEUE_SEND,
                    false,
                    "chunk sent to a closed module queue",
                    Some(module.name.as_str()),
                );
            }
        }
        if module.assignments.denote_completed(released) {
            if target == self.output {
                // Readers check completion after the sink drains.
                self.complete.store(true, Ordering::Release);
            }
            module.queue.close();
            return true;
        }
        false
    }

    /// Call the kernel. A panic inside it becomes [`KernelError::Panicked`].
    fn execute(&self, module: &Module, chunk: Chunk) -> Result<(), KernelError> {
        let Some(kernel) = &module.kernel else {
            return Ok(());
        };
        panic::catch_unwind(AssertUnwindSafe(|| kernel.execute(self.stream.as_ref(), chunk)))
            .unwrap_or_else(|payload| Err(KernelError::Panicked(panic_message(payload.as_ref()))))
    }

    /// Run one received chunk through `module` and pass it downstream.
    fn process(&self, module: &Module, chunk: Chunk) -> Result<(), KernelError> {
        if module.input_size == InputSize::Assignment {
            self.execute(module, chunk)?;
            for piece in chunk.split(module.chunk_size) {
                self.propagate(module, piece);
            }
            return Ok(());
        }

        let call_size = module.call_size();
        for piece in chunk.split(module.chunk_size) {
            for call in piece.split(call_size) {
                self.execute(module, call)?;
            }
            if self.is_terminated() {
                return Ok(());
            }
            self.propagate(module, piece);
        }
        Ok(())
    }

    fn propagate(&self, module: &Module, piece: Chunk) {
        for &downstream in &module.outputs {
            self.prime(downstream, piece);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Body of one module worker thread.
pub(crate) fn run_worker(
    dispatch: Arc<Dispatch>,
    id: ModuleId,
    thread: u8,
    terminator: Terminator,
) {
    let module = dispatch.module(id);
    tracing::trace!(graph = %dispatch.graph_name, module = %module.name, thread, "worker started");

    loop {
        select! {
            recv(terminator.kill) -> _ => {
                let _ = terminator.ack.send(());
                break;
            }
            recv(module.queue.receiver()) -> msg => match msg {
                Ok(chunk) => {
                    if dispatch.is_terminated() {
                        continue;
                    }
                    if let Err(e) = dispatch.process(module, chunk) {
                        dispatch.fail(module, e);
                    }
                }
                Err(_) => break,
            },
        }
    }

    module.mark_dead(thread);
    tracing::trace!(graph = %dispatch.graph_name, module = %module.name, thread, "worker exited");
}
