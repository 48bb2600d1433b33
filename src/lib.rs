//! Round-dispatch and phase-execution core of a cMix mix node.
//!
//! A round is split into phases; each phase runs a [`graph::Graph`] of
//! worker modules over chunks of slot indices. Phases are driven by tagged
//! network events through a round's [`response::ResponseMap`] and executed
//! one at a time by the [`resource_queue::ResourceQueue`]. The last realtime
//! phase hands the finished batch to the gateway via
//! [`batch_queue::BatchQueue`].

#![forbid(unsafe_code)]

pub mod assignment;
pub mod batch_queue;
pub mod chunk;
pub mod config;
mod dispatch;
pub mod error;
pub mod finish;
pub mod graph;
pub mod group;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod kernel;
pub mod measure;
pub mod module;
pub mod node;
pub mod phase;
pub mod plan;
pub mod queue;
pub mod resource_queue;
pub mod response;
pub mod round;
pub mod round_buffer;
pub mod stream;
pub mod topology;

pub use batch_queue::{BatchQueue, BatchRequest, CompletedRound};
pub use chunk::Chunk;
pub use config::NodeConfig;
pub use dispatch::ModuleFailure;
pub use error::{
    ConfigError, GraphError, KernelError, NodeError, QueueError, RoundError, StreamError,
    TransportError,
};
pub use finish::{FinishRealtime, PeerNotifier};
pub use graph::{Graph, GraphGenerator, GraphState};
pub use kernel::{FnKernel, Kernel, TypedKernel};
pub use module::{InputSize, ModuleDef, ModuleId};
pub use node::MixNode;
pub use phase::{Drain, Phase, PhaseState, PhaseType, TransmitContext, Transmitter};
pub use response::{Event, Response, ResponseMap};
pub use round::{Round, RoundId, RoundManager};
pub use stream::{PayloadStream, Slot, Stream};
pub use topology::{NodeId, Topology};
