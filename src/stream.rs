//! Streams: the per-round payload store a phase graph computes over.
//!
//! A stream is linked exactly once, at the graph's expanded batch size,
//! against the round buffer. Kernels reach their typed arrays by downcasting
//! the stream (see [`crate::kernel::TypedKernel`]).

use crate::error::StreamError;
use crate::group::{CyclicGroup, GroupElement};
use crate::invariant_ppt::{assert_invariant, STREAM_RELINK};
use crate::round_buffer::RoundBuffer;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, OnceLock};

/// Wire-level slot exchanged with peers and gateways.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slot {
    pub index: u32,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

/// A fixed-length vector of group elements with one cell per slot.
#[derive(Debug)]
pub struct GroupArray {
    cells: Vec<RwLock<GroupElement>>,
}

impl GroupArray {
    pub fn filled(len: u32, value: &GroupElement) -> Self {
        Self {
            cells: (0..len).map(|_| RwLock::new(value.clone())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: u32) -> GroupElement {
        self.cells[index as usize].read().clone()
    }

    pub fn set(&self, index: u32, value: GroupElement) {
        *self.cells[index as usize].write() = value;
    }

    /// Replace slot `index` with `f(old)`.
    pub fn update<F>(&self, index: u32, f: F)
    where
        F: FnOnce(&GroupElement) -> GroupElement,
    {
        let mut cell = self.cells[index as usize].write();
        *cell = f(&cell);
    }

    pub fn fill(&self, value: &GroupElement) {
        for cell in &self.cells {
            *cell.write() = value.clone();
        }
    }
}

/// Everything a stream needs to link against its round.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub expanded_batch_size: u32,
    pub buffer: Arc<RoundBuffer>,
}

impl LinkContext {
    pub fn group(&self) -> &Arc<CyclicGroup> {
        self.buffer.group()
    }
}

/// Object-safe stream interface used by graphs, phases and transmitters.
pub trait Stream: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Bind the stream to the round buffer. Linking twice is a wiring fault.
    fn link(&self, ctx: &LinkContext);

    /// Decode `slot` into the arrays at `index`.
    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError>;

    /// Encode the arrays at `index` for transmission.
    fn output(&self, index: u32) -> Result<Slot, StreamError>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
struct LinkedPayloads {
    size: u32,
    buffer: Arc<RoundBuffer>,
    payload_a: GroupArray,
    payload_b: GroupArray,
}

/// General-purpose stream carrying two payload arrays per slot.
#[derive(Debug, Default)]
pub struct PayloadStream {
    linked: OnceLock<LinkedPayloads>,
}

impl PayloadStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn linked(&self) -> Result<&LinkedPayloads, StreamError> {
        self.linked.get().ok_or(StreamError::NotLinked)
    }

    fn checked(&self, index: u32) -> Result<&LinkedPayloads, StreamError> {
        let linked = self.linked()?;
        if index >= linked.size {
            return Err(StreamError::IndexOutOfRange {
                index,
                size: linked.size,
            });
        }
        Ok(linked)
    }

    pub fn is_linked(&self) -> bool {
        self.linked.get().is_some()
    }

    /// Linked size, zero before linking.
    pub fn size(&self) -> u32 {
        self.linked.get().map_or(0, |l| l.size)
    }

    pub fn payload_a(&self) -> Result<&GroupArray, StreamError> {
        Ok(&self.linked()?.payload_a)
    }

    pub fn payload_b(&self) -> Result<&GroupArray, StreamError> {
        Ok(&self.linked()?.payload_b)
    }

    pub fn buffer(&self) -> Result<&Arc<RoundBuffer>, StreamError> {
        Ok(&self.linked()?.buffer)
    }

    pub fn group(&self) -> Result<&Arc<CyclicGroup>, StreamError> {
        Ok(self.linked()?.buffer.group())
    }
}

impl Stream for PayloadStream {
    fn name(&self) -> &'static str {
        "PayloadStream"
    }

    fn link(&self, ctx: &LinkContext) {
        let one = ctx.group().identity();
        let linked = LinkedPayloads {
            size: ctx.expanded_batch_size,
            buffer: Arc::clone(&ctx.buffer),
            payload_a: GroupArray::filled(ctx.expanded_batch_size, &one),
            payload_b: GroupArray::filled(ctx.expanded_batch_size, &one),
        };
        assert_invariant(
            STREAM_RELINK,
            self.linked.set(linked).is_ok(),
            "stream linked twice",
            Some(self.name()),
        );
    }

    fn input(&self, index: u32, slot: &Slot) -> Result<(), StreamError> {
        let linked = self.checked(index)?;
        let group = linked.buffer.group();
        for (name, payload) in [("payload A", &slot.payload_a), ("payload B", &slot.payload_b)] {
            if payload.len() != group.byte_len() {
                return Err(StreamError::Malformed(format!(
                    "{} is {} bytes, expected {}",
                    name,
                    payload.len(),
                    group.byte_len()
                )));
            }
        }
        let a = group.element_from_bytes(&slot.payload_a)?;
        let b = group.element_from_bytes(&slot.payload_b)?;
        linked.payload_a.set(index, a);
        linked.payload_b.set(index, b);
        Ok(())
    }

    fn output(&self, index: u32) -> Result<Slot, StreamError> {
        let linked = self.checked(index)?;
        let group = linked.buffer.group();
        Ok(Slot {
            index,
            payload_a: group.element_to_bytes(&linked.payload_a.get(index)),
            payload_b: group.element_to_bytes(&linked.payload_b.get(index)),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
