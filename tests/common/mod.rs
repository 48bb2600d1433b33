//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use cmix_node::group::CyclicGroup;
use cmix_node::round_buffer::RoundBuffer;
use cmix_node::{Chunk, FnKernel, Graph, GraphGenerator, Kernel, KernelError, PayloadStream, Slot};
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` filters it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn group() -> Arc<CyclicGroup> {
    Arc::new(CyclicGroup::new(
        BigUint::from(1_000_000_007u64),
        BigUint::from(5u32),
    ))
}

pub fn buffer(batch_size: u32) -> Arc<RoundBuffer> {
    Arc::new(RoundBuffer::new(group(), batch_size, batch_size))
}

pub fn noop() -> Arc<dyn Kernel> {
    Arc::new(FnKernel::new("noop", |_s: &PayloadStream, _c: Chunk| Ok(())))
}

/// Kernel that records every chunk it is called with.
pub fn recording(calls: Arc<Mutex<Vec<Chunk>>>) -> Arc<dyn Kernel> {
    Arc::new(FnKernel::new("record", move |_s: &PayloadStream, c: Chunk| {
        calls.lock().push(c);
        Ok(())
    }))
}

/// Kernel that squares payload A of every slot in its chunk.
pub fn square() -> Arc<dyn Kernel> {
    Arc::new(FnKernel::new("square", |s: &PayloadStream, c: Chunk| {
        let group = s.group()?;
        let a = s.payload_a()?;
        for i in c.range() {
            a.update(i, |x| group.mul(x, x));
        }
        Ok::<(), KernelError>(())
    }))
}

pub fn failing_at(slot: u32) -> Arc<dyn Kernel> {
    Arc::new(FnKernel::new("fail", move |_s: &PayloadStream, c: Chunk| {
        if c.range().contains(&slot) {
            Err(KernelError::Failed(format!("slot {slot}")))
        } else {
            Ok(())
        }
    }))
}

pub fn generator(min_slot_size: u32) -> GraphGenerator {
    GraphGenerator::new(min_slot_size, 1, 0.0)
}

/// Build, link and run `graph` at `batch_size`.
pub fn start(graph: &mut Graph, batch_size: u32) {
    graph.build(batch_size);
    let expanded = graph.expanded_batch_size();
    graph.link(Arc::new(RoundBuffer::new(group(), batch_size, expanded)));
    graph.run().expect("spawn workers");
}

/// Read the output sink until it closes.
pub fn drain(graph: &Graph) -> Vec<Chunk> {
    let mut out = Vec::new();
    while let Some(c) = graph.get_output() {
        out.push(c);
    }
    out
}

/// Wire slot carrying the element `value` in both payloads.
pub fn slot(index: u32, value: u32) -> Slot {
    let g = group();
    let bytes = g.element_to_bytes(&g.element(BigUint::from(value)));
    Slot {
        index,
        payload_a: bytes.clone(),
        payload_b: bytes,
    }
}

pub fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
