//! Trait-based kernel definitions for phase operations.
//!
//! The concrete cMix operations live outside this crate. They implement
//! [`TypedKernel`] against the stream type they compute over; the graph only
//! sees the object-safe [`Kernel`].

use crate::chunk::Chunk;
use crate::error::KernelError;
use crate::stream::Stream;

/// Object-safe kernel, as stored in a module.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute over the slots of `chunk`. Must not touch slots outside it.
    fn execute(&self, stream: &dyn Stream, chunk: Chunk) -> Result<(), KernelError>;
}

/// Kernel bound to a concrete stream type; implement this for operations.
pub trait TypedKernel: Send + Sync + 'static {
    type Stream: Stream;

    fn name(&self) -> &'static str;

    fn execute(&self, stream: &Self::Stream, chunk: Chunk) -> Result<(), KernelError>;
}

impl<T: TypedKernel> Kernel for T {
    fn name(&self) -> &'static str {
        <T as TypedKernel>::name(self)
    }

    fn execute(&self, stream: &dyn Stream, chunk: Chunk) -> Result<(), KernelError> {
        match stream.as_any().downcast_ref::<T::Stream>() {
            Some(typed) => <T as TypedKernel>::execute(self, typed, chunk),
            // The graph was given a stream this kernel cannot read.
            None => Err(KernelError::StreamMismatch {
                expected: std::any::type_name::<T::Stream>(),
            }),
        }
    }
}

/// Kernel built from a closure over a typed stream.
pub struct FnKernel<S, F> {
    name: &'static str,
    f: F,
    _stream: std::marker::PhantomData<fn(&S)>,
}

impl<S, F> FnKernel<S, F>
where
    S: Stream,
    F: Fn(&S, Chunk) -> Result<(), KernelError> + Send + Sync + 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _stream: std::marker::PhantomData,
        }
    }
}

impl<S, F> TypedKernel for FnKernel<S, F>
where
    S: Stream,
    F: Fn(&S, Chunk) -> Result<(), KernelError> + Send + Sync + 'static,
{
    type Stream = S;

    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, stream: &S, chunk: Chunk) -> Result<(), KernelError> {
        (self.f)(stream, chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::stream::{LinkContext, PayloadStream, Slot};
    use std::any::Any;

    struct OtherStream;

    impl Stream for OtherStream {
        fn name(&self) -> &'static str {
            "OtherStream"
        }
        fn link(&self, _ctx: &LinkContext) {}
        fn input(&self, _index: u32, _slot: &Slot) -> Result<(), StreamError> {
            Ok(())
        }
        fn output(&self, index: u32) -> Result<Slot, StreamError> {
            Ok(Slot {
                index,
                ..Slot::default()
            })
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn typed_kernel_runs_on_matching_stream() {
        let k = FnKernel::new("count", |s: &OtherStream, c: Chunk| {
            assert_eq!(s.name(), "OtherStream");
            assert_eq!(c.len(), 4);
            Ok(())
        });
        let dynk: &dyn Kernel = &k;
        assert_eq!(dynk.name(), "count");
        assert!(dynk.execute(&OtherStream, Chunk::new(0, 4)).is_ok());
    }

    #[test]
    fn mismatched_stream_is_an_error_not_a_panic() {
        let k = FnKernel::new("payload", |_s: &PayloadStream, _c: Chunk| Ok(()));
        let err = Kernel::execute(&k, &OtherStream, Chunk::new(0, 1)).unwrap_err();
        assert!(matches!(err, KernelError::StreamMismatch { .. }));
    }
}
