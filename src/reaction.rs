// reaction.rs - the uniform reaction handle and the factory.
//
// `Reaction` is the host-visible face of the framework: one capability,
// "transform this whole buffer on that queue". Concrete variants of any
// kind sit behind `Arc<dyn Reaction>` so a mixed collection can be driven
// by identical calling code. Dynamic dispatch stops here; everything below
// the trait boundary is statically specialized per variant (see
// dispatch.rs).

use std::fmt;
use std::sync::Arc;

use crate::device::GpuDevice;
use crate::dispatch::ExecutionError;

/// A uniform handle to one buffer transformation.
///
/// Calling `react` behaves identically whether invoked on the concrete
/// variant or through a `SharedReaction`; which variant backs the handle
/// only changes *what* is computed, never *how* the call behaves.
///
/// There is deliberately no default no-op implementation: a reaction that
/// silently does nothing would mask configuration bugs, so every variant
/// must route through the dispatch bridge (the blanket impl in
/// `dispatch.rs` is the only implementation path).
pub trait Reaction: Send + Sync {
    /// Apply this reaction's transformation to every element of
    /// `elements`, in place, using `gpu`'s queue.
    ///
    /// Blocks until the device has finished. On `Err` the slice has not
    /// been modified and must not be treated as transformed.
    fn react(&self, gpu: &GpuDevice, elements: &mut [f32]) -> Result<(), ExecutionError>;
}

/// Shared, type-erased reaction handle for heterogeneous collections.
/// Lives as long as its longest holder.
pub type SharedReaction = Arc<dyn Reaction>;

impl fmt::Debug for dyn Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Reaction")
    }
}

/// Construction of a reaction variant from its argument pack.
///
/// Split from the variants' inherent `new` so the factory can be generic
/// over "any buildable reaction kind" without knowing arities.
pub trait BuildReaction: Sized {
    /// Constructor arguments for this variant (a scalar or a tuple).
    type Args;

    fn build(args: Self::Args) -> Result<Self, ConstructionError>;
}

/// Construct a reaction variant and upgrade it to the shared uniform
/// handle, ready to be stored in a heterogeneous collection.
///
/// ```no_run
/// use dasher::{make_reaction, Offset, Scale, SharedReaction};
///
/// let reactions: Vec<SharedReaction> = vec![
///     make_reaction::<Scale>(0.1)?,
///     make_reaction::<Offset>(2)?,
/// ];
/// # Ok::<(), dasher::ConstructionError>(())
/// ```
///
/// # Errors
/// Fails only if the variant's constructor rejects `args`.
pub fn make_reaction<R>(args: R::Args) -> Result<SharedReaction, ConstructionError>
where
    R: Reaction + BuildReaction + 'static,
{
    Ok(Arc::new(R::build(args)?))
}

/// A reaction variant could not be constructed.
#[derive(Debug)]
pub enum ConstructionError {
    /// A constructor argument violates the variant's invariants.
    InvalidParameter {
        /// Which reaction kind rejected the argument.
        reaction: &'static str,
        message: String,
    },
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionError::InvalidParameter { reaction, message } => {
                write!(f, "cannot construct {reaction} reaction: {message}")
            }
        }
    }
}

impl std::error::Error for ConstructionError {}
