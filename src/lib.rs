// dasher: Device-Accelerated SHader Elementwise Reactions
//
// Pluggable per-element transformations ("reactions") over f32 buffers,
// dispatched as wgpu compute kernels. New reaction kinds plug in without
// touching the dispatch machinery; mixed kinds are stored and driven
// uniformly through `Arc<dyn Reaction>`.
//
// Layering, bottom up:
//   device    - Vulkan adapter selection, device/queue, profile limits
//   op        - the per-element operation contract (Pod params + WGSL)
//   dispatch  - the generic upload/dispatch/wait/readback bridge
//   reaction  - the uniform handle and the factory
//   reactions - the shipped variants (Scale, Offset)

pub mod device;
pub mod dispatch;
pub mod op;
pub mod reaction;
pub mod reactions;

pub use device::{DeviceProfile, GpuDevice, GpuError};
pub use dispatch::{dispatch_elementwise, Elementwise, ExecutionError};
pub use op::DeviceOp;
pub use reaction::{make_reaction, BuildReaction, ConstructionError, Reaction, SharedReaction};
pub use reactions::{Offset, OffsetOp, Scale, ScaleOp};
