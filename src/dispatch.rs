// dispatch.rs - the elementwise dispatch bridge.
//
// TWO-LAYER POLYMORPHISM
// ───────────────────────
// The framework needs two kinds of dispatch at once:
//
//   - The host stores mixed reaction kinds behind `Arc<dyn Reaction>` and
//     drives them with identical calls. That layer is dynamic.
//   - The kernel applying a reaction to each element must be statically
//     specialized: a vtable cannot cross the GPU boundary, and the per-op
//     `apply` has to be baked into the shader at pipeline creation.
//
// The seam between the layers is `Elementwise`: a variant hands the bridge
// a copy of its `DeviceOp`, and the blanket `impl<V: Elementwise> Reaction
// for V` routes the variant's `react` through `dispatch_elementwise`,
// which is monomorphized once per op type. Dynamic dispatch happens only
// at the outer handle; the generic routine is never visible through it.
//
// PROTOCOL (per call)
// ────────────────────
//   1. copy the op out of the variant
//   2. guard preconditions (empty buffer, binding-size limit)
//   3. splice the op's WGSL into the kernel template, build the pipeline
//   4. upload elements (storage) and op parameters (uniform)
//   5. dispatch ceil(N / workgroup) groups, one invocation per index
//   6. block until done; device errors surface as `ExecutionError`
//   7. read the result back into the caller's slice
//
// wgpu cannot alias host memory on discrete GPUs, so the "wrap the buffer
// for device access" step is an upload/readback pair. The caller's slice
// is written only after the dispatch is known to have succeeded; on any
// failure it is returned untouched. All device resources are dropped on
// every path.
//
// NEW RUST CONCEPTS
// ──────────────────
// - Blanket impls (`impl<V: Elementwise> Reaction for V`): one generic
//   impl covers every current and future variant. Coherence then forbids
//   any other `Reaction` impl, which is exactly what we want: the bridge
//   is the only way to satisfy the handle contract.
// - `device.push_error_scope` / `pop_error_scope`: wgpu reports
//   validation and out-of-memory failures through scopes rather than
//   return values; popping after submit yields the first error raised
//   since the push, which we block on with pollster.

use wgpu::util::DeviceExt;

use std::fmt;

use crate::device::GpuDevice;
use crate::op::DeviceOp;
use crate::reaction::Reaction;

/// The kernel template. `{{PARAMS_STRUCT}}`, `{{APPLY_FN}}` and
/// `{{WG_SIZE}}` are substituted per reaction kind at pipeline creation.
const KERNEL_TEMPLATE: &str = include_str!("shaders/reaction.wgsl");

// ---------------------------------------------------------------------------
// The variant seam
// ---------------------------------------------------------------------------

/// Implemented by each concrete reaction variant: hands the bridge a copy
/// of the variant's device operation.
///
/// This is the only thing a new reaction kind has to provide (besides the
/// op itself); `react` is derived below.
pub trait Elementwise: Send + Sync {
    type Op: DeviceOp;

    /// The owned device operation, by value.
    fn device_op(&self) -> Self::Op;
}

/// Every elementwise variant is a `Reaction`. The bridge is instantiated
/// once per `Op` type; the trait object layer above never sees it.
impl<V: Elementwise> Reaction for V {
    fn react(&self, gpu: &GpuDevice, elements: &mut [f32]) -> Result<(), ExecutionError> {
        dispatch_elementwise(gpu, &self.device_op(), elements)
    }
}

// ---------------------------------------------------------------------------
// Kernel assembly
// ---------------------------------------------------------------------------

/// Splice an op's WGSL fragments and the device's workgroup size into the
/// kernel template.
fn kernel_source<O: DeviceOp>(workgroup_size: u32) -> String {
    KERNEL_TEMPLATE
        .replace("{{PARAMS_STRUCT}}", O::PARAMS_WGSL)
        .replace("{{APPLY_FN}}", O::APPLY_WGSL)
        .replace("{{WG_SIZE}}", &workgroup_size.to_string())
}

// ---------------------------------------------------------------------------
// The bridge
// ---------------------------------------------------------------------------

/// Apply `op` to every element of `elements` on `gpu`'s queue, blocking
/// until the device has finished.
///
/// Invocations are independent, one per element index; the device may run
/// them in any order and at any parallelism. On success every element has
/// been transformed exactly once. On error the slice is untouched.
///
/// # Errors
/// - [`ExecutionError::BufferTooLarge`] if the slice exceeds the device's
///   storage-binding limit (checked before any device work).
/// - [`ExecutionError::Device`] if the device reports a validation or
///   out-of-memory failure for this dispatch.
/// - [`ExecutionError::Readback`] if mapping the result buffer fails.
pub fn dispatch_elementwise<O: DeviceOp>(
    gpu: &GpuDevice,
    op: &O,
    elements: &mut [f32],
) -> Result<(), ExecutionError> {
    let n = elements.len();
    if n == 0 {
        return Ok(());
    }

    let byte_len = (n * std::mem::size_of::<f32>()) as u64;
    let max = gpu.max_binding_bytes();
    if byte_len > max {
        return Err(ExecutionError::BufferTooLarge {
            reaction: O::LABEL,
            bytes: byte_len,
            max,
        });
    }

    // Everything from here to the submit runs inside error scopes, so a
    // bad shader, an invalid binding, or an allocation failure surfaces
    // from pop_error_scope instead of the global uncaptured handler.
    gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

    let source = kernel_source::<O>(gpu.workgroup_size);
    let shader = gpu
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(O::LABEL),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

    let bgl = gpu
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dasher BGL"),
            entries: &[
                // 0 - the element buffer (storage read_write)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // 1 - op parameters (uniform)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

    let pipeline_layout = gpu
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dasher pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

    let pipeline = gpu
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(O::LABEL),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "react",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

    // Upload: elements as an initialised storage buffer, the op copied by
    // value into a uniform buffer.
    let element_buf = gpu
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dasher elements"),
            contents: bytemuck::cast_slice(elements),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });

    let params_buf = gpu
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dasher params"),
            contents: bytemuck::bytes_of(op),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("dasher BG"),
        layout: &bgl,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: element_buf.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: params_buf.as_entire_binding(),
            },
        ],
    });

    let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("dasher readback"),
        size: byte_len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let workgroups = gpu.dispatch_size(n as u32);
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("dasher dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(O::LABEL),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
    encoder.copy_buffer_to_buffer(&element_buf, 0, &readback_buf, 0, byte_len);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    // Block until the queue is drained, then collect whatever the scopes
    // caught. Validation first (it was pushed last), then out-of-memory.
    gpu.device.poll(wgpu::Maintain::Wait);
    let validation = pollster::block_on(gpu.device.pop_error_scope());
    let oom = pollster::block_on(gpu.device.pop_error_scope());
    if let Some(e) = validation.or(oom) {
        return Err(ExecutionError::Device {
            reaction: O::LABEL,
            message: e.to_string(),
        });
    }

    // Map the result. map_async is asynchronous in wgpu's API; poll(Wait)
    // drives the callback, the channel hands us the outcome.
    let slice = readback_buf.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| ExecutionError::Readback {
            reaction: O::LABEL,
            message: "map callback never fired".into(),
        })?
        .map_err(|e| ExecutionError::Readback {
            reaction: O::LABEL,
            message: e.to_string(),
        })?;

    {
        let mapped = slice.get_mapped_range();
        elements.copy_from_slice(bytemuck::cast_slice(&mapped));
    }
    readback_buf.unmap();

    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A dispatch failed on the accelerator. The buffer passed to `react` has
/// not been modified and must not be treated as transformed.
#[derive(Debug)]
pub enum ExecutionError {
    /// The device reported a validation or out-of-memory failure at
    /// submission or during execution.
    Device {
        reaction: &'static str,
        message: String,
    },
    /// Mapping the result buffer back to host memory failed.
    Readback {
        reaction: &'static str,
        message: String,
    },
    /// The element buffer exceeds the device's storage-binding limit.
    /// Checked before any device work.
    BufferTooLarge {
        reaction: &'static str,
        bytes: u64,
        max: u64,
    },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Device { reaction, message } => {
                write!(f, "{reaction} dispatch failed on the device: {message}")
            }
            ExecutionError::Readback { reaction, message } => {
                write!(f, "{reaction} result readback failed: {message}")
            }
            ExecutionError::BufferTooLarge { reaction, bytes, max } => write!(
                f,
                "{reaction} buffer of {bytes} bytes exceeds the device's \
                 storage-binding limit of {max} bytes"
            ),
        }
    }
}

impl std::error::Error for ExecutionError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
