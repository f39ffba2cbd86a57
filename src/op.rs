// op.rs - the per-element device operation contract.
//
// A `DeviceOp` is the minimal, transferable payload of a reaction: a plain
// parameter block plus a pure per-element function. The parameter block
// crosses the host/device boundary by value (bytemuck cast into a uniform
// buffer), and the function crosses it as WGSL source spliced into the
// kernel template at pipeline-creation time. That split is what lets the
// kernel be statically specialized per operation while the host side stays
// free to handle operations polymorphically.

use bytemuck::Pod;

/// A self-contained per-element operation.
///
/// Implementors are small `#[repr(C)]` value types: the fields are the
/// operation's parameters, fixed at construction, and the associated
/// constants carry the device-side rendition of the function.
///
/// # Contract
/// - `apply` must be pure: it reads only `self` and its argument, mutates
///   nothing else, never allocates, and never performs I/O. The kernel
///   replicates it across arbitrarily many concurrent invocations.
/// - `APPLY_WGSL` must compute the same function as `apply`. The host
///   mirror is the authoritative reference; every GPU dispatch is validated
///   against it in the test suite.
/// - `PARAMS_WGSL` must declare a uniform-compatible `struct Params` whose
///   field layout matches `Self` byte-for-byte (trailing padding on the
///   Rust side is fine; wgpu only requires the binding to be at least as
///   large as the WGSL struct).
pub trait DeviceOp: Pod {
    /// WGSL declaration of the `Params` uniform struct for this operation.
    const PARAMS_WGSL: &'static str;

    /// WGSL `fn apply(x: f32) -> f32` reading only `params` and `x`.
    const APPLY_WGSL: &'static str;

    /// Short name used for wgpu resource labels and error diagnostics.
    const LABEL: &'static str;

    /// Host-side mirror of the device function.
    fn apply(&self, x: f32) -> f32;
}
