// reactions.rs - the shipped reaction variants.
//
// Two kinds, mostly here to exercise the framework end to end:
//
//   Scale  - multiply every element by a factor
//   Offset - add an integral increment to every element
//
// Each variant is an op + two impls. `Elementwise` hands the bridge the
// op; `BuildReaction` plugs the variant into the factory. Nothing else is
// needed, and in particular the dispatch bridge and the `Reaction` trait
// are untouched when a kind is added.
//
// The op structs are padded to 16 bytes so bytemuck's Pod derive sees no
// implicit padding and the uniform upload has a stable layout.

use bytemuck::{Pod, Zeroable};

use crate::dispatch::Elementwise;
use crate::op::DeviceOp;
use crate::reaction::{BuildReaction, ConstructionError};

// ---------------------------------------------------------------------------
// Scale
// ---------------------------------------------------------------------------

/// Device operation for [`Scale`]: `x ↦ x * factor`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ScaleOp {
    factor: f32,
    _pad: [u32; 3],
}

impl DeviceOp for ScaleOp {
    const PARAMS_WGSL: &'static str = "struct Params {\n    factor: f32,\n}";
    const APPLY_WGSL: &'static str =
        "fn apply(x: f32) -> f32 {\n    return x * params.factor;\n}";
    const LABEL: &'static str = "scale";

    fn apply(&self, x: f32) -> f32 {
        x * self.factor
    }
}

/// Multiplies every buffer element by a fixed factor.
#[derive(Debug)]
pub struct Scale {
    op: ScaleOp,
}

impl Scale {
    /// A scale reaction with the given factor.
    ///
    /// # Errors
    /// Rejects non-finite factors: a NaN or infinite parameter would break
    /// the device operation's totality (every output would be poisoned).
    pub fn new(factor: f32) -> Result<Self, ConstructionError> {
        if !factor.is_finite() {
            return Err(ConstructionError::InvalidParameter {
                reaction: ScaleOp::LABEL,
                message: format!("factor must be finite, got {factor}"),
            });
        }
        Ok(Scale {
            op: ScaleOp { factor, _pad: [0; 3] },
        })
    }
}

impl Elementwise for Scale {
    type Op = ScaleOp;

    fn device_op(&self) -> ScaleOp {
        self.op
    }
}

impl BuildReaction for Scale {
    type Args = f32;

    fn build(factor: f32) -> Result<Self, ConstructionError> {
        Scale::new(factor)
    }
}

// ---------------------------------------------------------------------------
// Offset
// ---------------------------------------------------------------------------

/// Device operation for [`Offset`]: `x ↦ x + increment`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct OffsetOp {
    increment: i32,
    _pad: [u32; 3],
}

impl DeviceOp for OffsetOp {
    const PARAMS_WGSL: &'static str = "struct Params {\n    increment: i32,\n}";
    const APPLY_WGSL: &'static str =
        "fn apply(x: f32) -> f32 {\n    return x + f32(params.increment);\n}";
    const LABEL: &'static str = "offset";

    fn apply(&self, x: f32) -> f32 {
        x + self.increment as f32
    }
}

/// Adds a fixed integral increment to every buffer element.
pub struct Offset {
    op: OffsetOp,
}

impl Offset {
    /// An offset reaction with the given increment. Infallible, but the
    /// factory path still reports `Result` for uniformity with fallible
    /// variants.
    pub fn new(increment: i32) -> Self {
        Offset {
            op: OffsetOp { increment, _pad: [0; 3] },
        }
    }
}

impl Elementwise for Offset {
    type Op = OffsetOp;

    fn device_op(&self) -> OffsetOp {
        self.op
    }
}

impl BuildReaction for Offset {
    type Args = i32;

    fn build(increment: i32) -> Result<Self, ConstructionError> {
        Ok(Offset::new(increment))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuDevice;
    use crate::reaction::{make_reaction, Reaction, SharedReaction};

    // ---- Host mirrors (pure, no GPU needed) --------------------------------

    #[test]
    fn scale_host_apply() {
        let s = Scale::new(0.1).unwrap();
        let op = s.device_op();
        assert_eq!(op.apply(0.0), 0.0);
        assert!((op.apply(10.0) - 1.0).abs() < 1e-7);
        assert!((op.apply(-4.0) + 0.4).abs() < 1e-7);
    }

    #[test]
    fn offset_host_apply() {
        let o = Offset::new(2);
        let op = o.device_op();
        assert_eq!(op.apply(0.0), 2.0);
        assert!((op.apply(3.1) - 5.1).abs() < 1e-6);
        let neg = Offset::new(-7).device_op();
        assert_eq!(neg.apply(7.0), 0.0);
    }

    #[test]
    fn scale_composition_matches_single_scale() {
        // Scale(f1) then Scale(f2) ≡ Scale(f1 * f2) on every element.
        let f1 = 0.3f32;
        let f2 = 7.0f32;
        let a = Scale::new(f1).unwrap().device_op();
        let b = Scale::new(f2).unwrap().device_op();
        let combined = Scale::new(f1 * f2).unwrap().device_op();

        for i in 0..64 {
            let x = i as f32 * 0.57 - 9.0;
            let chained = b.apply(a.apply(x));
            let direct = combined.apply(x);
            assert!(
                (chained - direct).abs() <= 1e-4 * direct.abs().max(1.0),
                "x={x}: chained={chained} direct={direct}"
            );
        }
    }

    #[test]
    fn scale_rejects_non_finite_factors() {
        assert!(Scale::new(f32::NAN).is_err());
        assert!(Scale::new(f32::INFINITY).is_err());
        assert!(Scale::new(f32::NEG_INFINITY).is_err());
        assert!(Scale::new(0.0).is_ok());
    }

    #[test]
    fn factory_propagates_construction_failure() {
        let err = make_reaction::<Scale>(f32::NAN).expect_err("NaN must be rejected");
        assert!(err.to_string().contains("scale"));
    }

    // ---- Op layout and WGSL fragments (pure) -------------------------------

    #[test]
    fn ops_are_uniform_sized() {
        assert_eq!(std::mem::size_of::<ScaleOp>(), 16);
        assert_eq!(std::mem::size_of::<OffsetOp>(), 16);
    }

    #[test]
    fn wgsl_fragments_declare_the_documented_interface() {
        for (params, apply) in [
            (ScaleOp::PARAMS_WGSL, ScaleOp::APPLY_WGSL),
            (OffsetOp::PARAMS_WGSL, OffsetOp::APPLY_WGSL),
        ] {
            assert!(params.starts_with("struct Params"));
            assert!(apply.starts_with("fn apply(x: f32) -> f32"));
        }
        assert!(OffsetOp::APPLY_WGSL.contains("f32(params.increment)"));
    }

    // ---- GPU integration (subprocess-isolated) -----------------------------

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_uniform_handle_matches_concrete_call() {
        // Substitutability: the same reaction through the concrete path and
        // through the type-erased handle must agree bit-for-bit.
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let input: Vec<f32> = (0..512).map(|i| i as f32 * 0.25).collect();

        let concrete = Scale::new(0.1).unwrap();
        let mut via_concrete = input.clone();
        concrete.react(&gpu, &mut via_concrete).expect("concrete react failed");

        let handle: SharedReaction = make_reaction::<Scale>(0.1).unwrap();
        let mut via_handle = input.clone();
        handle.react(&gpu, &mut via_handle).expect("handle react failed");

        assert_eq!(via_concrete, via_handle);
        println!("GPU_TEST_OK");
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_heterogeneous_collection_scenario() {
        // The original driver scenario: [0, 1, ..., 31], Scale(0.1) then
        // Offset(2) through a mixed collection gives [2.0, 2.1, ..., 5.1].
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut data: Vec<f32> = (0..32).map(|i| i as f32).collect();

        let reactions: Vec<SharedReaction> = vec![
            make_reaction::<Scale>(0.1).unwrap(),
            make_reaction::<Offset>(2).unwrap(),
        ];
        for rx in &reactions {
            rx.react(&gpu, &mut data).expect("react failed");
        }

        assert_eq!(data.len(), 32);
        for (i, &got) in data.iter().enumerate() {
            let want = (i as f32).mul_add(0.1, 2.0);
            assert!(
                (got - want).abs() < 1e-6,
                "element {i}: got {got}, want {want}"
            );
        }
        println!("GPU_TEST_OK");
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_collection_order_does_not_matter_for_offsets() {
        // Two Offset reactions commute; position in the collection must not
        // change each one's own transformation.
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();

        let forward: Vec<SharedReaction> = vec![
            make_reaction::<Offset>(5).unwrap(),
            make_reaction::<Offset>(-3).unwrap(),
        ];
        let reversed: Vec<SharedReaction> = vec![
            make_reaction::<Offset>(-3).unwrap(),
            make_reaction::<Offset>(5).unwrap(),
        ];

        let mut a = input.clone();
        for rx in &forward {
            rx.react(&gpu, &mut a).expect("react failed");
        }
        let mut b = input.clone();
        for rx in &reversed {
            rx.react(&gpu, &mut b).expect("react failed");
        }

        assert_eq!(a, b);
        println!("GPU_TEST_OK");
        drop(gpu);
    }

    // Outer wrappers ─────────────────────────────────────────────────────────

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_uniform_handle_matches_concrete_call() {
        let out = run_gpu_test_in_subprocess(
            "reactions::tests::inner_uniform_handle_matches_concrete_call",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_heterogeneous_collection_scenario() {
        let out = run_gpu_test_in_subprocess(
            "reactions::tests::inner_heterogeneous_collection_scenario",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_collection_order_does_not_matter_for_offsets() {
        let out = run_gpu_test_in_subprocess(
            "reactions::tests::inner_collection_order_does_not_matter_for_offsets",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
