// device.rs - wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap storage-buffer sizes to match
//     Raspberry Pi before deploying there).
//   - Provide the 1-D workgroup size used by the elementwise kernel,
//     validated against the active profile.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer real
// hardware, taking a software adapter only as a last resort.
//
// DEVICE LIMITS:
// We request *lower* limits than the hardware actually supports when
// running under a non-Native profile. wgpu validates every buffer binding
// and dispatch against the requested limits, so violations that would
// crash on the target are caught at dev time on the laptop.

use std::fmt;

/// Hardware profile controlling device limits and the default workgroup size.
///
/// Use `Native` for best performance on your development machine.
/// Use `RaspberryPi` to simulate RPi 4/5 constraints: wgpu will reject
/// any binding or dispatch that exceeds the RPi's actual Vulkan limits,
/// catching problems before you deploy to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    /// Caps `max_compute_invocations_per_workgroup` to 256 and storage
    /// buffer bindings to 128 MiB, matching the device report from RPi's
    /// V3DV driver.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

/// The core GPU context: adapter, device, queue, and active profile.
///
/// Create via `GpuDevice::new()` or `GpuDevice::new_with_profile()`.
/// Hold one `GpuDevice` for the lifetime of the application; it is
/// expensive to create (Vulkan instance + device initialization) and is
/// shared read-only by every reaction that dispatches on it.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` (and its
/// internal Vulkan instance handle) outlives `device` and `queue`.
/// This prevents a crash in dzn (the D3D12-to-Vulkan layer on WSL2)
/// that occurs when the Vulkan instance is destroyed while device-level
/// objects still hold dangling back-references to it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    /// 1-D workgroup size for elementwise dispatches. Spliced into the
    /// kernel template as `{{WG_SIZE}}`; change via `set_workgroup_size`.
    pub workgroup_size: u32,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never access this field directly; its sole purpose is
    /// to control the drop order. Prefixed `_` to signal intent.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` using the first non-CPU Vulkan adapter found,
    /// with `DeviceProfile::Native` limits.
    ///
    /// # Errors
    /// Returns `Err` if no suitable adapter is found or the device
    /// request fails.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a `GpuDevice` with an explicit hardware profile.
    ///
    /// Use `DeviceProfile::RaspberryPi` during development to catch
    /// buffer-size and workgroup violations before deploying to the
    /// target device.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        // Request only Vulkan. No DX12, no Metal, no WebGPU.
        //
        // WSL2 note: Microsoft's dzn (D3D12-to-Vulkan) declares itself
        // non-conformant ("WARNING: dzn is not a conformant Vulkan
        // implementation"). wgpu drops non-conformant adapters by default.
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER tells wgpu to enumerate them
        // anyway so we can select dzn over llvmpipe.
        //
        // The flag is safe for our use case: we run compute-only kernels
        // with no reliance on any conformance-required rendering behaviour.
        // dzn has full support for storage buffers and compute dispatches.
        let flags = if cfg!(debug_assertions) {
            // Validation layer in debug builds for shader error feedback.
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        // Enumerate all Vulkan adapters, selecting the best available:
        //   DiscreteGpu   - dedicated NVIDIA/AMD card        <- ideal
        //   IntegratedGpu - iGPU (AMD APU, Intel)            <- good
        //   VirtualGpu    - VM pass-through                  <- acceptable
        //   Other         - dzn (D3D12->Vulkan) on WSL2      <- acceptable
        //   Cpu           - llvmpipe / software rasterizer   <- last resort
        //
        // The adapter name is printed at startup to confirm which was chosen.
        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();

        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }

        for a in &all_adapters {
            let info = a.get_info();
            eprintln!(
                "[dasher] Vulkan adapter: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        // Tier 1: real hardware GPU.
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            // Tier 2 (last resort): take whatever exists, even if Cpu/software.
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // Auto-detect RPi when the caller passed Native but the adapter is
        // V3D, so `GpuDevice::new()` works correctly on RPi without every
        // call site knowing about DeviceProfile::RaspberryPi.
        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                eprintln!("[dasher] V3D adapter detected; using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let limits = limits_for_profile(profile);

        // wgpu 22: request_device returns (Device, Queue) directly; the tuple
        // type must be spelled out to help the type inferencer.
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("dasher"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size: default_workgroup_for_profile(profile),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the active
    /// profile.
    ///
    /// Returns `Err` if `size` is zero or exceeds the profile's
    /// `max_compute_invocations_per_workgroup`.
    pub fn set_workgroup_size(&mut self, size: u32) -> Result<(), GpuError> {
        let max = max_invocations_for_profile(self.profile);
        if size == 0 || size > max {
            return Err(GpuError::WorkgroupTooLarge { size, max });
        }
        self.workgroup_size = size;
        Ok(())
    }

    /// Number of workgroups needed to cover `n` elements with the active
    /// workgroup size. Ceiling division, so every element is covered even
    /// when `n` is not a multiple of the workgroup size; zero elements
    /// need zero workgroups.
    ///
    /// The kernel guards against the overshoot:
    /// ```wgsl
    /// if idx >= arrayLength(&elements) { return; }
    /// ```
    pub fn dispatch_size(&self, n: u32) -> u32 {
        if n == 0 {
            0
        } else {
            (n + self.workgroup_size - 1) / self.workgroup_size
        }
    }

    /// Largest storage-buffer binding the active profile allows, in bytes.
    /// The dispatch bridge checks buffer sizes against this before touching
    /// the device.
    pub fn max_binding_bytes(&self) -> u64 {
        u64::from(limits_for_profile(self.profile).max_storage_buffer_binding_size)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
///
/// We request *lower* limits than the hardware supports when running
/// under a non-Native profile. wgpu validates bindings against the
/// *requested* limits, so violations are caught on the laptop before
/// they crash on the target device.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            // V3DV also caps individual workgroup dimensions at 256.
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // Conservative storage buffer binding: 128 MiB. RPi 4 has 4 GiB
            // RAM shared with the CPU; 128 MiB per element buffer is safe.
            max_storage_buffer_binding_size: 128 << 20,
            // Inherit everything else from wgpu defaults (already
            // conservative enough for RPi's Vulkan implementation).
            ..wgpu::Limits::default()
        },
    }
}

/// Maximum compute invocations per workgroup for the given profile.
/// Used to validate `set_workgroup_size()`.
fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default().max_compute_invocations_per_workgroup,
        DeviceProfile::RaspberryPi => 256,
    }
}

/// Default 1-D workgroup size for the given profile.
///
/// - `Native` (NVIDIA/AMD): 256 invocations. A multiple of NVIDIA's
///   32-wide warps (8 warps) and AMD's 64-wide wavefronts (4 waves),
///   and the size the elementwise kernels in the wild settle on.
/// - `RaspberryPi`: 128. Fits the 256 invocation limit with headroom for
///   the V3DV scheduler; VideoCore QPUs are SIMD-4, so 128 = 32 QPU
///   "threads" of 4 elements.
fn default_workgroup_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => 256,
        DeviceProfile::RaspberryPi => 128,
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization and configuration.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter found at all.
    /// On WSL2: check that Vulkan is installed and `vulkaninfo` shows
    /// a real GPU; only llvmpipe/software renderers found otherwise.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    DeviceRequest(wgpu::RequestDeviceError),
    /// Requested workgroup size is zero or exceeds the profile's
    /// invocation limit.
    WorkgroupTooLarge { size: u32, max: u32 },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible). \
                 On WSL2: ensure Vulkan is installed and `vulkaninfo` lists a real GPU."
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
            GpuError::WorkgroupTooLarge { size, max } => write!(
                f,
                "workgroup size {size} outside the profile limit of {max} invocations"
            ),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    // NOTE: Tests that require an actual GPU are behind `#[ignore]` so that
    // `cargo test` passes in CI without Vulkan. Run with:
    //   cargo test -- --include-ignored

    #[test]
    fn default_workgroups_fit_their_profiles() {
        for profile in [DeviceProfile::Native, DeviceProfile::RaspberryPi] {
            let wg = default_workgroup_for_profile(profile);
            assert!(wg <= max_invocations_for_profile(profile));
            assert!(wg.is_power_of_two());
        }
    }

    #[test]
    fn rpi_limits_are_capped() {
        let limits = limits_for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_storage_buffer_binding_size, 128 << 20);
    }

    #[test]
    fn profile_display() {
        assert_eq!(DeviceProfile::Native.to_string(), "Native");
        assert!(DeviceProfile::RaspberryPi.to_string().contains("RaspberryPi"));
    }

    // dispatch_size is pure arithmetic over the workgroup field; build a
    // GpuDevice-free replica to test it without a GPU.
    fn dispatch_size(n: u32, wg: u32) -> u32 {
        if n == 0 { 0 } else { (n + wg - 1) / wg }
    }

    #[test]
    fn dispatch_size_covers_every_element() {
        assert_eq!(dispatch_size(0, 256), 0);
        assert_eq!(dispatch_size(1, 256), 1);
        assert_eq!(dispatch_size(256, 256), 1);
        assert_eq!(dispatch_size(257, 256), 2);
        assert_eq!(dispatch_size(32, 256), 1);
        assert_eq!(dispatch_size(1_000_000, 256), 3907);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn gpu_device_initializes() {
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        eprintln!("[test] {gpu}");
        assert!(gpu.workgroup_size > 0);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn workgroup_override_is_validated() {
        let mut gpu = GpuDevice::new_with_profile(DeviceProfile::RaspberryPi)
            .expect("need Vulkan GPU");
        gpu.set_workgroup_size(64).expect("64 fits the RPi limit");
        assert_eq!(gpu.workgroup_size, 64);
        assert!(gpu.set_workgroup_size(512).is_err());
        assert!(gpu.set_workgroup_size(0).is_err());
    }
}
