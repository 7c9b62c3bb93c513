//! GPU device management and initialization.
//!
//! A [`GpuContext`] is the explicit execution context of the device
//! executor: every build and query receives one, nothing is kept in global
//! state, and cloning it shares the same device and queue.

use crate::{
    error::{RbcError, Result},
    types::RbcConfig,
};
use log::{debug, info};
use std::sync::Arc;

/// Rough device footprint of one indexed point: the reordered copy at a
/// typical dimensionality plus owner, owner distance and permutation.
const BYTES_PER_POINT: u64 = 48;

/// GPU device context containing all resources needed for compute operations.
#[derive(Clone)]
pub struct GpuContext {
    /// The wgpu device for creating GPU resources
    pub device: Arc<wgpu::Device>,
    /// The command queue for submitting GPU work
    pub queue: Arc<wgpu::Queue>,
    /// Information about the selected adapter
    pub adapter_info: wgpu::AdapterInfo,
    /// Configured limits for this device
    pub limits: wgpu::Limits,
    /// Supported features on this device
    pub features: wgpu::Features,
}

impl GpuContext {
    /// Creates a new GPU context with the best available adapter.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU adapter is found or device creation fails.
    pub async fn new() -> Result<Self> {
        let instance = create_instance();
        let adapter = select_best_adapter(&instance).await?;

        Self::from_adapter(adapter).await
    }

    /// Creates a GPU context from a specific adapter.
    ///
    /// Storage limits are raised as far as the adapter allows, capped so a
    /// single binding stays within a few hundred megabytes.
    pub async fn from_adapter(adapter: wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        info!(
            "Selected GPU adapter: {} ({:?})",
            adapter_info.name, adapter_info.device_type
        );

        let supported = adapter.limits();
        let required_limits = wgpu::Limits {
            max_storage_buffer_binding_size: supported
                .max_storage_buffer_binding_size
                .min(256 * 1024 * 1024),
            max_buffer_size: supported.max_buffer_size.min(1024 * 1024 * 1024),
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("RBC Compute Device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: Default::default(),
            })
            .await
            .map_err(|e| RbcError::GpuInitError(format!("Failed to create device: {}", e)))?;

        let limits = device.limits();
        let features = device.features();

        debug!("Device limits: {:?}", limits);
        debug!("Device features: {:?}", features);

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            features,
        })
    }

    /// Creates a configuration sized for this device.
    ///
    /// Discrete GPUs get a wider computation plan; the point cap follows
    /// the largest buffer the device accepts.
    pub fn create_optimal_config(&self) -> RbcConfig {
        let target_work_items = match self.adapter_info.device_type {
            wgpu::DeviceType::DiscreteGpu => 8192,
            wgpu::DeviceType::IntegratedGpu => 4096,
            _ => 1024,
        };
        let max_points = (self.limits.max_buffer_size / BYTES_PER_POINT).min(100_000_000) as u32;

        RbcConfig {
            target_work_items,
            max_points,
            ..RbcConfig::default()
        }
    }

    /// Checks if the device supports the given configuration.
    pub fn supports_config(&self, config: &RbcConfig) -> Result<()> {
        config.validate().map_err(RbcError::InvalidConfig)?;

        if config.workgroup_size > self.limits.max_compute_invocations_per_workgroup {
            return Err(RbcError::NotSupported(format!(
                "Workgroup size {} exceeds device limit of {}",
                config.workgroup_size, self.limits.max_compute_invocations_per_workgroup
            )));
        }

        let required_memory = config.max_points as u64 * BYTES_PER_POINT;
        if required_memory > self.limits.max_buffer_size {
            return Err(RbcError::NotSupported(format!(
                "Configuration requires {} bytes but device only supports {}",
                required_memory, self.limits.max_buffer_size
            )));
        }

        Ok(())
    }

    /// Largest number of 4-byte elements a single storage binding can hold.
    pub fn max_binding_elements(&self) -> u64 {
        self.limits.max_storage_buffer_binding_size as u64 / 4
    }

    /// Gets a human-readable description of the GPU device.
    pub fn device_description(&self) -> String {
        format!(
            "{} ({:?}, driver: {})",
            self.adapter_info.name, self.adapter_info.device_type, self.adapter_info.driver
        )
    }
}

/// Creates a wgpu instance with appropriate backends for the platform.
fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Selects the best available adapter for compute workloads.
async fn select_best_adapter(instance: &wgpu::Instance) -> Result<wgpu::Adapter> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        })
        .await;

    if let Ok(adapter) = adapter {
        if matches!(adapter.get_info().device_type, wgpu::DeviceType::DiscreteGpu) {
            return Ok(adapter);
        }
    }

    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .max_by_key(|adapter| adapter_rank(adapter.get_info().device_type))
        .ok_or_else(|| RbcError::GpuInitError("No suitable GPU adapter found".to_string()))
}

fn adapter_rank(device_type: wgpu::DeviceType) -> u8 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 3,
        wgpu::DeviceType::IntegratedGpu => 2,
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 0,
    }
}
