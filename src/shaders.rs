//! Shader management module for loading and compiling WGSL shaders.
//!
//! Four kernels make up the device pipeline: a tiled distance matrix, a
//! per-row radius search, nearest-representative assignment and the
//! plan-driven top-k scorer.

use crate::error::{RbcError, Result};
use std::borrow::Cow;

/// Entry point of `distance.wgsl`.
pub const DISTANCE_ENTRY: &str = "compute_distances";
/// Entry point of `range.wgsl`.
pub const RANGE_ENTRY: &str = "find_ranges";
/// Entry point of `assign.wgsl`.
pub const ASSIGN_ENTRY: &str = "assign_owners";
/// Entry point of `plan_knn.wgsl`.
pub const PLAN_KNN_ENTRY: &str = "plan_knn";

/// All shader sources used by the device executor.
pub struct ShaderSources {
    /// Tiled squared-distance matrix
    pub distance: &'static str,
    /// Per-row bisection radius search
    pub range: &'static str,
    /// Nearest-representative assignment
    pub assign: &'static str,
    /// Work-item top-k scoring
    pub plan_knn: &'static str,
}

impl Default for ShaderSources {
    fn default() -> Self {
        Self {
            distance: include_str!("shaders/distance.wgsl"),
            range: include_str!("shaders/range.wgsl"),
            assign: include_str!("shaders/assign.wgsl"),
            plan_knn: include_str!("shaders/plan_knn.wgsl"),
        }
    }
}

impl ShaderSources {
    /// Checks every source for its entry point.
    pub fn validate(&self) -> Result<()> {
        validate_shader_entry_points(self.distance, &[DISTANCE_ENTRY])?;
        validate_shader_entry_points(self.range, &[RANGE_ENTRY])?;
        validate_shader_entry_points(self.assign, &[ASSIGN_ENTRY])?;
        validate_shader_entry_points(self.plan_knn, &[PLAN_KNN_ENTRY])
    }
}

/// Compiled shader modules ready for use in pipelines.
pub struct CompiledShaders {
    /// Distance matrix module
    pub distance: wgpu::ShaderModule,
    /// Range search module
    pub range: wgpu::ShaderModule,
    /// Assignment module
    pub assign: wgpu::ShaderModule,
    /// Top-k scoring module
    pub plan_knn: wgpu::ShaderModule,
}

impl CompiledShaders {
    /// Compiles all shaders for the given device.
    ///
    /// # Errors
    /// Returns an error if a source lacks its entry point.
    pub fn compile(device: &wgpu::Device, sources: &ShaderSources) -> Result<Self> {
        sources.validate()?;
        Ok(Self {
            distance: compile_shader(device, "rbc distance", sources.distance),
            range: compile_shader(device, "rbc range", sources.range),
            assign: compile_shader(device, "rbc assign", sources.assign),
            plan_knn: compile_shader(device, "rbc plan knn", sources.plan_knn),
        })
    }
}

fn compile_shader(device: &wgpu::Device, name: &str, source: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    })
}

/// Validates that a shader source contains expected entry points.
pub fn validate_shader_entry_points(source: &str, expected: &[&str]) -> Result<()> {
    for entry_point in expected {
        if !source.contains(&format!("fn {}(", entry_point)) {
            return Err(RbcError::ShaderError(format!(
                "Missing entry point '{}' in shader",
                entry_point
            )));
        }
    }
    Ok(())
}
