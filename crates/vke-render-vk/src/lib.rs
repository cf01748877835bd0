// SPDX-License-Identifier: CEPL-1.0
//! Vulkan implementation of [`vke_render::GpuBackend`] on top of ash.

mod backend;
mod descriptor;
mod device;
mod instance;
mod memory;
mod pipeline;
mod scene;
mod shader;
mod swapchain;

use std::path::PathBuf;

pub use backend::VkBackend;
pub use descriptor::{PoolConfig, PoolConfigError, PoolEntry};
pub use device::{DeviceSelectionError, OptionalExtensions, QueueFamilies};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    /// Strict vertical sync.
    Fifo,
    /// Vsync without blocking the renderer when it runs ahead.
    #[default]
    Mailbox,
}

/// Settings fixed for the lifetime of a [`VkBackend`].
#[derive(Clone, Debug)]
pub struct VkConfig {
    pub app_name: String,
    /// Enables `VK_LAYER_KHRONOS_validation`; creation fails if the layer is missing.
    pub validation: bool,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub clear_color: [f32; 4],
    /// Directory holding `vert.spv` and `frag.spv`.
    pub shader_dir: PathBuf,
    /// Descriptor pool sizing file, read once when the logical device is created.
    pub descriptor_pools: PathBuf,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            app_name: "Vulkan-Engine".to_owned(),
            validation: cfg!(debug_assertions),
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            shader_dir: PathBuf::from("resources/shaders/spv"),
            descriptor_pools: PathBuf::from("resources/descriptor_pools.txt"),
        }
    }
}
