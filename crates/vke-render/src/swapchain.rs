// SPDX-License-Identifier: CEPL-1.0

/// Lifecycle of the swapchain and everything built on top of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Active,
    /// Out of date, suboptimal or resized; rebuilt before the next acquire.
    /// Stays stale if a rebuild step fails.
    Stale,
}

/// Resource groups that depend on the swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SwapchainStage {
    Framebuffers,
    CommandBuffers,
    Pipeline,
    PipelineLayout,
    RenderPass,
    ImageViews,
    Swapchain,
}

/// Dependents go first: nothing is destroyed while something built on it survives.
pub const TEARDOWN_ORDER: [SwapchainStage; 7] = [
    SwapchainStage::Framebuffers,
    SwapchainStage::CommandBuffers,
    SwapchainStage::Pipeline,
    SwapchainStage::PipelineLayout,
    SwapchainStage::RenderPass,
    SwapchainStage::ImageViews,
    SwapchainStage::Swapchain,
];

/// Command buffers are recorded last because they reference the framebuffers.
pub const REBUILD_ORDER: [SwapchainStage; 7] = [
    SwapchainStage::Swapchain,
    SwapchainStage::ImageViews,
    SwapchainStage::RenderPass,
    SwapchainStage::PipelineLayout,
    SwapchainStage::Pipeline,
    SwapchainStage::Framebuffers,
    SwapchainStage::CommandBuffers,
];
