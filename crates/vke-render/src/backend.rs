// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use std::fmt::Debug;

use crate::{RenderSize, SwapchainStage};

/// Result of asking the presentation engine for the next image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Everything [`crate::FrameLoop`] needs from a graphics API.
///
/// Out-of-date and suboptimal surfaces are reported through the outcome
/// enums; `Err` is reserved for failures the frame loop can not recover from.
pub trait GpuBackend {
    type Fence: Copy + Eq + Debug;
    type Semaphore: Copy + Debug;

    fn create_fence(&mut self, signaled: bool) -> Result<Self::Fence>;
    fn create_semaphore(&mut self) -> Result<Self::Semaphore>;
    fn destroy_fence(&mut self, fence: Self::Fence);
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);

    /// CPU wait with no timeout.
    fn wait_for_fence(&mut self, fence: Self::Fence) -> Result<()>;
    fn reset_fence(&mut self, fence: Self::Fence) -> Result<()>;

    fn acquire_next_image(&mut self, signal: Self::Semaphore) -> Result<AcquireOutcome>;

    /// Submits the prerecorded command buffer of `image_index` to the graphics queue.
    fn submit(
        &mut self,
        image_index: u32,
        wait: Self::Semaphore,
        signal: Self::Semaphore,
        fence: Self::Fence,
    ) -> Result<()>;

    /// Queues `image_index` for presentation once `wait` is signaled.
    fn present(&mut self, image_index: u32, wait: Self::Semaphore) -> Result<PresentOutcome>;

    /// Number of images in the current swapchain.
    fn image_count(&self) -> usize;

    fn wait_idle(&mut self) -> Result<()>;

    /// Destroys one swapchain-derived resource group.
    fn teardown(&mut self, stage: SwapchainStage) -> Result<()>;

    /// Creates one swapchain-derived resource group for a surface of `size`.
    fn rebuild(&mut self, stage: SwapchainStage, size: RenderSize) -> Result<()>;
}
