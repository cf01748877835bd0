// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Backend-agnostic frame pacing and swapchain lifecycle.
//!
//! [`FrameLoop`] owns a [`GpuBackend`] and drives it one frame at a time:
//! fence wait, acquire, image ownership bookkeeping, submit, present and
//! recreation of everything derived from the swapchain.

mod backend;
mod frame;
mod swapchain;

#[cfg(test)]
mod mock;

pub use backend::{AcquireOutcome, GpuBackend, PresentOutcome};
pub use frame::{FrameLoop, FrameStatus};
pub use swapchain::{SwapchainStage, SwapchainState, REBUILD_ORDER, TEARDOWN_ORDER};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Minimized windows report a zero dimension; nothing can be presented then.
    pub const fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for RenderSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The window side of presentation.
pub trait SurfaceProvider {
    /// Current framebuffer size in pixels.
    fn framebuffer_size(&self) -> RenderSize;

    /// Blocks until the window system delivers at least one event.
    fn wait_events(&mut self);

    /// Set once the user asked to close the window; a minimized window that
    /// is being closed must not keep the swapchain rebuild waiting forever.
    fn close_requested(&self) -> bool {
        false
    }
}
