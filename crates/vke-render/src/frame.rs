// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace, warn};

use crate::{
    AcquireOutcome, GpuBackend, PresentOutcome, SurfaceProvider, SwapchainState,
    MAX_FRAMES_IN_FLIGHT, REBUILD_ORDER, TEARDOWN_ORDER,
};

/// Synchronization owned by one frame in flight.
struct FrameSlot<B: GpuBackend> {
    image_available: B::Semaphore,
    render_finished: B::Semaphore,
    in_flight: B::Fence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Submitted and queued for presentation. `recreated` is set when the
    /// swapchain was rebuilt after presenting.
    Presented { recreated: bool },
    /// Nothing was submitted: the surface was out of date or can not be rebuilt yet.
    Skipped,
}

pub struct FrameLoop<B: GpuBackend> {
    backend: B,
    slots: Vec<FrameSlot<B>>,
    frames_in_flight: usize,
    /// Frame slot whose fence guards each swapchain image.
    image_owner: Vec<Option<usize>>,
    current: usize,
    state: SwapchainState,
    resize_requested: bool,
}

impl<B: GpuBackend> FrameLoop<B> {
    pub fn new(backend: B) -> Result<Self> {
        Self::with_frames_in_flight(backend, MAX_FRAMES_IN_FLIGHT)
    }

    pub fn with_frames_in_flight(backend: B, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            bail!("at least one frame in flight is required");
        }

        let image_count = backend.image_count();
        let mut this = Self {
            backend,
            slots: Vec::with_capacity(frames_in_flight),
            frames_in_flight,
            image_owner: vec![None; image_count],
            current: 0,
            state: SwapchainState::Active,
            resize_requested: false,
        };

        // Pushed one at a time so Drop releases whatever was created if a later one fails.
        for i in 0..frames_in_flight {
            let image_available = this
                .backend
                .create_semaphore()
                .with_context(|| format!("image-available semaphore for frame {i}"))?;
            let render_finished = match this.backend.create_semaphore() {
                Ok(s) => s,
                Err(e) => {
                    this.backend.destroy_semaphore(image_available);
                    return Err(e.context(format!("render-finished semaphore for frame {i}")));
                }
            };
            // Signaled, so the very first wait on each slot returns immediately.
            let in_flight = match this.backend.create_fence(true) {
                Ok(f) => f,
                Err(e) => {
                    this.backend.destroy_semaphore(image_available);
                    this.backend.destroy_semaphore(render_finished);
                    return Err(e.context(format!("in-flight fence for frame {i}")));
                }
            };
            this.slots.push(FrameSlot {
                image_available,
                render_finished,
                in_flight,
            });
        }

        info!(
            "frame loop: {} frames in flight, {} swapchain images",
            frames_in_flight, image_count
        );
        Ok(this)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// Frame slot currently guarding `image_index`, if any.
    pub fn image_owner(&self, image_index: usize) -> Option<usize> {
        self.image_owner.get(image_index).copied().flatten()
    }

    /// Called by the window layer on every framebuffer resize.
    pub fn notify_resized(&mut self) {
        self.resize_requested = true;
    }

    /// Marks the swapchain for rebuild before the next acquire.
    pub fn invalidate_swapchain(&mut self) {
        if self.state == SwapchainState::Active {
            debug!("swapchain marked stale");
            self.state = SwapchainState::Stale;
        }
    }

    /// Rebuilds the swapchain chain if it is stale. Returns whether a rebuild happened.
    ///
    /// Blocks on window events while the framebuffer has a zero dimension and
    /// gives up (leaving the swapchain stale) if the window is closed meanwhile.
    /// Frame slots, their fences and the current slot index are left untouched.
    pub fn ensure_swapchain<S: SurfaceProvider + ?Sized>(&mut self, surface: &mut S) -> Result<bool> {
        if self.state == SwapchainState::Active {
            return Ok(false);
        }

        let mut size = surface.framebuffer_size();
        while size.is_zero() {
            if surface.close_requested() {
                debug!("close requested while minimized; swapchain left stale");
                return Ok(false);
            }
            trace!("framebuffer is {size}; waiting for events");
            surface.wait_events();
            size = surface.framebuffer_size();
        }

        self.backend
            .wait_idle()
            .context("wait for device idle before swapchain rebuild")?;

        for stage in TEARDOWN_ORDER {
            self.backend
                .teardown(stage)
                .with_context(|| format!("tear down {stage:?}"))?;
        }
        for stage in REBUILD_ORDER {
            self.backend
                .rebuild(stage, size)
                .with_context(|| format!("rebuild {stage:?} at {size}"))?;
        }

        // New images start without owners.
        self.image_owner.clear();
        self.image_owner.resize(self.backend.image_count(), None);
        // The rebuild already covers any resize reported before it.
        self.resize_requested = false;
        self.state = SwapchainState::Active;

        info!(
            "swapchain rebuilt at {size} with {} images",
            self.image_owner.len()
        );
        Ok(true)
    }

    /// Renders and presents one frame.
    pub fn render_frame<S: SurfaceProvider + ?Sized>(&mut self, surface: &mut S) -> Result<FrameStatus> {
        self.ensure_swapchain(surface)?;
        if self.state != SwapchainState::Active {
            return Ok(FrameStatus::Skipped);
        }

        let current = self.current;
        let (image_available, render_finished, fence) = {
            let slot = &self.slots[current];
            (slot.image_available, slot.render_finished, slot.in_flight)
        };

        self.backend
            .wait_for_fence(fence)
            .with_context(|| format!("wait for frame {current} fence"))?;

        let image_index = match self
            .backend
            .acquire_next_image(image_available)
            .context("acquire next swapchain image")?
        {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    trace!("acquired suboptimal image {image_index}");
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                debug!("acquire: swapchain out of date, skipping frame {current}");
                self.invalidate_swapchain();
                self.ensure_swapchain(surface)?;
                return Ok(FrameStatus::Skipped);
            }
        };

        let image = image_index as usize;
        debug_assert!(
            image < self.image_owner.len(),
            "image index {image} out of range for {} images",
            self.image_owner.len()
        );
        let Some(owner) = self.image_owner.get(image).copied() else {
            bail!(
                "presentation engine returned image {image} but the swapchain has {}",
                self.image_owner.len()
            );
        };

        // Same slot: its fence was waited on above.
        if let Some(previous) = owner.filter(|&o| o != current) {
            trace!("image {image} still in flight on frame {previous}");
            let previous_fence = self.slots[previous].in_flight;
            self.backend
                .wait_for_fence(previous_fence)
                .with_context(|| format!("wait for frame {previous} fence guarding image {image}"))?;
        }
        self.image_owner[image] = Some(current);

        self.backend
            .reset_fence(fence)
            .with_context(|| format!("reset frame {current} fence"))?;
        self.backend
            .submit(image_index, image_available, render_finished, fence)
            .with_context(|| format!("submit image {image} on frame {current}"))?;

        let presented = self
            .backend
            .present(image_index, render_finished)
            .with_context(|| format!("present image {image}"))?;
        let resized = std::mem::take(&mut self.resize_requested);

        let recreated = if resized || presented != PresentOutcome::Presented {
            debug!("present: {presented:?}, resized={resized}");
            self.invalidate_swapchain();
            self.ensure_swapchain(surface)?
        } else {
            false
        };

        self.current = (current + 1) % self.frames_in_flight;
        trace!("frame {current} presented image {image}");
        Ok(FrameStatus::Presented { recreated })
    }
}

impl<B: GpuBackend> Drop for FrameLoop<B> {
    fn drop(&mut self) {
        // Fences and semaphores may still be referenced by queued work.
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait idle before releasing frame sync failed: {e:#}");
        }
        for slot in self.slots.drain(..) {
            self.backend.destroy_fence(slot.in_flight);
            self.backend.destroy_semaphore(slot.render_finished);
            self.backend.destroy_semaphore(slot.image_available);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockBackend, MockSurface};
    use crate::{RenderSize, SwapchainStage};

    fn stage_calls(calls: &[Call]) -> (Vec<SwapchainStage>, Vec<SwapchainStage>) {
        let teardown = calls
            .iter()
            .filter_map(|c| match c {
                Call::Teardown(s) => Some(*s),
                _ => None,
            })
            .collect();
        let rebuild = calls
            .iter()
            .filter_map(|c| match c {
                Call::Rebuild(s, _) => Some(*s),
                _ => None,
            })
            .collect();
        (teardown, rebuild)
    }

    fn recreation_count(calls: &[Call]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, Call::Teardown(SwapchainStage::Swapchain)))
            .count()
    }

    #[test]
    fn fences_waited_and_reset_twice_after_two_rounds() {
        for n in 1..=3 {
            for m in n..=4 {
                let mut frames = FrameLoop::with_frames_in_flight(MockBackend::new(m), n).unwrap();
                let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

                for _ in 0..2 * n {
                    let status = frames.render_frame(&mut surface).unwrap();
                    assert_eq!(status, FrameStatus::Presented { recreated: false });
                }

                let mock = frames.backend();
                for slot in 0..n {
                    let fence = mock.slot_fence(slot);
                    assert_eq!(mock.resets_of(fence), 2, "N={n} M={m} slot {slot}");
                    let waits = mock.waits_of(fence);
                    if m == n {
                        assert_eq!(waits, 2, "N={n} M={m} slot {slot}");
                    } else {
                        assert!(waits >= 2, "N={n} M={m} slot {slot} waited {waits}");
                    }
                }
                assert_eq!(mock.submits(), 2 * n);
                assert_eq!(frames.current_frame(), 0);
            }
        }
    }

    #[test]
    fn reused_image_waits_on_the_slot_that_owns_it() {
        // Two slots, three images: frame 3 (slot 1) gets image 0 owned by slot 0.
        let mut frames = FrameLoop::with_frames_in_flight(MockBackend::new(3), 2).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(640, 480));

        for _ in 0..3 {
            frames.render_frame(&mut surface).unwrap();
        }
        assert_eq!(frames.image_owner(0), Some(0));
        let slot0 = frames.backend().slot_fence(0);
        let waits_before = frames.backend().waits_of(slot0);

        frames.render_frame(&mut surface).unwrap();
        assert_eq!(frames.backend().waits_of(slot0), waits_before + 1);
        assert_eq!(frames.image_owner(0), Some(1));
    }

    #[test]
    fn acquire_out_of_date_skips_frame_and_recreates_once() {
        let mut mock = MockBackend::new(2);
        mock.push_acquire(Ok(AcquireOutcome::OutOfDate));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(frames.current_frame(), 0);

        let mock = frames.backend();
        assert_eq!(mock.submits(), 0);
        assert_eq!(mock.presents(), 0);
        assert_eq!(recreation_count(&mock.calls), 1);
        assert_eq!(mock.resets_of(mock.slot_fence(0)), 0);
        assert_eq!(frames.state(), SwapchainState::Active);

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: false });
        assert_eq!(recreation_count(&frames.backend().calls), 1);
    }

    #[test]
    fn suboptimal_acquire_renders_normally() {
        let mut mock = MockBackend::new(2);
        mock.push_acquire(Ok(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        }));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: false });
        assert_eq!(frames.image_owner(1), Some(0));
        assert_eq!(recreation_count(&frames.backend().calls), 0);
    }

    #[test]
    fn suboptimal_present_recreates_and_advances() {
        let mut mock = MockBackend::new(2);
        mock.push_present(Ok(PresentOutcome::Suboptimal));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: true });
        assert_eq!(frames.current_frame(), 1);
        assert_eq!(recreation_count(&frames.backend().calls), 1);
        assert_eq!(frames.backend().presents(), 1);
    }

    #[test]
    fn out_of_date_present_recreates_and_advances() {
        let mut mock = MockBackend::new(3);
        mock.push_present(Ok(PresentOutcome::OutOfDate));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: true });
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn resize_flag_recreates_once_and_clears() {
        let mut frames = FrameLoop::new(MockBackend::new(2)).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(1024, 768));

        frames.notify_resized();
        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: true });
        assert_eq!(frames.current_frame(), 1);

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: false });
        assert_eq!(recreation_count(&frames.backend().calls), 1);
    }

    #[test]
    fn resize_then_out_of_date_acquire_recreates_once() {
        let mut mock = MockBackend::new(2);
        mock.push_acquire(Ok(AcquireOutcome::OutOfDate));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(1280, 720));

        frames.notify_resized();
        assert_eq!(frames.render_frame(&mut surface).unwrap(), FrameStatus::Skipped);
        assert_eq!(recreation_count(&frames.backend().calls), 1);

        let status = frames.render_frame(&mut surface).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: false });
        let mock = frames.backend();
        assert_eq!(recreation_count(&mock.calls), 1);
        assert_eq!(mock.wait_idles(), 1);
    }

    #[test]
    fn failed_rebuild_is_fatal_and_leaves_swapchain_stale() {
        let mut mock = MockBackend::new(2);
        mock.fail_rebuild = Some(SwapchainStage::Pipeline);
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        frames.invalidate_swapchain();
        assert!(frames.ensure_swapchain(&mut surface).is_err());
        assert_eq!(frames.state(), SwapchainState::Stale);
    }

    #[test]
    fn zero_size_blocks_rebuild_until_nonzero() {
        let mut mock = MockBackend::new(2);
        mock.push_present(Ok(PresentOutcome::OutOfDate));
        let mut frames = FrameLoop::new(mock).unwrap();
        // Only a rebuild asks for the size, so the frame itself runs while "minimized".
        let mut surface = MockSurface::scripted(&[
            RenderSize::new(0, 0),
            RenderSize::new(0, 0),
            RenderSize::new(300, 200),
        ]);

        frames.render_frame(&mut surface).unwrap();

        assert_eq!(surface.waits, 2);
        let rebuild_sizes: Vec<_> = frames
            .backend()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Rebuild(_, size) => Some(*size),
                _ => None,
            })
            .collect();
        assert_eq!(rebuild_sizes.len(), REBUILD_ORDER.len());
        assert!(rebuild_sizes.iter().all(|s| *s == RenderSize::new(300, 200)));
    }

    #[test]
    fn minimized_window_closing_leaves_swapchain_stale() {
        let mut frames = FrameLoop::new(MockBackend::new(2)).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(0, 0));
        surface.closing = true;

        frames.invalidate_swapchain();
        assert!(!frames.ensure_swapchain(&mut surface).unwrap());
        assert_eq!(frames.state(), SwapchainState::Stale);
        assert_eq!(frames.render_frame(&mut surface).unwrap(), FrameStatus::Skipped);

        let (teardown, rebuild) = stage_calls(&frames.backend().calls);
        assert!(teardown.is_empty());
        assert!(rebuild.is_empty());
    }

    #[test]
    fn recreation_follows_dependency_order() {
        let mut frames = FrameLoop::new(MockBackend::new(2)).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        frames.invalidate_swapchain();
        assert!(frames.ensure_swapchain(&mut surface).unwrap());

        let calls = &frames.backend().calls;
        let (teardown, rebuild) = stage_calls(calls);
        assert_eq!(teardown, TEARDOWN_ORDER);
        assert_eq!(rebuild, REBUILD_ORDER);

        let idle = calls.iter().position(|c| *c == Call::WaitIdle).unwrap();
        let first_teardown = calls
            .iter()
            .position(|c| matches!(c, Call::Teardown(_)))
            .unwrap();
        let last_teardown = calls
            .iter()
            .rposition(|c| matches!(c, Call::Teardown(_)))
            .unwrap();
        let first_rebuild = calls
            .iter()
            .position(|c| matches!(c, Call::Rebuild(..)))
            .unwrap();
        assert!(idle < first_teardown);
        assert!(last_teardown < first_rebuild);
    }

    #[test]
    fn ensure_on_active_swapchain_is_a_no_op() {
        let mut frames = FrameLoop::new(MockBackend::new(2)).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        frames.render_frame(&mut surface).unwrap();
        frames.invalidate_swapchain();
        assert!(frames.ensure_swapchain(&mut surface).unwrap());

        let calls_before = frames.backend().calls.len();
        let current_before = frames.current_frame();
        let owners_before: Vec<_> = (0..2).map(|i| frames.image_owner(i)).collect();

        assert!(!frames.ensure_swapchain(&mut surface).unwrap());
        assert!(!frames.ensure_swapchain(&mut surface).unwrap());

        assert_eq!(frames.backend().calls.len(), calls_before);
        assert_eq!(frames.current_frame(), current_before);
        let owners_after: Vec<_> = (0..2).map(|i| frames.image_owner(i)).collect();
        assert_eq!(owners_after, owners_before);
    }

    #[test]
    fn recreation_keeps_slot_index_and_clears_owners() {
        let mut frames = FrameLoop::new(MockBackend::new(2)).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        frames.render_frame(&mut surface).unwrap();
        assert_eq!(frames.image_owner(0), Some(0));

        frames.backend_mut().rebuild_image_count = Some(4);
        frames.invalidate_swapchain();
        frames.ensure_swapchain(&mut surface).unwrap();

        assert_eq!(frames.current_frame(), 1);
        assert_eq!(frames.backend().image_count(), 4);
        assert!((0..4).all(|i| frames.image_owner(i).is_none()));

        // Two more rounds on the wider swapchain keep the fence protocol intact.
        for _ in 0..4 {
            frames.render_frame(&mut surface).unwrap();
        }
    }

    #[test]
    fn acquire_failure_is_fatal() {
        let mut mock = MockBackend::new(2);
        mock.push_acquire(Err("device lost"));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let err = frames.render_frame(&mut surface).unwrap_err();
        assert!(format!("{err:#}").contains("device lost"));
        assert_eq!(frames.backend().submits(), 0);
    }

    #[test]
    fn present_failure_is_fatal() {
        let mut mock = MockBackend::new(2);
        mock.push_present(Err("surface lost"));
        let mut frames = FrameLoop::new(mock).unwrap();
        let mut surface = MockSurface::fixed(RenderSize::new(800, 600));

        let err = frames.render_frame(&mut surface).unwrap_err();
        assert!(format!("{err:#}").contains("surface lost"));
    }

    #[test]
    fn drop_waits_idle_and_releases_sync_objects() {
        let mock = MockBackend::new(3);
        let live = mock.live_objects();
        {
            let mut frames = FrameLoop::new(mock).unwrap();
            assert_eq!(live.get(), 3 * MAX_FRAMES_IN_FLIGHT);
            let mut surface = MockSurface::fixed(RenderSize::new(800, 600));
            frames.render_frame(&mut surface).unwrap();
        }
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(FrameLoop::with_frames_in_flight(MockBackend::new(2), 0).is_err());
    }
}
