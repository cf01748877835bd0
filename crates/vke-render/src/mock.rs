// SPDX-License-Identifier: CEPL-1.0
//! Recording backend that enforces the fence/semaphore rules a driver would.

use anyhow::{anyhow, bail, Result};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::{AcquireOutcome, GpuBackend, PresentOutcome, RenderSize, SurfaceProvider, SwapchainStage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockFence(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockSemaphore(usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    WaitFence(MockFence),
    ResetFence(MockFence),
    Acquire,
    Submit { image: u32, fence: MockFence },
    Present(u32),
    WaitIdle,
    Teardown(SwapchainStage),
    Rebuild(SwapchainStage, RenderSize),
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    /// Image whose submission this fence is guarding and has not been waited on.
    pending: Option<u32>,
    destroyed: bool,
}

#[derive(Default)]
struct SemaphoreState {
    signaled: bool,
    destroyed: bool,
}

pub struct MockBackend {
    pub calls: Vec<Call>,
    /// Image count applied when the swapchain stage is rebuilt.
    pub rebuild_image_count: Option<usize>,
    /// Stage whose rebuild reports an error.
    pub fail_rebuild: Option<SwapchainStage>,
    image_count: usize,
    next_image: usize,
    acquire_script: VecDeque<Result<AcquireOutcome, &'static str>>,
    present_script: VecDeque<Result<PresentOutcome, &'static str>>,
    fences: Vec<FenceState>,
    semaphores: Vec<SemaphoreState>,
    live: Rc<Cell<usize>>,
}

impl MockBackend {
    pub fn new(image_count: usize) -> Self {
        Self {
            calls: Vec::new(),
            rebuild_image_count: None,
            fail_rebuild: None,
            image_count,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            fences: Vec::new(),
            semaphores: Vec::new(),
            live: Rc::new(Cell::new(0)),
        }
    }

    pub fn push_acquire(&mut self, outcome: Result<AcquireOutcome, &'static str>) {
        self.acquire_script.push_back(outcome);
    }

    pub fn push_present(&mut self, outcome: Result<PresentOutcome, &'static str>) {
        self.present_script.push_back(outcome);
    }

    /// Count of fences and semaphores created and not yet destroyed.
    pub fn live_objects(&self) -> Rc<Cell<usize>> {
        self.live.clone()
    }

    /// Fences are only created by frame slots, in slot order.
    pub fn slot_fence(&self, slot: usize) -> MockFence {
        MockFence(slot)
    }

    pub fn waits_of(&self, fence: MockFence) -> usize {
        self.count(|c| *c == Call::WaitFence(fence))
    }

    pub fn resets_of(&self, fence: MockFence) -> usize {
        self.count(|c| *c == Call::ResetFence(fence))
    }

    pub fn submits(&self) -> usize {
        self.count(|c| matches!(c, Call::Submit { .. }))
    }

    pub fn presents(&self) -> usize {
        self.count(|c| matches!(c, Call::Present(_)))
    }

    pub fn wait_idles(&self) -> usize {
        self.count(|c| *c == Call::WaitIdle)
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    fn fence(&mut self, fence: MockFence) -> Result<&mut FenceState> {
        match self.fences.get_mut(fence.0) {
            Some(f) if !f.destroyed => Ok(f),
            _ => Err(anyhow!("use of destroyed or unknown fence {fence:?}")),
        }
    }

    fn semaphore(&mut self, semaphore: MockSemaphore) -> Result<&mut SemaphoreState> {
        match self.semaphores.get_mut(semaphore.0) {
            Some(s) if !s.destroyed => Ok(s),
            _ => Err(anyhow!("use of destroyed or unknown semaphore {semaphore:?}")),
        }
    }

    fn consume(&mut self, semaphore: MockSemaphore) -> Result<()> {
        let s = self.semaphore(semaphore)?;
        if !s.signaled {
            bail!("wait on {semaphore:?} which nothing will signal");
        }
        s.signaled = false;
        Ok(())
    }

    fn signal(&mut self, semaphore: MockSemaphore) -> Result<()> {
        let s = self.semaphore(semaphore)?;
        if s.signaled {
            bail!("{semaphore:?} signaled twice without a wait");
        }
        s.signaled = true;
        Ok(())
    }
}

impl GpuBackend for MockBackend {
    type Fence = MockFence;
    type Semaphore = MockSemaphore;

    fn create_fence(&mut self, signaled: bool) -> Result<MockFence> {
        self.fences.push(FenceState {
            signaled,
            ..Default::default()
        });
        self.live.set(self.live.get() + 1);
        Ok(MockFence(self.fences.len() - 1))
    }

    fn create_semaphore(&mut self) -> Result<MockSemaphore> {
        self.semaphores.push(SemaphoreState::default());
        self.live.set(self.live.get() + 1);
        Ok(MockSemaphore(self.semaphores.len() - 1))
    }

    fn destroy_fence(&mut self, fence: MockFence) {
        let f = &mut self.fences[fence.0];
        assert!(f.pending.is_none(), "destroying {fence:?} while in flight");
        f.destroyed = true;
        self.live.set(self.live.get() - 1);
    }

    fn destroy_semaphore(&mut self, semaphore: MockSemaphore) {
        self.semaphores[semaphore.0].destroyed = true;
        self.live.set(self.live.get() - 1);
    }

    fn wait_for_fence(&mut self, fence: MockFence) -> Result<()> {
        self.calls.push(Call::WaitFence(fence));
        let f = self.fence(fence)?;
        if f.pending.take().is_some() {
            f.signaled = true;
        }
        if !f.signaled {
            bail!("waiting on {fence:?} with no submitted work would block forever");
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: MockFence) -> Result<()> {
        self.calls.push(Call::ResetFence(fence));
        let f = self.fence(fence)?;
        if f.pending.is_some() {
            bail!("reset of {fence:?} while its work is in flight");
        }
        f.signaled = false;
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: MockSemaphore) -> Result<AcquireOutcome> {
        self.calls.push(Call::Acquire);
        let outcome = match self.acquire_script.pop_front() {
            Some(scripted) => scripted.map_err(|e| anyhow!(e))?,
            None => {
                let image_index = (self.next_image % self.image_count) as u32;
                self.next_image += 1;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }
        };
        if let AcquireOutcome::Acquired { .. } = outcome {
            self.signal(signal)?;
        }
        Ok(outcome)
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: MockSemaphore,
        signal: MockSemaphore,
        fence: MockFence,
    ) -> Result<()> {
        self.calls.push(Call::Submit {
            image: image_index,
            fence,
        });
        if image_index as usize >= self.image_count {
            bail!("submit for image {image_index} of {}", self.image_count);
        }
        if let Some(other) = self
            .fences
            .iter()
            .position(|f| !f.destroyed && f.pending == Some(image_index))
        {
            bail!("image {image_index} already guarded by un-waited fence {other}");
        }
        {
            let f = self.fence(fence)?;
            if f.signaled || f.pending.is_some() {
                bail!("{fence:?} must be reset before submit");
            }
            f.pending = Some(image_index);
        }
        self.consume(wait)?;
        self.signal(signal)
    }

    fn present(&mut self, image_index: u32, wait: MockSemaphore) -> Result<PresentOutcome> {
        self.calls.push(Call::Present(image_index));
        self.consume(wait)?;
        match self.present_script.pop_front() {
            Some(scripted) => scripted.map_err(|e| anyhow!(e)),
            None => Ok(PresentOutcome::Presented),
        }
    }

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        for f in self.fences.iter_mut().filter(|f| f.pending.is_some()) {
            f.pending = None;
            f.signaled = true;
        }
        Ok(())
    }

    fn teardown(&mut self, stage: SwapchainStage) -> Result<()> {
        if self.fences.iter().any(|f| f.pending.is_some()) {
            bail!("tearing down {stage:?} while work is in flight");
        }
        self.calls.push(Call::Teardown(stage));
        Ok(())
    }

    fn rebuild(&mut self, stage: SwapchainStage, size: RenderSize) -> Result<()> {
        if size.is_zero() {
            bail!("rebuild of {stage:?} at zero size");
        }
        if self.fail_rebuild == Some(stage) {
            bail!("scripted failure rebuilding {stage:?}");
        }
        if stage == SwapchainStage::Swapchain {
            if let Some(count) = self.rebuild_image_count {
                self.image_count = count;
            }
            self.next_image = 0;
        }
        self.calls.push(Call::Rebuild(stage, size));
        Ok(())
    }
}

/// Window whose size follows a script; each event wait moves one step forward.
pub struct MockSurface {
    sizes: Vec<RenderSize>,
    position: usize,
    pub waits: usize,
    pub closing: bool,
}

impl MockSurface {
    pub fn fixed(size: RenderSize) -> Self {
        Self::scripted(&[size])
    }

    pub fn scripted(sizes: &[RenderSize]) -> Self {
        assert!(!sizes.is_empty());
        Self {
            sizes: sizes.to_vec(),
            position: 0,
            waits: 0,
            closing: false,
        }
    }
}

impl SurfaceProvider for MockSurface {
    fn framebuffer_size(&self) -> RenderSize {
        self.sizes[self.position]
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.position = (self.position + 1).min(self.sizes.len() - 1);
    }

    fn close_requested(&self) -> bool {
        self.closing
    }
}
