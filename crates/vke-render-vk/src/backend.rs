// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Context, Result};
use ash::khr::swapchain;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};
use vke_render::{
    AcquireOutcome, GpuBackend, PresentOutcome, RenderSize, SwapchainStage, REBUILD_ORDER,
    TEARDOWN_ORDER,
};

use crate::device::{select_physical_device, LogicalDevice, OptionalExtensions, QueueFamilies};
use crate::instance::{Instance, Surface};
use crate::memory::{Buffer, MemoryUsage};
use crate::scene::{Transform, TRIANGLE};
use crate::{pipeline, swapchain as sc, VkConfig};

/// Vulkan renderer state driven by [`vke_render::FrameLoop`].
///
/// Swapchain-derived resources are created and destroyed one
/// [`SwapchainStage`] at a time. Field order matters: the device, surface
/// and instance are dropped last, in that order.
pub struct VkBackend {
    config: VkConfig,
    clear: vk::ClearValue,

    swapchain_loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,

    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    transform: Buffer,
    vertex_buffer: Buffer,

    device: LogicalDevice,
    surface: Surface,
    #[allow(dead_code)]
    instance: Instance,
}

impl VkBackend {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: VkConfig,
    ) -> Result<Self> {
        let display_raw = display.display_handle().context("display handle")?.as_raw();
        let window_raw = window.window_handle().context("window handle")?.as_raw();

        let instance = unsafe { Instance::new(&config.app_name, display_raw, config.validation) }?;
        let surface = unsafe { Surface::new(&instance, display_raw, window_raw) }?;
        let physical = unsafe { select_physical_device(&instance, &surface) }?;
        let device = unsafe { LogicalDevice::new(&instance, &physical, &config.descriptor_pools) }?;
        let swapchain_loader = swapchain::Device::new(&instance.raw, &device.raw);

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: config.clear_color,
            },
        };

        // Assembled empty first so that Drop cleans up after any failure below.
        let mut this = Self {
            config,
            clear,
            swapchain_loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            command_buffers: Vec::new(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_set: vk::DescriptorSet::null(),
            transform: Buffer::null(),
            vertex_buffer: Buffer::null(),
            device,
            surface,
            instance,
        };

        unsafe {
            this.create_descriptors()?;
            this.upload_vertices()?;
        }
        for stage in REBUILD_ORDER {
            this.rebuild(stage, size)
                .with_context(|| format!("create {stage:?}"))?;
        }

        info!(
            "vk backend ready: {}x{} {:?}, {} swapchain images",
            this.extent.width,
            this.extent.height,
            this.format,
            this.images.len()
        );
        Ok(this)
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.device.families
    }

    pub fn optional_extensions(&self) -> OptionalExtensions {
        self.device.optional
    }

    pub fn extent(&self) -> RenderSize {
        RenderSize::new(self.extent.width, self.extent.height)
    }

    /// Transform uniform buffer plus the set it is bound through.
    unsafe fn create_descriptors(&mut self) -> Result<()> {
        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        };
        let pool = self.device.descriptors();
        self.set_layout = unsafe { pool.create_layout(std::slice::from_ref(&binding)) }?;
        let first = unsafe { pool.create_sets(&[self.set_layout]) }?;
        self.descriptor_set = pool.set(first).context("descriptor set missing after allocation")?;

        self.transform = unsafe {
            self.device.memory().create_buffer(
                std::mem::size_of::<Transform>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryUsage::Upload,
                "transform",
            )
        }?;

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: self.transform.raw,
            offset: 0,
            range: self.transform.size,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: self.descriptor_set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        unsafe { self.device.descriptors().update(std::slice::from_ref(&write)) };
        Ok(())
    }

    /// Copies the triangle into a device-local vertex buffer through a staging buffer.
    unsafe fn upload_vertices(&mut self) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        let size = bytes.len() as vk::DeviceSize;

        let mut staging = unsafe {
            self.device.memory().create_buffer(
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryUsage::Upload,
                "vertex staging",
            )
        }?;
        self.vertex_buffer = match unsafe {
            self.device.memory().create_buffer(
                size,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryUsage::DeviceLocal,
                "vertices",
            )
        } {
            Ok(buffer) => buffer,
            Err(e) => {
                unsafe { self.device.memory().destroy_buffer(&mut staging) };
                return Err(e);
            }
        };

        let mut copied = self.device.memory().write(&staging, bytes);
        if copied.is_ok() {
            copied = unsafe { self.copy_buffer(staging.raw, self.vertex_buffer.raw, size) };
        }
        unsafe { self.device.memory().destroy_buffer(&mut staging) };
        copied
    }

    unsafe fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> Result<()> {
        let device = &self.device.raw;
        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.device.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { device.allocate_command_buffers(&alloc) }
            .context("allocate upload command buffer")?[0];

        let result = (|| -> Result<()> {
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            unsafe {
                device.begin_command_buffer(cmd, &begin)?;
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                device.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
                device.end_command_buffer(cmd)?;

                let submit = vk::SubmitInfo {
                    s_type: vk::StructureType::SUBMIT_INFO,
                    command_buffer_count: 1,
                    p_command_buffers: &cmd,
                    ..Default::default()
                };
                device
                    .queue_submit(self.device.graphics_queue, &[submit], vk::Fence::null())
                    .context("submit vertex upload")?;
                device
                    .queue_wait_idle(self.device.graphics_queue)
                    .context("wait for vertex upload")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.device.command_pool, &[cmd]) };
        result
    }

    unsafe fn record_command_buffers(&self) -> Result<()> {
        let device = &self.device.raw;
        for (&cmd, &framebuffer) in self.command_buffers.iter().zip(&self.framebuffers) {
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            let clears = [self.clear];
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.render_pass,
                framebuffer,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.extent,
                },
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            };

            unsafe {
                device
                    .begin_command_buffer(cmd, &begin)
                    .context("begin_command_buffer")?;
                device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[scissor]);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_set],
                    &[],
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.raw], &[0]);
                device.cmd_draw(cmd, TRIANGLE.len() as u32, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
                device
                    .end_command_buffer(cmd)
                    .context("end_command_buffer")?;
            }
        }
        Ok(())
    }

    fn write_transform(&mut self) -> Result<()> {
        let transform = Transform::for_extent(self.extent.width, self.extent.height);
        self.device
            .memory()
            .write(&self.transform, bytemuck::bytes_of(&transform))
    }
}

impl GpuBackend for VkBackend {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.raw.create_fence(&info, None) }.context("create_fence")
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe { self.device.raw.create_semaphore(&info, None) }.context("create_semaphore")
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device.raw.destroy_fence(fence, None) };
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.raw.destroy_semaphore(semaphore, None) };
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.raw.wait_for_fences(&[fence], true, u64::MAX) }
            .context("wait_for_fences")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.raw.reset_fences(&[fence]) }.context("reset_fences")
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        match unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        } {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => bail!("acquire_next_image: {e:?}"),
        }
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .with_context(|| format!("no command buffer for image {image_index}"))?;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.device
                .raw
                .queue_submit(self.device.graphics_queue, &[submit], fence)
        }
        .context("queue_submit")
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        match unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue, &info)
        } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => bail!("queue_present: {e:?}"),
        }
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.raw.device_wait_idle() }.context("device_wait_idle")
    }

    fn teardown(&mut self, stage: SwapchainStage) -> Result<()> {
        let device = &self.device.raw;
        unsafe {
            match stage {
                SwapchainStage::Framebuffers => {
                    for fb in self.framebuffers.drain(..) {
                        device.destroy_framebuffer(fb, None);
                    }
                }
                SwapchainStage::CommandBuffers => {
                    if !self.command_buffers.is_empty() {
                        device.free_command_buffers(self.device.command_pool, &self.command_buffers);
                        self.command_buffers.clear();
                    }
                }
                SwapchainStage::Pipeline => {
                    device.destroy_pipeline(self.pipeline, None);
                    self.pipeline = vk::Pipeline::null();
                }
                SwapchainStage::PipelineLayout => {
                    device.destroy_pipeline_layout(self.pipeline_layout, None);
                    self.pipeline_layout = vk::PipelineLayout::null();
                }
                SwapchainStage::RenderPass => {
                    device.destroy_render_pass(self.render_pass, None);
                    self.render_pass = vk::RenderPass::null();
                }
                SwapchainStage::ImageViews => {
                    for view in self.image_views.drain(..) {
                        device.destroy_image_view(view, None);
                    }
                }
                SwapchainStage::Swapchain => {
                    self.swapchain_loader.destroy_swapchain(self.swapchain, None);
                    self.swapchain = vk::SwapchainKHR::null();
                    self.images.clear();
                }
            }
        }
        debug!("torn down {stage:?}");
        Ok(())
    }

    fn rebuild(&mut self, stage: SwapchainStage, size: RenderSize) -> Result<()> {
        unsafe {
            match stage {
                SwapchainStage::Swapchain => {
                    let desc = sc::create_swapchain(
                        &self.swapchain_loader,
                        &self.surface,
                        self.device.physical,
                        self.device.families,
                        size,
                        self.config.vsync,
                        self.config.vsync_mode,
                    )?;
                    self.swapchain = desc.raw;
                    self.format = desc.format;
                    self.extent = desc.extent;
                    self.images = desc.images;
                    // The device is idle here, so the uniform is not in use.
                    self.write_transform()?;
                }
                SwapchainStage::ImageViews => {
                    self.image_views =
                        sc::create_image_views(&self.device.raw, &self.images, self.format)?;
                }
                SwapchainStage::RenderPass => {
                    self.render_pass = pipeline::create_render_pass(&self.device.raw, self.format)?;
                }
                SwapchainStage::PipelineLayout => {
                    self.pipeline_layout =
                        pipeline::create_pipeline_layout(&self.device.raw, self.set_layout)?;
                }
                SwapchainStage::Pipeline => {
                    self.pipeline = pipeline::create_pipeline(
                        &self.device.raw,
                        self.render_pass,
                        self.pipeline_layout,
                        &self.config.shader_dir,
                    )?;
                }
                SwapchainStage::Framebuffers => {
                    self.framebuffers = pipeline::create_framebuffers(
                        &self.device.raw,
                        self.render_pass,
                        &self.image_views,
                        self.extent,
                    )?;
                }
                SwapchainStage::CommandBuffers => {
                    let alloc = vk::CommandBufferAllocateInfo {
                        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                        command_pool: self.device.command_pool,
                        level: vk::CommandBufferLevel::PRIMARY,
                        command_buffer_count: self.framebuffers.len() as u32,
                        ..Default::default()
                    };
                    self.command_buffers = self
                        .device
                        .raw
                        .allocate_command_buffers(&alloc)
                        .context("allocate_command_buffers")?;
                    self.record_command_buffers()?;
                }
            }
        }
        debug!("rebuilt {stage:?} for {size}");
        Ok(())
    }
}

impl Drop for VkBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("vk backend drop: {e:#}");
        }
        for stage in TEARDOWN_ORDER {
            let _ = self.teardown(stage);
        }
        unsafe {
            let memory = self.device.memory();
            memory.destroy_buffer(&mut self.vertex_buffer);
            memory.destroy_buffer(&mut self.transform);
        }
    }
}
