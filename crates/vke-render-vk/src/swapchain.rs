// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use tracing::info;
use vke_render::RenderSize;

use crate::device::QueueFamilies;
use crate::instance::Surface;
use crate::VsyncMode;

pub(crate) struct SwapchainDesc {
    pub(crate) raw: vk::SwapchainKHR,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent2D,
    pub(crate) images: Vec<vk::Image>,
}

/// sRGB formats first, otherwise whatever the driver lists first.
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let srgb_nonlinear = |f: &&vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
    formats
        .iter()
        .filter(srgb_nonlinear)
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
        .or_else(|| formats.iter().find(|f| f.format == vk::Format::R8G8B8A8_SRGB))
        .or_else(|| {
            formats
                .iter()
                .filter(srgb_nonlinear)
                .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        })
        .or_else(|| formats.first())
        .copied()
}

pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, VsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, VsyncMode::Fifo) => &[vk::PresentModeKHR::FIFO],
    };
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the window size clamped to the surface
/// limits when the surface leaves it to the swapchain.
pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub(crate) fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

pub(crate) unsafe fn create_swapchain(
    loader: &swapchain::Device,
    surface: &Surface,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
    size: RenderSize,
    vsync: bool,
    vsync_mode: VsyncMode,
) -> Result<SwapchainDesc> {
    let caps = unsafe {
        surface
            .loader
            .get_physical_device_surface_capabilities(phys, surface.raw)
    }
    .context("get_physical_device_surface_capabilities")?;
    let formats = unsafe {
        surface
            .loader
            .get_physical_device_surface_formats(phys, surface.raw)
    }
    .context("get_physical_device_surface_formats")?;
    let modes = unsafe {
        surface
            .loader
            .get_physical_device_surface_present_modes(phys, surface.raw)
    }
    .context("get_physical_device_surface_present_modes")?;

    let surface_format = choose_surface_format(&formats).context("surface reports no formats")?;
    let present_mode = choose_present_mode(&modes, vsync, vsync_mode);
    let extent = choose_extent(&caps, size);
    let image_count = choose_image_count(&caps);

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let family_indices = [families.graphics, families.present];
    let (sharing_mode, index_count) = if families.split_present() {
        (vk::SharingMode::CONCURRENT, family_indices.len() as u32)
    } else {
        (vk::SharingMode::EXCLUSIVE, 0)
    };

    let info = vk::SwapchainCreateInfoKHR {
        s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
        surface: surface.raw,
        min_image_count: image_count,
        image_format: surface_format.format,
        image_color_space: surface_format.color_space,
        image_extent: extent,
        image_array_layers: 1,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        image_sharing_mode: sharing_mode,
        queue_family_index_count: index_count,
        p_queue_family_indices: family_indices.as_ptr(),
        pre_transform,
        composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        present_mode,
        clipped: vk::TRUE,
        // The previous swapchain is destroyed before this one is created.
        old_swapchain: vk::SwapchainKHR::null(),
        ..Default::default()
    };
    let raw = unsafe { loader.create_swapchain(&info, None) }.context("create_swapchain")?;
    let images = match unsafe { loader.get_swapchain_images(raw) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loader.destroy_swapchain(raw, None) };
            return Err(e).context("get_swapchain_images");
        }
    };

    info!(
        "swapchain: {}x{} {:?}/{:?} {:?}, {} image(s) (min {})",
        extent.width,
        extent.height,
        surface_format.format,
        surface_format.color_space,
        present_mode,
        images.len(),
        caps.min_image_count
    );

    Ok(SwapchainDesc {
        raw,
        format: surface_format.format,
        extent,
        images,
    })
}

pub(crate) unsafe fn create_image_views(
    device: &ash::Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        match unsafe { device.create_image_view(&info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                return Err(e).context("create_image_view");
            }
        }
    }
    Ok(views)
}
