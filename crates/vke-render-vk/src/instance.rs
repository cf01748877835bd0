// SPDX-License-Identifier: CEPL-1.0
use anyhow::{bail, Context, Result};
use ash::ext::debug_utils as ext_debug;
use ash::khr::surface;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || unsafe { (*data).p_message.is_null() } {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[vulkan {types:?}] {msg}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[vulkan {types:?}] {msg}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!("[vulkan {types:?}] {msg}"),
        _ => trace!("[vulkan {types:?}] {msg}"),
    }
    vk::FALSE
}

struct DebugMessenger {
    loader: ext_debug::Instance,
    raw: vk::DebugUtilsMessengerEXT,
}

/// Vulkan instance plus the debug messenger that lives and dies with it.
pub(crate) struct Instance {
    pub(crate) entry: Entry,
    pub(crate) raw: ash::Instance,
    debug: Option<DebugMessenger>,
}

impl Instance {
    pub(crate) unsafe fn new(
        app_name: &str,
        display: RawDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let entry = Entry::linked();

        let layer_available = unsafe { has_layer(&entry, VALIDATION_LAYER) }?;
        if validation && !layer_available {
            bail!(
                "validation requested but {} is not installed",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        let app = CString::new(app_name).context("application name contains a NUL byte")?;
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app.as_ptr(),
            application_version: 0,
            p_engine_name: c"VKE".as_ptr(),
            engine_version: 0,
            api_version: vk::API_VERSION_1_1,
            ..Default::default()
        };

        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
            .context("enumerate_required_extensions")?
            .to_vec();
        if validation {
            extensions.push(ext_debug::NAME.as_ptr());
        }
        let layers = [VALIDATION_LAYER.as_ptr()];

        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
            pp_enabled_layer_names: layers.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?;

        let debug = if validation {
            let loader = ext_debug::Instance::new(&entry, &raw);
            let ci = vk::DebugUtilsMessengerCreateInfoEXT {
                s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_callback),
                ..Default::default()
            };
            match unsafe { loader.create_debug_utils_messenger(&ci, None) } {
                Ok(messenger) => Some(DebugMessenger {
                    loader,
                    raw: messenger,
                }),
                Err(e) => {
                    unsafe { raw.destroy_instance(None) };
                    bail!("create_debug_utils_messenger: {e:?}");
                }
            }
        } else {
            None
        };

        info!("vulkan instance created (validation={validation})");
        Ok(Self { entry, raw, debug })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug.loader.destroy_debug_utils_messenger(debug.raw, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe fn has_layer(entry: &Entry, name: &CStr) -> Result<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .context("enumerate_instance_layer_properties")?;
    Ok(layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == name))
}

/// Presentation surface of the window; must be dropped before its [`Instance`].
pub(crate) struct Surface {
    pub(crate) loader: surface::Instance,
    pub(crate) raw: vk::SurfaceKHR,
}

impl Surface {
    pub(crate) unsafe fn new(
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let loader = surface::Instance::new(&instance.entry, &instance.raw);
        let raw = unsafe {
            ash_window::create_surface(&instance.entry, &instance.raw, display, window, None)
        }
        .context("ash_window::create_surface")?;
        Ok(Self { loader, raw })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}
