// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::fs;
use std::io::{self, Cursor};
use std::path::Path;
use tracing::{debug, info};

pub(crate) const VERTEX_FILE: &str = "vert.spv";
pub(crate) const FRAGMENT_FILE: &str = "frag.spv";

static EMBEDDED_VERTEX: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vert.spv"));
static EMBEDDED_FRAGMENT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/frag.spv"));

/// Reads `dir/file` as SPIR-V words, or decodes `embedded` if the file does
/// not exist. Any other read failure and malformed SPIR-V are errors.
pub(crate) fn load_spirv(dir: &Path, file: &str, embedded: &[u8]) -> Result<Vec<u32>> {
    let path = dir.join(file);
    let bytes = match fs::read(&path) {
        Ok(bytes) => {
            info!("shader: {}", path.display());
            bytes
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("shader: {} not found, using built-in {file}", path.display());
            embedded.to_vec()
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    read_spv(&mut Cursor::new(&bytes[..]))
        .with_context(|| format!("{} is not valid SPIR-V", path.display()))
}

pub(crate) struct ShaderPair {
    pub(crate) vertex: Vec<u32>,
    pub(crate) fragment: Vec<u32>,
}

impl ShaderPair {
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            vertex: load_spirv(dir, VERTEX_FILE, EMBEDDED_VERTEX)?,
            fragment: load_spirv(dir, FRAGMENT_FILE, EMBEDDED_FRAGMENT)?,
        })
    }
}

pub(crate) unsafe fn create_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: std::mem::size_of_val(code),
        ..Default::default()
    };
    unsafe { device.create_shader_module(&info, None) }.context("create_shader_module")
}
