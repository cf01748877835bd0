// SPDX-License-Identifier: CEPL-1.0
//! Descriptor pool sizing file and the pool built from it.
//!
//! The sizing file has one `type count setCount` entry per line:
//!
//! ```text
//! # type                  count  setCount
//! UNIFORM_BUFFER          16     16
//! COMBINED_IMAGE_SAMPLER  16     16
//! ```
//!
//! Blank lines and `#` comments are ignored. The pool's `maxSets` is the sum
//! of all set counts and must be nonzero.

use anyhow::{Context, Result};
use ash::vk;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: expected `type count setCount`, found {found} field(s)")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: unknown descriptor type `{name}`")]
    UnknownType { line: usize, name: String },
    #[error("line {line}: `{value}` is not a valid count")]
    InvalidCount { line: usize, value: String },
    #[error("descriptor pool file has no entries")]
    Empty,
    #[error("line {line}: total setCount exceeds 4294967295")]
    SetCountOverflow { line: usize },
    #[error("descriptor pool file allows no sets; at least one setCount must be nonzero")]
    NoSets,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub set_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub entries: Vec<PoolEntry>,
    max_sets: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            entries: vec![
                PoolEntry {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    count: 16,
                    set_count: 16,
                },
                PoolEntry {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    count: 16,
                    set_count: 0,
                },
            ],
            max_sets: 16,
        }
    }
}

impl PoolConfig {
    pub fn parse(text: &str) -> Result<Self, PoolConfigError> {
        let mut entries = Vec::new();
        let mut max_sets: u32 = 0;
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let fields: Vec<&str> = content.split_whitespace().collect();
            let &[name, count, set_count] = fields.as_slice() else {
                return Err(PoolConfigError::FieldCount {
                    line,
                    found: fields.len(),
                });
            };

            let ty = descriptor_type(name).ok_or_else(|| PoolConfigError::UnknownType {
                line,
                name: name.to_owned(),
            })?;
            let entry = PoolEntry {
                ty,
                count: parse_count(count, line, 1)?,
                set_count: parse_count(set_count, line, 0)?,
            };
            max_sets = max_sets
                .checked_add(entry.set_count)
                .ok_or(PoolConfigError::SetCountOverflow { line })?;
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(PoolConfigError::Empty);
        }
        // vkCreateDescriptorPool requires maxSets > 0.
        if max_sets == 0 {
            return Err(PoolConfigError::NoSets);
        }
        Ok(Self { entries, max_sets })
    }

    /// Reads the sizing file. A missing file yields the built-in sizes.
    pub fn load(path: &Path) -> Result<Self, PoolConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "descriptor pool file {} not found; using built-in sizes",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(source) => Err(PoolConfigError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.entries
            .iter()
            .map(|e| vk::DescriptorPoolSize {
                ty: e.ty,
                descriptor_count: e.count,
            })
            .collect()
    }
}

fn parse_count(value: &str, line: usize, min: u32) -> Result<u32, PoolConfigError> {
    match value.parse::<u32>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(PoolConfigError::InvalidCount {
            line,
            value: value.to_owned(),
        }),
    }
}

/// Accepts `UNIFORM_BUFFER` and `VK_DESCRIPTOR_TYPE_UNIFORM_BUFFER`, any case.
fn descriptor_type(name: &str) -> Option<vk::DescriptorType> {
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("VK_DESCRIPTOR_TYPE_").unwrap_or(&upper);
    let ty = match short {
        "SAMPLER" => vk::DescriptorType::SAMPLER,
        "COMBINED_IMAGE_SAMPLER" => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        "SAMPLED_IMAGE" => vk::DescriptorType::SAMPLED_IMAGE,
        "STORAGE_IMAGE" => vk::DescriptorType::STORAGE_IMAGE,
        "UNIFORM_TEXEL_BUFFER" => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        "STORAGE_TEXEL_BUFFER" => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        "UNIFORM_BUFFER" => vk::DescriptorType::UNIFORM_BUFFER,
        "STORAGE_BUFFER" => vk::DescriptorType::STORAGE_BUFFER,
        "UNIFORM_BUFFER_DYNAMIC" => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        "STORAGE_BUFFER_DYNAMIC" => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        "INPUT_ATTACHMENT" => vk::DescriptorType::INPUT_ATTACHMENT,
        _ => return None,
    };
    Some(ty)
}

/// Descriptor pool together with every set and layout created through it.
///
/// Sets are addressed by index: [`DescriptorPool::create_sets`] returns the
/// index of the first set it allocated, the rest follow consecutively.
pub struct DescriptorPool {
    device: ash::Device,
    raw: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    layouts: Vec<vk::DescriptorSetLayout>,
}

impl DescriptorPool {
    pub(crate) unsafe fn new(device: &ash::Device, config: &PoolConfig) -> Result<Self> {
        let sizes = config.pool_sizes();
        let info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: config.max_sets(),
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { device.create_descriptor_pool(&info, None) }
            .context("create_descriptor_pool")?;
        debug!(
            "descriptor pool: max_sets={} sizes={:?}",
            config.max_sets(),
            config.entries
        );
        Ok(Self {
            device: device.clone(),
            raw,
            sets: Vec::new(),
            layouts: Vec::new(),
        })
    }

    /// The layout is owned by the pool and destroyed with it.
    pub(crate) unsafe fn create_layout(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .context("create_descriptor_set_layout")?;
        self.layouts.push(layout);
        Ok(layout)
    }

    /// Allocates one set per layout and returns the index of the first.
    pub(crate) unsafe fn create_sets(&mut self, layouts: &[vk::DescriptorSetLayout]) -> Result<usize> {
        let info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.raw,
            descriptor_set_count: layouts.len() as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .with_context(|| format!("allocate {} descriptor set(s)", layouts.len()))?;
        let first = self.sets.len();
        self.sets.extend(sets);
        Ok(first)
    }

    pub(crate) fn set(&self, index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(index).copied()
    }

    pub(crate) unsafe fn update(&self, writes: &[vk::WriteDescriptorSet]) {
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            // Frees every set allocated from it.
            self.device.destroy_descriptor_pool(self.raw, None);
            for &layout in &self.layouts {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
        self.sets.clear();
    }
}
