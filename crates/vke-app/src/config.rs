// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use vke_platform::WindowConfig;
use vke_render_vk::{VkConfig, VsyncMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub log_level: String,
    pub window: WindowCfg,
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub vsync_mode: VsyncModeCfg,
    pub validation: bool,
    pub shader_dir: PathBuf,
    pub descriptor_pools: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            window: WindowCfg::default(),
            render: RenderCfg::default(),
        }
    }
}

impl Default for WindowCfg {
    fn default() -> Self {
        let defaults = WindowConfig::default();
        Self {
            title: defaults.title,
            width: defaults.width,
            height: defaults.height,
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        let defaults = VkConfig::default();
        Self {
            clear_color: defaults.clear_color,
            vsync: defaults.vsync,
            vsync_mode: VsyncModeCfg::Mailbox,
            validation: defaults.validation,
            shader_dir: defaults.shader_dir,
            descriptor_pools: defaults.descriptor_pools,
        }
    }
}

impl AppCfg {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Missing file means defaults; anything unreadable or malformed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Logging is not set up yet; reported after init.
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }

    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
        }
    }

    pub fn vk_config(&self) -> VkConfig {
        VkConfig {
            app_name: self.window.title.clone(),
            validation: self.render.validation,
            vsync: self.render.vsync,
            vsync_mode: match self.render.vsync_mode {
                VsyncModeCfg::Fifo => VsyncMode::Fifo,
                VsyncModeCfg::Mailbox => VsyncMode::Mailbox,
            },
            clear_color: self.render.clear_color,
            shader_dir: self.render.shader_dir.clone(),
            descriptor_pools: self.render.descriptor_pools.clone(),
        }
    }

    pub fn log_summary(&self) {
        info!(
            "config: window {}x{} \"{}\", vsync={} mode={:?} validation={}",
            self.window.width,
            self.window.height,
            self.window.title,
            self.render.vsync,
            self.render.vsync_mode,
            self.render.validation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppCfg::parse("", Path::new("vke.toml")).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.window.width, 800);
        assert_eq!(cfg.window.height, 600);
        assert_eq!(cfg.window.title, "Vulkan-Engine");
        assert!(cfg.render.vsync);
        assert_eq!(cfg.render.vsync_mode, VsyncModeCfg::Mailbox);
        assert_eq!(cfg.render.validation, cfg!(debug_assertions));
        assert_eq!(cfg.render.shader_dir, PathBuf::from("resources/shaders/spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = r#"
log_level = "debug"

[window]
width = 1280

[render]
vsync_mode = "fifo"
clear_color = [0.1, 0.2, 0.3, 1.0]
validation = false
"#;
        let cfg = AppCfg::parse(text, Path::new("vke.toml")).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.window.height, 600);
        assert_eq!(cfg.render.vsync_mode, VsyncModeCfg::Fifo);

        let vk = cfg.vk_config();
        assert_eq!(vk.vsync_mode, VsyncMode::Fifo);
        assert_eq!(vk.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert!(!vk.validation);
        assert_eq!(vk.app_name, "Vulkan-Engine");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let err = AppCfg::parse("[render]\nvsync = \"sometimes\"", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("parse bad.toml"));
    }

    #[test]
    fn unknown_vsync_mode_is_rejected() {
        assert!(AppCfg::parse("[render]\nvsync_mode = \"adaptive\"", Path::new("vke.toml")).is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("vke-app-config-does-not-exist.toml");
        let cfg = AppCfg::load(&path).unwrap();
        assert_eq!(cfg.window.title, "Vulkan-Engine");
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../vke.toml");
        let cfg = AppCfg::load(&path).unwrap();
        assert_eq!(cfg.window.title, "Vulkan-Engine");
    }
}
