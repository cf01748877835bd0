// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};
use vke_core::init_tracing;
use vke_platform::Platform;
use vke_render::{FrameLoop, FrameStatus, SurfaceProvider};
use vke_render_vk::VkBackend;

use crate::config::AppCfg;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; defaults are used when it does not exist
    #[arg(long, default_value = "vke.toml")]
    config: PathBuf,
    /// Force the Vulkan validation layer on
    #[arg(long, conflicts_with = "no_validation")]
    validation: bool,
    /// Force the Vulkan validation layer off
    #[arg(long)]
    no_validation: bool,
    /// Exit after this many presented frames (0 = run until closed)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match AppCfg::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing("info");
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&cfg.log_level);
    if !args.config.exists() {
        warn!("{} not found; using defaults", args.config.display());
    }

    match run(&args, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, mut cfg: AppCfg) -> Result<()> {
    if args.validation {
        cfg.render.validation = true;
    } else if args.no_validation {
        cfg.render.validation = false;
    }
    cfg.log_summary();

    // Declared first so it outlives the surface owned by the frame loop.
    let mut platform = Platform::new(cfg.window_config())?;
    let backend = VkBackend::new(
        platform.window(),
        platform.window(),
        platform.framebuffer_size(),
        cfg.vk_config(),
    )
    .context("vulkan init")?;
    info!(
        "queue families {:?}, optional extensions {:?}",
        backend.queue_families(),
        backend.optional_extensions()
    );
    let mut frames = FrameLoop::new(backend)?;

    let mut presented: u64 = 0;
    let mut fps_frames: u32 = 0;
    let mut last_fps = Instant::now();

    loop {
        platform.pump();
        if platform.close_requested() {
            break;
        }
        if platform.take_resized() {
            frames.notify_resized();
        }

        match frames.render_frame(&mut platform)? {
            FrameStatus::Presented { recreated } => {
                presented += 1;
                fps_frames += 1;
                if recreated {
                    info!("swapchain now {}", frames.backend().extent());
                }
            }
            FrameStatus::Skipped => {}
        }

        if args.frames != 0 && presented >= args.frames {
            info!("presented {presented} frames; exiting");
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_fps).as_secs_f32() >= 1.0 {
            info!("fps ~ {fps_frames}");
            fps_frames = 0;
            last_fps = now;
        }
    }

    Ok(())
}
