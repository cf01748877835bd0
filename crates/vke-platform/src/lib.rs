// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Window and event pumping for the renderer.
//!
//! The event loop is pumped by the caller instead of owning the main loop,
//! so the frame loop can block on window events while the window is
//! minimized.

pub use winit;

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{debug, info};
use vke_render::{RenderSize, SurfaceProvider};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan-Engine".to_owned(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Default)]
struct WindowState {
    config: WindowConfig,
    /// Newly created window, taken by [`Platform::new`].
    window: Option<Window>,
    window_id: Option<WindowId>,
    create_error: Option<OsError>,
    size: RenderSize,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    fn new(config: WindowConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window_id.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(LogicalSize::new(self.config.width, self.config.height));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let size = window.inner_size();
                self.size = RenderSize::new(size.width, size.height);
                info!("window created: {}", self.size);
                self.window_id = Some(window.id());
                self.window = Some(window);
            }
            Err(e) => {
                self.create_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window_id != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                self.size = RenderSize::new(new_size.width, new_size.height);
                self.resized = true;
                debug!("Resized → {}", self.size);
            }
            _ => {}
        }
    }
}

/// Owns the event loop and the single application window.
pub struct Platform {
    window: Window,
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl Platform {
    /// Creates the event loop and pumps it until the window exists.
    pub fn new(config: WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("create event loop")?;
        let mut state = WindowState::new(config);

        // The window is created on the first resume.
        let window = loop {
            let status = event_loop.pump_app_events(Some(Duration::ZERO), &mut state);
            if let Some(e) = state.create_error.take() {
                bail!("create window: {e}");
            }
            if let Some(window) = state.window.take() {
                break window;
            }
            if let PumpStatus::Exit(code) = status {
                bail!("event loop exited with code {code} before the window was created");
            }
        };

        Ok(Self {
            window,
            event_loop,
            state,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Handles pending events without blocking.
    pub fn pump(&mut self) {
        self.pump_with_timeout(Some(Duration::ZERO));
    }

    /// Returns whether the window was resized since the last call.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn pump_with_timeout(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            debug!("event loop exited with code {code}");
            self.state.close_requested = true;
        }
    }
}

impl SurfaceProvider for Platform {
    fn framebuffer_size(&self) -> RenderSize {
        let size = self.window().inner_size();
        RenderSize::new(size.width, size.height)
    }

    fn wait_events(&mut self) {
        self.pump_with_timeout(None);
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }
}
