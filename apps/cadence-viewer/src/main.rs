//! Cadence demo viewer.
//!
//! Opens a window and drives the frame engine over Vulkan, clearing and
//! presenting every frame. Settings can be changed live to exercise the
//! rebuild path.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cadence-viewer
//! ```
//!
//! Configuration is read from `cadence.toml` in the working directory when
//! present.
//!
//! ## Keys
//!
//! - `M`: toggle 4x MSAA
//! - `1`-`4`: shadow quality low, medium, high, ultra
//! - `V`: toggle vsync
//! - `Esc`: quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use std::fs;

use cadence_core::{EngineConfig, Format};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::Viewer;

const CONFIG_PATH: &str = "cadence.toml";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config();
    info!("Cadence viewer starting...");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut viewer = Viewer::new(config);
    event_loop.run_app(&mut viewer)?;
    Ok(())
}

/// Read `cadence.toml`, falling back to defaults when it is missing or invalid.
fn load_config() -> EngineConfig {
    // Most Vulkan surfaces list BGRA first
    let fallback = EngineConfig::default().with_back_buffer_format(Format::Bgra8Unorm);

    match fs::read_to_string(CONFIG_PATH) {
        Ok(source) => match EngineConfig::from_toml_str(&source) {
            Ok(config) => {
                info!("Loaded {}", CONFIG_PATH);
                config
            }
            Err(e) => {
                warn!("Ignoring {}: {}", CONFIG_PATH, e);
                fallback
            }
        },
        Err(_) => fallback,
    }
}
