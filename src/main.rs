mod app_runtime;
mod audio_device;
mod backend;
mod config;
mod console;
mod download_tracker;
mod error;
mod event_sync;
mod media_session;
mod media_transport;
mod model;
mod observable;
mod player_state;
mod playlist_navigator;
mod protocol;
mod resample;

use std::path::PathBuf;

use log::info;

use app_runtime::PlayerRuntime;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_file = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()?,
    };
    let config = config::load_or_create(&config_file)?;

    let mut clog = colog::default_builder();
    clog.filter(None, config.logging.level_filter());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    info!("Using config {}", config_file.display());
    info!("Backend at {}", config.backend.base_url);

    let mut runtime = PlayerRuntime::build(config)?;
    runtime.run();

    info!("Application exiting");
    Ok(())
}
