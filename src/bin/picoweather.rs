// bin/picoweather.rs

#![warn(clippy::large_futures)]

use std::sync::Arc;

use log::*;
use picoweather::*;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Hello.");
    info!("Starting up.");

    // settings.json path may be passed as the first argument; anything
    // missing falls back to compiled-in defaults
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            match MyConfig::from_json(&raw) {
                Ok(c) => c,
                Err(e) => {
                    error!("Could not parse {path}, using defaults: {e:#}");
                    MyConfig::default()
                }
            }
        }
        None => MyConfig::default(),
    };
    info!("My config:\n{config:#?}");

    let state = Arc::new(MyState::new(config, Box::new(HostPowerSwitch::new())));

    let shtc3 = SimClimate::new();
    let apc1 = SimParticulate::new();
    let battery = SimBattery::new();
    let renderer = LogRenderer::new();
    let broker = LogBroker::new();
    let time_source = SystemTimeSource;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(async move {
            info!("Entering main loop...");
            tokio::select! {
                _ = Box::pin(supervise("shtc3", read_climate_task(state.clone(), shtc3))) => { error!("SHTC3 task ended."); }
                _ = Box::pin(supervise("apc1", run_particulate(state.clone(), apc1))) => { error!("APC1 task ended."); }
                _ = Box::pin(supervise("battery", read_battery_task(state.clone(), battery))) => { error!("Battery task ended."); }
                _ = Box::pin(supervise("display", display_task(state.clone(), renderer))) => { error!("Display task ended."); }
                _ = Box::pin(supervise("power", power_task(state.clone()))) => { error!("Power task ended."); }
                _ = Box::pin(supervise("webserver", run_webserver(state.clone()))) => { error!("Web server ended."); }
                _ = Box::pin(supervise("publisher", run_publisher(state.clone(), broker))) => { error!("Publisher task ended."); }
                _ = Box::pin(supervise("clock", clock_sync_task(state.clone(), time_source))) => { error!("Clock sync task ended."); }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, stopping.");
                    state.stop.stop();
                }
            };
        }));

    info!("main() finished.");
    Ok(())
}

// EOF
