use color_eyre::{eyre::eyre, Result};
use open_station::config::Config;
use open_station::station::Station;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::load();
    info!(
        "Starting Open Station for team {} (usb: {})",
        config.team_number, config.use_usb
    );

    if let Some(command) = &config.dashboard_command {
        info!("Launching dashboard: {command}");
        if let Err(e) = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
        {
            warn!("Dashboard launch failed: {e}");
        }
    }

    let (station, mut events) = Station::spawn(config)
        .await
        .map_err(|e| eyre!("Failed to start station engine: {e}"))?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupt received, shutting down");
                break;
            }
            result = events.state.changed() => {
                if result.is_err() {
                    break;
                }
                let state = events.state.borrow_and_update().clone();
                debug!(
                    "connected={} enabled={} mode={} voltage={:.2}",
                    state.connected, state.enabled, state.mode, state.voltage
                );
            }
            Ok(line) = events.stdout.recv() => {
                info!(target: "robot", "{}", line.trim_end());
            }
            Ok(message) = events.messages.recv() => {
                debug!("Controller message: {message:?}");
            }
        }
    }

    station.shutdown().await;
    info!("Open Station stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}
