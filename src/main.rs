use std::time::Duration;
use tokio::sync::mpsc;
use wand_controller::domain::settings::SettingsService;
use wand_controller::domain::telemetry::EventSink;
use wand_controller::infrastructure::bluetooth::connection::SupervisorConfig;
use wand_controller::infrastructure::bluetooth::sniffer::SnifferConfig;
use wand_controller::infrastructure::bluetooth::{self, ProtocolSession, SnifferSession};
use wand_controller::infrastructure::logging;
use wand_controller::presentation::console::Console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting Wand Controller");

    let supervisor_config = SupervisorConfig::from_settings(&settings.wand)?;
    let sniffer_config = SnifferConfig::from_settings(
        &settings.sniffer,
        &settings.wand.name_prefix,
        Duration::from_millis(settings.wand.error_revert_ms),
        Duration::from_millis(settings.wand.connect_timeout_ms),
    )?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sink = EventSink::new(events_tx, settings.telemetry_capacity);
    let transport = bluetooth::platform_transport(&settings.wand);

    let (session, session_task) = ProtocolSession::new(
        transport.clone(),
        supervisor_config,
        settings.opcodes,
        sink.clone(),
    )
    .spawn();
    let (sniffer, sniffer_task) = SnifferSession::new(transport, sniffer_config, sink.clone()).spawn();

    Console::new(session, sniffer, sink, settings_service)
        .run(events_rx)
        .await?;

    // Handles are gone; both sessions tear down and exit
    let _ = tokio::join!(session_task, sniffer_task);
    tracing::info!("Wand Controller stopped");
    Ok(())
}
