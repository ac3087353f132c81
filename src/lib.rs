// Module declarations for the application's core components
pub mod channels;       // Inter-component communication channels
pub mod config;         // Configuration management
pub mod database;       // Tick persistence into SQLite
pub mod datalog_writer; // JSON-lines tick dump
pub mod daylight;       // Sunrise/sunset gate for inverter polling
pub mod hardware;       // UART, GPIO and nRF24L01 adapters
pub mod hoymiles;       // Hoymiles HM radio protocol implementation
pub mod meter;          // Shared-UART meter channel controller
pub mod options;        // Command line options parsing
pub mod prelude;        // Common imports and types
pub mod scheduler;      // Acquisition tick scheduling
pub mod sml;            // SML telegram decoder
pub mod utils;          // Field parsing helpers

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::database::Database;
use crate::datalog_writer::DatalogWriter;
use crate::daylight::DayWindow;
use crate::hoymiles::{HmDtu, RadioAddress};
use crate::meter::MeterBus;
use crate::scheduler::AcquisitionScheduler;

fn init_logger(filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Main application entry point
///
/// Opens the shared transports (fatal if unavailable), wires the
/// components together and runs until a shutdown signal arrives.
pub async fn app(shutdown: broadcast::Sender<()>) -> Result<()> {
    let options = Options::new();

    init_logger("info");
    info!(
        "starting ebz-hm-bridge {} with config file {}",
        CARGO_PKG_VERSION, options.config_file
    );

    let config = ConfigWrapper::new(options.config_file.clone()).unwrap_or_else(|err| {
        error!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });

    // update log level based on configuration
    init_logger(&config.loglevel());

    let channels = Channels::new();

    // Without the shared transports no tick can proceed, so failing to
    // open any of them aborts startup.
    info!("opening meter UART and select line...");
    let uart = hardware::UartSource::open(config.meters())?;
    let select = hardware::GpioSelectLine::new(config.meters().select_gpio())?;
    let bus = MeterBus::new(uart, select, config.meters().settle());

    info!("initializing radio...");
    let serial = hoymiles::InverterSerial::new(config.inverter().serial())?;
    let inverter_addr = serial.radio_address()?;
    let dtu_addr = RadioAddress::dtu_from_seed(hardware::dtu_seed());
    let channel_count = config.inverter_channel_count()?;
    let radio = hardware::Nrf24Radio::new(config.inverter(), inverter_addr, dtu_addr)?;
    let dtu = HmDtu::new(radio, config.inverter(), channel_count, dtu_addr)?;
    info!(
        "polling inverter {} ({} channel(s)) as DTU {}",
        inverter_addr, channel_count, dtu_addr
    );

    let gate = DayWindow::new(config.location())?;

    let mut handles = Vec::new();

    for db_config in config.enabled_databases() {
        let database = Database::new(db_config, channels.clone(), channel_count);
        handles.push(tokio::spawn(async move {
            if let Err(e) = database.start().await {
                error!("database task failed: {}", e);
            }
        }));
    }

    if let Some(path) = config.datalog_file() {
        let writer = DatalogWriter::new(path, channels.clone());
        handles.push(tokio::spawn(async move {
            if let Err(e) = writer.start().await {
                error!("datalog task failed: {}", e);
            }
        }));
    }

    info!("starting scheduler...");
    // subscribed before the scheduler can possibly fail and signal
    let mut shutdown_rx = shutdown.subscribe();
    let scheduler = AcquisitionScheduler::new(config.clone(), channels.clone(), bus, dtu, gate);
    let scheduler_shutdown = shutdown.subscribe();
    let shutdown_on_failure = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.start(scheduler_shutdown).await {
            error!("scheduler failed: {:?}", e);
            let _ = shutdown_on_failure.send(());
        }
    });

    if let Some(secs) = options.runtime {
        let shutdown_on_timer = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("runtime limit of {}s reached", secs);
            let _ = shutdown_on_timer.send(());
        });
    }

    // Wait for shutdown signal
    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received, stopping components...");

    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Error waiting for task: {}", e);
        }
    }

    info!("Application shutdown complete");
    Ok(())
}
