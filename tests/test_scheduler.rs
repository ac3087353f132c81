mod common;
use common::*;

use ebz_hm_bridge::channels::Channels;
use ebz_hm_bridge::config::{self, Config, ConfigWrapper};
use ebz_hm_bridge::daylight::DayWindow;
use ebz_hm_bridge::hoymiles::{HmDtu, RadioAddress};
use ebz_hm_bridge::meter::MeterBus;
use ebz_hm_bridge::scheduler::{AcquisitionScheduler, ChannelData, InverterSlot};

use std::time::Duration;
use tokio::sync::broadcast;

fn test_config(margin_minutes: i64) -> ConfigWrapper {
    ConfigWrapper::from_config(Config {
        meters: config::Meters {
            uart: "unused".to_string(),
            baud: None,
            select_gpio: None,
            settle_ms: Some(1),
            read_timeout_secs: Some(1),
        },
        inverter: inverter_config(1),
        location: config::Location {
            latitude: 50.92,
            longitude: 13.33,
            utc_offset_hours: 1.0,
            // a day-length negative margin closes the window entirely,
            // making the gate deterministic for the test
            margin_minutes: Some(margin_minutes),
        },
        scheduler: Some(config::Scheduler {
            period_secs: Some(5),
        }),
        databases: Vec::new(),
        loglevel: "info".to_string(),
        datalog_file: None,
    })
}

/// Meter 1 always times out and the inverter sits outside its day
/// window; the tick must still appear, carrying meter 0 and explicit
/// absence for the other two sources.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_failures_still_emit_a_full_tick() {
    let config = test_config(-24 * 60);
    let channels = Channels::new();
    let mut ticks = channels.ticks.subscribe();

    let (uart, select) = fake_bus(telegram_bytes(SAMPLE_TELEGRAM_0), Vec::new());
    let bus = MeterBus::new(uart, select, Duration::from_millis(1));

    let radio = FakeRadio::default();
    let dtu = HmDtu::new(
        radio.clone(),
        config.inverter(),
        2,
        RadioAddress::dtu_from_seed(42),
    )
    .unwrap();
    let gate = DayWindow::new(config.location()).unwrap();

    let scheduler = AcquisitionScheduler::new(config, channels.clone(), bus, dtu, gate);

    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(scheduler.start(shutdown_tx.subscribe()));

    let tick = match ticks.recv().await.unwrap() {
        ChannelData::Tick(tick) => tick,
        other => panic!("expected a tick, got {:?}", other),
    };

    let meter0 = tick.meters[0].as_ref().expect("meter 0 answered");
    assert!((meter0.power_total().unwrap() - 3.89).abs() < 1e-9);
    assert!(tick.meters[1].is_none());
    assert_eq!(tick.inverter, InverterSlot::ExpectedOffline);

    // gated out means not a single radio request was sent
    assert_eq!(radio.transmit_count(), 0);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // consumers are released by an explicit shutdown marker
    loop {
        match ticks.recv().await.unwrap() {
            ChannelData::Shutdown => break,
            ChannelData::Tick(_) => continue,
        }
    }
}
