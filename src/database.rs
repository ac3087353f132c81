use crate::prelude::*;

use crate::scheduler::{AcquisitionTick, ChannelData, InverterSlot};
use crate::sml::MeterReading;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::sync::RwLock;

const METER_COLUMNS: [&str; 8] = ["+A", "+A T1", "+A T2", "-A", "P", "P L1", "P L2", "P L3"];
const INVERTER_CHANNEL_COLUMNS: [&str; 5] = ["DC V", "DC I", "DC P", "DC E day", "DC E total"];
const INVERTER_COLUMNS: [&str; 7] = ["AC V", "AC I", "AC F", "AC P", "AC Q", "AC PF", "T"];

const INSERT_RETRIES: u32 = 3;

/// Stores one row per tick and meter plus one per inverter reading.
/// Consumes the tick channel; a failing insert is retried with backoff
/// and then dropped, never blocking acquisition.
#[derive(Clone)]
pub struct Database {
    config: config::Database,
    channels: Channels,
    channel_count: usize,
    pool: Arc<RwLock<Option<SqlitePool>>>,
}

impl Database {
    pub fn new(config: config::Database, channels: Channels, channel_count: usize) -> Self {
        Self {
            config,
            channels,
            channel_count,
            pool: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        info!("initializing database {}", self.config.url());

        self.connect().await?;
        self.create_tables().await?;
        self.inserter().await?;

        info!("database loop exiting");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.ticks.send(ChannelData::Shutdown);
    }

    async fn connect(&self) -> Result<()> {
        let url = self.config.url();
        if !url.starts_with("sqlite:") {
            bail!("unsupported database url {}, only sqlite is supported", url);
        }

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        *self
            .pool
            .write()
            .map_err(|_| anyhow!("database pool lock poisoned"))? = Some(pool);

        Ok(())
    }

    async fn connection(&self) -> Result<SqlitePool> {
        match &*self
            .pool
            .read()
            .map_err(|_| anyhow!("database pool lock poisoned"))?
        {
            Some(pool) => Ok(pool.clone()),
            None => Err(anyhow!("database not connected")),
        }
    }

    fn inverter_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        for channel in 0..self.channel_count {
            for reading in INVERTER_CHANNEL_COLUMNS {
                columns.push(format!("CH{} {}", channel, reading));
            }
        }
        columns.extend(INVERTER_COLUMNS.iter().map(|c| c.to_string()));
        columns
    }

    async fn create_tables(&self) -> Result<()> {
        let pool = self.connection().await?;

        let meter_columns = METER_COLUMNS
            .iter()
            .map(|c| format!("\"{}\" REAL", c))
            .collect::<Vec<_>>()
            .join(", ");

        for table in ["ElectricityMeter0", "ElectricityMeter1"] {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (\"time\" INTEGER NOT NULL PRIMARY KEY, {}) STRICT",
                table, meter_columns
            );
            sqlx::query(&sql).execute(&pool).await?;
        }

        let inverter_columns = self
            .inverter_columns()
            .iter()
            .map(|c| format!("\"{}\" REAL", c))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS Inverter (\"time\" INTEGER NOT NULL PRIMARY KEY, {}) STRICT",
            inverter_columns
        );
        sqlx::query(&sql).execute(&pool).await?;

        Ok(())
    }

    async fn inserter(&self) -> Result<()> {
        let mut receiver = self.channels.ticks.subscribe();

        loop {
            match receiver.recv().await? {
                ChannelData::Shutdown => break,
                ChannelData::Tick(tick) => self.store_tick(&tick).await,
            }
        }

        Ok(())
    }

    async fn store_tick(&self, tick: &AcquisitionTick) {
        let mut backoff = 1;
        for attempt in 1..=INSERT_RETRIES {
            match self.insert_tick(tick).await {
                Ok(_) => return,
                Err(e) => {
                    error!(
                        "INSERT failed ({}/{}): {:?} - retrying in {}s",
                        attempt, INSERT_RETRIES, e, backoff
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    backoff *= 2;
                }
            }
        }
        error!("dropping tick after {} failed inserts", INSERT_RETRIES);
    }

    async fn insert_tick(&self, tick: &AcquisitionTick) -> Result<()> {
        let time = tick.timestamp.timestamp();

        for (channel, reading) in tick.meters.iter().enumerate() {
            if let Some(reading) = reading {
                self.insert_meter(channel, time, reading).await?;
            }
        }

        if let InverterSlot::Reading(reading) = &tick.inverter {
            self.insert_inverter(time, reading).await?;
        }

        Ok(())
    }

    async fn insert_meter(&self, channel: usize, time: i64, reading: &MeterReading) -> Result<()> {
        let pool = self.connection().await?;

        let columns = METER_COLUMNS
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO ElectricityMeter{} (\"time\", {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            channel, columns
        );

        sqlx::query(&sql)
            .bind(time)
            .bind(reading.energy_import_total())
            .bind(reading.energy_import_t1())
            .bind(reading.energy_import_t2())
            .bind(reading.energy_export_total())
            .bind(reading.power_total())
            .bind(reading.power_phase(1))
            .bind(reading.power_phase(2))
            .bind(reading.power_phase(3))
            .execute(&pool)
            .await?;

        Ok(())
    }

    async fn insert_inverter(
        &self,
        time: i64,
        reading: &crate::hoymiles::InverterReading,
    ) -> Result<()> {
        let pool = self.connection().await?;

        let columns = self
            .inverter_columns()
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = std::iter::repeat("?")
            .take(self.channel_count * INVERTER_CHANNEL_COLUMNS.len() + INVERTER_COLUMNS.len() + 1)
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO Inverter (\"time\", {}) VALUES ({})",
            columns, placeholders
        );

        let mut query = sqlx::query(&sql).bind(time);
        for channel in 0..self.channel_count {
            let dc = reading.channels.get(channel);
            query = query
                .bind(dc.map(|c| c.voltage))
                .bind(dc.map(|c| c.current))
                .bind(dc.map(|c| c.power))
                .bind(dc.map(|c| c.energy_day))
                .bind(dc.map(|c| c.energy_total));
        }
        query = query
            .bind(reading.ac_voltage)
            .bind(reading.ac_current)
            .bind(reading.frequency)
            .bind(reading.ac_power)
            .bind(reading.reactive_power)
            .bind(reading.power_factor)
            .bind(reading.temperature);

        query.execute(&pool).await?;

        Ok(())
    }
}
