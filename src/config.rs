use crate::prelude::*;

use serde::Deserialize;
use serde_with::serde_as;

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub meters: Meters,
    pub inverter: Inverter,
    pub location: Location,

    pub scheduler: Option<Scheduler>,

    #[serde(default = "Vec::new")]
    pub databases: Vec<Database>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to dump every acquisition tick as one JSON line
    pub datalog_file: Option<String>,
}

// Meters {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Meters {
    pub uart: String,

    pub baud: Option<u32>,
    pub select_gpio: Option<u8>,
    pub settle_ms: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

impl Meters {
    pub fn uart(&self) -> &str {
        &self.uart
    }

    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(9600)
    }

    pub fn select_gpio(&self) -> u8 {
        self.select_gpio.unwrap_or(17)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(100))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.unwrap_or(5))
    }
} // }}}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    pub serial: String,

    /// Override for the channel count normally derived from the serial number
    pub channels: Option<usize>,

    pub spi_bus: Option<u8>,
    pub ce_gpio: Option<u8>,
    pub retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub listen_window_ms: Option<u64>,
}

impl Inverter {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn spi_bus(&self) -> u8 {
        self.spi_bus.unwrap_or(0)
    }

    pub fn ce_gpio(&self) -> u8 {
        self.ce_gpio.unwrap_or(24)
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(5)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs.unwrap_or(3))
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms.unwrap_or(500))
    }
} // }}}

// Location {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub utc_offset_hours: f64,

    pub margin_minutes: Option<i64>,
}

impl Location {
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn utc_offset_hours(&self) -> f64 {
        self.utc_offset_hours
    }

    pub fn margin_minutes(&self) -> i64 {
        self.margin_minutes.unwrap_or(15)
    }
} // }}}

// Scheduler {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Scheduler {
    pub period_secs: Option<u64>,
}

impl Scheduler {
    pub fn period(&self) -> Duration {
        // the meter read timeouts alone can take seconds, shorter periods
        // would never be met
        Duration::from_secs(self.period_secs.unwrap_or(30).max(5))
    }
} // }}}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub url: String,
}

impl Database {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("cannot read config file {}", file))?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.location.latitude) {
            bail!("location.latitude {} out of range", self.location.latitude);
        }
        if !(-180.0..=180.0).contains(&self.location.longitude) {
            bail!("location.longitude {} out of range", self.location.longitude);
        }
        if self.location.utc_offset_hours.abs() > 14.0 {
            bail!(
                "location.utc_offset_hours {} out of range",
                self.location.utc_offset_hours
            );
        }

        // fails early for unsupported serial numbers
        let serial = crate::hoymiles::InverterSerial::new(self.inverter.serial())?;
        let channels = match self.inverter.channels {
            Some(channels) => channels,
            None => serial.channel_count()?,
        };
        if channels != 1 && channels != 2 {
            bail!("inverters with {} channels are not supported", channels);
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub struct ConfigWrapper(Arc<Config>);

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self(Arc::new(Config::new(file)?)))
    }

    pub fn from_config(config: Config) -> Self {
        Self(Arc::new(config))
    }

    pub fn loglevel(&self) -> String {
        self.0.loglevel.clone()
    }

    pub fn meters(&self) -> &Meters {
        &self.0.meters
    }

    pub fn inverter(&self) -> &Inverter {
        &self.0.inverter
    }

    pub fn inverter_channel_count(&self) -> Result<usize> {
        match self.0.inverter.channels {
            Some(channels) => Ok(channels),
            None => crate::hoymiles::InverterSerial::new(self.0.inverter.serial())?.channel_count(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.0.location
    }

    pub fn period(&self) -> Duration {
        match &self.0.scheduler {
            Some(scheduler) => scheduler.period(),
            None => Duration::from_secs(30),
        }
    }

    pub fn enabled_databases(&self) -> Vec<Database> {
        self.0
            .databases
            .iter()
            .filter(|db| db.enabled())
            .cloned()
            .collect()
    }

    pub fn datalog_file(&self) -> Option<String> {
        self.0.datalog_file.clone()
    }
}
