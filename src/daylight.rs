use crate::prelude::*;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Utc};

/// Zenith angle of the sun's upper limb at sunrise/sunset, including
/// refraction (NOAA "official" value).
const ZENITH_DEG: f64 = 90.833;

/// Sunrise and sunset for one calendar day at one site, or the polar
/// degenerate cases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SunTimes {
    RisesAndSets {
        sunrise: DateTime<FixedOffset>,
        sunset: DateTime<FixedOffset>,
    },
    PolarDay,
    PolarNight,
}

/// NOAA solar-position arithmetic. Deterministic, no side effects;
/// accuracy is a couple of minutes, which the gate's margin absorbs.
pub fn sun_times(date: NaiveDate, latitude: f64, longitude: f64, offset: FixedOffset) -> SunTimes {
    let lat = latitude.to_radians();

    // fractional year at local noon
    let day_of_year = date.ordinal() as f64;
    let gamma = 2.0 * std::f64::consts::PI / 365.0 * (day_of_year - 1.0 + 0.5);

    // equation of time (minutes) and solar declination (radians)
    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let cos_hour_angle =
        ZENITH_DEG.to_radians().cos() / (lat.cos() * decl.cos()) - lat.tan() * decl.tan();

    if cos_hour_angle > 1.0 {
        return SunTimes::PolarNight;
    }
    if cos_hour_angle < -1.0 {
        return SunTimes::PolarDay;
    }

    let hour_angle_deg = cos_hour_angle.acos().to_degrees();
    let sunrise_utc_min = 720.0 - 4.0 * (longitude + hour_angle_deg) - eqtime;
    let sunset_utc_min = 720.0 - 4.0 * (longitude - hour_angle_deg) - eqtime;

    let midnight_utc = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    let minutes = |m: f64| {
        (midnight_utc + chrono::Duration::seconds((m * 60.0).round() as i64))
            .with_timezone(&offset)
    };

    SunTimes::RisesAndSets {
        sunrise: minutes(sunrise_utc_min),
        sunset: minutes(sunset_utc_min),
    }
}

/// Decides whether the inverter is expected to be producing. The margin
/// widens the window on both sides to absorb clock skew and model error.
#[derive(Debug, Clone, Copy)]
pub struct DayWindow {
    latitude: f64,
    longitude: f64,
    offset: FixedOffset,
    margin: chrono::Duration,
}

impl DayWindow {
    pub fn new(location: &config::Location) -> Result<Self> {
        let offset_secs = (location.utc_offset_hours() * 3600.0).round() as i32;
        let offset = FixedOffset::east_opt(offset_secs)
            .ok_or_else(|| anyhow!("invalid UTC offset {}", location.utc_offset_hours()))?;

        Ok(Self {
            latitude: location.latitude(),
            longitude: location.longitude(),
            offset,
            margin: chrono::Duration::minutes(location.margin_minutes()),
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Pure check against local wall-clock time.
    pub fn is_daylight_at(&self, local: DateTime<FixedOffset>) -> bool {
        match sun_times(local.date_naive(), self.latitude, self.longitude, self.offset) {
            SunTimes::RisesAndSets { sunrise, sunset } => {
                local >= sunrise - self.margin && local <= sunset + self.margin
            }
            SunTimes::PolarDay => true,
            SunTimes::PolarNight => false,
        }
    }

    pub fn is_daylight(&self, now: DateTime<Utc>) -> bool {
        self.is_daylight_at(now.with_timezone(&self.offset))
    }
}
