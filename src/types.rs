use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::SystemTime};
use uuid::Uuid;

use crate::error::{CradleError, Result};

/// Connection lifecycle of the single peripheral link
///
/// Transitions are driven by radio callbacks only; `connect` and `disconnect`
/// merely request them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Initial state, or a fresh link that has not come up yet
    #[default]
    Unknown,
    /// Link established, service discovery still running
    Connected,
    /// Services discovered, characteristics usable
    Ready,
    /// Link closed or lost
    Disconnected,
}

impl ConnectionState {
    /// Whether reads and writes may be submitted
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Connected => write!(f, "Connected"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Scanner duty-cycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan has been requested yet
    #[default]
    Unknown,
    /// Actively scanning
    Start,
    /// Resting between two scan windows
    Pause,
    /// Fully stopped by the caller
    Stop,
    /// Radio reported a scan failure
    Error(i32),
}

impl ScanState {
    /// Whether the duty cycle is running (scanning or resting)
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Start | Self::Pause)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Start => write!(f, "START"),
            Self::Pause => write!(f, "PAUSE"),
            Self::Stop => write!(f, "STOP"),
            Self::Error(code) => write!(f, "ERROR {code}"),
        }
    }
}

/// On/off byte used by the switch-like characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Switch {
    /// `0x00`
    Off = 0x00,
    /// `0x01`
    On = 0x01,
}

impl Switch {
    /// Whether the switch is on
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl From<bool> for Switch {
    fn from(value: bool) -> Self {
        if value {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl TryFrom<u8> for Switch {
    type Error = CradleError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            other => Err(CradleError::ParseError(format!(
                "Invalid switch byte: {other:02X}"
            ))),
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::On => write!(f, "ON"),
        }
    }
}

/// LED on/off status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedSwitch {
    /// Whether the LED is lit
    pub on: bool,
}

/// PIR motion sensor status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PirSwitch {
    /// Whether motion sensing is enabled
    pub on: bool,
    /// Brightness applied when motion triggers the light
    pub min_brightness: u8,
}

/// RGB color of the LED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedColor {
    /// Red channel
    pub red: u8,
    /// Green channel
    pub green: u8,
    /// Blue channel
    pub blue: u8,
}

impl LedColor {
    /// Create a new color
    #[must_use]
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Pack as `0xRRGGBB`
    #[must_use]
    pub const fn to_rgb(self) -> u32 {
        ((self.red as u32) << 16) | ((self.green as u32) << 8) | self.blue as u32
    }

    /// Unpack from `0xRRGGBB`; the top byte (alpha) is ignored
    #[must_use]
    pub const fn from_rgb(rgb: u32) -> Self {
        Self {
            red: ((rgb >> 16) & 0xFF) as u8,
            green: ((rgb >> 8) & 0xFF) as u8,
            blue: (rgb & 0xFF) as u8,
        }
    }
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.red, self.green, self.blue)
    }
}

/// LED brightness, 0-255
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedBrightness(pub u8);

impl LedBrightness {
    /// Scale a 0-100 percentage to the device range
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if `percent` is above 100.
    pub fn from_percent(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(CradleError::InvalidParameters(format!(
                "Brightness {percent}% is out of range (0-100)"
            )));
        }
        let scaled = u16::from(percent) * 255 / 100;
        Ok(Self(u8::try_from(scaled).unwrap_or(u8::MAX)))
    }
}

/// Wall-clock time kept by the device for its timer feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrentTime {
    /// Hour of the day (0-23)
    pub hour: u8,
    /// Minute (0-59)
    pub minute: u8,
    /// Second (0-59)
    pub second: u8,
    /// Day of the month (1-31)
    pub day: u8,
    /// Month of the year (1-12)
    pub month: u8,
    /// Years since 2000
    pub year_offset: u8,
}

impl CurrentTime {
    /// Create a validated time value
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if any field is out of range.
    pub fn new(
        hour: u8,
        minute: u8,
        second: u8,
        day: u8,
        month: u8,
        year_offset: u8,
    ) -> Result<Self> {
        let time = Self {
            hour,
            minute,
            second,
            day,
            month,
            year_offset,
        };
        time.validate()?;
        Ok(time)
    }

    /// Build from any chrono date-time
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if the year is outside 2000-2255.
    pub fn from_datetime<T: Datelike + Timelike>(datetime: &T) -> Result<Self> {
        let year_offset = datetime
            .year()
            .checked_sub(2000)
            .and_then(|offset| u8::try_from(offset).ok())
            .ok_or_else(|| {
                CradleError::InvalidParameters(format!(
                    "Year {} is out of range (2000-2255)",
                    datetime.year()
                ))
            })?;

        // chrono guarantees these ranges; the leap second shows up as second 60
        Self::new(
            datetime.hour() as u8,
            datetime.minute() as u8,
            datetime.second().min(59) as u8,
            datetime.day() as u8,
            datetime.month() as u8,
            year_offset,
        )
    }

    /// Current local time
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if the local year is outside 2000-2255.
    pub fn now_local() -> Result<Self> {
        Self::from_datetime(&chrono::Local::now())
    }

    /// Full calendar year
    #[must_use]
    pub fn year(&self) -> u16 {
        2000 + u16::from(self.year_offset)
    }

    /// Check every field against its calendar range
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        check_range("hour", self.hour, 0, 23)?;
        check_range("minute", self.minute, 0, 59)?;
        check_range("second", self.second, 0, 59)?;
        check_range("day", self.day, 1, 31)?;
        check_range("month", self.month, 1, 12)
    }
}

impl fmt::Display for CurrentTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second
        )
    }
}

/// Automatic on/off timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerSchedule {
    /// Whether the timer is armed
    pub enabled: bool,
    /// Hour the LED turns on (0-23)
    pub on_hour: u8,
    /// Minute the LED turns on (0-59)
    pub on_minute: u8,
    /// Hour the LED turns off (0-23)
    pub off_hour: u8,
    /// Minute the LED turns off (0-59)
    pub off_minute: u8,
}

impl TimerSchedule {
    /// Create a validated schedule
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if any field is out of range.
    pub fn new(enabled: bool, on_hour: u8, on_minute: u8, off_hour: u8, off_minute: u8) -> Result<Self> {
        let schedule = Self {
            enabled,
            on_hour,
            on_minute,
            off_hour,
            off_minute,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    /// Check every field against its clock range
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        check_range("on hour", self.on_hour, 0, 23)?;
        check_range("on minute", self.on_minute, 0, 59)?;
        check_range("off hour", self.off_hour, 0, 23)?;
        check_range("off minute", self.off_minute, 0, 59)
    }
}

fn check_range(field: &str, value: u8, min: u8, max: u8) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CradleError::InvalidParameters(format!(
            "{field} {value} is out of range ({min}-{max})"
        )))
    }
}

/// Advertisement payload as reported by the radio
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    /// Advertised local name
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Manufacturer specific data keyed by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised TX power
    pub tx_power_level: Option<i16>,
}

/// A peripheral reported by the scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    /// Hardware address, used as dedup key and connection target
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Raw advertisement content
    pub advertisement: AdvertisementData,
}

impl DiscoveredPeripheral {
    /// Create a peripheral record with an empty advertisement
    #[must_use]
    pub fn new(address: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            rssi,
            advertisement: AdvertisementData::default(),
        }
    }
}

/// Latest decoded values, one slot per characteristic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// LED on/off
    pub led_switch: Option<LedSwitch>,
    /// PIR sensor
    pub pir_switch: Option<PirSwitch>,
    /// LED color
    pub led_color: Option<LedColor>,
    /// LED brightness
    pub led_brightness: Option<LedBrightness>,
    /// Device clock
    pub current_time: Option<CurrentTime>,
    /// On/off timer
    pub timer_schedule: Option<TimerSchedule>,
    /// When any slot was last updated
    pub updated_at: Option<SystemTime>,
}

/// Peripheral client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for the link to come up after `connect`
    pub connect_timeout_ms: u64,
    /// Deadline for service discovery once connected
    pub discovery_timeout_ms: u64,
    /// Deadline for a single read or write completion
    pub operation_timeout_ms: u64,
    /// Deadline for the radio to confirm a requested disconnect
    pub disconnect_timeout_ms: u64,
    /// Pause between reads of the hydration sequence
    pub hydration_interval_ms: u64,
    /// Run the hydration sequence automatically on `Ready`
    pub hydrate_on_ready: bool,
    /// Buffer size of each device-state stream
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            disconnect_timeout_ms: 3_000,
            hydration_interval_ms: 500,
            hydrate_on_ready: true,
            event_capacity: 32,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Default active scan window in seconds
    pub scan_duration_secs: u64,
    /// Default rest between windows in seconds
    pub rest_interval_secs: u64,
    /// Buffer size of the discovered-peripheral stream
    pub discovery_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration_secs: 20,
            rest_interval_secs: 5,
            discovery_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_switch_from_u8() {
        assert_eq!(Switch::try_from(0x00).unwrap(), Switch::Off);
        assert_eq!(Switch::try_from(0x01).unwrap(), Switch::On);
        assert!(Switch::try_from(0x02).is_err());
        assert!(Switch::from(true).is_on());
    }

    #[test]
    fn test_color_packing() {
        let color = LedColor::new(0x12, 0x34, 0x56);
        assert_eq!(color.to_rgb(), 0x0012_3456);
        assert_eq!(LedColor::from_rgb(0xFF12_3456), color);
        assert_eq!(color.to_string(), "#123456");
    }

    #[test]
    fn test_brightness_percent_scaling() {
        assert_eq!(LedBrightness::from_percent(0).unwrap(), LedBrightness(0));
        assert_eq!(LedBrightness::from_percent(50).unwrap(), LedBrightness(127));
        assert_eq!(LedBrightness::from_percent(100).unwrap(), LedBrightness(255));
        assert!(LedBrightness::from_percent(101).is_err());
    }

    #[test]
    fn test_current_time_bounds() {
        assert!(CurrentTime::new(23, 59, 59, 31, 12, 255).is_ok());
        assert!(CurrentTime::new(0, 0, 0, 1, 1, 0).is_ok());
        assert!(CurrentTime::new(24, 0, 0, 1, 1, 0).is_err());
        assert!(CurrentTime::new(0, 60, 0, 1, 1, 0).is_err());
        assert!(CurrentTime::new(0, 0, 0, 0, 1, 0).is_err());
        assert!(CurrentTime::new(0, 0, 0, 1, 13, 0).is_err());
    }

    #[test]
    fn test_current_time_from_datetime() {
        let datetime = Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(17, 45, 12)
                .unwrap(),
        );
        let time = CurrentTime::from_datetime(&datetime).unwrap();
        assert_eq!(time, CurrentTime::new(17, 45, 12, 9, 3, 24).unwrap());
        assert_eq!(time.year(), 2024);
        assert_eq!(time.to_string(), "2024-03-09 17:45:12");

        let too_early = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(CurrentTime::from_datetime(&too_early).is_err());
    }

    #[test]
    fn test_timer_schedule_bounds() {
        assert!(TimerSchedule::new(true, 7, 30, 22, 0).is_ok());
        assert!(TimerSchedule::new(true, 24, 0, 22, 0).is_err());
        assert!(TimerSchedule::new(false, 7, 30, 22, 60).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.hydration_interval_ms, 500);
        assert!(config.hydrate_on_ready);

        let scan = ScanConfig::default();
        assert_eq!(scan.scan_duration_secs, 20);
        assert_eq!(scan.rest_interval_secs, 5);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Unknown);
        assert_eq!(ScanState::Error(3).to_string(), "ERROR 3");
        assert!(ScanState::Pause.is_active());
        assert!(!ScanState::Stop.is_active());
    }
}
