use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    catalog::Characteristic,
    error::{CradleError, Result},
    types::{
        CurrentTime, LedBrightness, LedColor, LedSwitch, PirSwitch, Switch, TimerSchedule,
    },
};

/// Payload size of a characteristic in bytes
///
/// Every field is a single unsigned byte in fixed order:
/// - LED Status: `[switch]`
/// - PIR Status: `[switch, min_brightness]`
/// - LED Color: `[red, green, blue]`
/// - LED Brightness: `[brightness]`
/// - Current Time: `[hour, minute, second, day, month, year - 2000]`
/// - Timer Schedule: `[switch, on_hour, on_minute, off_hour, off_minute]`
#[must_use]
pub const fn payload_len(characteristic: Characteristic) -> usize {
    match characteristic {
        Characteristic::LedStatus | Characteristic::LedBrightness => 1,
        Characteristic::PirStatus => 2,
        Characteristic::LedColor => 3,
        Characteristic::TimerSchedule => 5,
        Characteristic::CurrentTime => 6,
    }
}

/// A write to one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Turn the LED on or off
    SetLedStatus(LedSwitch),
    /// Configure motion sensing
    SetPirStatus(PirSwitch),
    /// Change the LED color
    SetLedColor(LedColor),
    /// Change the LED brightness
    SetLedBrightness(LedBrightness),
    /// Set the device clock
    SetCurrentTime(CurrentTime),
    /// Configure the on/off timer
    SetTimerSchedule(TimerSchedule),
}

impl Command {
    /// Target characteristic
    #[must_use]
    pub const fn characteristic(&self) -> Characteristic {
        match self {
            Self::SetLedStatus(_) => Characteristic::LedStatus,
            Self::SetPirStatus(_) => Characteristic::PirStatus,
            Self::SetLedColor(_) => Characteristic::LedColor,
            Self::SetLedBrightness(_) => Characteristic::LedBrightness,
            Self::SetCurrentTime(_) => Characteristic::CurrentTime,
            Self::SetTimerSchedule(_) => Characteristic::TimerSchedule,
        }
    }

    /// Serialize the write payload
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if a clock field is out of range.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(payload_len(self.characteristic()));

        match self {
            Self::SetLedStatus(status) => {
                buf.put_u8(Switch::from(status.on) as u8);
            }
            Self::SetPirStatus(pir) => {
                buf.put_u8(Switch::from(pir.on) as u8);
                buf.put_u8(pir.min_brightness);
            }
            Self::SetLedColor(color) => {
                buf.put_u8(color.red);
                buf.put_u8(color.green);
                buf.put_u8(color.blue);
            }
            Self::SetLedBrightness(brightness) => {
                buf.put_u8(brightness.0);
            }
            Self::SetCurrentTime(time) => {
                time.validate()?;
                buf.put_u8(time.hour);
                buf.put_u8(time.minute);
                buf.put_u8(time.second);
                buf.put_u8(time.day);
                buf.put_u8(time.month);
                buf.put_u8(time.year_offset);
            }
            Self::SetTimerSchedule(schedule) => {
                schedule.validate()?;
                buf.put_u8(Switch::from(schedule.enabled) as u8);
                buf.put_u8(schedule.on_hour);
                buf.put_u8(schedule.on_minute);
                buf.put_u8(schedule.off_hour);
                buf.put_u8(schedule.off_minute);
            }
        }

        Ok(buf.freeze())
    }
}

/// A decoded characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// LED on/off
    LedStatus(LedSwitch),
    /// PIR sensor status
    PirStatus(PirSwitch),
    /// LED color
    LedColor(LedColor),
    /// LED brightness
    LedBrightness(LedBrightness),
    /// Device clock
    CurrentTime(CurrentTime),
    /// On/off timer
    TimerSchedule(TimerSchedule),
}

impl DeviceEvent {
    /// Decode a read payload of `characteristic`
    ///
    /// Bytes are taken as unsigned values; trailing bytes beyond the layout are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::ParseError`] if the payload is shorter than the
    /// layout or a switch byte is neither `0x00` nor `0x01`.
    pub fn decode(characteristic: Characteristic, data: &[u8]) -> Result<Self> {
        let expected = payload_len(characteristic);
        if data.len() < expected {
            return Err(CradleError::ParseError(format!(
                "{characteristic} payload too short: {} bytes, expected {expected}",
                data.len()
            )));
        }

        let mut buf = data;

        let event = match characteristic {
            Characteristic::LedStatus => Self::LedStatus(LedSwitch {
                on: Switch::try_from(buf.get_u8())?.is_on(),
            }),
            Characteristic::PirStatus => {
                let on = Switch::try_from(buf.get_u8())?.is_on();
                Self::PirStatus(PirSwitch {
                    on,
                    min_brightness: buf.get_u8(),
                })
            }
            Characteristic::LedColor => Self::LedColor(LedColor {
                red: buf.get_u8(),
                green: buf.get_u8(),
                blue: buf.get_u8(),
            }),
            Characteristic::LedBrightness => Self::LedBrightness(LedBrightness(buf.get_u8())),
            Characteristic::CurrentTime => Self::CurrentTime(CurrentTime {
                hour: buf.get_u8(),
                minute: buf.get_u8(),
                second: buf.get_u8(),
                day: buf.get_u8(),
                month: buf.get_u8(),
                year_offset: buf.get_u8(),
            }),
            Characteristic::TimerSchedule => {
                let enabled = Switch::try_from(buf.get_u8())?.is_on();
                Self::TimerSchedule(TimerSchedule {
                    enabled,
                    on_hour: buf.get_u8(),
                    on_minute: buf.get_u8(),
                    off_hour: buf.get_u8(),
                    off_minute: buf.get_u8(),
                })
            }
        };

        Ok(event)
    }

    /// Source characteristic
    #[must_use]
    pub const fn characteristic(&self) -> Characteristic {
        match self {
            Self::LedStatus(_) => Characteristic::LedStatus,
            Self::PirStatus(_) => Characteristic::PirStatus,
            Self::LedColor(_) => Characteristic::LedColor,
            Self::LedBrightness(_) => Characteristic::LedBrightness,
            Self::CurrentTime(_) => Characteristic::CurrentTime,
            Self::TimerSchedule(_) => Characteristic::TimerSchedule,
        }
    }
}
