use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CradleError, Result};

/// Logical characteristics of the Cradle smart light service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Characteristic {
    /// LED on/off
    LedStatus,
    /// RGB color
    LedColor,
    /// Brightness 0-255
    LedBrightness,
    /// PIR motion sensing with minimum brightness
    PirStatus,
    /// Device wall clock
    CurrentTime,
    /// Automatic on/off timer
    TimerSchedule,
}

impl Characteristic {
    /// Every characteristic, in table order
    pub const ALL: [Self; 6] = [
        Self::LedStatus,
        Self::LedColor,
        Self::LedBrightness,
        Self::PirStatus,
        Self::CurrentTime,
        Self::TimerSchedule,
    ];

    /// Human readable name
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::LedStatus => "Led Status",
            Self::LedColor => "Led Color",
            Self::LedBrightness => "Led Brightness",
            Self::PirStatus => "Pir Status",
            Self::CurrentTime => "Current Time",
            Self::TimerSchedule => "Timer Feature",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One row of a service table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicEntry {
    /// Logical characteristic
    pub characteristic: Characteristic,
    /// 128-bit identifier
    pub id: u128,
}

impl CharacteristicEntry {
    /// Create a table row
    #[must_use]
    pub const fn new(characteristic: Characteristic, id: u128) -> Self {
        Self { characteristic, id }
    }

    /// Identifier as a [`Uuid`]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        Uuid::from_u128(self.id)
    }
}

/// Cradle Smart Light Service
pub const CRADLE_SERVICE_ID: u128 = 0xc9ea4800_ad9e_4d67_b570_69352fdc1078;

/// Characteristic table of the Cradle Smart Light Service
pub const CRADLE_CHARACTERISTICS: [CharacteristicEntry; 6] = [
    CharacteristicEntry::new(Characteristic::LedStatus, 0xc9ea4801_ad9e_4d67_b570_69352fdc1078),
    CharacteristicEntry::new(Characteristic::LedColor, 0xc9ea4802_ad9e_4d67_b570_69352fdc1078),
    CharacteristicEntry::new(Characteristic::LedBrightness, 0xc9ea4803_ad9e_4d67_b570_69352fdc1078),
    CharacteristicEntry::new(Characteristic::PirStatus, 0xc9ea4804_ad9e_4d67_b570_69352fdc1078),
    CharacteristicEntry::new(Characteristic::CurrentTime, 0xc9ea4805_ad9e_4d67_b570_69352fdc1078),
    CharacteristicEntry::new(Characteristic::TimerSchedule, 0xc9ea4806_ad9e_4d67_b570_69352fdc1078),
];

const fn has_duplicate_ids(entries: &[CharacteristicEntry]) -> bool {
    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() {
            if entries[i].id == entries[j].id {
                return true;
            }
            j += 1;
        }
        i += 1;
    }
    false
}

const _: () = assert!(
    !has_duplicate_ids(&CRADLE_CHARACTERISTICS),
    "duplicate characteristic identifier in the Cradle service table"
);

/// A validated service with its characteristic table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    uuid: Uuid,
    description: &'static str,
    entries: Vec<CharacteristicEntry>,
}

impl ServiceLayout {
    /// Build a layout, refusing tables where an identifier or a logical
    /// characteristic appears twice
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::DuplicateCharacteristic`] on the first collision.
    pub fn new(
        uuid: Uuid,
        description: &'static str,
        entries: impl IntoIterator<Item = CharacteristicEntry>,
    ) -> Result<Self> {
        let mut accepted: Vec<CharacteristicEntry> = Vec::new();

        for entry in entries {
            if let Some(existing) = accepted
                .iter()
                .find(|e| e.id == entry.id || e.characteristic == entry.characteristic)
            {
                return Err(CradleError::DuplicateCharacteristic {
                    uuid: entry.uuid(),
                    first: existing.characteristic,
                    second: entry.characteristic,
                });
            }
            accepted.push(entry);
        }

        Ok(Self {
            uuid,
            description,
            entries: accepted,
        })
    }

    /// The Cradle Smart Light Service
    #[must_use]
    pub fn cradle() -> Self {
        // Checked for collisions at compile time above
        Self {
            uuid: Uuid::from_u128(CRADLE_SERVICE_ID),
            description: "Cradle Smart Light Service",
            entries: CRADLE_CHARACTERISTICS.to_vec(),
        }
    }

    /// Service identifier
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Human readable service name
    #[must_use]
    pub const fn description(&self) -> &'static str {
        self.description
    }

    /// Table rows
    #[must_use]
    pub fn entries(&self) -> &[CharacteristicEntry] {
        &self.entries
    }

    /// Identifier of a logical characteristic
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::InvalidParameters`] if the layout does not carry it.
    pub fn uuid_of(&self, characteristic: Characteristic) -> Result<Uuid> {
        self.entries
            .iter()
            .find(|e| e.characteristic == characteristic)
            .map(CharacteristicEntry::uuid)
            .ok_or_else(|| {
                CradleError::InvalidParameters(format!(
                    "{characteristic} is not part of {}",
                    self.description
                ))
            })
    }

    /// Logical characteristic behind an identifier
    #[must_use]
    pub fn characteristic_for(&self, uuid: Uuid) -> Option<Characteristic> {
        self.entries
            .iter()
            .find(|e| e.uuid() == uuid)
            .map(|e| e.characteristic)
    }
}

impl Default for ServiceLayout {
    fn default() -> Self {
        Self::cradle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cradle_lookup_roundtrip() {
        let layout = ServiceLayout::cradle();
        assert_eq!(
            layout.uuid().to_string(),
            "c9ea4800-ad9e-4d67-b570-69352fdc1078"
        );

        for characteristic in Characteristic::ALL {
            let uuid = layout.uuid_of(characteristic).unwrap();
            assert_eq!(layout.characteristic_for(uuid), Some(characteristic));
        }

        assert_eq!(
            layout.uuid_of(Characteristic::LedColor).unwrap().to_string(),
            "c9ea4802-ad9e-4d67-b570-69352fdc1078"
        );
        assert_eq!(
            layout.uuid_of(Characteristic::TimerSchedule).unwrap().to_string(),
            "c9ea4806-ad9e-4d67-b570-69352fdc1078"
        );
    }

    #[test]
    fn test_unknown_uuid_lookup() {
        let layout = ServiceLayout::cradle();
        assert_eq!(layout.characteristic_for(layout.uuid()), None);
        assert_eq!(layout.characteristic_for(Uuid::nil()), None);
    }

    #[test]
    fn test_cradle_table_matches_validated_construction() {
        let validated = ServiceLayout::new(
            Uuid::from_u128(CRADLE_SERVICE_ID),
            "Cradle Smart Light Service",
            CRADLE_CHARACTERISTICS,
        )
        .unwrap();
        assert_eq!(validated, ServiceLayout::cradle());
    }

    #[test]
    fn test_duplicate_identifier_fails_construction() {
        // PIR control and current time sharing one identifier
        let shared = 0x0000_ff02_0000_1000_8000_0080_5f9b_34fb;
        let result = ServiceLayout::new(
            Uuid::from_u128(0x0000_ff00_0000_1000_8000_0080_5f9b_34fb),
            "Hardware Control Service",
            [
                CharacteristicEntry::new(Characteristic::LedStatus, 0x0000_ff01_0000_1000_8000_0080_5f9b_34fb),
                CharacteristicEntry::new(Characteristic::PirStatus, shared),
                CharacteristicEntry::new(Characteristic::CurrentTime, shared),
            ],
        );

        match result {
            Err(CradleError::DuplicateCharacteristic { uuid, first, second }) => {
                assert_eq!(uuid, Uuid::from_u128(shared));
                assert_eq!(first, Characteristic::PirStatus);
                assert_eq!(second, Characteristic::CurrentTime);
            }
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_logical_characteristic_fails_construction() {
        let result = ServiceLayout::new(
            Uuid::from_u128(CRADLE_SERVICE_ID),
            "Cradle Smart Light Service",
            [
                CharacteristicEntry::new(Characteristic::LedColor, 1),
                CharacteristicEntry::new(Characteristic::LedColor, 2),
            ],
        );
        assert!(matches!(
            result,
            Err(CradleError::DuplicateCharacteristic { .. })
        ));
    }

    #[test]
    fn test_missing_characteristic_lookup_fails() {
        let layout = ServiceLayout::new(
            Uuid::from_u128(CRADLE_SERVICE_ID),
            "Partial",
            [CharacteristicEntry::new(Characteristic::LedStatus, 1)],
        )
        .unwrap();
        assert!(layout.uuid_of(Characteristic::LedColor).is_err());
    }

    #[test]
    fn test_compile_time_duplicate_check() {
        assert!(!has_duplicate_ids(&CRADLE_CHARACTERISTICS));
        let dup = [
            CharacteristicEntry::new(Characteristic::LedStatus, 7),
            CharacteristicEntry::new(Characteristic::LedColor, 7),
        ];
        assert!(has_duplicate_ids(&dup));
    }
}
