use chrono::{DateTime, Utc};
use num_enum::TryFromPrimitive;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// A 6-byte OBIS object identifier as carried in the telegram's list
/// entries, e.g. 1-0:1.8.0*255 for imported active energy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObisCode([u8; 6]);

impl ObisCode {
    pub const MANUFACTURER: ObisCode = ObisCode([0x81, 0x81, 0xC7, 0x82, 0x03, 0xFF]);
    pub const DEVICE_ID: ObisCode = ObisCode([0x01, 0x00, 0x00, 0x00, 0x09, 0xFF]);
    pub const ENERGY_IMPORT_TOTAL: ObisCode = ObisCode([0x01, 0x00, 0x01, 0x08, 0x00, 0xFF]);
    pub const ENERGY_IMPORT_T1: ObisCode = ObisCode([0x01, 0x00, 0x01, 0x08, 0x01, 0xFF]);
    pub const ENERGY_IMPORT_T2: ObisCode = ObisCode([0x01, 0x00, 0x01, 0x08, 0x02, 0xFF]);
    pub const ENERGY_EXPORT_TOTAL: ObisCode = ObisCode([0x01, 0x00, 0x02, 0x08, 0x00, 0xFF]);
    pub const POWER_TOTAL: ObisCode = ObisCode([0x01, 0x00, 0x10, 0x07, 0x00, 0xFF]);
    pub const POWER_L1: ObisCode = ObisCode([0x01, 0x00, 0x24, 0x07, 0x00, 0xFF]);
    pub const POWER_L2: ObisCode = ObisCode([0x01, 0x00, 0x38, 0x07, 0x00, 0xFF]);
    pub const POWER_L3: ObisCode = ObisCode([0x01, 0x00, 0x4C, 0x07, 0x00, 0xFF]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn kind(&self) -> ObisKind {
        ObisKind::from_code(self)
    }
}

impl std::fmt::Display for ObisCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(f, "{}-{}:{}.{}.{}*{}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl std::fmt::Debug for ObisCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for ObisCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Semantic classification of the OBIS codes the eBZ DD3 publishes.
/// Codes not in the table decode as `Unrecognized` and are kept, so a
/// firmware update adding new codes does not break the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObisKind {
    Manufacturer,
    DeviceId,
    EnergyImportTotal,
    EnergyImportT1,
    EnergyImportT2,
    EnergyExportTotal,
    PowerTotal,
    PowerL1,
    PowerL2,
    PowerL3,
    Unrecognized,
}

impl ObisKind {
    pub fn from_code(code: &ObisCode) -> Self {
        match *code {
            ObisCode::MANUFACTURER => Self::Manufacturer,
            ObisCode::DEVICE_ID => Self::DeviceId,
            ObisCode::ENERGY_IMPORT_TOTAL => Self::EnergyImportTotal,
            ObisCode::ENERGY_IMPORT_T1 => Self::EnergyImportT1,
            ObisCode::ENERGY_IMPORT_T2 => Self::EnergyImportT2,
            ObisCode::ENERGY_EXPORT_TOTAL => Self::EnergyExportTotal,
            ObisCode::POWER_TOTAL => Self::PowerTotal,
            ObisCode::POWER_L1 => Self::PowerL1,
            ObisCode::POWER_L2 => Self::PowerL2,
            ObisCode::POWER_L3 => Self::PowerL3,
            _ => Self::Unrecognized,
        }
    }
}

/// DLMS unit codes observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum Unit {
    Watt = 27,
    VoltAmpereReactive = 29,
    WattHour = 30,
    Ampere = 33,
    Volt = 35,
    Hertz = 44,
}

/// One decoded SML data node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SmlValue {
    OctetString(Vec<u8>),
    Bool(bool),
    Int(i64),
    UInt(u64),
    List(Vec<SmlValue>),
    EndOfMessage,
}

impl SmlValue {
    pub fn as_list(&self) -> Option<&[SmlValue]> {
        match self {
            SmlValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            SmlValue::OctetString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SmlValue::Int(v) => Some(*v),
            SmlValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// One measurement from a telegram list entry. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObisValue {
    pub code: ObisCode,
    pub value: SmlValue,
    pub scaler: i8,
    pub unit: Option<Unit>,
}

impl ObisValue {
    /// The physical value with the telegram's power-of-ten scaler applied.
    /// Octet-string entries (identifiers) have no numeric form.
    pub fn scaled(&self) -> Option<f64> {
        let raw = match self.value {
            SmlValue::Int(v) => v as f64,
            SmlValue::UInt(v) => v as f64,
            _ => return None,
        };
        Some(raw * 10f64.powi(self.scaler as i32))
    }

    pub fn text(&self) -> Option<String> {
        self.value
            .as_octets()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

/// All values decoded from one valid telegram, at most one per OBIS code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterReading {
    pub received_at: DateTime<Utc>,
    pub values: BTreeMap<ObisCode, ObisValue>,
}

impl MeterReading {
    pub fn new(received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, value: ObisValue) {
        self.values.insert(value.code, value);
    }

    pub fn get(&self, code: &ObisCode) -> Option<&ObisValue> {
        self.values.get(code)
    }

    pub fn scaled(&self, code: &ObisCode) -> Option<f64> {
        self.get(code).and_then(|v| v.scaled())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn manufacturer(&self) -> Option<String> {
        self.get(&ObisCode::MANUFACTURER).and_then(|v| v.text())
    }

    pub fn device_id(&self) -> Option<String> {
        self.get(&ObisCode::DEVICE_ID)
            .and_then(|v| v.value.as_octets())
            .map(hex::encode_upper)
    }

    /// Wh
    pub fn energy_import_total(&self) -> Option<f64> {
        self.scaled(&ObisCode::ENERGY_IMPORT_TOTAL)
    }

    pub fn energy_import_t1(&self) -> Option<f64> {
        self.scaled(&ObisCode::ENERGY_IMPORT_T1)
    }

    pub fn energy_import_t2(&self) -> Option<f64> {
        self.scaled(&ObisCode::ENERGY_IMPORT_T2)
    }

    pub fn energy_export_total(&self) -> Option<f64> {
        self.scaled(&ObisCode::ENERGY_EXPORT_TOTAL)
    }

    /// W
    pub fn power_total(&self) -> Option<f64> {
        self.scaled(&ObisCode::POWER_TOTAL)
    }

    pub fn power_phase(&self, phase: usize) -> Option<f64> {
        let code = match phase {
            1 => ObisCode::POWER_L1,
            2 => ObisCode::POWER_L2,
            3 => ObisCode::POWER_L3,
            _ => return None,
        };
        self.scaled(&code)
    }

    /// A reading that can be persisted carries at least the instantaneous
    /// power sum and the cumulative import counter.
    pub fn is_complete(&self) -> bool {
        self.power_total().is_some() && self.energy_import_total().is_some()
    }
}
