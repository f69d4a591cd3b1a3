//! Parameter catalogue: one immutable entry per symbolic key, mapping the
//! key to its register recipe (address, byte selector, scale, offset, string
//! span) or to a field of the decoded status record.
//!
//! The byte-level H/L assignments around 0x42A, 0x44B-0x457 and 0x451-0x456
//! resolve documentation conflicts that were disambiguated against real
//! devices; they are authoritative as written and must not be re-derived
//! from the register descriptions.

use crate::frame::ProtocolError;
use crate::registers::{decode_ascii, RegisterView};
use crate::status::{BmsStatus, ProductionDate, TempPoint};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Voltage,
    Current,
    Temperature,
    Other,
    String,
    System,
    Status,
}

/// Which half of a 16-bit register a one-byte parameter occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ByteSelector {
    High,
    Low,
}

/// Decode/encode recipe, tagged by value kind.
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    U8 {
        address: u16,
        byte: ByteSelector,
        scale: f64,
        offset: f64,
    },
    U16 {
        address: u16,
        scale: f64,
        offset: f64,
    },
    U32 {
        address: u16,
        scale: f64,
        offset: f64,
    },
    Str {
        start_address: u16,
        byte_length: u16,
    },
    /// Derived from the decoded status record; not register-addressable.
    Status(StatusField),
}

impl ValueKind {
    /// Register span `(start, length)` for address-backed kinds; status
    /// fields have none.
    pub fn span(&self) -> Option<(u16, u16)> {
        match *self {
            ValueKind::U8 { address, .. } | ValueKind::U16 { address, .. } => Some((address, 1)),
            ValueKind::U32 { address, .. } => Some((address, 2)),
            ValueKind::Str {
                start_address,
                byte_length,
            } => Some((start_address, byte_length.div_ceil(2))),
            ValueKind::Status(_) => None,
        }
    }
}

/// One catalogue entry.
#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub key: &'static str,
    pub category: Category,
    pub access: Access,
    pub unit: Option<&'static str>,
    pub kind: ValueKind,
}

/// A decoded parameter value in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
    Flags(BTreeMap<&'static str, bool>),
    Numbers(Vec<f64>),
    MaybeNumbers(Vec<Option<f64>>),
    Bools(Vec<bool>),
    Date(ProductionDate),
    Temp(TempPoint),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// Typed accessor for every status-derived parameter. Replaces runtime path
/// strings with an exhaustive match so a new field cannot be silently
/// mis-addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusField {
    SeriesCount,
    CellTempCount,
    HardwareVersion,
    SoftwareVersion,
    SpecialId,
    ProtocolVersion,
    DesignCapacityMah,
    RemainingCapacityMah,
    FullCapacityMah,
    FullWh,
    RemainingWh,
    SocPct,
    SohPct,
    CycleCount,
    MaxChargeIntervalHours,
    CurrentChargeIntervalHours,
    DischargeRemainingMin,
    ChargeRemainingMin,
    ChargeCount,
    DischargeCount,
    BmsTimestamp,
    PowerOnWorkHours,
    TotalChargeCapacityRaw,
    PackCellSumVoltageV,
    VbatVoltageV,
    VpackVoltageV,
    VloadVoltageV,
    PackCurrentA,
    HighestCellVoltageMv,
    LowestCellVoltageMv,
    AvgCellVoltageMv,
    MaxCellDiffMv,
    HighestCellIndex,
    LowestCellIndex,
    ChargeMosTempC,
    DischargeMosTempC,
    PrechargeMosTempC,
    AmbientTempC,
    HeatingFilmTempC,
    PoleTempC,
    HighestTemp,
    LowestTemp,
    ProtectionStatus,
    IndicatorStatus,
    AlarmStatus,
    CustomStatusU32,
    ProductionDate,
    CustomParams,
    CellVoltagesMv,
    CellTempsC,
    CellBalancing,
    HardwareModel,
    BoardCode,
    BluetoothMac,
}

impl StatusField {
    /// Reads this field out of a freshly decoded status record. `None`
    /// mirrors an unpopulated sensor or unprogrammed identity field.
    pub fn read(self, status: &BmsStatus) -> Option<ParamValue> {
        use ParamValue::{Bools, Date, Flags, MaybeNumbers, Number, Numbers, Temp, Text};
        match self {
            StatusField::SeriesCount => Some(Number(f64::from(status.meta.series_count))),
            StatusField::CellTempCount => Some(Number(f64::from(status.meta.cell_temp_count))),
            StatusField::HardwareVersion => Some(Number(status.meta.hardware_version)),
            StatusField::SoftwareVersion => Some(Number(status.meta.software_version)),
            StatusField::SpecialId => Some(Number(f64::from(status.meta.special_id))),
            StatusField::ProtocolVersion => Some(Number(f64::from(status.meta.protocol_version))),
            StatusField::DesignCapacityMah => {
                Some(Number(f64::from(status.energy.design_capacity_mah)))
            }
            StatusField::RemainingCapacityMah => {
                Some(Number(f64::from(status.energy.remaining_capacity_mah)))
            }
            StatusField::FullCapacityMah => {
                Some(Number(f64::from(status.energy.full_capacity_mah)))
            }
            StatusField::FullWh => Some(Number(status.energy.full_wh)),
            StatusField::RemainingWh => Some(Number(status.energy.remaining_wh)),
            StatusField::SocPct => Some(Number(status.energy.soc_pct)),
            StatusField::SohPct => Some(Number(status.energy.soh_pct)),
            StatusField::CycleCount => Some(Number(f64::from(status.energy.cycle_count))),
            StatusField::MaxChargeIntervalHours => {
                Some(Number(f64::from(status.timing.max_charge_interval_hours)))
            }
            StatusField::CurrentChargeIntervalHours => Some(Number(f64::from(
                status.timing.current_charge_interval_hours,
            ))),
            StatusField::DischargeRemainingMin => {
                Some(Number(f64::from(status.timing.discharge_remaining_min)))
            }
            StatusField::ChargeRemainingMin => {
                Some(Number(f64::from(status.timing.charge_remaining_min)))
            }
            StatusField::ChargeCount => Some(Number(f64::from(status.timing.charge_count))),
            StatusField::DischargeCount => Some(Number(f64::from(status.timing.discharge_count))),
            StatusField::BmsTimestamp => Some(Number(f64::from(status.timing.bms_timestamp))),
            StatusField::PowerOnWorkHours => {
                Some(Number(f64::from(status.timing.power_on_work_hours)))
            }
            StatusField::TotalChargeCapacityRaw => {
                Some(Number(f64::from(status.energy.total_charge_capacity_raw)))
            }
            StatusField::PackCellSumVoltageV => {
                Some(Number(status.electrical.pack_cell_sum_voltage_v))
            }
            StatusField::VbatVoltageV => Some(Number(status.electrical.v_bat_v)),
            StatusField::VpackVoltageV => Some(Number(status.electrical.v_pack_v)),
            StatusField::VloadVoltageV => Some(Number(status.electrical.v_load_v)),
            StatusField::PackCurrentA => Some(Number(status.electrical.current_a)),
            StatusField::HighestCellVoltageMv => {
                Some(Number(f64::from(status.electrical.highest_cell_voltage_mv)))
            }
            StatusField::LowestCellVoltageMv => {
                Some(Number(f64::from(status.electrical.lowest_cell_voltage_mv)))
            }
            StatusField::AvgCellVoltageMv => {
                Some(Number(f64::from(status.electrical.avg_cell_voltage_mv)))
            }
            StatusField::MaxCellDiffMv => {
                Some(Number(f64::from(status.electrical.max_cell_voltage_diff_mv)))
            }
            StatusField::HighestCellIndex => {
                Some(Number(f64::from(status.electrical.highest_cell_index)))
            }
            StatusField::LowestCellIndex => {
                Some(Number(f64::from(status.electrical.lowest_cell_index)))
            }
            StatusField::ChargeMosTempC => {
                status.temperature.charge_mos_c.map(|v| Number(f64::from(v)))
            }
            StatusField::DischargeMosTempC => {
                status.temperature.discharge_mos_c.map(|v| Number(f64::from(v)))
            }
            StatusField::PrechargeMosTempC => {
                status.temperature.precharge_mos_c.map(|v| Number(f64::from(v)))
            }
            StatusField::AmbientTempC => {
                status.temperature.ambient_c.map(|v| Number(f64::from(v)))
            }
            StatusField::HeatingFilmTempC => {
                status.temperature.heating_film_c.map(|v| Number(f64::from(v)))
            }
            StatusField::PoleTempC => status.temperature.pole_c.map(|v| Number(f64::from(v))),
            StatusField::HighestTemp => Some(Temp(status.temperature.highest)),
            StatusField::LowestTemp => Some(Temp(status.temperature.lowest)),
            StatusField::ProtectionStatus => Some(Flags(status.flags.protection.clone())),
            StatusField::IndicatorStatus => Some(Flags(status.flags.indicator.clone())),
            StatusField::AlarmStatus => Some(Flags(status.flags.alarm.clone())),
            StatusField::CustomStatusU32 => Some(Number(f64::from(status.flags.custom_status))),
            StatusField::ProductionDate => Some(Date(status.meta.production_date)),
            StatusField::CustomParams => Some(Numbers(
                status.custom_params.iter().map(|v| f64::from(*v)).collect(),
            )),
            StatusField::CellVoltagesMv => Some(Numbers(
                status.cells.voltages_mv.iter().map(|v| f64::from(*v)).collect(),
            )),
            StatusField::CellTempsC => Some(MaybeNumbers(status.temperature.cell_temps_c.clone())),
            StatusField::CellBalancing => Some(Bools(status.cells.balancing.clone())),
            StatusField::HardwareModel => Some(Text(status.identity.hardware_model.clone())),
            StatusField::BoardCode => Some(Text(status.identity.board_code.clone())),
            StatusField::BluetoothMac => status.identity.bluetooth_mac.clone().map(Text),
        }
    }
}

const fn status_def(key: &'static str, field: StatusField) -> ParamDef {
    ParamDef {
        key,
        category: Category::Status,
        access: Access::ReadOnly,
        unit: None,
        kind: ValueKind::Status(field),
    }
}

const fn u16_def(
    key: &'static str,
    category: Category,
    address: u16,
    scale: f64,
    unit: Option<&'static str>,
) -> ParamDef {
    ParamDef {
        key,
        category,
        access: Access::ReadWrite,
        unit,
        kind: ValueKind::U16 {
            address,
            scale,
            offset: 0.0,
        },
    }
}

const fn u32_def(
    key: &'static str,
    category: Category,
    address: u16,
    scale: f64,
    unit: Option<&'static str>,
) -> ParamDef {
    ParamDef {
        key,
        category,
        access: Access::ReadWrite,
        unit,
        kind: ValueKind::U32 {
            address,
            scale,
            offset: 0.0,
        },
    }
}

const fn u8_def(
    key: &'static str,
    category: Category,
    address: u16,
    byte: ByteSelector,
    scale: f64,
    unit: Option<&'static str>,
) -> ParamDef {
    ParamDef {
        key,
        category,
        access: Access::ReadWrite,
        unit,
        kind: ValueKind::U8 {
            address,
            byte,
            scale,
            offset: 0.0,
        },
    }
}

/// A one-byte temperature: offset-40 degrees Celsius.
const fn u8_temp_def(
    key: &'static str,
    category: Category,
    address: u16,
    byte: ByteSelector,
) -> ParamDef {
    ParamDef {
        key,
        category,
        access: Access::ReadWrite,
        unit: Some("°C"),
        kind: ValueKind::U8 {
            address,
            byte,
            scale: 1.0,
            offset: -40.0,
        },
    }
}

const fn str_def(
    key: &'static str,
    category: Category,
    start_address: u16,
    byte_length: u16,
) -> ParamDef {
    ParamDef {
        key,
        category,
        access: Access::ReadWrite,
        unit: None,
        kind: ValueKind::Str {
            start_address,
            byte_length,
        },
    }
}

use self::ByteSelector::{High, Low};
use self::Category::{Current, Other, String as StringCat, System, Temperature, Voltage};

/// The full catalogue. Declarative configuration; addresses and byte
/// selectors are device-authoritative (see the module docs).
pub static PARAM_DEFS: &[ParamDef] = &[
    // --- Status area (0x100~), read-only, derived from the status record.
    status_def("SERIES_COUNT", StatusField::SeriesCount),
    status_def("CELL_TEMP_COUNT", StatusField::CellTempCount),
    status_def("HARDWARE_VERSION", StatusField::HardwareVersion),
    status_def("SOFTWARE_VERSION", StatusField::SoftwareVersion),
    status_def("SPECIAL_ID", StatusField::SpecialId),
    status_def("PROTOCOL_VERSION", StatusField::ProtocolVersion),
    status_def("DESIGN_CAPACITY_MAH", StatusField::DesignCapacityMah),
    status_def("REMAINING_CAPACITY_MAH", StatusField::RemainingCapacityMah),
    status_def("FULL_CAPACITY_MAH", StatusField::FullCapacityMah),
    status_def("FULL_WH", StatusField::FullWh),
    status_def("REMAINING_WH", StatusField::RemainingWh),
    status_def("SOC_PCT", StatusField::SocPct),
    status_def("SOH_PCT", StatusField::SohPct),
    status_def("CYCLE_COUNT", StatusField::CycleCount),
    status_def("MAX_CHARGE_INTERVAL_HOURS", StatusField::MaxChargeIntervalHours),
    status_def("CURRENT_CHARGE_INTERVAL_HOURS", StatusField::CurrentChargeIntervalHours),
    status_def("DISCHARGE_REMAINING_MIN", StatusField::DischargeRemainingMin),
    status_def("CHARGE_REMAINING_MIN", StatusField::ChargeRemainingMin),
    status_def("CHARGE_COUNT", StatusField::ChargeCount),
    status_def("DISCHARGE_COUNT", StatusField::DischargeCount),
    status_def("BMS_TIMESTAMP", StatusField::BmsTimestamp),
    status_def("POWER_ON_WORK_HOURS", StatusField::PowerOnWorkHours),
    status_def("TOTAL_CHARGE_CAPACITY_RAW", StatusField::TotalChargeCapacityRaw),
    status_def("PACK_CELL_SUM_VOLTAGE_V", StatusField::PackCellSumVoltageV),
    status_def("VBAT_VOLTAGE_V", StatusField::VbatVoltageV),
    status_def("VPACK_VOLTAGE_V", StatusField::VpackVoltageV),
    status_def("VLOAD_VOLTAGE_V", StatusField::VloadVoltageV),
    status_def("PACK_CURRENT_A", StatusField::PackCurrentA),
    status_def("HIGHEST_CELL_VOLTAGE_MV", StatusField::HighestCellVoltageMv),
    status_def("LOWEST_CELL_VOLTAGE_MV", StatusField::LowestCellVoltageMv),
    status_def("AVG_CELL_VOLTAGE_MV", StatusField::AvgCellVoltageMv),
    status_def("MAX_CELL_DIFF_MV", StatusField::MaxCellDiffMv),
    status_def("HIGHEST_CELL_INDEX", StatusField::HighestCellIndex),
    status_def("LOWEST_CELL_INDEX", StatusField::LowestCellIndex),
    status_def("CHARGE_MOS_TEMP_C", StatusField::ChargeMosTempC),
    status_def("DISCHARGE_MOS_TEMP_C", StatusField::DischargeMosTempC),
    status_def("PRECHARGE_MOS_TEMP_C", StatusField::PrechargeMosTempC),
    status_def("AMBIENT_TEMP_C", StatusField::AmbientTempC),
    status_def("HEATING_FILM_TEMP_C", StatusField::HeatingFilmTempC),
    status_def("POLE_TEMP_C", StatusField::PoleTempC),
    status_def("HIGHEST_TEMP", StatusField::HighestTemp),
    status_def("LOWEST_TEMP", StatusField::LowestTemp),
    status_def("PROTECTION_STATUS", StatusField::ProtectionStatus),
    status_def("INDICATOR_STATUS", StatusField::IndicatorStatus),
    status_def("ALARM_STATUS", StatusField::AlarmStatus),
    status_def("CUSTOM_STATUS_U32", StatusField::CustomStatusU32),
    status_def("PRODUCTION_DATE", StatusField::ProductionDate),
    status_def("CUSTOM_PARAMS", StatusField::CustomParams),
    status_def("CELL_VOLTAGES_MV", StatusField::CellVoltagesMv),
    status_def("CELL_TEMPS_C", StatusField::CellTempsC),
    status_def("CELL_BALANCING", StatusField::CellBalancing),
    status_def("HARDWARE_MODEL", StatusField::HardwareModel),
    status_def("BOARD_CODE", StatusField::BoardCode),
    status_def("BLUETOOTH_MAC", StatusField::BluetoothMac),
    // --- Voltage configuration (0x400~).
    u16_def("CELL_OV_ALARM_V", Voltage, 0x400, 0.001, Some("V")),
    u16_def("CELL_OC_PROTECT_V", Voltage, 0x401, 0.001, Some("V")),
    u8_def("CELL_OC_ALARM_DELAY_S", Voltage, 0x402, Low, 0.1, Some("s")),
    u8_def("CELL_OC_PROTECT_DELAY_S", Voltage, 0x402, High, 0.1, Some("s")),
    u8_temp_def("NORMAL_LOW_TEMP_THRESHOLD_C", Voltage, 0x403, High),
    u16_def("CELL_OV_PROTECT_RELEASE_V", Voltage, 0x404, 0.001, Some("V")),
    u16_def("CELL_OC_ALARM_RELEASE_DELTA_V", Voltage, 0x405, 0.001, Some("V")),
    u16_def("CAPACITY_RELEASE_SOC_PCT", Voltage, 0x406, 1.0, Some("%")),
    u8_def("OV_DISCHARGE_RELEASE_A", Voltage, 0x407, Low, 0.1, Some("A")),
    u8_def("UV_CHARGE_RELEASE_A", Voltage, 0x407, High, 0.1, Some("A")),
    u8_def("CELL_OV_ALARM_RELEASE_DELAY_S", Voltage, 0x408, Low, 0.1, Some("s")),
    u8_def("CELL_OV_PROTECT_RELEASE_DELAY_S", Voltage, 0x408, High, 0.1, Some("s")),
    u16_def("NORMAL_CELL_UV_ALARM_V", Voltage, 0x409, 0.001, Some("V")),
    u16_def("NORMAL_CELL_UV_PROTECT_V", Voltage, 0x40A, 0.001, Some("V")),
    u16_def("LOW_TEMP_CELL_UV_ALARM_V", Voltage, 0x40B, 0.001, Some("V")),
    u16_def("LOW_TEMP_CELL_UV_PROTECT_V", Voltage, 0x40C, 0.001, Some("V")),
    u8_def("CELL_UV_ALARM_DELAY_S", Voltage, 0x40D, Low, 0.1, Some("s")),
    u8_def("CELL_UV_PROTECT_DELAY_S", Voltage, 0x40E, High, 0.1, Some("s")),
    u16_def("CELL_UV_PROTECT_RELEASE_V", Voltage, 0x40F, 0.001, Some("V")),
    u8_def("CELL_UV_ALARM_RELEASE_DELAY_S", Voltage, 0x410, Low, 0.1, Some("s")),
    u8_def("CELL_UV_PROTECT_RELEASE_DELAY_S", Voltage, 0x410, High, 0.1, Some("s")),
    u16_def("PACK_OV_ALARM_V", Voltage, 0x411, 0.01, Some("V")),
    u16_def("PACK_OV_PROTECT_V", Voltage, 0x412, 0.01, Some("V")),
    u8_def("PACK_OV_PROTECT_DELAY_S", Voltage, 0x413, Low, 0.1, Some("s")),
    u8_def("PACK_OV_ALARM_DELAY_S", Voltage, 0x413, High, 0.1, Some("s")),
    u16_def("PACK_OV_ALARM_RELEASE_V", Voltage, 0x414, 0.01, Some("V")),
    u16_def("PACK_OV_PROTECT_RELEASE_V", Voltage, 0x415, 0.01, Some("V")),
    u8_def("PACK_OV_PROTECT_RELEASE_DELAY_S", Voltage, 0x416, Low, 0.1, Some("s")),
    u8_def("PACK_OV_ALARM_RELEASE_DELAY_S", Voltage, 0x416, High, 0.1, Some("s")),
    u16_def("NORMAL_PACK_UV_ALARM_V", Voltage, 0x417, 0.01, Some("V")),
    u16_def("NORMAL_PACK_UV_PROTECT_V", Voltage, 0x418, 0.01, Some("V")),
    u16_def("LOW_TEMP_PACK_UV_ALARM_V", Voltage, 0x419, 0.01, Some("V")),
    u16_def("LOW_TEMP_PACK_UV_PROTECT_V", Voltage, 0x41A, 0.01, Some("V")),
    u8_def("PACK_UV_ALARM_DELAY_S", Voltage, 0x41B, Low, 0.1, Some("s")),
    u8_def("PACK_UV_PROTECT_DELAY_S", Voltage, 0x41B, High, 0.1, Some("s")),
    u16_def("PACK_UV_ALARM_RELEASE_V", Voltage, 0x41C, 0.01, Some("V")),
    u16_def("PACK_UV_PROTECT_RELEASE_V", Voltage, 0x41D, 0.01, Some("V")),
    u8_def("PACK_UV_ALARM_RELEASE_DELAY_S", Voltage, 0x41E, Low, 0.1, Some("s")),
    u8_def("PACK_UV_PROTECT_RELEASE_DELAY_S", Voltage, 0x41E, High, 0.1, Some("s")),
    // --- Current configuration (0x420~).
    u16_def("CHARGE_OC_PROTECT_SMALL_A", Current, 0x420, 0.1, Some("A")),
    u16_def("CHARGE_OC_PROTECT_LARGE_A", Current, 0x421, 0.1, Some("A")),
    u8_def("CHARGE_OC_ALARM_DELAY_S", Current, 0x422, Low, 1.0, Some("s")),
    u8_def("CHARGE_OC_PROTECT_LARGE_DELAY_S", Current, 0x422, High, 1.0, Some("s")),
    u8_def("CHARGE_OC_PROTECT_SMALL_DELAY_S", Current, 0x423, Low, 1.0, Some("s")),
    u8_def("CHARGE_OC_ALARM_RELEASE_DELAY_S", Current, 0x424, Low, 1.0, Some("s")),
    u8_def("AUTO_RELEASE_TIME_MIN", Current, 0x424, High, 1.0, Some("min")),
    u16_def("CHARGE_OC_ALARM_RELEASE_A", Current, 0x425, 0.1, Some("A")),
    u8_def("DISCHARGE_RELEASE_A", Current, 0x426, Low, 0.1, Some("A")),
    u8_def("AUTO_RELEASE_LOCK_COUNT", Current, 0x426, High, 1.0, Some("count")),
    u16_def("DISCHARGE_OC_ALARM_A", Current, 0x427, 0.1, Some("A")),
    u16_def("DISCHARGE_OC_PROTECT_SMALL_A", Current, 0x428, 0.1, Some("A")),
    u16_def("DISCHARGE_OC_PROTECT_LARGE_A", Current, 0x429, 0.1, Some("A")),
    u8_def("DISCHARGE_OC_ALARM_DELAY_S", Current, 0x42A, Low, 1.0, Some("s")),
    u8_def("DISCHARGE_OC_PROTECT_LARGE_DELAY_S", Current, 0x42A, High, 1.0, Some("s")),
    u8_def("DISCHARGE_OC_PROTECT_SMALL_DELAY_S", Current, 0x42B, Low, 1.0, Some("s")),
    u8_def("DISCHARGE_OC_AUTO_RELEASE_TIME_MIN", Current, 0x42B, High, 1.0, Some("min")),
    u16_def("DISCHARGE_OC_ALARM_RELEASE_A", Current, 0x42C, 0.1, Some("A")),
    u8_def("CHARGE_RELEASE_A", Current, 0x42D, Low, 0.1, Some("A")),
    u8_def("CHARGE_LOCK_COUNT", Current, 0x42D, High, 1.0, Some("count")),
    // --- Temperature configuration (0x438~).
    u8_temp_def("MOS_OT_ALARM_C", Temperature, 0x438, Low),
    u8_temp_def("MOS_OT_PROTECT_C", Temperature, 0x438, High),
    u8_temp_def("MOS_OT_ALARM_RELEASE_C", Temperature, 0x439, Low),
    u8_temp_def("MOS_OT_PROTECT_RELEASE_C", Temperature, 0x439, High),
    u8_def("MOS_OT_ALARM_DELAY_S", Temperature, 0x43A, Low, 1.0, Some("s")),
    u8_def("MOS_OT_PROTECT_DELAY_S", Temperature, 0x43A, High, 1.0, Some("s")),
    u8_def("MOS_OT_ALARM_RELEASE_DELAY_S", Temperature, 0x43B, Low, 1.0, Some("s")),
    u8_def("MOS_OT_PROTECT_RELEASE_DELAY_S", Temperature, 0x43B, High, 1.0, Some("s")),
    u8_temp_def("AMBIENT_OT_ALARM_C", Temperature, 0x43C, Low),
    u8_temp_def("AMBIENT_OT_PROTECT_C", Temperature, 0x43C, High),
    u8_temp_def("AMBIENT_OT_ALARM_RELEASE_C", Temperature, 0x43D, Low),
    u8_temp_def("AMBIENT_OT_PROTECT_RELEASE_C", Temperature, 0x43D, High),
    u8_temp_def("AMBIENT_UT_ALARM_C", Temperature, 0x43E, Low),
    u8_temp_def("AMBIENT_UT_PROTECT_C", Temperature, 0x43E, High),
    u8_temp_def("AMBIENT_UT_ALARM_RELEASE_C", Temperature, 0x43F, Low),
    u8_temp_def("AMBIENT_UT_PROTECT_RELEASE_C", Temperature, 0x43F, High),
    u8_def("AMBIENT_OT_ALARM_DELAY_S", Temperature, 0x440, Low, 1.0, Some("s")),
    u8_def("AMBIENT_OT_PROTECT_DELAY_S", Temperature, 0x440, High, 1.0, Some("s")),
    u8_def("AMBIENT_OT_ALARM_RELEASE_DELAY_S", Temperature, 0x441, Low, 1.0, Some("s")),
    u8_def("AMBIENT_OT_PROTECT_RELEASE_DELAY_S", Temperature, 0x441, High, 1.0, Some("s")),
    u8_temp_def("CHARGE_UT_ALARM_C", Temperature, 0x442, Low),
    u8_temp_def("CHARGE_UT_PROTECT_C", Temperature, 0x442, High),
    u8_temp_def("CHARGE_UT_ALARM_RELEASE_C", Temperature, 0x443, Low),
    u8_temp_def("CHARGE_UT_PROTECT_RELEASE_C", Temperature, 0x443, High),
    u8_temp_def("CHARGE_OT_ALARM_C", Temperature, 0x444, Low),
    u8_temp_def("CHARGE_OT_PROTECT_C", Temperature, 0x444, High),
    u8_temp_def("CHARGE_OT_ALARM_RELEASE_C", Temperature, 0x445, Low),
    u8_temp_def("CHARGE_OT_PROTECT_RELEASE_C", Temperature, 0x445, High),
    u8_def("CHARGE_OT_ALARM_DELAY_S", Temperature, 0x446, Low, 1.0, Some("s")),
    u8_def("CHARGE_OT_PROTECT_DELAY_S", Temperature, 0x446, High, 1.0, Some("s")),
    u8_def("CHARGE_OT_ALARM_RELEASE_DELAY_S", Temperature, 0x447, Low, 1.0, Some("s")),
    u8_def("CHARGE_OT_PROTECT_RELEASE_DELAY_S", Temperature, 0x447, High, 1.0, Some("s")),
    u8_temp_def("DISCHARGE_UT_ALARM_C", Temperature, 0x448, Low),
    u8_temp_def("DISCHARGE_UT_PROTECT_C", Temperature, 0x448, High),
    u8_temp_def("DISCHARGE_UT_ALARM_RELEASE_C", Temperature, 0x449, Low),
    u8_temp_def("DISCHARGE_UT_PROTECT_RELEASE_C", Temperature, 0x449, High),
    u8_temp_def("DISCHARGE_OT_ALARM_C", Temperature, 0x44A, Low),
    u8_temp_def("DISCHARGE_OT_PROTECT_C", Temperature, 0x44A, High),
    u8_temp_def("DISCHARGE_OT_ALARM_RELEASE_C", Temperature, 0x44B, Low),
    u8_temp_def("DISCHARGE_OT_PROTECT_RELEASE_C", Temperature, 0x44C, Low),
    u8_def("DISCHARGE_OT_ALARM_DELAY_S", Temperature, 0x44D, Low, 1.0, Some("s")),
    u8_def("DISCHARGE_OT_PROTECT_DELAY_S", Temperature, 0x44E, Low, 1.0, Some("s")),
    u8_def("DISCHARGE_OT_ALARM_RELEASE_DELAY_S", Temperature, 0x44F, Low, 1.0, Some("s")),
    u8_def("DISCHARGE_OT_PROTECT_RELEASE_DELAY_S", Temperature, 0x450, Low, 1.0, Some("s")),
    u8_temp_def("CELL_OT_ALARM_C", Temperature, 0x451, Low),
    u8_temp_def("CELL_THERMAL_RUNAWAY_C", Temperature, 0x451, High),
    u8_temp_def("CELL_OT_ALARM_RELEASE_C", Temperature, 0x452, Low),
    u8_def("CELL_OT_ALARM_DELAY_S", Temperature, 0x452, High, 1.0, Some("s")),
    u8_def("CELL_OT_ALARM_RELEASE_DELAY_S", Temperature, 0x453, Low, 1.0, Some("s")),
    u8_temp_def("HEAT_CELL_ON_C", Temperature, 0x453, High),
    u8_temp_def("HEAT_CELL_OFF_C", Temperature, 0x454, Low),
    u8_temp_def("HEAT_FILM_PROTECT_C", Temperature, 0x454, High),
    u8_temp_def("HEAT_FILM_PROTECT_RELEASE_C", Temperature, 0x455, Low),
    u8_def("HEAT_ON_DELAY_S", Temperature, 0x455, High, 1.0, Some("s")),
    u8_def("HEAT_OFF_DELAY_S", Temperature, 0x456, Low, 1.0, Some("s")),
    u8_temp_def("POLE_TEMP_PROTECT_C", Temperature, 0x456, High),
    u8_temp_def("POLE_TEMP_PROTECT_RELEASE_C", Temperature, 0x457, Low),
    // --- Other configuration (0x458~).
    u16_def("BALANCE_START_V", Other, 0x458, 0.001, Some("V")),
    u8_def("BALANCE_START_DELTA_V", Other, 0x459, Low, 0.001, Some("V")),
    u8_def("BALANCE_STOP_DELTA_V", Other, 0x45A, Low, 0.001, Some("V")),
    u8_temp_def("BALANCE_DISABLE_HIGH_TEMP_C", Other, 0x45A, High),
    u8_temp_def("BALANCE_DISABLE_LOW_TEMP_C", Other, 0x45B, Low),
    u8_def("DELTA_V_ALARM_THRESHOLD_V", Other, 0x45B, High, 0.01, Some("V")),
    u8_def("DELTA_V_ALARM_RELEASE_V", Other, 0x45C, Low, 0.01, Some("V")),
    u8_def("DELTA_V_PROTECT_THRESHOLD_V", Other, 0x45C, High, 0.01, Some("V")),
    u8_def("DELTA_V_PROTECT_RELEASE_V", Other, 0x45D, Low, 0.01, Some("V")),
    u8_def("DELTA_V_PROTECT_DELAY_S", Other, 0x45D, High, 1.0, Some("s")),
    u8_def("DELTA_V_RELEASE_DELAY_S", Other, 0x45E, Low, 1.0, Some("s")),
    u8_def("TEMP_DIFF_ALARM_THRESHOLD_C", Other, 0x45E, High, 1.0, Some("°C")),
    u8_def("TEMP_DIFF_ALARM_RELEASE_C", Other, 0x45F, Low, 1.0, Some("°C")),
    u8_def("TEMP_DIFF_PROTECT_THRESHOLD_C", Other, 0x45F, High, 1.0, Some("°C")),
    u8_def("TEMP_DIFF_PROTECT_RELEASE_C", Other, 0x460, Low, 1.0, Some("°C")),
    u8_def("TEMP_DIFF_PROTECT_DELAY_S", Other, 0x460, High, 1.0, Some("s")),
    // --- Identification strings.
    str_def("BATTERY_GROUP_ID", StringCat, 0x500, 32),
    str_def("DTU_DOMAIN_PORT", StringCat, 0x53A, 108),
    // --- System registers.
    u16_def("SERIES_COUNT_CONFIG", System, 0x0001, 1.0, None),
    u32_def("DESIGN_CAPACITY_AH", System, 0x0030, 0.001, Some("Ah")),
    u32_def("FULL_CAPACITY_AH", System, 0x0032, 0.001, Some("Ah")),
    u32_def("REMAIN_CAPACITY_AH", System, 0x0034, 0.001, Some("Ah")),
    u16_def("FUNCTION_CONFIG", System, 0x003E, 1.0, None),
];

/// Converts a lowerCamel key back to its canonical UPPER_SNAKE form.
fn camel_to_const(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 8);
    let mut prev_lower_or_digit = false;
    for ch in key.chars() {
        if ch.is_ascii_uppercase() && prev_lower_or_digit {
            out.push('_');
        }
        prev_lower_or_digit = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch.to_ascii_uppercase());
    }
    out
}

fn find_exact(key: &str) -> Option<&'static ParamDef> {
    PARAM_DEFS.iter().find(|def| def.key == key)
}

/// Looks up a definition by canonical key or its lowerCamel derivative.
pub fn lookup(key: &str) -> Option<&'static ParamDef> {
    find_exact(key).or_else(|| find_exact(&camel_to_const(key)))
}

/// All catalogue entries of one category, in table order.
pub fn params_in_category(category: Category) -> impl Iterator<Item = &'static ParamDef> {
    PARAM_DEFS.iter().filter(move |def| def.category == category)
}

/// `round((value - offset) / scale)` before masking to the field width.
pub(crate) fn encode_scaled(value: f64, scale: f64, offset: f64) -> i64 {
    ((value - offset) / scale).round() as i64
}

impl ParamDef {
    /// Decodes this definition from a register window. All-ones sentinel
    /// patterns yield `None`. Status-derived definitions have no register
    /// span and always decode to `None`; read them through
    /// [`StatusField::read`] instead.
    pub fn decode(&self, view: &RegisterView<'_>) -> Result<Option<ParamValue>, ProtocolError> {
        match self.kind {
            ValueKind::U16 {
                address,
                scale,
                offset,
            } => {
                let raw = view.u16(address)?;
                Ok((raw != 0xFFFF).then(|| ParamValue::Number(f64::from(raw) * scale + offset)))
            }
            ValueKind::U32 {
                address,
                scale,
                offset,
            } => {
                let raw = view.u32(address)?;
                Ok((raw != 0xFFFF_FFFF)
                    .then(|| ParamValue::Number(f64::from(raw) * scale + offset)))
            }
            ValueKind::U8 {
                address,
                byte,
                scale,
                offset,
            } => {
                let raw = match byte {
                    ByteSelector::High => view.byte_h(address)?,
                    ByteSelector::Low => view.byte_l(address)?,
                };
                Ok((raw != 0xFF).then(|| ParamValue::Number(f64::from(raw) * scale + offset)))
            }
            ValueKind::Str {
                start_address,
                byte_length,
            } => {
                let bytes = view.bytes(start_address, usize::from(byte_length))?;
                Ok(Some(ParamValue::Text(decode_ascii(&bytes))))
            }
            ValueKind::Status(_) => Ok(None),
        }
    }
}

/// Decodes every address-backed catalogue entry whose full span lies inside
/// the window. Partially covered spans (half a u32, the head of a string)
/// are skipped, never partially decoded.
pub fn decode_in_range(
    start_address: u16,
    registers: &[u16],
) -> Vec<(&'static str, Option<ParamValue>)> {
    if registers.is_empty() {
        return Vec::new();
    }
    let view = RegisterView::new(start_address, registers);
    let range_start = u32::from(start_address);
    let range_end = range_start + registers.len() as u32 - 1;
    PARAM_DEFS
        .iter()
        .filter_map(|def| {
            let (span_start, span_len) = def.kind.span()?;
            let span_start = u32::from(span_start);
            let span_end = span_start + u32::from(span_len) - 1;
            if span_start < range_start || span_end > range_end {
                return None;
            }
            def.decode(&view).ok().map(|value| (def.key, value))
        })
        .collect()
}
