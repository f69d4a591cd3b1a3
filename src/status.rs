//! Decoder for the contiguous status register block.
//!
//! The block starts at a fixed origin; everything from the cell-voltage
//! region onwards is variable-length, positioned by the series count `S` and
//! temperature-sensor count `N` reported in the origin register itself.

use crate::frame::ProtocolError;
use crate::registers::{decode_ascii, RegisterView};
use serde::Serialize;
use std::collections::BTreeMap;

/// Origin of the status register area.
pub const STATUS_BASE_ADDRESS: u16 = 0x100;
/// First cell-voltage register; the end of the fixed block.
pub const CELL_VOLTAGES_ADDRESS: u16 = 0x141;
/// Each identity string field occupies 32 bytes (16 registers).
pub const IDENTITY_STRING_BYTES: usize = 32;
/// The MAC field occupies 10 bytes (5 registers); only the first 6 bytes
/// carry the address.
pub const MAC_FIELD_BYTES: usize = 10;

const IDENTITY_STRING_REGISTERS: u16 = (IDENTITY_STRING_BYTES / 2) as u16;
pub(crate) const MAC_FIELD_REGISTERS: u16 = (MAC_FIELD_BYTES / 2) as u16;

/// Protection bitfield (register 0x12D), bit index to flag name.
pub const PROTECTION_BITS: &[(u8, &str)] = &[
    (0, "charge_mos_fault"),
    (1, "discharge_mos_fault"),
    (2, "pole_temp_over_temp_protection"),
    (3, "anti_reverse_mos_fault"),
    (4, "charge_over_current_protection_lv1"),
    (5, "discharge_over_current_protection_lv1"),
    (6, "short_circuit_protection"),
    (7, "insulation_protection"),
    (8, "cell_over_voltage_protection_lv2"),
    (9, "cell_under_voltage_protection_lv2"),
    (14, "ambient_ntc_invalid"),
    (18, "charge_low_temp_protection_cell"),
    (19, "discharge_low_temp_protection_cell"),
    (20, "cell_under_temp_protection"),
    (21, "cell_over_temp_protection"),
    (23, "discharge_mos_over_temp_protection"),
    (24, "charge_mos_over_temp_protection"),
    (25, "full_charge_protection"),
    (26, "delta_v_protection"),
    (27, "temp_diff_protection"),
    (28, "heating_film_temp_protection"),
    (29, "pack_under_voltage_protection"),
    (30, "pack_over_voltage_protection"),
];

/// Run-state indicator bitfield (register 0x132).
pub const INDICATOR_BITS: &[(u8, &str)] = &[
    (0, "discharging"),
    (1, "charging"),
    (3, "feedback_charging"),
    (4, "charge_current_limited"),
    (5, "discharge_current_limited"),
    (6, "charge_fet_on"),
    (7, "discharge_fet_on"),
    (8, "precharge_fet_on"),
    (9, "anti_reverse_fet_on"),
    (12, "comm_dcdc_output_on"),
    (13, "vibration_sensor_on"),
    (16, "charger_delta_v_detect_on"),
    (17, "gps_power_on"),
    (18, "heating_film_on"),
    (19, "charge_handshake_ok"),
    (20, "discharge_handshake_ok"),
    (23, "cin_plus_connected"),
    (26, "dted_connected"),
    (28, "board_registered"),
    (29, "voltage_calibrating"),
    (30, "zero_current_calibrating"),
    (31, "multi_current_calibrating"),
];

/// Alarm bitfield (register 0x134).
pub const ALARM_BITS: &[(u8, &str)] = &[
    (0, "charge_high_temp_alarm_cell"),
    (1, "discharge_or_idle_high_temp_alarm_cell"),
    (2, "charge_low_temp_alarm_cell"),
    (3, "discharge_or_idle_low_temp_alarm_cell"),
    (4, "thermal_runaway_alarm"),
    (5, "ambient_high_temp_alarm"),
    (6, "ambient_low_temp_alarm"),
    (7, "discharge_mos_high_temp_alarm"),
    (8, "charge_mos_high_temp_alarm"),
    (9, "low_soc_alarm"),
    (10, "cell_over_voltage_alarm"),
    (11, "cell_under_voltage_alarm"),
    (12, "pack_over_voltage_alarm"),
    (13, "pack_under_voltage_alarm"),
    (14, "charge_over_current_alarm"),
    (15, "discharge_over_current_alarm"),
    (16, "delta_v_alarm"),
    (17, "temp_diff_alarm"),
    (18, "insulation_alarm"),
];

/// Production date packed into one word: `year = bits 15..9` (offset from
/// 2000), `month = bits 8..5`, `day = bits 4..0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProductionDate {
    pub raw: u16,
    pub year: u8,
    pub month: u8,
    pub day: u8,
}

impl ProductionDate {
    pub fn from_raw(raw: u16) -> Self {
        Self {
            raw,
            year: ((raw >> 9) & 0x7F) as u8,
            month: ((raw >> 5) & 0x0F) as u8,
            day: (raw & 0x1F) as u8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceMeta {
    pub series_count: u8,
    pub cell_temp_count: u8,
    /// Raw tenths, e.g. 12 -> 1.2.
    pub hardware_version: f64,
    pub software_version: f64,
    pub special_id: u8,
    pub protocol_version: u8,
    pub production_date: ProductionDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyStatus {
    pub design_capacity_mah: u32,
    pub remaining_capacity_mah: u32,
    pub full_capacity_mah: u32,
    pub full_wh: f64,
    pub remaining_wh: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    pub cycle_count: u16,
    pub total_charge_capacity_raw: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingStatus {
    pub max_charge_interval_hours: u16,
    pub current_charge_interval_hours: u16,
    pub discharge_remaining_min: u16,
    pub charge_remaining_min: u16,
    pub charge_count: u16,
    pub discharge_count: u16,
    pub bms_timestamp: u32,
    pub power_on_work_hours: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElectricalStatus {
    pub pack_cell_sum_voltage_v: f64,
    pub v_bat_v: f64,
    pub v_pack_v: f64,
    pub v_load_v: f64,
    pub current_a: f64,
    pub highest_cell_voltage_mv: u16,
    pub lowest_cell_voltage_mv: u16,
    pub avg_cell_voltage_mv: u16,
    pub max_cell_voltage_diff_mv: u16,
    pub highest_cell_index: u8,
    pub lowest_cell_index: u8,
}

/// A temperature extreme: sensor index plus its offset-40 reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TempPoint {
    pub index: u8,
    pub value_c: Option<i16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureStatus {
    pub charge_mos_c: Option<i16>,
    pub discharge_mos_c: Option<i16>,
    pub precharge_mos_c: Option<i16>,
    pub ambient_c: Option<i16>,
    pub heating_film_c: Option<i16>,
    pub pole_c: Option<i16>,
    pub highest: TempPoint,
    pub lowest: TempPoint,
    /// Per-cell sensors, tenths-of-Kelvin encoding, `None` when absent.
    pub cell_temps_c: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellStatus {
    pub voltages_mv: Vec<u16>,
    pub balancing: Vec<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusFlags {
    pub protection: BTreeMap<&'static str, bool>,
    pub indicator: BTreeMap<&'static str, bool>,
    pub alarm: BTreeMap<&'static str, bool>,
    pub custom_status: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub hardware_model: String,
    pub battery_group_id: String,
    pub board_code: String,
    /// 12 uppercase hex digits, `None` when the field is not programmed.
    pub bluetooth_mac: Option<String>,
}

/// Full decoded status record. Rebuilt from a fresh read on every call;
/// never cached, the device state moves continuously.
#[derive(Debug, Clone, Serialize)]
pub struct BmsStatus {
    pub meta: DeviceMeta,
    pub energy: EnergyStatus,
    pub timing: TimingStatus,
    pub electrical: ElectricalStatus,
    pub temperature: TemperatureStatus,
    pub cells: CellStatus,
    pub flags: StatusFlags,
    pub identity: IdentityStatus,
    pub custom_params: Vec<u16>,
}

/// Start addresses of the variable-length region, derived from `(S, N)` by
/// cumulative width: S voltage words, N temperature words, then three
/// 16-register strings and the MAC field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdentityAddresses {
    pub cell_voltages: u16,
    pub cell_temps: u16,
    pub hardware_model: u16,
    pub battery_group_id: u16,
    pub board_code: u16,
    pub bluetooth_mac: u16,
}

pub fn identity_addresses(series_count: u8, cell_temp_count: u8) -> IdentityAddresses {
    let cell_voltages = CELL_VOLTAGES_ADDRESS;
    let cell_temps = cell_voltages + u16::from(series_count);
    let hardware_model = cell_temps + u16::from(cell_temp_count);
    let battery_group_id = hardware_model + IDENTITY_STRING_REGISTERS;
    let board_code = battery_group_id + IDENTITY_STRING_REGISTERS;
    let bluetooth_mac = board_code + IDENTITY_STRING_REGISTERS;
    IdentityAddresses {
        cell_voltages,
        cell_temps,
        hardware_model,
        battery_group_id,
        board_code,
        bluetooth_mac,
    }
}

/// Number of registers from the origin through the end of the MAC field for
/// the given counts.
pub fn status_span_registers(series_count: u8, cell_temp_count: u8) -> u16 {
    let addrs = identity_addresses(series_count, cell_temp_count);
    let last = addrs.bluetooth_mac + MAC_FIELD_REGISTERS - 1;
    last - STATUS_BASE_ADDRESS + 1
}

/// Byte temperature with a fixed -40 offset; 0xFF means "no reading".
fn temp_from_offset_byte(raw: u8) -> Option<i16> {
    (raw != 0xFF).then(|| i16::from(raw) - 40)
}

/// Per-cell temperature word: tenths of Kelvin above 0 degrees (25.0 C is
/// stored as 250 + 2731); 0xFFFF means "no reading". A different encoding
/// from the offset-40 bytes in the fixed block.
fn cell_temp_from_kelvin_tenths(raw: u16) -> Option<f64> {
    (raw != 0xFFFF).then(|| (f64::from(raw) - 2731.0) / 10.0)
}

fn decode_bitfield32(word: u32, mapping: &[(u8, &'static str)]) -> BTreeMap<&'static str, bool> {
    mapping
        .iter()
        .map(|(bit, name)| (*name, word & (1u32 << bit) != 0))
        .collect()
}

fn all_same(bytes: &[u8], value: u8) -> bool {
    bytes.iter().all(|b| *b == value)
}

/// Applies the MAC validity rule to the raw 10-byte field: all-zero or
/// all-ones over the whole field or over its first six bytes means "not
/// programmed". Otherwise the first six bytes are the address, rendered as
/// 12 uppercase hex digits.
pub fn decode_mac_field(bytes: &[u8]) -> Option<String> {
    if all_same(bytes, 0x00) || all_same(bytes, 0xFF) {
        return None;
    }
    let mac = bytes.get(..6)?;
    if all_same(mac, 0x00) || all_same(mac, 0xFF) {
        return None;
    }
    Some(hex_upper(mac))
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Decodes a status window read from [`STATUS_BASE_ADDRESS`]. The window
/// must span through the end of the MAC field for the device's `(S, N)`.
pub fn decode_status(registers: &[u16]) -> Result<BmsStatus, ProtocolError> {
    let view = RegisterView::new(STATUS_BASE_ADDRESS, registers);
    let series_count = view.byte_h(0x100)?;
    let cell_temp_count = view.byte_l(0x100)?;
    log::debug!(
        "decoding status block: series={series_count} temp_sensors={cell_temp_count} window={} regs",
        registers.len()
    );

    let meta = DeviceMeta {
        series_count,
        cell_temp_count,
        hardware_version: f64::from(view.byte_h(0x101)?) / 10.0,
        software_version: f64::from(view.byte_l(0x101)?) / 10.0,
        special_id: view.byte_h(0x102)?,
        protocol_version: view.byte_l(0x102)?,
        production_date: ProductionDate::from_raw(view.u16(0x138)?),
    };

    let energy = EnergyStatus {
        design_capacity_mah: view.u32(0x103)?,
        remaining_capacity_mah: view.u32(0x105)?,
        full_capacity_mah: view.u32(0x107)?,
        full_wh: f64::from(view.u32(0x109)?) * 0.1,
        remaining_wh: f64::from(view.u32(0x10B)?) * 0.1,
        soc_pct: f64::from(view.byte_h(0x10D)?) * 0.5,
        soh_pct: f64::from(view.byte_l(0x10D)?),
        cycle_count: view.u16(0x10E)?,
        total_charge_capacity_raw: view.u32(0x12B)?,
    };

    let timing = TimingStatus {
        max_charge_interval_hours: view.u16(0x10F)?,
        current_charge_interval_hours: view.u16(0x110)?,
        discharge_remaining_min: view.u16(0x111)?,
        charge_remaining_min: view.u16(0x112)?,
        charge_count: view.u16(0x113)?,
        discharge_count: view.u16(0x114)?,
        bms_timestamp: view.u32(0x120)?,
        power_on_work_hours: view.u32(0x129)?,
    };

    let electrical = ElectricalStatus {
        pack_cell_sum_voltage_v: f64::from(view.u16(0x115)?) * 0.1,
        v_bat_v: f64::from(view.u16(0x116)?) * 0.1,
        v_pack_v: f64::from(view.u16(0x117)?) * 0.1,
        v_load_v: f64::from(view.u16(0x118)?) * 0.1,
        // 0.1 mA per bit, signed.
        current_a: f64::from(view.i32(0x119)?) * 0.0001,
        highest_cell_voltage_mv: view.u16(0x122)?,
        lowest_cell_voltage_mv: view.u16(0x123)?,
        avg_cell_voltage_mv: view.u16(0x124)?,
        max_cell_voltage_diff_mv: view.u16(0x125)?,
        highest_cell_index: view.byte_h(0x128)?,
        lowest_cell_index: view.byte_l(0x128)?,
    };

    let addrs = identity_addresses(series_count, cell_temp_count);

    let mut cell_temps_c = Vec::with_capacity(usize::from(cell_temp_count));
    for i in 0..u16::from(cell_temp_count) {
        cell_temps_c.push(cell_temp_from_kelvin_tenths(view.u16(addrs.cell_temps + i)?));
    }

    let temperature = TemperatureStatus {
        charge_mos_c: temp_from_offset_byte(view.byte_h(0x11D)?),
        discharge_mos_c: temp_from_offset_byte(view.byte_l(0x11D)?),
        precharge_mos_c: temp_from_offset_byte(view.byte_h(0x11E)?),
        ambient_c: temp_from_offset_byte(view.byte_l(0x11E)?),
        heating_film_c: temp_from_offset_byte(view.byte_h(0x11F)?),
        pole_c: temp_from_offset_byte(view.byte_l(0x11F)?),
        highest: TempPoint {
            index: view.byte_h(0x126)?,
            value_c: temp_from_offset_byte(view.byte_l(0x126)?),
        },
        lowest: TempPoint {
            index: view.byte_h(0x127)?,
            value_c: temp_from_offset_byte(view.byte_l(0x127)?),
        },
        cell_temps_c,
    };

    let mut voltages_mv = Vec::with_capacity(usize::from(series_count));
    for i in 0..u16::from(series_count) {
        voltages_mv.push(view.u16(addrs.cell_voltages + i)?);
    }

    let balance_lo = view.u16(0x11B)?;
    let balance_hi = view.u16(0x11C)?;
    let balance_word = (u32::from(balance_hi) << 16) | u32::from(balance_lo);
    let balancing = (0..usize::from(series_count).min(32))
        .map(|bit| balance_word & (1 << bit) != 0)
        .collect();

    let cells = CellStatus {
        voltages_mv,
        balancing,
    };

    let flags = StatusFlags {
        protection: decode_bitfield32(view.u32(0x12D)?, PROTECTION_BITS),
        indicator: decode_bitfield32(view.u32(0x132)?, INDICATOR_BITS),
        alarm: decode_bitfield32(view.u32(0x134)?, ALARM_BITS),
        custom_status: view.u32(0x136)?,
    };

    let identity = IdentityStatus {
        hardware_model: decode_ascii(&view.bytes(addrs.hardware_model, IDENTITY_STRING_BYTES)?),
        battery_group_id: decode_ascii(&view.bytes(addrs.battery_group_id, IDENTITY_STRING_BYTES)?),
        board_code: decode_ascii(&view.bytes(addrs.board_code, IDENTITY_STRING_BYTES)?),
        bluetooth_mac: decode_mac_field(&view.bytes(addrs.bluetooth_mac, MAC_FIELD_BYTES)?),
    };

    let mut custom_params = Vec::with_capacity(8);
    for i in 0u16..8 {
        custom_params.push(view.u16(0x139 + i)?);
    }

    Ok(BmsStatus {
        meta,
        energy,
        timing,
        electrical,
        temperature,
        cells,
        flags,
        identity,
        custom_params,
    })
}
