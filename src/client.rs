//! High-level client for one BMS controller behind a request transport.
//!
//! Every public operation is one or more encode → request → parse →
//! validate round-trips, issued strictly in sequence (the device is a
//! half-duplex single slave). Nothing is retried here; retry policy belongs
//! to the transport or the caller.

use crate::error::Error;
use crate::frame::{
    build_read_frame, build_write_frame, parse_frame, split_registers_be, ParsedFrame,
    ProtocolError, FUNC_READ_HOLDING_REGISTERS, FUNC_READ_UUID, FUNC_WRITE_MULTIPLE_REGISTERS,
    HOST_ADDRESS, MAX_REGISTERS_PER_FRAME,
};
use crate::params::{
    self, encode_scaled, Access, ByteSelector, Category, ParamDef, ParamValue, ValueKind,
};
use crate::registers::{decode_ascii, encode_ascii_fixed, RegisterView};
use crate::status::{
    decode_mac_field, decode_status, identity_addresses, status_span_registers, BmsStatus,
    IDENTITY_STRING_BYTES, MAC_FIELD_BYTES, MAC_FIELD_REGISTERS, STATUS_BASE_ADDRESS,
};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Register holding the 32-bit epoch used by the time sync command.
pub const TIME_SYNC_ADDRESS: u16 = 0x57C;
/// Peripheral address of the external meter taking the MAC configuration.
pub const DEFAULT_METER_ADDRESS: u8 = 0xFC;

const UUID_REGISTER_COUNT: u16 = 8;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target_address: u8,
    pub source_address: u8,
    /// Per-frame register ceiling for chunked reads.
    pub max_read_registers: u16,
    /// Per-frame register ceiling for chunked writes.
    pub max_write_registers: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_address: 0x01,
            source_address: HOST_ADDRESS,
            max_read_registers: MAX_REGISTERS_PER_FRAME as u16,
            max_write_registers: MAX_REGISTERS_PER_FRAME as u16,
        }
    }
}

/// A six-byte MAC address, accepted as raw bytes or a separator-delimited
/// hex literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mac([u8; 6]);

impl Mac {
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for Mac {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Mac {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; 6] = bytes.try_into().map_err(|_| ProtocolError::InvalidMac)?;
        Ok(Self(bytes))
    }
}

impl FromStr for Mac {
    type Err = ProtocolError;

    /// Parses `AA:BB:CC:DD:EE:FF` (colon or dash separated).
    fn from_str(text: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = text
            .trim()
            .split(|c| c == ':' || c == '-')
            .filter(|part| !part.is_empty())
            .collect();
        if parts.len() != 6 {
            return Err(ProtocolError::InvalidMac);
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| ProtocolError::InvalidMac)?;
        }
        Ok(Self(bytes))
    }
}

/// Device identity read through the dynamically addressed status-area
/// fields. Empty or unprogrammed fields come back as `None`.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub series_count: u8,
    pub cell_temp_count: u8,
    pub hardware_model: Option<String>,
    pub battery_group_id: Option<String>,
    pub board_code: Option<String>,
    pub bluetooth_mac: Option<String>,
}

fn chunk_ranges(start_address: u16, quantity: u16, max_chunk: u16) -> Vec<(u16, u16)> {
    let mut ranges = Vec::new();
    let mut address = start_address;
    let mut remaining = quantity;
    while remaining > 0 {
        let n = remaining.min(max_chunk);
        ranges.push((address, n));
        address = address.wrapping_add(n);
        remaining -= n;
    }
    ranges
}

fn group_contiguous(addresses: &BTreeSet<u16>) -> Vec<(u16, u16)> {
    let mut ranges: Vec<(u16, u16)> = Vec::new();
    for address in addresses {
        match ranges.last_mut() {
            Some((start, len)) if *start + *len == *address => *len += 1,
            _ => ranges.push((*address, 1)),
        }
    }
    ranges
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

fn require_number(def: &ParamDef, value: &ParamValue) -> Result<f64, Error> {
    value.as_number().ok_or_else(|| Error::InvalidValue {
        key: def.key.to_string(),
        reason: "expected a number".to_string(),
    })
}

pub struct BmsClient<T> {
    transport: T,
    config: ClientConfig,
}

impl<T: Transport> BmsClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    /// Hands the transport back, consuming the client.
    pub fn into_transport(self) -> T {
        self.transport
    }

    async fn round_trip(&mut self, frame: &[u8]) -> Result<ParsedFrame, Error> {
        let response = self.transport.request(frame).await?;
        Ok(parse_frame(&response)?)
    }

    fn expect_read(frame: ParsedFrame) -> Result<Vec<u8>, Error> {
        match frame {
            ParsedFrame::Read { data, .. } => Ok(data),
            ParsedFrame::Error {
                source,
                target,
                function,
                code,
            } => Err(ProtocolError::ErrorResponse {
                src: source,
                target,
                function,
                code,
            }
            .into()),
            ParsedFrame::Write { .. } => {
                Err(ProtocolError::UnexpectedResponse { expected: "read" }.into())
            }
        }
    }

    fn expect_write(frame: ParsedFrame) -> Result<(), Error> {
        match frame {
            ParsedFrame::Write { .. } => Ok(()),
            ParsedFrame::Error {
                source,
                target,
                function,
                code,
            } => Err(ProtocolError::ErrorResponse {
                src: source,
                target,
                function,
                code,
            }
            .into()),
            ParsedFrame::Read { .. } => {
                Err(ProtocolError::UnexpectedResponse { expected: "write" }.into())
            }
        }
    }

    /// Reads a contiguous register range, splitting into frames of at most
    /// `max_read_registers` and concatenating in address order. The first
    /// failing chunk aborts the whole call.
    pub async fn read_registers(
        &mut self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, Error> {
        let mut out = Vec::with_capacity(usize::from(quantity));
        for (address, n) in chunk_ranges(start_address, quantity, self.config.max_read_registers) {
            let request = build_read_frame(
                self.config.source_address,
                self.config.target_address,
                FUNC_READ_HOLDING_REGISTERS,
                address,
                n,
            )?;
            let data = Self::expect_read(self.round_trip(&request).await?)?;
            out.extend(split_registers_be(&data)?);
        }
        Ok(out)
    }

    /// Writes a contiguous register range, chunked like [`Self::read_registers`].
    pub async fn write_registers(
        &mut self,
        start_address: u16,
        values: &[u16],
    ) -> Result<(), Error> {
        let mut offset = 0usize;
        for (address, n) in
            chunk_ranges(start_address, values.len() as u16, self.config.max_write_registers)
        {
            let chunk = &values[offset..offset + usize::from(n)];
            let request = build_write_frame(
                self.config.source_address,
                self.config.target_address,
                FUNC_WRITE_MULTIPLE_REGISTERS,
                address,
                chunk,
            )?;
            Self::expect_write(self.round_trip(&request).await?)?;
            offset += usize::from(n);
        }
        Ok(())
    }

    /// Reads the head register: series count in the high byte, temperature
    /// sensor count in the low byte.
    pub async fn read_series_and_temp_counts(&mut self) -> Result<(u8, u8), Error> {
        let registers = self.read_registers(STATUS_BASE_ADDRESS, 1).await?;
        let word = registers[0];
        let series = (word >> 8) as u8;
        let temps = (word & 0xFF) as u8;
        log::debug!("series/temp counts: s={series} n={temps} (word={word:#06x})");
        Ok((series, temps))
    }

    /// Reads hardware model, battery group id, board code and Bluetooth MAC
    /// in one combined read spanning the whole dynamically addressed
    /// identity region.
    pub async fn read_identity_info(&mut self) -> Result<IdentityInfo, Error> {
        let (series, temps) = self.read_series_and_temp_counts().await?;
        let addrs = identity_addresses(series, temps);
        log::debug!(
            "identity addresses: hw={:#05x} group={:#05x} board={:#05x} mac={:#05x}",
            addrs.hardware_model,
            addrs.battery_group_id,
            addrs.board_code,
            addrs.bluetooth_mac
        );

        // Three 16-register strings plus the 5-register MAC field.
        let quantity = 3 * (IDENTITY_STRING_BYTES as u16 / 2) + MAC_FIELD_REGISTERS;
        let registers = self.read_registers(addrs.hardware_model, quantity).await?;
        let view = RegisterView::new(addrs.hardware_model, &registers);

        let hardware_model = decode_ascii(&view.bytes(addrs.hardware_model, IDENTITY_STRING_BYTES)?);
        let battery_group_id =
            decode_ascii(&view.bytes(addrs.battery_group_id, IDENTITY_STRING_BYTES)?);
        let board_code = decode_ascii(&view.bytes(addrs.board_code, IDENTITY_STRING_BYTES)?);
        let bluetooth_mac = decode_mac_field(&view.bytes(addrs.bluetooth_mac, MAC_FIELD_BYTES)?);

        let info = IdentityInfo {
            series_count: series,
            cell_temp_count: temps,
            hardware_model: non_empty(hardware_model.trim()),
            battery_group_id: non_empty(battery_group_id.trim()),
            board_code: non_empty(board_code.trim()),
            bluetooth_mac,
        };
        log::debug!("identity parsed: {info:?}");
        Ok(info)
    }

    /// Reads and decodes the whole status block, sized by a fresh `(S, N)`
    /// read. The result is never cached.
    pub async fn read_all_status(&mut self) -> Result<BmsStatus, Error> {
        let (series, temps) = self.read_series_and_temp_counts().await?;
        let total = status_span_registers(series, temps);
        let registers = self.read_registers(STATUS_BASE_ADDRESS, total).await?;
        Ok(decode_status(&registers)?)
    }

    /// Reads only the MAC field instead of the whole status block; the full
    /// read is large and slow when the MAC is all that is needed.
    pub async fn read_bluetooth_mac_hex(&mut self) -> Result<Option<String>, Error> {
        let (series, temps) = self.read_series_and_temp_counts().await?;
        let addrs = identity_addresses(series, temps);
        let registers = self
            .read_registers(addrs.bluetooth_mac, MAC_FIELD_REGISTERS)
            .await?;
        let view = RegisterView::new(addrs.bluetooth_mac, &registers);
        Ok(decode_mac_field(&view.bytes(addrs.bluetooth_mac, MAC_FIELD_BYTES)?))
    }

    /// Reads one catalogue parameter in engineering units. Status-derived
    /// keys trigger a full status read.
    pub async fn read_param(&mut self, key: &str) -> Result<Option<ParamValue>, Error> {
        let def = params::lookup(key).ok_or_else(|| Error::UnknownParameter(key.to_string()))?;
        match def.kind {
            ValueKind::Status(field) => {
                let status = self.read_all_status().await?;
                Ok(field.read(&status))
            }
            ValueKind::Str {
                start_address,
                byte_length,
            } => {
                let registers = self
                    .read_registers(start_address, byte_length.div_ceil(2))
                    .await?;
                Ok(def.decode(&RegisterView::new(start_address, &registers))?)
            }
            ValueKind::U32 { address, .. } => {
                let registers = self.read_registers(address, 2).await?;
                Ok(def.decode(&RegisterView::new(address, &registers))?)
            }
            ValueKind::U8 { address, .. } | ValueKind::U16 { address, .. } => {
                let registers = self.read_registers(address, 1).await?;
                Ok(def.decode(&RegisterView::new(address, &registers))?)
            }
        }
    }

    /// Writes one catalogue parameter. For one-byte parameters the shared
    /// register is read first and the sibling byte carried over, unless
    /// `preserve_other_byte` is false (the sibling is then zeroed).
    pub async fn write_param(
        &mut self,
        key: &str,
        value: ParamValue,
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        let def = params::lookup(key).ok_or_else(|| Error::UnknownParameter(key.to_string()))?;
        match def.kind {
            ValueKind::Status(_) => Err(Error::AccessViolation {
                key: def.key.to_string(),
                reason: "status-derived parameters are read-only".to_string(),
            }),
            _ if def.access != Access::ReadWrite => Err(Error::AccessViolation {
                key: def.key.to_string(),
                reason: "parameter is read-only".to_string(),
            }),
            ValueKind::Str {
                start_address,
                byte_length,
            } => {
                let text = value.as_text().ok_or_else(|| Error::InvalidValue {
                    key: def.key.to_string(),
                    reason: "expected a string".to_string(),
                })?;
                let bytes = encode_ascii_fixed(text, usize::from(byte_length));
                let registers = split_registers_be(&bytes)?;
                self.write_registers(start_address, &registers).await
            }
            ValueKind::U32 {
                address,
                scale,
                offset,
            } => {
                let raw = encode_scaled(require_number(def, &value)?, scale, offset) as u32;
                self.write_registers(address, &[(raw >> 16) as u16, (raw & 0xFFFF) as u16])
                    .await
            }
            ValueKind::U16 {
                address,
                scale,
                offset,
            } => {
                let raw = encode_scaled(require_number(def, &value)?, scale, offset) as u16;
                self.write_registers(address, &[raw]).await
            }
            ValueKind::U8 {
                address,
                byte,
                scale,
                offset,
            } => {
                let raw = (encode_scaled(require_number(def, &value)?, scale, offset) & 0xFF) as u8;
                let existing = if preserve_other_byte {
                    self.read_registers(address, 1).await?[0]
                } else {
                    0x0000
                };
                let word = match byte {
                    ByteSelector::High => (u16::from(raw) << 8) | (existing & 0x00FF),
                    ByteSelector::Low => (existing & 0xFF00) | u16::from(raw),
                };
                self.write_registers(address, &[word]).await
            }
        }
    }

    /// Reads a register window and decodes every catalogue entry fully
    /// contained in it.
    pub async fn read_params_by_address_range(
        &mut self,
        start_address: u16,
        quantity: u16,
    ) -> Result<Vec<(&'static str, Option<ParamValue>)>, Error> {
        let registers = self.read_registers(start_address, quantity).await?;
        Ok(params::decode_in_range(start_address, &registers))
    }

    /// Bulk read of one category: a single read over the minimal span
    /// covering its numeric entries, then the string entries one by one.
    pub async fn read_category_params(
        &mut self,
        category: Category,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        let defs: Vec<&'static ParamDef> = params::params_in_category(category).collect();
        let mut out = BTreeMap::new();

        let numeric: Vec<&'static ParamDef> = defs
            .iter()
            .copied()
            .filter(|def| {
                matches!(
                    def.kind,
                    ValueKind::U8 { .. } | ValueKind::U16 { .. } | ValueKind::U32 { .. }
                )
            })
            .collect();
        if !numeric.is_empty() {
            // span() is Some for every numeric kind.
            let spans: Vec<(u16, u16)> = numeric.iter().filter_map(|def| def.kind.span()).collect();
            let min = spans.iter().map(|(start, _)| *start).min().unwrap_or(0);
            let max_end = spans
                .iter()
                .map(|(start, len)| start + len - 1)
                .max()
                .unwrap_or(0);
            let registers = self.read_registers(min, max_end - min + 1).await?;
            let view = RegisterView::new(min, &registers);
            for def in &numeric {
                out.insert(def.key, def.decode(&view)?);
            }
        }

        for def in defs
            .iter()
            .filter(|def| matches!(def.kind, ValueKind::Str { .. }))
        {
            out.insert(def.key, self.read_param(def.key).await?);
        }
        Ok(out)
    }

    /// Bulk write of one category.
    ///
    /// String entries are written immediately. Numeric entries are merged
    /// into per-register words first: two one-byte parameters sharing a
    /// register become a single write. Registers still missing one byte are
    /// fetched in one batched read over contiguous ranges (when preservation
    /// is requested), and the final words are coalesced into
    /// contiguous-address write frames.
    pub async fn write_category_params(
        &mut self,
        category: Category,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        let mut strings: Vec<(&'static ParamDef, &ParamValue)> = Vec::new();
        let mut numeric: Vec<(&'static ParamDef, &ParamValue)> = Vec::new();
        for (key, value) in values {
            let def =
                params::lookup(key).ok_or_else(|| Error::UnknownParameter(key.to_string()))?;
            if def.category != category {
                return Err(Error::AccessViolation {
                    key: def.key.to_string(),
                    reason: format!("not in the {category:?} category"),
                });
            }
            if def.access != Access::ReadWrite || matches!(def.kind, ValueKind::Status(_)) {
                return Err(Error::AccessViolation {
                    key: def.key.to_string(),
                    reason: "parameter is read-only".to_string(),
                });
            }
            if matches!(def.kind, ValueKind::Str { .. }) {
                strings.push((def, value));
            } else {
                numeric.push((def, value));
            }
        }

        for (def, value) in strings {
            self.write_param(def.key, value.clone(), preserve_other_byte)
                .await?;
        }

        let mut reg_writes: BTreeMap<u16, u16> = BTreeMap::new();
        // address -> (high, low); a side stays None until supplied by the
        // caller or read back from the device.
        let mut byte_writes: BTreeMap<u16, (Option<u8>, Option<u8>)> = BTreeMap::new();
        for (def, value) in numeric {
            let number = require_number(def, value)?;
            match def.kind {
                ValueKind::U16 {
                    address,
                    scale,
                    offset,
                } => {
                    reg_writes.insert(address, encode_scaled(number, scale, offset) as u16);
                }
                ValueKind::U32 {
                    address,
                    scale,
                    offset,
                } => {
                    let raw = encode_scaled(number, scale, offset) as u32;
                    reg_writes.insert(address, (raw >> 16) as u16);
                    reg_writes.insert(address + 1, (raw & 0xFFFF) as u16);
                }
                ValueKind::U8 {
                    address,
                    byte,
                    scale,
                    offset,
                } => {
                    let raw = (encode_scaled(number, scale, offset) & 0xFF) as u8;
                    let entry = byte_writes.entry(address).or_default();
                    match byte {
                        ByteSelector::High => entry.0 = Some(raw),
                        ByteSelector::Low => entry.1 = Some(raw),
                    }
                }
                ValueKind::Str { .. } | ValueKind::Status(_) => {}
            }
        }

        if preserve_other_byte {
            let need_read: BTreeSet<u16> = byte_writes
                .iter()
                .filter(|(_, (high, low))| high.is_none() || low.is_none())
                .map(|(address, _)| *address)
                .collect();
            for (range_start, range_len) in group_contiguous(&need_read) {
                let registers = self.read_registers(range_start, range_len).await?;
                for (i, existing) in registers.iter().enumerate() {
                    let address = range_start + i as u16;
                    if let Some((high, low)) = byte_writes.get_mut(&address) {
                        if high.is_none() {
                            *high = Some((existing >> 8) as u8);
                        }
                        if low.is_none() {
                            *low = Some((existing & 0xFF) as u8);
                        }
                    }
                }
            }
        }

        for (address, (high, low)) in byte_writes {
            let word = (u16::from(high.unwrap_or(0)) << 8) | u16::from(low.unwrap_or(0));
            reg_writes.insert(address, word);
        }
        if reg_writes.is_empty() {
            return Ok(());
        }

        // Coalesce contiguous addresses into single write frames.
        let mut runs: Vec<(u16, Vec<u16>)> = Vec::new();
        for (address, word) in reg_writes {
            match runs.last_mut() {
                Some((start, words)) if *start + words.len() as u16 == address => words.push(word),
                _ => runs.push((address, vec![word])),
            }
        }
        for (start, words) in runs {
            self.write_registers(start, &words).await?;
        }
        Ok(())
    }

    pub async fn read_voltage_params(
        &mut self,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        self.read_category_params(Category::Voltage).await
    }

    pub async fn write_voltage_params(
        &mut self,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        self.write_category_params(Category::Voltage, values, preserve_other_byte)
            .await
    }

    pub async fn read_current_params(
        &mut self,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        self.read_category_params(Category::Current).await
    }

    pub async fn write_current_params(
        &mut self,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        self.write_category_params(Category::Current, values, preserve_other_byte)
            .await
    }

    pub async fn read_temperature_params(
        &mut self,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        self.read_category_params(Category::Temperature).await
    }

    pub async fn write_temperature_params(
        &mut self,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        self.write_category_params(Category::Temperature, values, preserve_other_byte)
            .await
    }

    pub async fn read_other_params(
        &mut self,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        self.read_category_params(Category::Other).await
    }

    pub async fn write_other_params(
        &mut self,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        self.write_category_params(Category::Other, values, preserve_other_byte)
            .await
    }

    pub async fn read_system_params(
        &mut self,
    ) -> Result<BTreeMap<&'static str, Option<ParamValue>>, Error> {
        self.read_category_params(Category::System).await
    }

    pub async fn write_system_params(
        &mut self,
        values: &[(&str, ParamValue)],
        preserve_other_byte: bool,
    ) -> Result<(), Error> {
        self.write_category_params(Category::System, values, preserve_other_byte)
            .await
    }

    /// Reads the 16-byte board UUID through the extended read function.
    pub async fn read_uuid(&mut self) -> Result<String, Error> {
        let request = build_read_frame(
            self.config.source_address,
            self.config.target_address,
            FUNC_READ_UUID,
            0x0000,
            UUID_REGISTER_COUNT,
        )?;
        let data = Self::expect_read(self.round_trip(&request).await?)?;
        Ok(data.iter().map(|byte| format!("{byte:02x}")).collect())
    }

    /// Writes a 32-bit epoch timestamp to the device clock register.
    pub async fn sync_time(&mut self, epoch_seconds: u32) -> Result<(), Error> {
        self.write_registers(
            TIME_SYNC_ADDRESS,
            &[(epoch_seconds >> 16) as u16, (epoch_seconds & 0xFFFF) as u16],
        )
        .await
    }

    /// Programs the external meter's MAC: three registers at address zero of
    /// the meter's own bus address, not the BMS target address.
    pub async fn configure_meter_mac(&mut self, meter_address: u8, mac: Mac) -> Result<(), Error> {
        let bytes = mac.bytes();
        let registers = [
            u16::from_be_bytes([bytes[0], bytes[1]]),
            u16::from_be_bytes([bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
        ];
        let request = build_write_frame(
            self.config.source_address,
            meter_address,
            FUNC_WRITE_MULTIPLE_REGISTERS,
            0x0000,
            &registers,
        )?;
        Self::expect_write(self.round_trip(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::{build_error_reply, build_read_reply, build_write_ack};
    use crate::frame::join_registers_be;
    use crate::status::identity_addresses;
    use crate::transport::TransportError;

    /// Scripted device: a register memory plus a log of every request frame
    /// received, answering the way the controller does (addresses swapped).
    #[derive(Default)]
    struct DeviceSim {
        memory: BTreeMap<u16, u16>,
        requests: Vec<Vec<u8>>,
        error_code: Option<u8>,
        wrong_reply_type: bool,
    }

    impl DeviceSim {
        fn load(&mut self, start_address: u16, values: &[u16]) {
            for (i, value) in values.iter().enumerate() {
                self.memory.insert(start_address + i as u16, *value);
            }
        }

        fn read_frames(&self) -> Vec<(u16, u16)> {
            self.requests
                .iter()
                .filter(|f| f[4] == FUNC_READ_HOLDING_REGISTERS)
                .map(|f| {
                    (
                        u16::from_be_bytes([f[5], f[6]]),
                        u16::from_be_bytes([f[7], f[8]]),
                    )
                })
                .collect()
        }

        fn write_frames(&self) -> Vec<(u16, Vec<u16>)> {
            self.requests
                .iter()
                .filter(|f| f[4] == FUNC_WRITE_MULTIPLE_REGISTERS)
                .map(|f| {
                    let address = u16::from_be_bytes([f[5], f[6]]);
                    let count = usize::from(f[9]);
                    let words = split_registers_be(&f[10..10 + count]).unwrap();
                    (address, words)
                })
                .collect()
        }
    }

    impl Transport for DeviceSim {
        async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.requests.push(frame.to_vec());
            let source = frame[2];
            let target = frame[3];
            let function = frame[4];
            if let Some(code) = self.error_code {
                return Ok(build_error_reply(target, source, function, code));
            }
            match function {
                FUNC_READ_HOLDING_REGISTERS => {
                    let address = u16::from_be_bytes([frame[5], frame[6]]);
                    let quantity = u16::from_be_bytes([frame[7], frame[8]]);
                    if self.wrong_reply_type {
                        return Ok(build_write_ack(
                            target,
                            source,
                            FUNC_WRITE_MULTIPLE_REGISTERS,
                            address,
                            quantity,
                        ));
                    }
                    let words: Vec<u16> = (0..quantity)
                        .map(|i| *self.memory.get(&(address + i)).unwrap_or(&0))
                        .collect();
                    Ok(build_read_reply(
                        target,
                        source,
                        function,
                        &join_registers_be(&words),
                    ))
                }
                FUNC_READ_UUID => {
                    Ok(build_read_reply(target, source, function, &[0xA5; 16]))
                }
                FUNC_WRITE_MULTIPLE_REGISTERS => {
                    let address = u16::from_be_bytes([frame[5], frame[6]]);
                    let quantity = u16::from_be_bytes([frame[7], frame[8]]);
                    let count = usize::from(frame[9]);
                    let words = split_registers_be(&frame[10..10 + count]).unwrap();
                    for (i, word) in words.iter().enumerate() {
                        self.memory.insert(address + i as u16, *word);
                    }
                    Ok(build_write_ack(target, source, function, address, quantity))
                }
                _ => Ok(build_error_reply(target, source, function, 0x01)),
            }
        }
    }

    fn client(sim: DeviceSim) -> BmsClient<DeviceSim> {
        BmsClient::new(sim)
    }

    fn small_chunk_client(sim: DeviceSim, max: u16) -> BmsClient<DeviceSim> {
        BmsClient::with_config(
            sim,
            ClientConfig {
                max_read_registers: max,
                max_write_registers: max,
                ..ClientConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn chunked_read_matches_single_read() {
        let data: Vec<u16> = (0..10).map(|i| 0x1000 + i).collect();

        let mut sim = DeviceSim::default();
        sim.load(0x200, &data);
        let mut whole = client(sim);
        let expected = whole.read_registers(0x200, 10).await.unwrap();

        let mut sim = DeviceSim::default();
        sim.load(0x200, &data);
        let mut chunked = small_chunk_client(sim, 4);
        let result = chunked.read_registers(0x200, 10).await.unwrap();

        assert_eq!(result, expected);
        assert_eq!(result, data);
        let sim = chunked.into_transport();
        assert_eq!(sim.read_frames(), vec![(0x200, 4), (0x204, 4), (0x208, 2)]);
    }

    #[tokio::test]
    async fn chunked_write_splits_in_address_order() {
        let values: Vec<u16> = (0..7).collect();
        let mut c = small_chunk_client(DeviceSim::default(), 3);
        c.write_registers(0x400, &values).await.unwrap();
        let sim = c.into_transport();
        assert_eq!(
            sim.write_frames(),
            vec![
                (0x400, vec![0, 1, 2]),
                (0x403, vec![3, 4, 5]),
                (0x406, vec![6]),
            ]
        );
        assert_eq!(sim.memory.get(&0x406), Some(&6));
    }

    #[tokio::test]
    async fn device_error_frame_aborts_the_call() {
        let mut sim = DeviceSim::default();
        sim.error_code = Some(0x02);
        let mut c = client(sim);
        let err = c.read_registers(0x100, 2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ErrorResponse { code: 0x02, .. })
        ));
    }

    #[tokio::test]
    async fn wrong_reply_type_is_a_distinct_error() {
        let mut sim = DeviceSim::default();
        sim.wrong_reply_type = true;
        let mut c = client(sim);
        let err = c.read_registers(0x100, 2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedResponse { expected: "read" })
        ));
    }

    #[tokio::test]
    async fn reads_series_and_temp_counts() {
        let mut sim = DeviceSim::default();
        sim.load(0x100, &[0x1004]);
        let mut c = client(sim);
        assert_eq!(c.read_series_and_temp_counts().await.unwrap(), (16, 4));
    }

    fn load_identity(sim: &mut DeviceSim, series: u8, temps: u8) {
        sim.load(0x100, &[(u16::from(series) << 8) | u16::from(temps)]);
        let addrs = identity_addresses(series, temps);
        // "PK-48100" as the hardware model.
        sim.load(addrs.hardware_model, &[0x504B, 0x2D34, 0x3831, 0x3030]);
        sim.load(addrs.bluetooth_mac, &[0xA1B2, 0xC3D4, 0xE5F6]);
    }

    #[tokio::test]
    async fn identity_info_uses_one_combined_read() {
        let mut sim = DeviceSim::default();
        load_identity(&mut sim, 16, 4);
        let mut c = client(sim);
        let info = c.read_identity_info().await.unwrap();
        assert_eq!(info.series_count, 16);
        assert_eq!(info.cell_temp_count, 4);
        assert_eq!(info.hardware_model.as_deref(), Some("PK-48100"));
        assert_eq!(info.battery_group_id, None);
        assert_eq!(info.board_code, None);
        assert_eq!(info.bluetooth_mac.as_deref(), Some("A1B2C3D4E5F6"));

        let sim = c.into_transport();
        // One head read, then one 53-register read at the hw-model address.
        assert_eq!(sim.read_frames(), vec![(0x100, 1), (0x155, 53)]);
    }

    #[tokio::test]
    async fn bluetooth_mac_read_avoids_the_full_status_span() {
        let mut sim = DeviceSim::default();
        load_identity(&mut sim, 16, 4);
        let mut c = client(sim);
        let mac = c.read_bluetooth_mac_hex().await.unwrap();
        assert_eq!(mac.as_deref(), Some("A1B2C3D4E5F6"));
        let sim = c.into_transport();
        assert_eq!(sim.read_frames(), vec![(0x100, 1), (0x185, 5)]);
    }

    #[tokio::test]
    async fn unprogrammed_mac_reads_as_none() {
        let mut sim = DeviceSim::default();
        sim.load(0x100, &[(2 << 8) | 1]);
        let addrs = identity_addresses(2, 1);
        sim.load(addrs.bluetooth_mac, &[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF]);
        let mut c = client(sim);
        assert_eq!(c.read_bluetooth_mac_hex().await.unwrap(), None);
    }

    #[tokio::test]
    async fn full_status_read_spans_origin_to_mac() {
        let mut sim = DeviceSim::default();
        sim.load(0x100, &[(4 << 8) | 2]);
        let addrs = identity_addresses(4, 2);
        sim.load(addrs.cell_voltages, &[3301, 3302, 3303, 3304]);
        let mut c = client(sim);
        let status = c.read_all_status().await.unwrap();
        assert_eq!(status.meta.series_count, 4);
        assert_eq!(status.cells.voltages_mv, vec![3301, 3302, 3303, 3304]);
        let sim = c.into_transport();
        // 124 registers for (4, 2): the span itself gets chunked.
        let total = status_span_registers(4, 2);
        let mut expected = vec![(0x100, 1)];
        expected.extend(chunk_ranges(0x100, total, MAX_REGISTERS_PER_FRAME as u16));
        assert_eq!(sim.read_frames(), expected);
    }

    #[tokio::test]
    async fn read_param_dispatches_by_kind() {
        let mut sim = DeviceSim::default();
        sim.load(0x400, &[3350]);
        sim.load(0x0030, &[0x0000, 0x2710]);
        // "GRP-7" in the battery-group string field.
        sim.load(0x500, &[0x4752, 0x502D, 0x3700]);
        let mut c = client(sim);

        assert_eq!(
            c.read_param("CELL_OV_ALARM_V").await.unwrap(),
            Some(ParamValue::Number(3.35))
        );
        assert_eq!(
            c.read_param("designCapacityAh").await.unwrap(),
            Some(ParamValue::Number(10.0))
        );
        assert_eq!(
            c.read_param("BATTERY_GROUP_ID").await.unwrap(),
            Some(ParamValue::Text("GRP-7".to_string()))
        );
        assert!(matches!(
            c.read_param("NO_SUCH_KEY").await,
            Err(Error::UnknownParameter(_))
        ));
    }

    #[tokio::test]
    async fn status_param_read_triggers_full_status_read() {
        let mut sim = DeviceSim::default();
        sim.load(0x100, &[(2 << 8) | 1]);
        sim.load(0x10D, &[(140 << 8) | 95]);
        let mut c = client(sim);
        assert_eq!(
            c.read_param("SOC_PCT").await.unwrap(),
            Some(ParamValue::Number(70.0))
        );
        let sim = c.into_transport();
        let total = status_span_registers(2, 1);
        let mut expected = vec![(0x100, 1)];
        expected.extend(chunk_ranges(0x100, total, MAX_REGISTERS_PER_FRAME as u16));
        assert_eq!(sim.read_frames(), expected);
    }

    #[tokio::test]
    async fn u8_write_preserves_the_sibling_byte() {
        let mut sim = DeviceSim::default();
        sim.load(0x402, &[0xAB12]);
        let mut c = client(sim);
        // Low-byte parameter at 0.1 s resolution: 5.0 s -> raw 50.
        c.write_param("CELL_OC_ALARM_DELAY_S", ParamValue::Number(5.0), true)
            .await
            .unwrap();
        let sim = c.into_transport();
        assert_eq!(sim.read_frames(), vec![(0x402, 1)]);
        assert_eq!(sim.write_frames(), vec![(0x402, vec![0xAB32])]);
        assert_eq!(sim.memory[&0x402], 0xAB32);
    }

    #[tokio::test]
    async fn u8_write_without_preservation_zeroes_the_sibling() {
        let mut sim = DeviceSim::default();
        sim.load(0x402, &[0xAB12]);
        let mut c = client(sim);
        c.write_param("CELL_OC_ALARM_DELAY_S", ParamValue::Number(5.0), false)
            .await
            .unwrap();
        let sim = c.into_transport();
        assert_eq!(sim.read_frames(), Vec::<(u16, u16)>::new());
        assert_eq!(sim.memory[&0x402], 0x0032);
    }

    #[tokio::test]
    async fn write_param_rejects_read_only_and_status_keys() {
        let mut c = client(DeviceSim::default());
        assert!(matches!(
            c.write_param("SOC_PCT", ParamValue::Number(50.0), true).await,
            Err(Error::AccessViolation { .. })
        ));
        assert!(matches!(
            c.write_param("socPct", ParamValue::Number(50.0), true).await,
            Err(Error::AccessViolation { .. })
        ));
    }

    #[tokio::test]
    async fn category_set_merges_shared_register_bytes_into_one_write() {
        let mut c = client(DeviceSim::default());
        c.write_voltage_params(
            &[
                ("CELL_OC_ALARM_DELAY_S", ParamValue::Number(5.0)),
                ("CELL_OC_PROTECT_DELAY_S", ParamValue::Number(8.0)),
            ],
            true,
        )
        .await
        .unwrap();
        let sim = c.into_transport();
        // Both halves supplied: no read-before-write, exactly one register
        // write combining the two bytes.
        assert_eq!(sim.read_frames(), Vec::<(u16, u16)>::new());
        assert_eq!(sim.write_frames(), vec![(0x402, vec![(80 << 8) | 50])]);
    }

    #[tokio::test]
    async fn category_set_batches_reads_for_half_written_registers() {
        let mut sim = DeviceSim::default();
        sim.load(0x402, &[0x6312]);
        let mut c = client(sim);
        c.write_voltage_params(&[("CELL_OC_ALARM_DELAY_S", ParamValue::Number(5.0))], true)
            .await
            .unwrap();
        let sim = c.into_transport();
        assert_eq!(sim.read_frames(), vec![(0x402, 1)]);
        assert_eq!(sim.write_frames(), vec![(0x402, vec![0x6332])]);
    }

    #[tokio::test]
    async fn category_set_coalesces_contiguous_registers() {
        let mut c = client(DeviceSim::default());
        c.write_voltage_params(
            &[
                ("CELL_OV_ALARM_V", ParamValue::Number(3.45)),
                ("CELL_OC_PROTECT_V", ParamValue::Number(3.55)),
            ],
            true,
        )
        .await
        .unwrap();
        let sim = c.into_transport();
        assert_eq!(sim.write_frames(), vec![(0x400, vec![3450, 3550])]);
    }

    #[tokio::test]
    async fn category_set_rejects_foreign_keys() {
        let mut c = client(DeviceSim::default());
        let err = c
            .write_voltage_params(
                &[("CHARGE_OC_PROTECT_SMALL_A", ParamValue::Number(10.0))],
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessViolation { .. }));
        // Nothing reached the wire.
        let sim = c.into_transport();
        assert!(sim.requests.is_empty());
    }

    #[tokio::test]
    async fn category_get_uses_one_span_read_for_numerics() {
        let mut sim = DeviceSim::default();
        sim.load(0x420, &[100, 200]);
        let mut c = client(sim);
        let values = c.read_current_params().await.unwrap();
        assert_eq!(
            values["CHARGE_OC_PROTECT_SMALL_A"],
            Some(ParamValue::Number(10.0))
        );
        assert_eq!(
            values["CHARGE_OC_PROTECT_LARGE_A"],
            Some(ParamValue::Number(20.0))
        );
        let sim = c.into_transport();
        // One read spanning 0x420..=0x42D.
        assert_eq!(sim.read_frames(), vec![(0x420, 14)]);
    }

    #[tokio::test]
    async fn uuid_read_uses_the_extended_function() {
        let mut c = client(DeviceSim::default());
        let uuid = c.read_uuid().await.unwrap();
        assert_eq!(uuid, "a5".repeat(16));
        let sim = c.into_transport();
        assert_eq!(sim.requests.len(), 1);
        assert_eq!(sim.requests[0][4], FUNC_READ_UUID);
    }

    #[tokio::test]
    async fn time_sync_writes_big_endian_epoch() {
        let mut c = client(DeviceSim::default());
        c.sync_time(0x1234_5678).await.unwrap();
        let sim = c.into_transport();
        assert_eq!(sim.write_frames(), vec![(TIME_SYNC_ADDRESS, vec![0x1234, 0x5678])]);
    }

    #[tokio::test]
    async fn meter_mac_goes_to_the_peripheral_address() {
        let mut c = client(DeviceSim::default());
        let mac: Mac = "A1:B2:C3:D4:E5:F6".parse().unwrap();
        c.configure_meter_mac(DEFAULT_METER_ADDRESS, mac).await.unwrap();
        let sim = c.into_transport();
        let frame = &sim.requests[0];
        assert_eq!(frame[3], DEFAULT_METER_ADDRESS);
        assert_eq!(frame[4], FUNC_WRITE_MULTIPLE_REGISTERS);
        assert_eq!(sim.write_frames(), vec![(0x0000, vec![0xA1B2, 0xC3D4, 0xE5F6])]);
    }

    #[test]
    fn mac_parsing_accepts_common_forms() {
        let expected = Mac::from([0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
        assert_eq!("A1:B2:C3:D4:E5:F6".parse::<Mac>().unwrap(), expected);
        assert_eq!("a1-b2-c3-d4-e5-f6".parse::<Mac>().unwrap(), expected);
        assert_eq!(
            Mac::try_from(&[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6][..]).unwrap(),
            expected
        );
        assert!("A1:B2:C3".parse::<Mac>().is_err());
        assert!("A1:B2:C3:D4:E5:GG".parse::<Mac>().is_err());
        assert!(Mac::try_from(&[0u8; 5][..]).is_err());
    }

    #[tokio::test]
    async fn range_read_decodes_contained_params_only() {
        let mut sim = DeviceSim::default();
        sim.load(0x400, &[3350, 3400]);
        let mut c = client(sim);
        let decoded = c.read_params_by_address_range(0x400, 2).await.unwrap();
        let map: BTreeMap<_, _> = decoded.into_iter().collect();
        assert_eq!(map["CELL_OV_ALARM_V"], Some(ParamValue::Number(3.35)));
        assert_eq!(map["CELL_OC_PROTECT_V"], Some(ParamValue::Number(3.4)));
        assert!(!map.contains_key("CELL_OC_ALARM_DELAY_S"));
    }
}
