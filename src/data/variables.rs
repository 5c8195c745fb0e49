//! Variable header table.
//!
//! Each record follows the C structure layout from the iRacing SDK:
//! ```c
//! typedef struct irsdk_varHeader
//! {
//!     int type;                           // irsdk_VarType enum value
//!     int offset;                         // offset in bytes from buffer start
//!     int count;                          // number of elements (1 for scalar)
//!     bool countAsTime;
//!     char pad[3];
//!     char name[IRSDK_MAX_STRING];        // 32 bytes
//!     char desc[IRSDK_MAX_DESC];          // 64 bytes
//!     char unit[IRSDK_MAX_STRING];        // 32 bytes
//! } irsdk_varHeader;
//! ```
//!
//! The table is written once by the simulator before it sets the connected
//! status bit, so it is read with a plain copy rather than a seqlock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::header::DataFileHeader;
use crate::memory::SharedRegion;
use crate::{ConnectionError, Result};

const IRSDK_MAX_STRING: usize = 32;
const IRSDK_MAX_DESC: usize = 64;

/// Size of one `irsdk_varHeader` record in bytes
pub const VARIABLE_HEADER_SIZE: usize = 144;

mod record {
    pub const TYPE: usize = 0;
    pub const OFFSET: usize = 4;
    pub const COUNT: usize = 8;
    pub const COUNT_AS_TIME: usize = 12;
    pub const NAME: usize = 16;
    pub const DESC: usize = 48;
    pub const UNIT: usize = 112;
}

/// Telemetry value type. Maps to the SDK's `irsdk_VarType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableType {
    Char,
    Bool,
    Int,
    BitField,
    Float,
    Double,
}

impl VariableType {
    /// Map the numeric SDK type code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(VariableType::Char),
            1 => Some(VariableType::Bool),
            2 => Some(VariableType::Int),
            3 => Some(VariableType::BitField),
            4 => Some(VariableType::Float),
            5 => Some(VariableType::Double),
            _ => None,
        }
    }

    pub const fn code(&self) -> i32 {
        match self {
            VariableType::Char => 0,
            VariableType::Bool => 1,
            VariableType::Int => 2,
            VariableType::BitField => 3,
            VariableType::Float => 4,
            VariableType::Double => 5,
        }
    }

    /// Size in bytes of one element; matches `irsdk_VarTypeBytes`.
    pub const fn size(&self) -> usize {
        match self {
            VariableType::Char | VariableType::Bool => 1,
            VariableType::Int | VariableType::BitField | VariableType::Float => 4,
            VariableType::Double => 8,
        }
    }
}

/// A decoded telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Char(u8),
    Bool(bool),
    Int(i32),
    BitField(u32),
    Float(f32),
    Double(f64),
    Array(Vec<Value>),
}

/// One entry of the variable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableHeader {
    pub name: String,
    pub variable_type: VariableType,
    /// Offset within a data buffer
    pub offset: usize,
    pub count: usize,
    pub count_as_time: bool,
    pub unit: String,
    pub description: String,
}

impl VariableHeader {
    /// Decode one 144-byte record.
    pub fn parse(record_bytes: &[u8]) -> Result<Self> {
        if record_bytes.len() < VARIABLE_HEADER_SIZE {
            return Err(ConnectionError::parse_error(
                "Variable header",
                format!("Record is {} bytes, expected {}", record_bytes.len(), VARIABLE_HEADER_SIZE),
            ));
        }

        let int_at = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&record_bytes[offset..offset + 4]);
            i32::from_le_bytes(word)
        };

        let name = c_string(&record_bytes[record::NAME..record::NAME + IRSDK_MAX_STRING]);
        let code = int_at(record::TYPE);
        let variable_type = VariableType::from_code(code).ok_or_else(|| {
            ConnectionError::parse_error("Variable header", format!("Unknown type {} for {}", code, name))
        })?;

        let offset = int_at(record::OFFSET);
        let count = int_at(record::COUNT);
        if offset < 0 || count < 0 {
            return Err(ConnectionError::parse_error(
                "Variable header",
                format!("{} has offset {} and count {}", name, offset, count),
            ));
        }

        Ok(Self {
            name,
            variable_type,
            offset: offset as usize,
            count: count as usize,
            count_as_time: record_bytes[record::COUNT_AS_TIME] != 0,
            unit: c_string(&record_bytes[record::UNIT..record::UNIT + IRSDK_MAX_STRING]),
            description: c_string(&record_bytes[record::DESC..record::DESC + IRSDK_MAX_DESC]),
        })
    }

    /// Encode this header into a 144-byte record.
    pub fn encode(&self) -> [u8; VARIABLE_HEADER_SIZE] {
        let mut out = [0u8; VARIABLE_HEADER_SIZE];
        out[record::TYPE..record::TYPE + 4].copy_from_slice(&self.variable_type.code().to_le_bytes());
        out[record::OFFSET..record::OFFSET + 4].copy_from_slice(&(self.offset as i32).to_le_bytes());
        out[record::COUNT..record::COUNT + 4].copy_from_slice(&(self.count as i32).to_le_bytes());
        out[record::COUNT_AS_TIME] = self.count_as_time as u8;
        put_c_string(&mut out[record::NAME..record::NAME + IRSDK_MAX_STRING], &self.name);
        put_c_string(&mut out[record::DESC..record::DESC + IRSDK_MAX_DESC], &self.description);
        put_c_string(&mut out[record::UNIT..record::UNIT + IRSDK_MAX_STRING], &self.unit);
        out
    }

    /// Total bytes this variable occupies in a data buffer.
    pub fn byte_len(&self) -> usize {
        self.variable_type.size() * self.count.max(1)
    }

    /// Decode element `index` from a data buffer.
    pub fn value_at(&self, buffer: &[u8], index: usize) -> Result<Value> {
        if index >= self.count.max(1) {
            return Err(ConnectionError::parse_error(
                "Variable value",
                format!("Index {} out of range for {} (count {})", index, self.name, self.count),
            ));
        }

        let size = self.variable_type.size();
        let start = self.offset + index * size;
        let bytes = buffer
            .get(start..start + size)
            .ok_or_else(|| ConnectionError::memory_access_error(start))?;

        let mut word = [0u8; 4];
        let value = match self.variable_type {
            VariableType::Char => Value::Char(bytes[0]),
            VariableType::Bool => Value::Bool(bytes[0] != 0),
            VariableType::Int => {
                word.copy_from_slice(bytes);
                Value::Int(i32::from_le_bytes(word))
            }
            VariableType::BitField => {
                word.copy_from_slice(bytes);
                Value::BitField(u32::from_le_bytes(word))
            }
            VariableType::Float => {
                word.copy_from_slice(bytes);
                Value::Float(f32::from_le_bytes(word))
            }
            VariableType::Double => {
                let mut long = [0u8; 8];
                long.copy_from_slice(bytes);
                Value::Double(f64::from_le_bytes(long))
            }
        };
        Ok(value)
    }

    /// Decode the variable, returning an `Array` for multi-element entries.
    pub fn value(&self, buffer: &[u8]) -> Result<Value> {
        if self.count <= 1 {
            return self.value_at(buffer, 0);
        }
        (0..self.count).map(|index| self.value_at(buffer, index)).collect::<Result<_>>().map(Value::Array)
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].iter().map(|&b| b as char).collect()
}

fn put_c_string(dst: &mut [u8], text: &str) {
    // Last byte stays NUL.
    let capacity = dst.len().saturating_sub(1);
    for (slot, ch) in dst.iter_mut().take(capacity).zip(text.chars()) {
        *slot = if (ch as u32) < 0x100 { ch as u8 } else { b'?' };
    }
}

/// The simulator's variable table with name lookup.
#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    variables: Vec<VariableHeader>,
    by_name: HashMap<String, usize>,
}

impl VariableTable {
    /// Read `header.variable_count` records from `region`.
    pub fn read(region: &dyn SharedRegion, header: &DataFileHeader) -> Result<Self> {
        let count = header.variable_count.max(0) as usize;
        let start = header.variable_header_offset.max(0) as usize;

        let len = count
            .checked_mul(VARIABLE_HEADER_SIZE)
            .filter(|len| start.checked_add(*len).is_some_and(|end| end <= region.len()))
            .ok_or_else(|| ConnectionError::memory_access_error(start))?;

        let mut raw = vec![0u8; len];
        region.copy_into(start, &mut raw)?;

        let mut variables = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(VARIABLE_HEADER_SIZE) {
            let variable = VariableHeader::parse(chunk)?;
            if variable.offset + variable.byte_len() > header.buffer_length.max(0) as usize {
                warn!(
                    name = %variable.name,
                    offset = variable.offset,
                    buffer_length = header.buffer_length,
                    "Variable extends past the data buffer"
                );
            }
            variables.push(variable);
        }

        debug!(count = variables.len(), "Read variable table");
        Ok(Self::from_headers(variables))
    }

    pub fn from_headers(variables: Vec<VariableHeader>) -> Self {
        let by_name = variables.iter().enumerate().map(|(i, v)| (v.name.clone(), i)).collect();
        Self { variables, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&VariableHeader> {
        self.by_name.get(name).map(|&index| &self.variables[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableHeader> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Decode the named variable from a data buffer.
    pub fn value(&self, name: &str, buffer: &[u8]) -> Result<Value> {
        self.get(name)
            .ok_or_else(|| ConnectionError::parse_error("Variable lookup", format!("Unknown variable {}", name)))?
            .value(buffer)
    }
}
