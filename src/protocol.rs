//! Modbus protocol definitions and data structures
//!
//! Function codes, exception codes, the wire framing selector and the server-side
//! request/response PDUs. Framing (MBAP header or RTU address + CRC) is handled by
//! the wire server; everything here works on bare PDUs (function code + data).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModbusError, ModbusResult};
use crate::utils::bits;
use crate::{
    MAX_COILS_PER_REQUEST, MAX_REGISTERS_PER_REQUEST, MAX_WRITE_COILS_PER_REQUEST,
    MAX_WRITE_REGISTERS_PER_REQUEST,
};

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ModbusException {
    /// Map a core error onto the exception a wire client should see
    pub fn from_error(err: &ModbusError) -> Self {
        match err.exception_code() {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            _ => ModbusException::ServerDeviceFailure,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Framing used by the wire server
///
/// Chosen when the server is constructed. It only changes how requests are framed on
/// the socket; the register bank semantics are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// MBAP header + PDU (plain Modbus TCP)
    #[serde(rename = "ModbusTCP", alias = "tcp")]
    ModbusTcp,
    /// RTU frame (unit id + PDU + CRC-16) carried over a TCP stream
    #[default]
    #[serde(rename = "ModbusRTUviaTCP", alias = "rtu")]
    RtuOverTcp,
}

impl ProtocolVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVariant::ModbusTcp => "ModbusTCP",
            ProtocolVariant::RtuOverTcp => "ModbusRTUviaTCP",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVariant {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "modbustcp" | "tcp" => Ok(ProtocolVariant::ModbusTcp),
            "modbusrtuviatcp" | "rtu" | "rtuovertcp" => Ok(ProtocolVariant::RtuOverTcp),
            _ => Err(ModbusError::configuration(format!(
                "Unknown Modbus protocol '{}': expected ModbusTCP or ModbusRTUviaTCP",
                s
            ))),
        }
    }
}

/// A decoded server-side request PDU
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl ModbusRequest {
    /// Decode a request PDU (function code followed by its data)
    pub fn parse(pdu: &[u8]) -> ModbusResult<Self> {
        let (&code, data) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;
        let function = ModbusFunction::from_u8(code)?;

        if data.len() < 4 {
            return Err(ModbusError::frame(format!(
                "{} request too short: {} data bytes",
                function,
                data.len()
            )));
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let word = u16::from_be_bytes([data[2], data[3]]);

        let request = match function {
            ModbusFunction::ReadCoils => {
                check_quantity(function, word, MAX_COILS_PER_REQUEST)?;
                ModbusRequest::ReadCoils { address, quantity: word }
            }
            ModbusFunction::ReadDiscreteInputs => {
                check_quantity(function, word, MAX_COILS_PER_REQUEST)?;
                ModbusRequest::ReadDiscreteInputs { address, quantity: word }
            }
            ModbusFunction::ReadHoldingRegisters => {
                check_quantity(function, word, MAX_REGISTERS_PER_REQUEST)?;
                ModbusRequest::ReadHoldingRegisters { address, quantity: word }
            }
            ModbusFunction::ReadInputRegisters => {
                check_quantity(function, word, MAX_REGISTERS_PER_REQUEST)?;
                ModbusRequest::ReadInputRegisters { address, quantity: word }
            }
            ModbusFunction::WriteSingleCoil => {
                let value = match word {
                    0x0000 => false,
                    0xFF00 => true,
                    _ => {
                        return Err(ModbusError::invalid_data(format!(
                            "Invalid coil value 0x{:04X}",
                            word
                        )))
                    }
                };
                ModbusRequest::WriteSingleCoil { address, value }
            }
            ModbusFunction::WriteSingleRegister => {
                ModbusRequest::WriteSingleRegister { address, value: word }
            }
            ModbusFunction::WriteMultipleCoils => {
                check_quantity(function, word, MAX_WRITE_COILS_PER_REQUEST)?;
                let payload = write_payload(data, (word as usize).div_ceil(8))?;
                let values = bits::unpack(payload, word as usize);
                ModbusRequest::WriteMultipleCoils { address, values }
            }
            ModbusFunction::WriteMultipleRegisters => {
                check_quantity(function, word, MAX_WRITE_REGISTERS_PER_REQUEST)?;
                let payload = write_payload(data, word as usize * 2)?;
                let values = payload
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                ModbusRequest::WriteMultipleRegisters { address, values }
            }
        };
        Ok(request)
    }

    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusRequest::ReadCoils { .. } => ModbusFunction::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusRequest::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusRequest::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }
}

fn check_quantity(function: ModbusFunction, quantity: u16, max: u16) -> ModbusResult<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::invalid_data(format!(
            "{}: quantity {} outside 1-{}",
            function, quantity, max
        )));
    }
    Ok(())
}

/// Byte count + payload of a multiple-write request, checked against the quantity
fn write_payload(data: &[u8], expected: usize) -> ModbusResult<&[u8]> {
    let byte_count = *data
        .get(4)
        .ok_or_else(|| ModbusError::frame("Missing byte count"))? as usize;
    if byte_count != expected {
        return Err(ModbusError::invalid_data(format!(
            "Byte count {} does not match quantity (expected {})",
            byte_count, expected
        )));
    }
    data.get(5..5 + byte_count)
        .ok_or_else(|| ModbusError::frame("Incomplete write request"))
}

/// A server-side response PDU
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusResponse {
    /// Coils or discrete inputs
    Bits { function: ModbusFunction, values: Vec<bool> },
    /// Holding or input registers
    Registers { function: ModbusFunction, values: Vec<u16> },
    /// Echo of address + value/quantity for write functions
    Write { function: ModbusFunction, address: u16, word: u16 },
    /// Exception response
    Exception { function_code: u8, exception: ModbusException },
}

impl ModbusResponse {
    /// Encode the response PDU
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ModbusResponse::Bits { function, values } => {
                let packed = bits::pack(values);
                let mut pdu = Vec::with_capacity(2 + packed.len());
                pdu.push(function.to_u8());
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
                pdu
            }
            ModbusResponse::Registers { function, values } => {
                let mut pdu = Vec::with_capacity(2 + values.len() * 2);
                pdu.push(function.to_u8());
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                pdu
            }
            ModbusResponse::Write { function, address, word } => {
                let mut pdu = Vec::with_capacity(5);
                pdu.push(function.to_u8());
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&word.to_be_bytes());
                pdu
            }
            ModbusResponse::Exception { function_code, exception } => {
                vec![function_code | 0x80, exception.to_u8()]
            }
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusResponse::Exception { .. })
    }
}
