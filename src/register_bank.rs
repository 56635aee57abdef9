//! Modbus register bank for server-side data storage
//!
//! This module provides the device address space shared by every protocol front-end:
//! four fixed-size banks of coils, discrete inputs, holding registers and input
//! registers, each behind its own reader/writer lock.

use std::ops::Range;
use std::sync::{OnceLock, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Bank, ModbusError, ModbusResult};

/// Largest bank a 16-bit Modbus address can reach
pub const MAX_BANK_SIZE: usize = 65536;

/// Element counts of the four banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BankSizes {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl BankSizes {
    pub fn new(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> Self {
        Self {
            coils,
            discrete_inputs,
            holding_registers,
            input_registers,
        }
    }

    fn validate(&self) -> ModbusResult<()> {
        let banks = [
            (Bank::Coils, self.coils),
            (Bank::DiscreteInputs, self.discrete_inputs),
            (Bank::HoldingRegisters, self.holding_registers),
            (Bank::InputRegisters, self.input_registers),
        ];
        for (bank, size) in banks {
            if size > MAX_BANK_SIZE {
                return Err(ModbusError::configuration(format!(
                    "{} count {} exceeds the Modbus address range ({})",
                    bank, size, MAX_BANK_SIZE
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Banks {
    sizes: BankSizes,
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

/// Modbus register bank for storing coils, discrete inputs, holding registers, and input registers
///
/// The bank is created empty and sized exactly once by [`init`](Self::init). All
/// addressing is 0-based and every span must fit inside its bank: nothing is clamped
/// and a rejected write leaves the bank untouched.
///
/// Each bank has its own `RwLock`, so a coil write never blocks a holding register
/// read. Bulk reads and writes hold the lock for the whole span, which makes them
/// atomic with respect to each other.
///
/// ```rust
/// use voltage_modbus_slave::ModbusRegisterBank;
///
/// let bank = ModbusRegisterBank::with_counts(10, 10, 10, 10).unwrap();
/// bank.write_holding_registers(0, &[1, 2, 3, 4, 5]).unwrap();
/// assert_eq!(bank.read_holding_registers(0, 5).unwrap(), vec![1, 2, 3, 4, 5]);
/// assert_eq!(bank.read_holding_registers(5, 5).unwrap(), vec![0; 5]);
/// ```
#[derive(Debug, Default)]
pub struct ModbusRegisterBank {
    banks: OnceLock<Banks>,
}

impl ModbusRegisterBank {
    /// Create an uninitialized register bank
    ///
    /// Every operation fails with a state error until [`init`](Self::init) is called.
    pub fn new() -> Self {
        Self {
            banks: OnceLock::new(),
        }
    }

    /// Create a register bank and size it in one step
    pub fn with_sizes(sizes: BankSizes) -> ModbusResult<Self> {
        let bank = Self::new();
        bank.init(sizes)?;
        Ok(bank)
    }

    /// Shorthand for [`with_sizes`](Self::with_sizes) taking the four counts directly
    pub fn with_counts(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> ModbusResult<Self> {
        Self::with_sizes(BankSizes::new(
            coils,
            discrete_inputs,
            holding_registers,
            input_registers,
        ))
    }

    /// Allocate the four banks, all elements zero/false
    ///
    /// Fails with a state error if the bank was already initialized, and with a
    /// configuration error if a count exceeds [`MAX_BANK_SIZE`].
    pub fn init(&self, sizes: BankSizes) -> ModbusResult<()> {
        sizes.validate()?;

        let banks = Banks {
            sizes,
            coils: RwLock::new(vec![false; sizes.coils]),
            discrete_inputs: RwLock::new(vec![false; sizes.discrete_inputs]),
            holding_registers: RwLock::new(vec![0; sizes.holding_registers]),
            input_registers: RwLock::new(vec![0; sizes.input_registers]),
        };
        self.banks
            .set(banks)
            .map_err(|_| ModbusError::state("Register bank is already initialized"))?;

        debug!("Register bank initialized: {:?}", sizes);
        Ok(())
    }

    /// Whether [`init`](Self::init) has run
    pub fn is_initialized(&self) -> bool {
        self.banks.get().is_some()
    }

    /// Bank sizes, if initialized
    pub fn sizes(&self) -> Option<BankSizes> {
        self.banks.get().map(|b| b.sizes)
    }

    fn banks(&self) -> ModbusResult<&Banks> {
        self.banks
            .get()
            .ok_or_else(|| ModbusError::state("Register bank is not initialized"))
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let banks = self.banks()?;
        read_span(&banks.coils, Bank::Coils, address, quantity as usize)
    }

    /// Alias for read_coils using function code naming
    pub fn read_01(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_coils(address, quantity)
    }

    /// Force a contiguous run of coils (function code 0x0F)
    ///
    /// All-or-nothing: if any offset is out of range no coil is modified.
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let banks = self.banks()?;
        write_span(&banks.coils, Bank::Coils, address, values)
    }

    /// Alias for write_coils using function code naming
    pub fn write_0f(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.write_coils(address, values)
    }

    /// Write single coil (function code 0x05)
    pub fn write_single_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_coils(address, &[value])
    }

    /// Alias for write_single_coil using function code naming
    pub fn write_05(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_single_coil(address, value)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let banks = self.banks()?;
        read_span(
            &banks.discrete_inputs,
            Bank::DiscreteInputs,
            address,
            quantity as usize,
        )
    }

    /// Alias for read_discrete_inputs using function code naming
    pub fn read_02(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_discrete_inputs(address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let banks = self.banks()?;
        read_span(
            &banks.holding_registers,
            Bank::HoldingRegisters,
            address,
            quantity as usize,
        )
    }

    /// Alias for read_holding_registers using function code naming
    pub fn read_03(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_holding_registers(address, quantity)
    }

    /// Preset a contiguous run of holding registers (function code 0x10)
    ///
    /// All-or-nothing: if any offset is out of range no register is modified.
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let banks = self.banks()?;
        write_span(
            &banks.holding_registers,
            Bank::HoldingRegisters,
            address,
            values,
        )
    }

    /// Alias for write_holding_registers using function code naming
    pub fn write_10(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.write_holding_registers(address, values)
    }

    /// Write single register (function code 0x06)
    pub fn write_single_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_holding_registers(address, &[value])
    }

    /// Alias for write_single_register using function code naming
    pub fn write_06(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_single_register(address, value)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let banks = self.banks()?;
        read_span(
            &banks.input_registers,
            Bank::InputRegisters,
            address,
            quantity as usize,
        )
    }

    /// Alias for read_input_registers using function code naming
    pub fn read_04(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_input_registers(address, quantity)
    }

    /// Set input register values (for simulation/testing)
    ///
    /// Not reachable from any protocol front-end; input registers are read-only there.
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let banks = self.banks()?;
        write_span(
            &banks.input_registers,
            Bank::InputRegisters,
            address,
            values,
        )
    }

    /// Set discrete input values (for simulation/testing)
    ///
    /// Not reachable from any protocol front-end; discrete inputs are read-only there.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let banks = self.banks()?;
        write_span(
            &banks.discrete_inputs,
            Bank::DiscreteInputs,
            address,
            values,
        )
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> RegisterBankStats {
        let sizes = self.sizes().unwrap_or_default();
        RegisterBankStats {
            coils_count: sizes.coils,
            discrete_inputs_count: sizes.discrete_inputs,
            holding_registers_count: sizes.holding_registers,
            input_registers_count: sizes.input_registers,
        }
    }
}

/// Register bank statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

/// Resolve `address..address+count` inside a bank of `size` elements
fn span(bank: Bank, address: u16, count: usize, size: usize) -> ModbusResult<Range<usize>> {
    let start = address as usize;
    match start.checked_add(count) {
        Some(end) if count > 0 && end <= size => Ok(start..end),
        _ => Err(ModbusError::out_of_range(bank, address, count, size)),
    }
}

fn read_span<T: Copy>(
    lock: &RwLock<Vec<T>>,
    bank: Bank,
    address: u16,
    count: usize,
) -> ModbusResult<Vec<T>> {
    let data = lock
        .read()
        .map_err(|_| ModbusError::internal(format!("Failed to lock {}", bank)))?;
    let range = span(bank, address, count, data.len())?;
    Ok(data[range].to_vec())
}

fn write_span<T: Copy>(
    lock: &RwLock<Vec<T>>,
    bank: Bank,
    address: u16,
    values: &[T],
) -> ModbusResult<()> {
    let mut data = lock
        .write()
        .map_err(|_| ModbusError::internal(format!("Failed to lock {}", bank)))?;
    let range = span(bank, address, values.len(), data.len())?;
    data[range].copy_from_slice(values);
    Ok(())
}
