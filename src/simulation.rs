//! Random process data for the read-only banks
//!
//! Input registers and discrete inputs cannot be written by clients. The simulator
//! fills a window of them with random values on a fixed interval so clients polling
//! the emulator see changing data.

use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::ModbusResult;
use crate::register_bank::ModbusRegisterBank;

/// Largest window refreshed per tick
const DEFAULT_WINDOW: usize = 100;

/// Periodically randomizes input registers and discrete inputs
#[derive(Debug, Clone)]
pub struct Simulator {
    register_bank: Arc<ModbusRegisterBank>,
    interval: Duration,
    window: usize,
}

impl Simulator {
    pub fn new(register_bank: Arc<ModbusRegisterBank>, interval: Duration) -> Self {
        Self {
            register_bank,
            interval,
            window: DEFAULT_WINDOW,
        }
    }

    /// Number of leading elements refreshed in each bank
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Write one round of random values
    pub fn tick<R: Rng>(&self, rng: &mut R) -> ModbusResult<()> {
        let sizes = self.register_bank.sizes().unwrap_or_default();

        let registers = self.window.min(sizes.input_registers);
        if registers > 0 {
            let values: Vec<u16> = (0..registers).map(|_| rng.gen()).collect();
            self.register_bank.set_input_registers(0, &values)?;
        }

        let inputs = self.window.min(sizes.discrete_inputs);
        if inputs > 0 {
            let values: Vec<bool> = (0..inputs).map(|_| rng.gen_bool(0.5)).collect();
            self.register_bank.set_discrete_inputs(0, &values)?;
        }
        Ok(())
    }

    /// Run [`tick`](Self::tick) forever on the interval; abort the handle to stop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let mut rng = rand::thread_rng();
                if let Err(e) = self.tick(&mut rng) {
                    warn!("Simulation tick failed: {}", e);
                } else {
                    debug!("Simulated {} input values", self.window);
                }
            }
        })
    }
}
