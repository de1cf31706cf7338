use super::{DeviceType, PlcTransport};
use crate::error::{LineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Most recent data register writes kept for inspection
pub const WRITE_LOG_CAPACITY: usize = 4096;

#[derive(Default)]
struct Registers {
    words: HashMap<(DeviceType, u32), u16>,
    writes: VecDeque<(u16, u16)>,
    reads: usize,
}

/// In-memory register bank standing in for a PLC.
///
/// Clones share the same registers, so one handle can be boxed into a
/// [`PlcSync`](super::PlcSync) while another plays the PLC side.
#[derive(Clone)]
pub struct MemoryPlc {
    registers: Arc<Mutex<Registers>>,
    connected: Arc<AtomicBool>,
}

impl MemoryPlc {
    pub fn new() -> Self {
        Self {
            registers: Arc::new(Mutex::new(Registers::default())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Set a data register from the PLC side
    pub fn poke(&self, address: u16, value: u16) {
        self.registers.lock().words.insert((DeviceType::D, address as u32), value);
    }

    /// Current value of a data register
    pub fn peek(&self, address: u16) -> u16 {
        self.registers
            .lock()
            .words
            .get(&(DeviceType::D, address as u32))
            .copied()
            .unwrap_or(0)
    }

    /// Make every operation fail with a connection error
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Data register writes issued through the transport, oldest first.
    /// Only the last [`WRITE_LOG_CAPACITY`] are kept.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.registers.lock().writes.iter().copied().collect()
    }

    /// Number of single-word reads served
    pub fn read_count(&self) -> usize {
        self.registers.lock().reads
    }

    fn check_link(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LineError::connection("plc", "link down"))
        }
    }
}

impl Default for MemoryPlc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlcTransport for MemoryPlc {
    async fn get_device(&mut self, device: DeviceType, address: u32) -> Result<u16> {
        self.check_link()?;
        let mut regs = self.registers.lock();
        regs.reads += 1;
        Ok(regs.words.get(&(device, address)).copied().unwrap_or(0))
    }

    async fn set_device(&mut self, device: DeviceType, address: u32, value: u16) -> Result<()> {
        self.check_link()?;
        let mut regs = self.registers.lock();
        regs.words.insert((device, address), value);
        if device == DeviceType::D {
            if regs.writes.len() == WRITE_LOG_CAPACITY {
                regs.writes.pop_front();
            }
            regs.writes.push_back((address as u16, value));
        }
        Ok(())
    }

    async fn read_block(&mut self, device: DeviceType, address: u32, count: u16) -> Result<Vec<u16>> {
        self.check_link()?;
        let regs = self.registers.lock();
        Ok((0..count as u32)
            .map(|i| regs.words.get(&(device, address + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_block(&mut self, device: DeviceType, address: u32, data: &[u16]) -> Result<()> {
        self.check_link()?;
        let mut regs = self.registers.lock();
        for (i, &value) in data.iter().enumerate() {
            regs.words.insert((device, address + i as u32), value);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_log_keeps_most_recent_writes() {
        let plc = MemoryPlc::new();
        let mut transport = plc.clone();
        let total = WRITE_LOG_CAPACITY + 904;
        for i in 0..total {
            transport.set_device(DeviceType::D, 100, i as u16).await.unwrap();
        }

        let writes = plc.writes();
        assert_eq!(writes.len(), WRITE_LOG_CAPACITY);
        assert_eq!(writes[0], (100, (total - WRITE_LOG_CAPACITY) as u16));
        assert_eq!(writes.last(), Some(&(100, (total - 1) as u16)));
        assert_eq!(plc.peek(100), (total - 1) as u16);
    }

    #[tokio::test]
    async fn test_link_down_fails_every_operation() {
        let plc = MemoryPlc::new();
        let mut transport = plc.clone();
        plc.set_connected(false);
        assert!(transport.get_device(DeviceType::D, 1).await.is_err());
        assert!(transport.set_device(DeviceType::D, 1, 5).await.is_err());
        assert!(plc.writes().is_empty());
    }
}
