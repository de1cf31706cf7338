/*!
Serialized PLC register access and bit-polling primitives.

The PLC link correlates exactly one outstanding request, so every register
access goes through the single gate held by [`PlcSync`]. Concurrent callers
queue on the gate instead of interleaving frames.

Transport failures on single reads and writes are logged and reported as a
`-1` word or a `false` write result. Bit waits treat a timeout as a normal
outcome (`Ok(false)`) and only return an error on cancellation.
*/

mod mc;
mod memory;

pub use mc::McProtocolClient;
pub use memory::MemoryPlc;

use crate::error::{LineError, Result};
use async_trait::async_trait;
use shared::plc_word::{bit_mask, bits_match, is_bit_on, set_bit};
use shared::BitIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// PLC device families addressed by the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Data register
    D,
    /// Internal relay
    M,
    /// Link register
    W,
    /// File register
    R,
}

impl DeviceType {
    /// Binary device code used in MC 3E frames
    pub fn code(self) -> u8 {
        match self {
            Self::D => 0xA8,
            Self::M => 0x90,
            Self::W => 0xB4,
            Self::R => 0xAF,
        }
    }
}

/// Word-oriented PLC link. Implementations handle one request at a time.
#[async_trait]
pub trait PlcTransport: Send {
    /// Read one word
    async fn get_device(&mut self, device: DeviceType, address: u32) -> Result<u16>;

    /// Write one word
    async fn set_device(&mut self, device: DeviceType, address: u32, value: u16) -> Result<()>;

    /// Read `count` consecutive words
    async fn read_block(&mut self, device: DeviceType, address: u32, count: u16) -> Result<Vec<u16>>;

    /// Write consecutive words starting at `address`
    async fn write_block(&mut self, device: DeviceType, address: u32, data: &[u16]) -> Result<()>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;
}

/// Timeout and poll interval of a bit wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Single-gate access to the PLC data registers
pub struct PlcSync {
    transport: Mutex<Box<dyn PlcTransport>>,
    device: DeviceType,
}

impl PlcSync {
    /// Wrap a transport. All word operations target data registers.
    pub fn new(transport: Box<dyn PlcTransport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            device: DeviceType::D,
        }
    }

    /// Read a word, or `-1` if the read failed
    pub async fn get_word(&self, address: u16) -> i32 {
        let mut transport = self.transport.lock().await;
        match transport.get_device(self.device, address as u32).await {
            Ok(value) => value as i32,
            Err(e) => {
                error!(address, "PLC read failed: {}", e);
                -1
            }
        }
    }

    /// Write a word; `false` if the write failed
    pub async fn set_word(&self, address: u16, value: u16) -> bool {
        let mut transport = self.transport.lock().await;
        match transport.set_device(self.device, address as u32, value).await {
            Ok(()) => true,
            Err(e) => {
                error!(address, value, "PLC write failed: {}", e);
                false
            }
        }
    }

    /// Read consecutive words through the same gate
    pub async fn read_block(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut transport = self.transport.lock().await;
        transport.read_block(self.device, address as u32, count).await
    }

    /// Write consecutive words through the same gate
    pub async fn write_block(&self, address: u16, data: &[u16]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.write_block(self.device, address as u32, data).await
    }

    /// Link state, observed after any in-flight request completes
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Poll until `bit` of `address` equals `expected`.
    ///
    /// Returns `Ok(true)` on the first matching sample without sleeping,
    /// `Ok(false)` once the timeout has fully elapsed, and
    /// `Err(LineError::Cancelled)` when `cancel` fires.
    pub async fn wait_for_bit(
        &self,
        address: u16,
        bit: BitIndex,
        expected: bool,
        policy: WaitPolicy,
        cancel: &CancellationToken,
        tag: &str,
    ) -> Result<bool> {
        let matched = self
            .poll_until(address, policy, cancel, |word| is_bit_on(word, bit) == expected)
            .await?;
        if !matched {
            warn!(
                tag,
                address,
                bit = bit.get(),
                "timed out waiting for D{}.{} to turn {}",
                address,
                bit,
                if expected { "ON" } else { "OFF" }
            );
        }
        Ok(matched)
    }

    /// Poll until every bit in `bits` is on (`expect_all_on`) or every bit is off
    pub async fn wait_for_bits(
        &self,
        address: u16,
        bits: &[BitIndex],
        expect_all_on: bool,
        policy: WaitPolicy,
        cancel: &CancellationToken,
        tag: &str,
    ) -> Result<bool> {
        if bits.is_empty() {
            return Err(LineError::config("wait_for_bits needs at least one bit"));
        }

        let mask = bit_mask(bits);
        let matched = self
            .poll_until(address, policy, cancel, |word| bits_match(word, mask, expect_all_on))
            .await?;
        if !matched {
            let list: Vec<String> = bits.iter().map(|b| b.to_string()).collect();
            warn!(
                tag,
                address,
                "timed out waiting for D{} bits {} to be {}",
                address,
                list.join(","),
                if expect_all_on { "ALL ON" } else { "ALL OFF" }
            );
        }
        Ok(matched)
    }

    async fn poll_until<F>(
        &self,
        address: u16,
        policy: WaitPolicy,
        cancel: &CancellationToken,
        done: F,
    ) -> Result<bool>
    where
        F: Fn(u16) -> bool,
    {
        let deadline = Instant::now() + policy.timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(LineError::Cancelled);
            }

            // A failed read never counts as a match
            let word = self.get_word(address).await;
            if word >= 0 && done(word as u16) {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let nap = policy.interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LineError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// PC-owned word whose bits are set and cleared independently.
///
/// The last written value is kept as a shadow so that toggling one bit
/// never clobbers the others. Updates are ordered by the shadow lock.
pub struct ShadowWord {
    plc: Arc<PlcSync>,
    address: u16,
    shadow: Mutex<u16>,
}

impl ShadowWord {
    /// Start from an all-clear shadow
    pub fn new(plc: Arc<PlcSync>, address: u16) -> Self {
        Self {
            plc,
            address,
            shadow: Mutex::new(0),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Set or clear one bit and write the whole word
    pub async fn set_bit(&self, bit: BitIndex, on: bool) -> bool {
        let mut shadow = self.shadow.lock().await;
        let next = set_bit(*shadow, bit, on);
        // The shadow tracks intent even if the write fails
        *shadow = next;
        self.plc.set_word(self.address, next).await
    }

    /// Flip one bit, returning its new state
    pub async fn toggle_bit(&self, bit: BitIndex) -> bool {
        let mut shadow = self.shadow.lock().await;
        let on = !is_bit_on(*shadow, bit);
        *shadow = set_bit(*shadow, bit, on);
        self.plc.set_word(self.address, *shadow).await;
        on
    }

    /// Clear every bit
    pub async fn reset(&self) -> bool {
        let mut shadow = self.shadow.lock().await;
        *shadow = 0;
        self.plc.set_word(self.address, 0).await
    }

    /// Last value written
    pub async fn value(&self) -> u16 {
        *self.shadow.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(n: u8) -> BitIndex {
        BitIndex::new(n).unwrap()
    }

    fn policy() -> WaitPolicy {
        WaitPolicy::new(Duration::from_secs(1), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bit_returns_immediately_on_match() {
        let mem = MemoryPlc::new();
        mem.poke(100, 0b0100);
        let plc = PlcSync::new(Box::new(mem.clone()));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert!(plc.wait_for_bit(100, bit(2), true, policy(), &cancel, "test").await.unwrap());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(mem.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bit_times_out_after_full_timeout() {
        let mem = MemoryPlc::new();
        let plc = PlcSync::new(Box::new(mem.clone()));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert!(!plc.wait_for_bit(100, bit(2), true, policy(), &cancel, "test").await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bit_sees_late_change() {
        let mem = MemoryPlc::new();
        mem.poke(7, 0b1);
        let plc = PlcSync::new(Box::new(mem.clone()));
        let cancel = CancellationToken::new();

        let writer = mem.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            writer.poke(7, 0);
        });

        let start = Instant::now();
        assert!(plc.wait_for_bit(7, bit(0), false, policy(), &cancel, "test").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bit_cancellation_is_an_error() {
        let mem = MemoryPlc::new();
        let plc = PlcSync::new(Box::new(mem));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let err = plc.wait_for_bit(1, bit(0), true, policy(), &cancel, "test").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_bits_all_on_and_all_off() {
        let mem = MemoryPlc::new();
        mem.poke(20, 0b0111);
        let plc = PlcSync::new(Box::new(mem.clone()));
        let cancel = CancellationToken::new();

        assert!(plc.wait_for_bits(20, &[bit(0), bit(1)], true, policy(), &cancel, "light").await.unwrap());
        assert!(!plc.wait_for_bits(20, &[bit(1), bit(3)], false, policy(), &cancel, "light").await.unwrap());
        assert!(plc.wait_for_bits(20, &[], true, policy(), &cancel, "light").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_is_sentinel_and_never_matches() {
        let mem = MemoryPlc::new();
        mem.set_connected(false);
        let plc = PlcSync::new(Box::new(mem.clone()));
        let cancel = CancellationToken::new();

        assert_eq!(plc.get_word(5).await, -1);
        assert!(!plc.set_word(5, 1).await);
        // -1 has every bit set; it must not satisfy an "ON" wait
        assert!(!plc.wait_for_bit(5, bit(0), true, policy(), &cancel, "test").await.unwrap());
        assert!(!plc.is_connected().await);
    }

    #[tokio::test]
    async fn test_shadow_word_keeps_other_bits() {
        let mem = MemoryPlc::new();
        let plc = Arc::new(PlcSync::new(Box::new(mem.clone())));
        let word = ShadowWord::new(plc, 300);

        assert!(word.set_bit(bit(1), true).await);
        assert!(word.set_bit(bit(2), true).await);
        assert_eq!(mem.peek(300), 0b110);

        word.set_bit(bit(1), false).await;
        assert_eq!(mem.peek(300), 0b100);

        assert!(word.toggle_bit(bit(0)).await);
        assert!(!word.toggle_bit(bit(0)).await);
        assert_eq!(word.value().await, 0b100);

        word.reset().await;
        assert_eq!(mem.peek(300), 0);
    }

    #[tokio::test]
    async fn test_block_access_goes_through_gate() {
        let mem = MemoryPlc::new();
        let plc = PlcSync::new(Box::new(mem.clone()));

        plc.write_block(40, &[1, 2, 3]).await.unwrap();
        assert_eq!(plc.read_block(40, 4).await.unwrap(), vec![1, 2, 3, 0]);
        assert_eq!(plc.get_word(41).await, 2);
    }
}
