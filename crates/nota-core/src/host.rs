//! Host lifecycle: monotonic clock, bounded delays and reboot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

pub trait Host {
    /// Monotonic microseconds since an arbitrary origin.
    fn micros(&self) -> u64;

    fn millis(&self) -> u64 {
        self.micros() / 1000
    }

    /// Block for `ms` milliseconds.
    fn delay_ms(&self, ms: u64);

    /// Restart into the freshly written image.
    fn reboot(&self);

    /// Hardware address used for the default hostname and discovery.
    fn mac_address(&self) -> [u8; 6] {
        [0; 6]
    }
}

/// Host backed by the std clock. A reboot is recorded for the embedding
/// loop to act on.
pub struct StdHost {
    origin: Instant,
    mac: [u8; 6],
    reboot_requested: Arc<AtomicBool>,
}

impl StdHost {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            mac: [0; 6],
            reboot_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    /// Flag raised by `reboot`, shareable with the embedding loop.
    pub fn reboot_flag(&self) -> Arc<AtomicBool> {
        self.reboot_requested.clone()
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for StdHost {
    fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn delay_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn reboot(&self) {
        info!("Reboot requested");
        self.reboot_requested.store(true, Ordering::SeqCst);
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}

struct MockHostState {
    micros: u64,
    reboots: usize,
    delays: Vec<u64>,
}

/// Host with a virtual clock that only moves on `delay_ms` / `advance_ms`.
/// Clones share the same clock.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<MockHostState>>,
    mac: [u8; 6],
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockHostState {
                micros: 1_000_000,
                reboots: 0,
                delays: Vec::new(),
            })),
            mac: [0x24, 0x6f, 0x28, 0xa1, 0xb2, 0xc3],
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.state.lock().unwrap().micros += ms * 1000;
    }

    pub fn reboot_count(&self) -> usize {
        self.state.lock().unwrap().reboots
    }

    /// Sum of all requested delays.
    pub fn total_delay_ms(&self) -> u64 {
        self.state.lock().unwrap().delays.iter().sum()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MockHost {
    fn micros(&self) -> u64 {
        self.state.lock().unwrap().micros
    }

    fn delay_ms(&self, ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.micros += ms * 1000;
        state.delays.push(ms);
    }

    fn reboot(&self) {
        self.state.lock().unwrap().reboots += 1;
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_moves_on_delay() {
        let host = MockHost::new();
        let start = host.millis();
        host.delay_ms(5);
        host.advance_ms(10);
        assert_eq!(host.millis() - start, 15);
        assert_eq!(host.total_delay_ms(), 5);
    }

    #[test]
    fn test_std_host_reboot_flag() {
        let host = StdHost::new();
        let flag = host.reboot_flag();
        assert!(!flag.load(Ordering::SeqCst));
        host.reboot();
        assert!(flag.load(Ordering::SeqCst));
    }
}
