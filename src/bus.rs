use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

/// Interrupt sources sharing the system IRQ line, one bit each.
pub mod irq_source {
    pub const PS2: u8 = 0;
    pub const PERIPHERAL: u8 = 1;
}

/// A memory-mapped device. The bus hands each access the offset relative
/// to the device's range start.
pub trait Device: Send {
    fn read(&mut self, offset: u16) -> u8;
    fn write(&mut self, offset: u16, value: u8);
    fn name(&self) -> &'static str;
}

/// Devices that must stay reachable by their owner after registration
/// (e.g. for mounting disk images) are registered as `Arc<Mutex<_>>`.
impl<D: Device> Device for Arc<Mutex<D>> {
    fn read(&mut self, offset: u16) -> u8 {
        self.lock().unwrap().read(offset)
    }

    fn write(&mut self, offset: u16, value: u8) {
        self.lock().unwrap().write(offset, value)
    }

    fn name(&self) -> &'static str {
        self.lock().unwrap().name()
    }
}

/// The shared interrupt line. Pull-down semantics: the line reads asserted
/// while any source holds its bit set. Handles are cheap clones sharing
/// the same line.
#[derive(Clone)]
pub struct IrqLine {
    sources: Arc<AtomicU32>,
}

impl IrqLine {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn assert(&self, source: u8) {
        self.sources.fetch_or(1 << source, Ordering::SeqCst);
    }

    pub fn clear(&self, source: u8) {
        self.sources.fetch_and(!(1 << source), Ordering::SeqCst);
    }

    pub fn is_asserted(&self) -> bool {
        self.sources.load(Ordering::SeqCst) != 0
    }
}

impl Default for IrqLine {
    fn default() -> Self {
        Self::new()
    }
}

pub type ListenerFn = Box<dyn FnMut() + Send>;

/// Subscriber registry for device state-change notifications. Listeners
/// must not call back into the notifying device.
pub struct Listeners {
    subscribers: Vec<ListenerFn>,
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: ListenerFn) {
        self.subscribers.push(listener);
    }

    pub fn notify(&mut self) {
        for listener in &mut self.subscribers {
            listener();
        }
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum BusError {
    /// The new device's range overlaps one already registered.
    RangeOverlap {
        device: &'static str,
        start: u16,
        end: u16,
        existing: &'static str,
    },
    /// start > end.
    InvalidRange {
        device: &'static str,
        start: u16,
        end: u16,
    },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::RangeOverlap {
                device,
                start,
                end,
                existing,
            } => write!(
                f,
                "device '{}' range {:04X}-{:04X} overlaps '{}'",
                device, start, end, existing
            ),
            BusError::InvalidRange { device, start, end } => write!(
                f,
                "device '{}' has invalid range {:04X}-{:04X}",
                device, start, end
            ),
        }
    }
}

impl Error for BusError {}

struct DeviceMapping {
    start: u16,
    end: u16,
    device: Box<dyn Device>,
}

/// The 16-bit system bus. Devices own disjoint inclusive address ranges;
/// reads and writes are dispatched to the owning device with the offset
/// from its range start. Unmapped addresses read 0xFF and swallow writes
/// (RAM and ROM are external to this crate).
pub struct Bus {
    mappings: Vec<DeviceMapping>,
    irq: IrqLine,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            irq: IrqLine::new(),
        }
    }

    /// A handle to the shared interrupt line.
    pub fn irq(&self) -> IrqLine {
        self.irq.clone()
    }

    /// Register a device on `[start, end]`. Overlap with an existing
    /// device is fatal at setup: the device is refused.
    pub fn add_device(
        &mut self,
        start: u16,
        end: u16,
        device: Box<dyn Device>,
    ) -> Result<(), BusError> {
        if start > end {
            return Err(BusError::InvalidRange {
                device: device.name(),
                start,
                end,
            });
        }
        for mapping in &self.mappings {
            if start <= mapping.end && end >= mapping.start {
                return Err(BusError::RangeOverlap {
                    device: device.name(),
                    start,
                    end,
                    existing: mapping.device.name(),
                });
            }
        }
        info!(
            "bus: registered '{}' at {:04X}-{:04X}",
            device.name(),
            start,
            end
        );
        self.mappings.push(DeviceMapping { start, end, device });
        Ok(())
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        for mapping in &mut self.mappings {
            if addr >= mapping.start && addr <= mapping.end {
                return mapping.device.read(addr - mapping.start);
            }
        }
        0xFF
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        for mapping in &mut self.mappings {
            if addr >= mapping.start && addr <= mapping.end {
                mapping.device.write(addr - mapping.start, value);
                return;
            }
        }
        warn!("bus: write to unmapped address {:04X}", addr);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
