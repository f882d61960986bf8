use std::sync::{Arc, Mutex};

/// An SPI target driven by the peripheral controller's bit-bang master.
/// Bits arrive MSB-first, one per SCK rising edge.
pub trait SpiDevice: Send {
    /// The chip-select line for this target went low.
    fn select(&mut self);

    /// The chip-select line went high. Transient response state should be
    /// cleared so a re-select starts clean.
    fn deselect(&mut self);

    /// Exchange one bit: `mosi` is sampled on the SCK rising edge, the
    /// return value is the MISO level presented back to the master.
    fn transfer(&mut self, mosi: bool) -> bool;

    /// SCK falling edge notification. Idempotent; the default does
    /// nothing.
    fn on_sck_falling(&mut self) {}

    fn reset(&mut self);

    fn is_selected(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Targets the owner needs to keep a handle on (e.g. the SD card, for
/// mounting images) register as `Arc<Mutex<_>>`.
impl<D: SpiDevice> SpiDevice for Arc<Mutex<D>> {
    fn select(&mut self) {
        self.lock().unwrap().select()
    }

    fn deselect(&mut self) {
        self.lock().unwrap().deselect()
    }

    fn transfer(&mut self, mosi: bool) -> bool {
        self.lock().unwrap().transfer(mosi)
    }

    fn on_sck_falling(&mut self) {
        self.lock().unwrap().on_sck_falling()
    }

    fn reset(&mut self) {
        self.lock().unwrap().reset()
    }

    fn is_selected(&self) -> bool {
        self.lock().unwrap().is_selected()
    }

    fn name(&self) -> &'static str {
        self.lock().unwrap().name()
    }
}
