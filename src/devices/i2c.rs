use std::sync::{Arc, Mutex};

/// An I2C target addressed by the peripheral controller's bit-bang
/// master.
///
/// Protocol framing, reconstructed by the master from open-drain line
/// edges: START is SDA falling while SCL is high, STOP is SDA rising
/// while SCL is high, data is sampled MSB-first on SCL rising edges, and
/// the ninth clock of every byte carries ACK (low) or NACK (high). The
/// byte after START is the 7-bit address plus the R/W bit.
pub trait I2cDevice: Send {
    /// The 7-bit address this target answers to.
    fn address(&self) -> u8;

    /// Address matched after a START. Returns the ACK for the address
    /// byte.
    fn start(&mut self, is_read: bool) -> bool;

    /// STOP condition observed while this target was addressed.
    fn stop(&mut self);

    /// A data byte from the master (write transaction). Returns ACK.
    fn write_byte(&mut self, data: u8) -> bool;

    /// The next byte to send to the master (read transaction).
    /// `master_will_ack` is false for the final byte of the transfer.
    fn read_byte(&mut self, master_will_ack: bool) -> u8;

    /// A write transaction was just acknowledged; no data byte has
    /// arrived yet. Register-pointer devices arm the pointer here. The
    /// default does nothing.
    fn begin_write(&mut self) {}

    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

impl<D: I2cDevice> I2cDevice for Arc<Mutex<D>> {
    fn address(&self) -> u8 {
        self.lock().unwrap().address()
    }

    fn start(&mut self, is_read: bool) -> bool {
        self.lock().unwrap().start(is_read)
    }

    fn stop(&mut self) {
        self.lock().unwrap().stop()
    }

    fn write_byte(&mut self, data: u8) -> bool {
        self.lock().unwrap().write_byte(data)
    }

    fn read_byte(&mut self, master_will_ack: bool) -> u8 {
        self.lock().unwrap().read_byte(master_will_ack)
    }

    fn begin_write(&mut self) {
        self.lock().unwrap().begin_write()
    }

    fn reset(&mut self) {
        self.lock().unwrap().reset()
    }

    fn name(&self) -> &'static str {
        self.lock().unwrap().name()
    }
}
