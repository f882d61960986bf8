use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use log::{debug, info, warn};

use crate::devices::i2c::I2cDevice;

/// 7-bit I2C address of the DS3231.
pub const DS3231_ADDRESS: u8 = 0x68;

// Register map
const REG_SECONDS: usize = 0x00;
const REG_MINUTES: usize = 0x01;
const REG_HOURS: usize = 0x02;
const REG_DAY: usize = 0x03; // day of week, 1 = Sunday .. 7 = Saturday
const REG_DATE: usize = 0x04; // day of month
const REG_MONTH: usize = 0x05; // bit 7 = century
const REG_YEAR: usize = 0x06;
const REG_CONTROL: usize = 0x0E;
const REG_STATUS: usize = 0x0F;
const REG_TEMP_MSB: usize = 0x11;
const REG_TEMP_LSB: usize = 0x12;

const NUM_REGISTERS: usize = 0x13;

/// DS3231 real-time clock on the I2C bus.
///
/// Time registers 0x00-0x06 are computed from the host wall-clock (plus
/// a millisecond offset reserved for set-time support) and returned in
/// BCD; the remaining registers are plain storage. The first byte of a
/// write transaction sets the register pointer; further writes and all
/// reads auto-increment it modulo the register count.
pub struct Ds3231 {
    pointer: usize,
    /// The next write byte sets the register pointer instead of storing
    /// data. Armed by the master at the start of a write transaction.
    pointer_armed: bool,
    in_transaction: bool,
    read_mode: bool,
    registers: [u8; NUM_REGISTERS],
    time_offset_ms: i64,
}

impl Ds3231 {
    pub fn new() -> Self {
        let mut rtc = Self {
            pointer: 0,
            pointer_armed: false,
            in_transaction: false,
            read_mode: false,
            registers: [0; NUM_REGISTERS],
            time_offset_ms: 0,
        };
        rtc.reset();
        info!("DS3231 RTC initialized at I2C address 0x{:02X}", DS3231_ADDRESS);
        rtc
    }

    fn now(&self) -> DateTime<Local> {
        Local::now() + Duration::milliseconds(self.time_offset_ms)
    }

    fn read_register(&self, reg: usize) -> u8 {
        match reg {
            REG_SECONDS..=REG_YEAR => self.read_time_register(reg),
            _ => self.registers[reg],
        }
    }

    fn read_time_register(&self, reg: usize) -> u8 {
        let now = self.now();
        match reg {
            REG_SECONDS => bin_to_bcd(now.second() as u8),
            REG_MINUTES => bin_to_bcd(now.minute() as u8),
            // 24-hour mode (bit 6 clear)
            REG_HOURS => bin_to_bcd(now.hour() as u8),
            REG_DAY => now.weekday().num_days_from_sunday() as u8 + 1,
            REG_DATE => bin_to_bcd(now.day() as u8),
            REG_MONTH => {
                let mut month = bin_to_bcd(now.month() as u8);
                if now.year() >= 2100 {
                    month |= 0x80;
                }
                month
            }
            REG_YEAR => bin_to_bcd((now.year() % 100) as u8),
            _ => 0,
        }
    }

    fn write_register(&mut self, reg: usize, value: u8) {
        match reg {
            // Stored raw; the wall-clock offset is not recomputed, so
            // reads keep following the host clock.
            REG_SECONDS..=REG_YEAR => {
                debug!(
                    "DS3231 time register 0x{:02X} written with 0x{:02X}",
                    reg, value
                );
                self.registers[reg] = value;
            }
            REG_CONTROL => {
                self.registers[REG_CONTROL] = value;
                debug!("DS3231 control register set to 0x{:02X}", value);
            }
            // Only the alarm flag bits are writable.
            REG_STATUS => {
                self.registers[REG_STATUS] = (self.registers[REG_STATUS] & 0xFC) | (value & 0x03);
            }
            _ => {
                self.registers[reg] = value;
            }
        }
    }
}

impl Default for Ds3231 {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cDevice for Ds3231 {
    fn address(&self) -> u8 {
        DS3231_ADDRESS
    }

    fn start(&mut self, is_read: bool) -> bool {
        self.in_transaction = true;
        self.read_mode = is_read;
        debug!(
            "DS3231 start: {} mode, register pointer 0x{:02X}",
            if is_read { "read" } else { "write" },
            self.pointer
        );
        true
    }

    fn stop(&mut self) {
        self.in_transaction = false;
        debug!(
            "DS3231 stop ({} transaction)",
            if self.read_mode { "read" } else { "write" }
        );
    }

    fn write_byte(&mut self, data: u8) -> bool {
        if !self.in_transaction {
            warn!("DS3231 write_byte outside transaction");
            return false;
        }
        if self.pointer_armed {
            self.pointer = data as usize % NUM_REGISTERS;
            self.pointer_armed = false;
            debug!("DS3231 register pointer set to 0x{:02X}", self.pointer);
        } else {
            self.write_register(self.pointer, data);
            self.pointer = (self.pointer + 1) % NUM_REGISTERS;
        }
        true
    }

    fn read_byte(&mut self, master_will_ack: bool) -> u8 {
        if !self.in_transaction {
            warn!("DS3231 read_byte outside transaction");
            return 0xFF;
        }
        let value = self.read_register(self.pointer);
        debug!(
            "DS3231 read 0x{:02X} from register 0x{:02X}, master will {}",
            value,
            self.pointer,
            if master_will_ack { "ACK" } else { "NACK" }
        );
        self.pointer = (self.pointer + 1) % NUM_REGISTERS;
        value
    }

    fn begin_write(&mut self) {
        self.pointer_armed = true;
    }

    fn reset(&mut self) {
        self.pointer = 0;
        self.pointer_armed = false;
        self.in_transaction = false;
        self.read_mode = false;
        self.time_offset_ms = 0;
        self.registers = [0; NUM_REGISTERS];
        // Temperature reads as ~25 degrees C.
        self.registers[REG_TEMP_MSB] = 0x19;
        self.registers[REG_TEMP_LSB] = 0x00;
        debug!("DS3231 reset");
    }

    fn name(&self) -> &'static str {
        "DS3231 RTC"
    }
}

fn bin_to_bcd(value: u8) -> u8 {
    if value > 99 {
        return 0;
    }
    ((value / 10) << 4) | (value % 10)
}

#[allow(dead_code)]
fn bcd_to_bin(bcd: u8) -> u8 {
    ((bcd >> 4) & 0x0F) * 10 + (bcd & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_conversion() {
        assert_eq!(bin_to_bcd(0), 0x00);
        assert_eq!(bin_to_bcd(9), 0x09);
        assert_eq!(bin_to_bcd(10), 0x10);
        assert_eq!(bin_to_bcd(59), 0x59);
        assert_eq!(bin_to_bcd(99), 0x99);
        assert_eq!(bcd_to_bin(0x59), 59);
        assert_eq!(bcd_to_bin(0x10), 10);
    }

    #[test]
    fn pointer_set_then_autoincrement() {
        let mut rtc = Ds3231::new();
        rtc.start(false);
        rtc.begin_write();
        assert!(rtc.write_byte(0x0E)); // pointer -> control
        assert!(rtc.write_byte(0x1C)); // control
        assert!(rtc.write_byte(0xFF)); // status: only alarm bits stick
        rtc.stop();

        assert_eq!(rtc.registers[REG_CONTROL], 0x1C);
        assert_eq!(rtc.registers[REG_STATUS], 0x03);
    }

    #[test]
    fn pointer_wraps_modulo_register_count() {
        let mut rtc = Ds3231::new();
        rtc.start(false);
        rtc.begin_write();
        assert!(rtc.write_byte(0x12)); // pointer -> temp lsb (last register)
        assert!(rtc.write_byte(0xAB)); // stores, pointer wraps to 0x00
        rtc.stop();

        assert_eq!(rtc.registers[REG_TEMP_LSB], 0xAB);
        assert_eq!(rtc.pointer, 0x00);
    }

    #[test]
    fn seconds_read_is_bcd_of_host_clock() {
        let mut rtc = Ds3231::new();
        rtc.start(false);
        rtc.begin_write();
        rtc.write_byte(0x00);
        rtc.stop();

        let before = Local::now().second();
        rtc.start(true);
        let bcd = rtc.read_byte(false);
        rtc.stop();
        let after = Local::now().second();

        let seconds = bcd_to_bin(bcd) as u32;
        // The read happened between the two samples; allow the minute
        // boundary case where `after` wrapped past zero.
        assert!(
            seconds == before || seconds == after || after < before,
            "seconds {} not in [{}, {}]",
            seconds,
            before,
            after
        );
    }

    #[test]
    fn day_of_week_is_one_to_seven() {
        let rtc = Ds3231::new();
        let day = rtc.read_register(REG_DAY);
        assert!((1..=7).contains(&day));
    }

    #[test]
    fn temperature_defaults() {
        let rtc = Ds3231::new();
        assert_eq!(rtc.read_register(REG_TEMP_MSB), 0x19);
        assert_eq!(rtc.read_register(REG_TEMP_LSB), 0x00);
    }
}
