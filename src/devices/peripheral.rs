use std::collections::HashMap;

use log::{debug, info, warn};

use crate::bus::Device;
use crate::devices::i2c::I2cDevice;
use crate::devices::spi::SpiDevice;

pub const PERIPHERAL_SIZE: u16 = 16;

// VIA register offsets
const ORB: u16 = 0x00; // Port B output/input register
const ORA: u16 = 0x01; // Port A output/input register
const DDRB: u16 = 0x02;
const DDRA: u16 = 0x03;
const T1CL: u16 = 0x04;
const T1CH: u16 = 0x05;
const T1LL: u16 = 0x06;
const T1LH: u16 = 0x07;
const T2CL: u16 = 0x08;
const T2CH: u16 = 0x09;
const SR: u16 = 0x0A;
const ACR: u16 = 0x0B;
const PCR: u16 = 0x0C;
const IFR: u16 = 0x0D;
const IER: u16 = 0x0E;
const ORA_NH: u16 = 0x0F; // Port A, no handshake

// Port B pins (SPI)
const SPI_MOSI: u8 = 0x01; // PB0
const SPI_MISO: u8 = 0x02; // PB1
const SPI_SCK: u8 = 0x04; // PB2

// Port A pins (SPI chip selects + I2C)
const SPI_CS_MASK: u8 = 0x3F; // PA0-PA5, active low, one-hot
const I2C_SCL: u8 = 0x40; // PA6
const I2C_SDA: u8 = 0x80; // PA7

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum I2cState {
    Idle,
    Address,
    DataWrite,
    DataRead,
}

/// I2C master state, reconstructed from open-drain edges on DDRA.
///
/// `bit_count` runs 0..=9: it counts data bits shifted during a byte,
/// sits at 8 through the ACK phase, becomes 9 when the ACK clock has
/// risen, and resets to 0 on the following SCL falling edge.
struct I2cMaster {
    state: I2cState,
    scl_previous: bool,
    sda_previous: bool,
    bit_count: u8,
    shift_reg: u8,
    /// Address of the currently addressed target.
    active: Option<u8>,
    read_mode: bool,
    /// Staged byte being sent to the master in DATA_READ.
    read_byte: u8,
    /// ACK the slave will drive on the next ACK clock (true = ACK/low).
    slave_ack: bool,
}

impl I2cMaster {
    fn idle() -> Self {
        Self {
            state: I2cState::Idle,
            scl_previous: true,
            sda_previous: true,
            bit_count: 0,
            shift_reg: 0,
            active: None,
            read_mode: false,
            read_byte: 0xFF,
            slave_ack: false,
        }
    }
}

/// W65C22-class peripheral controller: two 8-bit ports with direction
/// registers, used as a bit-bang master for SPI (port B data lines, port
/// A chip selects) and I2C (port A bits 6/7).
///
/// The 6502 driver bit-bangs I2C open-drain style through DDRA: a DDR
/// bit of 1 drives the line low (the output register bit stays 0), a DDR
/// bit of 0 releases the line to float high through the pull-up. Line
/// levels therefore derive from DDRA, not from port A data.
pub struct PeripheralController {
    port_b: u8,
    port_a: u8,
    ddr_b: u8,
    ddr_a: u8,
    t1_counter_low: u8,
    t1_counter_high: u8,
    t1_latch_low: u8,
    t1_latch_high: u8,
    t2_counter_low: u8,
    t2_counter_high: u8,
    shift_register: u8,
    aux_control: u8,
    peripheral_control: u8,
    interrupt_flags: u8,
    interrupt_enable: u8,

    // SPI master state
    sck_previous: bool,
    selected: Option<u8>,

    spi_targets: HashMap<u8, Box<dyn SpiDevice>>,
    i2c_targets: HashMap<u8, Box<dyn I2cDevice>>,

    i2c: I2cMaster,
}

impl PeripheralController {
    pub fn new() -> Self {
        let mut controller = Self {
            port_b: 0,
            port_a: 0,
            ddr_b: 0,
            ddr_a: 0,
            t1_counter_low: 0,
            t1_counter_high: 0,
            t1_latch_low: 0,
            t1_latch_high: 0,
            t2_counter_low: 0,
            t2_counter_high: 0,
            shift_register: 0,
            aux_control: 0,
            peripheral_control: 0,
            interrupt_flags: 0,
            interrupt_enable: 0,
            sck_previous: false,
            selected: None,
            spi_targets: HashMap::new(),
            i2c_targets: HashMap::new(),
            i2c: I2cMaster::idle(),
        };
        controller.reset();
        controller
    }

    /// Register an SPI target on a chip-select line (0-5). Registering a
    /// line twice replaces the previous target.
    pub fn register_spi_target(&mut self, cs_line: u8, target: Box<dyn SpiDevice>) {
        assert!(cs_line <= 5, "SPI CS line must be 0-5");
        info!("registered SPI target '{}' on CS{}", target.name(), cs_line);
        self.spi_targets.insert(cs_line, target);
    }

    pub fn unregister_spi_target(&mut self, cs_line: u8) {
        if let Some(mut target) = self.spi_targets.remove(&cs_line) {
            target.deselect();
            if self.selected == Some(cs_line) {
                self.selected = None;
            }
            info!("unregistered SPI target '{}' from CS{}", target.name(), cs_line);
        }
    }

    /// Register an I2C target under its own 7-bit address.
    pub fn register_i2c_target(&mut self, target: Box<dyn I2cDevice>) {
        let address = target.address();
        assert!(address <= 0x7F, "I2C address must be 0x00-0x7F");
        info!(
            "registered I2C target '{}' at address 0x{:02X}",
            target.name(),
            address
        );
        self.i2c_targets.insert(address, target);
    }

    pub fn unregister_i2c_target(&mut self, address: u8) {
        if let Some(mut target) = self.i2c_targets.remove(&address) {
            target.reset();
            if self.i2c.active == Some(address) {
                self.i2c.active = None;
            }
            info!(
                "unregistered I2C target '{}' from address 0x{:02X}",
                target.name(),
                address
            );
        }
    }

    pub fn reset(&mut self) {
        self.port_b = 0x00;
        self.port_a = 0x00;
        self.ddr_b = 0x00;
        self.ddr_a = 0x00;
        self.t1_counter_low = 0xFF;
        self.t1_counter_high = 0xFF;
        self.t1_latch_low = 0xFF;
        self.t1_latch_high = 0xFF;
        self.t2_counter_low = 0xFF;
        self.t2_counter_high = 0xFF;
        self.shift_register = 0x00;
        self.aux_control = 0x00;
        self.peripheral_control = 0x00;
        self.interrupt_flags = 0x00;
        self.interrupt_enable = 0x00;

        self.sck_previous = false;
        self.selected = None;
        for target in self.spi_targets.values_mut() {
            target.reset();
            target.deselect();
        }

        self.i2c = I2cMaster::idle();
        for target in self.i2c_targets.values_mut() {
            target.reset();
        }

        debug!("peripheral controller reset");
    }

    // ---- SPI master ----

    fn write_port_b(&mut self, data: u8) {
        // Only bits configured as outputs change; input bits (MISO)
        // keep the value the selected target last drove.
        self.port_b = (self.port_b & !self.ddr_b) | (data & self.ddr_b);

        let sck = self.port_b & SPI_SCK != 0;
        if !self.sck_previous && sck {
            // Rising edge: sample MOSI, latch MISO.
            self.handle_spi_transfer();
        } else if self.sck_previous && !sck {
            self.handle_sck_falling();
        }
        self.sck_previous = sck;
    }

    fn read_port_b(&mut self) -> u8 {
        let mut result = self.port_b;
        if self.selected.is_none() {
            result |= SPI_MISO; // MISO floats high with no target
        }
        result
    }

    fn handle_spi_transfer(&mut self) {
        let Some(cs_line) = self.selected else {
            return;
        };
        if let Some(target) = self.spi_targets.get_mut(&cs_line) {
            if target.is_selected() {
                let mosi = self.port_b & SPI_MOSI != 0;
                let miso = target.transfer(mosi);
                if miso {
                    self.port_b |= SPI_MISO;
                } else {
                    self.port_b &= !SPI_MISO;
                }
            }
        }
    }

    fn handle_sck_falling(&mut self) {
        let Some(cs_line) = self.selected else {
            return;
        };
        if let Some(target) = self.spi_targets.get_mut(&cs_line) {
            if target.is_selected() {
                target.on_sck_falling();
            }
        }
    }

    fn write_port_a(&mut self, data: u8) {
        let old = self.port_a;
        self.port_a = data;
        self.handle_chip_select_changes(old, data);
        // SCL/SDA levels derive from DDRA alone (open-drain), so a port
        // write cannot produce an I2C edge.
    }

    fn read_port_a(&mut self) -> u8 {
        let mut result = self.port_a;
        // With SDA released (DDR bit clear) the master reads whatever
        // the addressed target is driving.
        if self.ddr_a & I2C_SDA == 0 {
            if self.i2c_sda_value() {
                result |= I2C_SDA;
            } else {
                result &= !I2C_SDA;
            }
        }
        result
    }

    fn handle_chip_select_changes(&mut self, old_port_a: u8, new_port_a: u8) {
        let old_cs = old_port_a & SPI_CS_MASK;
        let new_cs = new_port_a & SPI_CS_MASK;
        if old_cs == new_cs {
            return;
        }

        debug!("SPI chip select change: 0x{:02X} -> 0x{:02X}", old_cs, new_cs);

        if let Some(cs_line) = self.selected.take() {
            if let Some(target) = self.spi_targets.get_mut(&cs_line) {
                target.deselect();
            }
            debug!("SPI deselect: CS{}", cs_line);
        }

        // Active low, one-hot: exactly one cleared bit names the target.
        let inverted = !new_cs & SPI_CS_MASK;
        if inverted.count_ones() == 1 {
            let cs_line = inverted.trailing_zeros() as u8;
            self.selected = Some(cs_line);
            if let Some(target) = self.spi_targets.get_mut(&cs_line) {
                target.select();
            }
            debug!("SPI select: CS{}", cs_line);
        } else if new_cs == SPI_CS_MASK {
            // All lines high: nothing selected.
        } else {
            warn!(
                "multiple SPI chip selects active simultaneously: CS=0x{:02X}",
                new_cs
            );
        }
    }

    /// The chip-select line currently holding a target selected, if any.
    pub fn selected_spi_target(&self) -> Option<u8> {
        self.selected
    }

    // ---- I2C master ----

    fn handle_i2c_ddr_change(&mut self, new_ddr_a: u8) {
        // Open-drain: DDR bit clear = released = high via pull-up,
        // DDR bit set = driven low.
        let old_scl = self.i2c.scl_previous;
        let old_sda = self.i2c.sda_previous;
        let new_scl = new_ddr_a & I2C_SCL == 0;
        let new_sda = new_ddr_a & I2C_SDA == 0;

        // During the ACK phase the master releases SDA to read the
        // slave's ACK; that rise is not a STOP.
        let in_ack_phase = self.i2c.state != I2cState::Idle && self.i2c.bit_count == 8;

        if new_scl && old_sda && !new_sda {
            self.handle_i2c_start();
        } else if new_scl && !old_sda && new_sda && !in_ack_phase {
            self.handle_i2c_stop();
        } else if !old_scl && new_scl {
            self.handle_i2c_scl_rising(new_sda);
        } else if old_scl && !new_scl {
            self.handle_i2c_scl_falling();
        }

        self.i2c.scl_previous = new_scl;
        self.i2c.sda_previous = new_sda;
    }

    fn handle_i2c_start(&mut self) {
        if self.i2c.state != I2cState::Idle && self.i2c.active.is_some() {
            // Repeated START: the transaction continues, the target is
            // not stopped.
            debug!("I2C repeated START");
        } else {
            debug!("I2C START");
        }
        self.i2c.state = I2cState::Address;
        self.i2c.bit_count = 0;
        self.i2c.shift_reg = 0;
        self.i2c.active = None;
        self.i2c.slave_ack = false;
    }

    fn handle_i2c_stop(&mut self) {
        debug!(
            "I2C STOP ({} transaction)",
            if self.i2c.read_mode { "read" } else { "write" }
        );
        if let Some(address) = self.i2c.active {
            if let Some(target) = self.i2c_targets.get_mut(&address) {
                target.stop();
            }
        }
        self.i2c.state = I2cState::Idle;
        self.i2c.bit_count = 0;
        self.i2c.shift_reg = 0;
        self.i2c.active = None;
        self.i2c.read_mode = false;
        self.i2c.slave_ack = false;
    }

    /// SCL rising edge: the sampling edge.
    fn handle_i2c_scl_rising(&mut self, sda: bool) {
        if self.i2c.state == I2cState::Idle {
            return;
        }

        if self.i2c.bit_count == 8 {
            // Ninth clock: the ACK clock.
            debug!(
                "I2C ACK clock rising: state={:?}, sda={}, slave_ack={}",
                self.i2c.state, sda as u8, self.i2c.slave_ack
            );
            if self.i2c.state == I2cState::DataRead {
                // The master drives ACK/NACK; ACK means it wants more.
                let master_ack = !sda;
                if master_ack {
                    if let Some(target) = self
                        .i2c
                        .active
                        .and_then(|address| self.i2c_targets.get_mut(&address))
                    {
                        self.i2c.read_byte = target.read_byte(true);
                        debug!("I2C prefetched next read byte 0x{:02X}", self.i2c.read_byte);
                    }
                }
            }
            // For ADDRESS and DATA_WRITE the slave ACK is already
            // latched; the master reads it through the SDA overlay.
            self.i2c.bit_count = 9;
        } else if self.i2c.bit_count < 8 {
            if self.i2c.state != I2cState::DataRead {
                self.i2c.shift_reg = (self.i2c.shift_reg << 1) | sda as u8;
            }
            self.i2c.bit_count += 1;
            if self.i2c.bit_count == 8 {
                self.handle_i2c_byte_complete();
            }
        }
        // bit_count == 9: waiting for the ACK clock to fall.
    }

    /// SCL falling edge: bit boundaries move here.
    fn handle_i2c_scl_falling(&mut self) {
        if self.i2c.bit_count == 9 {
            // ACK cycle complete; next byte starts clean.
            self.i2c.bit_count = 0;
            self.i2c.shift_reg = 0;
        }
    }

    fn handle_i2c_byte_complete(&mut self) {
        let byte = self.i2c.shift_reg;

        match self.i2c.state {
            I2cState::Address => {
                let address = byte >> 1;
                let is_read = byte & 1 != 0;
                self.i2c.read_mode = is_read;
                debug!(
                    "I2C address byte 0x{:02X} (addr=0x{:02X}, {})",
                    byte,
                    address,
                    if is_read { "read" } else { "write" }
                );

                match self.i2c_targets.get_mut(&address) {
                    Some(target) => {
                        let ack = target.start(is_read);
                        self.i2c.active = Some(address);
                        self.i2c.slave_ack = ack;
                        if ack {
                            if is_read {
                                self.i2c.state = I2cState::DataRead;
                                self.i2c.read_byte = target.read_byte(true);
                            } else {
                                self.i2c.state = I2cState::DataWrite;
                                target.begin_write();
                            }
                        }
                    }
                    None => {
                        self.i2c.active = None;
                        self.i2c.slave_ack = false;
                        debug!("I2C no target at address 0x{:02X}", address);
                    }
                }
            }
            I2cState::DataWrite => {
                let ack = match self
                    .i2c
                    .active
                    .and_then(|address| self.i2c_targets.get_mut(&address))
                {
                    Some(target) => target.write_byte(byte),
                    None => false,
                };
                self.i2c.slave_ack = ack;
                debug!("I2C write byte 0x{:02X}, {}", byte, if ack { "ACK" } else { "NACK" });
            }
            // DATA_READ bytes are fetched at the ACK clock.
            _ => {}
        }
    }

    /// The SDA level the master observes when it reads port A with SDA
    /// released.
    fn i2c_sda_value(&self) -> bool {
        // ACK phase: the slave drives its ACK (low) or NACK (high).
        if (self.i2c.bit_count == 8 || self.i2c.bit_count == 9) && self.i2c.state != I2cState::Idle
        {
            return !self.i2c.slave_ack;
        }

        // Read data: bit_count was already advanced on the sampling
        // edge, so the bit on the wire is bit_count - 1, MSB first.
        if self.i2c.state == I2cState::DataRead && (1..=8).contains(&self.i2c.bit_count) {
            let bit_position = 7 - (self.i2c.bit_count - 1);
            return (self.i2c.read_byte >> bit_position) & 1 != 0;
        }

        true // released, pull-up wins
    }
}

impl Default for PeripheralController {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for PeripheralController {
    fn read(&mut self, offset: u16) -> u8 {
        match offset {
            ORB => self.read_port_b(),
            ORA | ORA_NH => self.read_port_a(),
            DDRB => self.ddr_b,
            DDRA => self.ddr_a,
            T1CL => {
                self.interrupt_flags &= !0x40;
                self.t1_counter_low
            }
            T1CH => self.t1_counter_high,
            T1LL => self.t1_latch_low,
            T1LH => self.t1_latch_high,
            T2CL => {
                self.interrupt_flags &= !0x20;
                self.t2_counter_low
            }
            T2CH => self.t2_counter_high,
            SR => self.shift_register,
            ACR => self.aux_control,
            PCR => self.peripheral_control,
            IFR => {
                let any = self.interrupt_flags & self.interrupt_enable & 0x7F != 0;
                self.interrupt_flags | if any { 0x80 } else { 0x00 }
            }
            IER => self.interrupt_enable | 0x80,
            _ => {
                warn!("read from invalid peripheral register 0x{:02X}", offset);
                0xFF
            }
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        match offset {
            ORB => self.write_port_b(value),
            ORA | ORA_NH => self.write_port_a(value),
            DDRB => self.ddr_b = value,
            DDRA => {
                self.ddr_a = value;
                self.handle_i2c_ddr_change(value);
            }
            T1CL => self.t1_latch_low = value,
            T1CH => {
                self.t1_counter_high = value;
                self.t1_counter_low = self.t1_latch_low;
            }
            T1LL => self.t1_latch_low = value,
            T1LH => self.t1_latch_high = value,
            T2CL => self.t2_counter_low = value,
            T2CH => self.t2_counter_high = value,
            SR => self.shift_register = value,
            ACR => self.aux_control = value,
            PCR => self.peripheral_control = value,
            IFR => self.interrupt_flags &= !(value & 0x7F),
            IER => {
                if value & 0x80 != 0 {
                    self.interrupt_enable |= value & 0x7F;
                } else {
                    self.interrupt_enable &= !(value & 0x7F);
                }
            }
            _ => {
                warn!(
                    "write to invalid peripheral register 0x{:02X} = 0x{:02X}",
                    offset, value
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "Peripheral Controller"
    }
}
