use std::io;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};

use crate::devices::disk::{DiskImage, SECTOR_SIZE};
use crate::devices::spi::SpiDevice;

// SD commands (first frame byte: 0x40 | command number)
const CMD0: u8 = 0x40; // GO_IDLE_STATE
const CMD8: u8 = 0x48; // SEND_IF_COND
const CMD17: u8 = 0x51; // READ_SINGLE_BLOCK
const CMD24: u8 = 0x58; // WRITE_SINGLE_BLOCK
const CMD55: u8 = 0x77; // APP_CMD
const ACMD41: u8 = 0x69; // SD_SEND_OP_COND

// R1 responses
const R1_IDLE: u8 = 0x01;
const R1_READY: u8 = 0x00;
const R1_ILLEGAL_CMD: u8 = 0x04;

const DATA_TOKEN: u8 = 0xFE;
const DATA_ACCEPTED: u8 = 0x05;

/// Card size reported while no image is mounted.
const DEFAULT_CARD_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    Idle,
    Ready,
    Reading,
    Writing,
    Error,
}

/// SPI-mode SD card backed by a raw disk image.
///
/// Bits from the master accumulate MSB-first; every completed byte runs
/// the command parser. Responses are pre-expanded into a bit buffer and
/// shifted out on subsequent transfers. A response staged by the parser
/// does not begin until the next SCK falling edge, so the master always
/// sees 0xFF through the end of the 6-byte command frame.
pub struct SpiSdCard {
    state: CardState,
    selected: bool,
    image: Option<DiskImage>,

    // bit-level framing
    bit_buffer: u8,
    bit_count: u8,

    // command accumulation
    command: [u8; 6],
    command_index: usize,
    in_command: bool,

    // active response, pre-expanded MSB-first
    response_bits: [bool; 8],
    response_bit_index: usize,
    response_ready: bool,

    // staged response, installed on the SCK falling edge
    pending_response: u8,
    has_pending_response: bool,

    // multi-byte queue for R7 frames
    response_queue: [u8; 5],
    queue_index: usize,
    queue_len: usize,
    using_queue: bool,

    // data phases
    data_buffer: [u8; SECTOR_SIZE],
    data_transfer_index: usize,
    in_data_transfer: bool,
    awaiting_write_token: bool,
    writing_data: bool,
    write_data_index: usize,
    current_sector: u64,
}

impl SpiSdCard {
    pub fn new() -> Self {
        let mut card = Self {
            state: CardState::Idle,
            selected: false,
            image: None,
            bit_buffer: 0,
            bit_count: 0,
            command: [0; 6],
            command_index: 0,
            in_command: false,
            response_bits: [true; 8],
            response_bit_index: 0,
            response_ready: false,
            pending_response: 0,
            has_pending_response: false,
            response_queue: [0xFF; 5],
            queue_index: 0,
            queue_len: 0,
            using_queue: false,
            data_buffer: [0; SECTOR_SIZE],
            data_transfer_index: 0,
            in_data_transfer: false,
            awaiting_write_token: false,
            writing_data: false,
            write_data_index: 0,
            current_sector: 0,
        };
        card.reset();
        info!("SPI SD card initialized (no image mounted)");
        card
    }

    /// Mount a disk image file. Replaces any image already mounted.
    pub fn mount_image(&mut self, path: &Path) -> io::Result<()> {
        let image = DiskImage::open(path)?;
        info!(
            "SD card mounted image: {} ({} bytes)",
            path.display(),
            image.size()
        );
        self.image = Some(image);
        Ok(())
    }

    /// Unmount the current image, flushing and closing the file.
    pub fn unmount_image(&mut self) {
        if self.image.take().is_some() {
            info!("SD card image unmounted");
        }
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_ref().map(|image| image.path())
    }

    pub fn is_image_mounted(&self) -> bool {
        self.image.is_some()
    }

    /// Size of the mounted image, or the default card size without one.
    pub fn card_size(&self) -> u64 {
        self.image
            .as_ref()
            .map(|image| image.size())
            .unwrap_or(DEFAULT_CARD_SIZE)
    }

    /// Expand a response byte into MSB-first bits and make it active.
    fn prepare_response(&mut self, response: u8) {
        for (i, bit) in self.response_bits.iter_mut().enumerate() {
            *bit = (response >> (7 - i)) & 1 != 0;
        }
        self.response_ready = true;
        self.response_bit_index = 0;
    }

    fn process_byte(&mut self, byte: u8) {
        // Ongoing sector read: every incoming dummy byte clocks out the
        // next outgoing byte.
        if self.in_data_transfer && !self.writing_data {
            self.handle_data_transfer();
            return;
        }

        if self.awaiting_write_token {
            if byte == DATA_TOKEN {
                self.awaiting_write_token = false;
                self.writing_data = true;
                self.write_data_index = 0;
                debug!(
                    "SD card received data token, receiving sector {}",
                    self.current_sector
                );
            }
            // Anything else is a dummy byte before the token.
            return;
        }

        if self.writing_data {
            self.handle_write_data(byte);
            return;
        }

        // Dummy bytes outside a command frame are for clocking responses.
        if byte == 0xFF && !self.in_command {
            return;
        }

        // Command frames start with a byte whose bit 6 is set (0x40-0x7F).
        if (byte & 0x40 != 0 && byte != 0xFF) || self.in_command {
            if byte & 0x40 != 0 && byte != 0xFF && !self.in_command {
                // New command: drop any response still in flight.
                self.response_ready = false;
                self.response_bit_index = 0;
                self.has_pending_response = false;
            }

            self.command[self.command_index] = byte;
            self.command_index += 1;
            self.in_command = true;

            if self.command_index >= 6 {
                // Stage the response; it activates on the next SCK
                // falling edge, never mid-frame.
                let response = self.process_command();
                self.pending_response = response;
                self.has_pending_response = response != 0xFF;
                self.command_index = 0;
                self.in_command = false;
            }
        }
    }

    /// Run a complete 6-byte command frame and return the R1 byte.
    fn process_command(&mut self) -> u8 {
        let cmd = self.command[0];
        let arg = BigEndian::read_u32(&self.command[1..5]);

        match cmd {
            CMD0 => {
                self.state = CardState::Idle;
                R1_IDLE
            }
            CMD8 => {
                if self.state == CardState::Idle {
                    // R7: R1 + 4 data bytes (voltage accepted, check
                    // pattern echo).
                    self.response_queue = [R1_IDLE, 0x00, 0x00, 0x01, 0xAA];
                    self.queue_len = 5;
                    self.queue_index = 0;
                    self.using_queue = true;
                    self.response_queue[0]
                } else {
                    R1_ILLEGAL_CMD
                }
            }
            CMD55 => {
                if self.state == CardState::Idle {
                    R1_IDLE
                } else {
                    R1_READY
                }
            }
            // Dispatched by opcode alone; the CMD55 pairing is not
            // enforced.
            ACMD41 => {
                self.state = CardState::Ready;
                R1_READY
            }
            CMD17 => {
                if self.state == CardState::Ready {
                    self.current_sector = arg as u64;
                    self.start_read_operation();
                    R1_READY
                } else {
                    R1_ILLEGAL_CMD
                }
            }
            CMD24 => {
                if self.state == CardState::Ready {
                    self.current_sector = arg as u64;
                    self.awaiting_write_token = true;
                    self.write_data_index = 0;
                    self.state = CardState::Writing;
                    debug!("SD card CMD24: will write sector {}", self.current_sector);
                    R1_READY
                } else {
                    R1_ILLEGAL_CMD
                }
            }
            _ => {
                warn!("unknown SD command: 0x{:02X}", cmd);
                R1_ILLEGAL_CMD
            }
        }
    }

    /// Sector read data phase: data token, 512 data bytes, CRC high,
    /// CRC low.
    fn handle_data_transfer(&mut self) {
        let response = if self.data_transfer_index == 0 {
            self.data_transfer_index += 1;
            DATA_TOKEN
        } else if self.data_transfer_index <= SECTOR_SIZE {
            let index = self.data_transfer_index - 1;
            self.data_transfer_index += 1;
            self.data_buffer[index]
        } else if self.data_transfer_index == SECTOR_SIZE + 1 {
            self.data_transfer_index += 1;
            (crc16_ccitt(&self.data_buffer) >> 8) as u8
        } else {
            let crc = crc16_ccitt(&self.data_buffer);
            self.in_data_transfer = false;
            self.data_transfer_index = 0;
            self.state = CardState::Ready;
            crc as u8
        };
        self.prepare_response(response);
    }

    fn start_read_operation(&mut self) {
        let Some(image) = self.image.as_mut() else {
            error!("no disk image mounted for read operation");
            return;
        };

        let offset = self.current_sector * SECTOR_SIZE as u64;
        if offset >= image.size() {
            error!("read beyond end of card: sector {}", self.current_sector);
            return;
        }

        match image.read_at(offset, &mut self.data_buffer) {
            Ok(()) => {
                self.in_data_transfer = true;
                self.data_transfer_index = 0;
                self.writing_data = false;
                self.state = CardState::Reading;
            }
            Err(e) => {
                error!("error reading from disk image: {}", e);
                self.state = CardState::Error;
            }
        }
    }

    /// Sector write data phase: 512 data bytes, then two CRC bytes
    /// (received but not validated). The sector hits the image on the
    /// final CRC byte.
    fn handle_write_data(&mut self, byte: u8) {
        if self.write_data_index < SECTOR_SIZE {
            self.data_buffer[self.write_data_index] = byte;
            self.write_data_index += 1;
        } else if self.write_data_index == SECTOR_SIZE {
            self.write_data_index += 1;
        } else {
            self.write_data_index += 1;
            self.write_to_image();
            self.prepare_response(DATA_ACCEPTED);
            self.writing_data = false;
            if self.state == CardState::Writing {
                self.state = CardState::Ready;
            }
            debug!(
                "SD card write complete for sector {}, sent data-accepted",
                self.current_sector
            );
        }
    }

    fn write_to_image(&mut self) {
        let Some(image) = self.image.as_mut() else {
            error!("no disk image mounted for write operation");
            return;
        };

        let offset = self.current_sector * SECTOR_SIZE as u64;
        if offset >= image.size() {
            error!("write beyond end of card: sector {}", self.current_sector);
            return;
        }

        match image.write_at(offset, &self.data_buffer) {
            Ok(()) => info!("SD card wrote sector {} to disk image", self.current_sector),
            Err(e) => {
                error!("error writing to disk image: {}", e);
                self.state = CardState::Error;
            }
        }
    }
}

impl Default for SpiSdCard {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiDevice for SpiSdCard {
    fn select(&mut self) {
        self.selected = true;
        debug!("SD card selected");
    }

    fn deselect(&mut self) {
        self.selected = false;
        // Transient response state goes away so a re-select starts
        // clean; the card-state enum survives across deselects.
        self.response_ready = false;
        self.response_bit_index = 0;
        self.has_pending_response = false;
        self.using_queue = false;
        self.queue_index = 0;
        self.queue_len = 0;
        self.response_bits = [true; 8];
        debug!("SD card deselected");
    }

    fn transfer(&mut self, mosi: bool) -> bool {
        if !self.selected {
            return true; // MISO floats high when not selected
        }

        let mut miso = true;

        if self.response_ready && self.response_bit_index < 8 {
            miso = self.response_bits[self.response_bit_index];
            self.response_bit_index += 1;
            if self.response_bit_index >= 8 {
                self.response_ready = false;
                self.response_bit_index = 0;
                if self.using_queue && self.queue_index + 1 < self.queue_len {
                    self.queue_index += 1;
                    self.prepare_response(self.response_queue[self.queue_index]);
                } else if self.using_queue {
                    self.using_queue = false;
                    self.queue_index = 0;
                    self.queue_len = 0;
                }
            }
        }

        self.bit_buffer = (self.bit_buffer << 1) | mosi as u8;
        self.bit_count += 1;
        if self.bit_count >= 8 {
            let byte = self.bit_buffer;
            self.bit_buffer = 0;
            self.bit_count = 0;
            self.process_byte(byte);
        }

        miso
    }

    fn on_sck_falling(&mut self) {
        if self.has_pending_response {
            let response = self.pending_response;
            self.prepare_response(response);
            self.has_pending_response = false;
        }
    }

    fn reset(&mut self) {
        self.state = CardState::Idle;
        self.selected = false;
        self.bit_buffer = 0;
        self.bit_count = 0;
        self.command_index = 0;
        self.in_command = false;
        self.response_ready = false;
        self.response_bit_index = 0;
        self.has_pending_response = false;
        self.in_data_transfer = false;
        self.data_transfer_index = 0;
        self.writing_data = false;
        self.awaiting_write_token = false;
        self.write_data_index = 0;
        self.response_bits = [true; 8];
        self.response_queue = [0xFF; 5];
        self.queue_index = 0;
        self.queue_len = 0;
        self.using_queue = false;
        debug!("SD card reset");
    }

    fn is_selected(&self) -> bool {
        self.selected
    }

    fn name(&self) -> &'static str {
        "SD Card"
    }
}

/// CRC-16-CCITT over the sector data phase: polynomial 0x1021, initial
/// value 0x0000, bytes processed MSB-first.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
