use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::info;

use crate::bus::{Bus, BusError};
use crate::devices::peripheral::{PeripheralController, PERIPHERAL_SIZE};
use crate::devices::ps2::{Ps2Input, Ps2Interface, PS2_SIZE};
use crate::devices::rtc::Ds3231;
use crate::devices::sdcard::SpiSdCard;
use crate::devices::video::{VideoController, VIDEO_SIZE};

// Waffle2e I/O map
pub const VIDEO_BASE: u16 = 0x4000;
pub const PS2_BASE: u16 = 0x4020;
pub const PERIPHERAL_BASE: u16 = 0x4070;

/// Chip-select line the SD card hangs off.
pub const SD_CS_LINE: u8 = 0;

/// The Waffle2e peripheral board: the bus plus every core device, wired
/// at the canonical addresses. RAM, ROM, and the serial ports are
/// external and registered by the system integrator on the same bus.
pub struct Machine {
    bus: Bus,
    video: Arc<Mutex<VideoController>>,
    ps2_input: Ps2Input,
    peripheral: Arc<Mutex<PeripheralController>>,
    sd_card: Arc<Mutex<SpiSdCard>>,
}

impl Machine {
    pub fn new() -> Result<Self, BusError> {
        let mut bus = Bus::new();

        let video = Arc::new(Mutex::new(VideoController::new()));
        bus.add_device(VIDEO_BASE, VIDEO_BASE + VIDEO_SIZE - 1, Box::new(video.clone()))?;

        let ps2 = Ps2Interface::new(bus.irq());
        let ps2_input = ps2.input();
        bus.add_device(PS2_BASE, PS2_BASE + PS2_SIZE - 1, Box::new(ps2))?;

        let sd_card = Arc::new(Mutex::new(SpiSdCard::new()));
        let mut peripheral = PeripheralController::new();
        peripheral.register_spi_target(SD_CS_LINE, Box::new(sd_card.clone()));
        peripheral.register_i2c_target(Box::new(Ds3231::new()));
        let peripheral = Arc::new(Mutex::new(peripheral));
        bus.add_device(
            PERIPHERAL_BASE,
            PERIPHERAL_BASE + PERIPHERAL_SIZE - 1,
            Box::new(peripheral.clone()),
        )?;

        info!("Waffle2e peripheral core initialized");

        Ok(Self {
            bus,
            video,
            ps2_input,
            peripheral,
            sd_card,
        })
    }

    pub fn bus(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn video(&self) -> Arc<Mutex<VideoController>> {
        self.video.clone()
    }

    pub fn ps2_input(&self) -> Ps2Input {
        self.ps2_input.clone()
    }

    pub fn peripheral(&self) -> Arc<Mutex<PeripheralController>> {
        self.peripheral.clone()
    }

    pub fn sd_card(&self) -> Arc<Mutex<SpiSdCard>> {
        self.sd_card.clone()
    }

    pub fn mount_disk_image(&self, path: &Path) -> io::Result<()> {
        self.sd_card.lock().unwrap().mount_image(path)
    }

    pub fn unmount_disk_image(&self) {
        self.sd_card.lock().unwrap().unmount_image();
    }

    pub fn disk_image_path(&self) -> Option<PathBuf> {
        self.sd_card
            .lock()
            .unwrap()
            .image_path()
            .map(|path| path.to_path_buf())
    }

    pub fn is_disk_image_mounted(&self) -> bool {
        self.sd_card.lock().unwrap().is_image_mounted()
    }

    /// Tear down: close the disk image and drain listener lists. Pacing
    /// timers that fire afterwards find an empty queue and do nothing.
    pub fn shutdown(&mut self) {
        self.unmount_disk_image();
        self.video.lock().unwrap().clear_listeners();
        self.ps2_input.clear_listeners();
        info!("Waffle2e peripheral core shut down");
    }
}
