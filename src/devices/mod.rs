pub mod disk;
pub mod i2c;
pub mod peripheral;
pub mod ps2;
pub mod rtc;
pub mod sdcard;
pub mod spi;
pub mod video;


pub use disk::DiskImage;
pub use i2c::I2cDevice;
pub use peripheral::PeripheralController;
pub use ps2::{Key, Ps2Input, Ps2Interface};
pub use rtc::Ds3231;
pub use sdcard::SpiSdCard;
pub use spi::SpiDevice;
pub use video::VideoController;
