//! USB subsystem
//!
//! Raw usbdevfs access to the emulator: bus scanning, descriptor
//! validation, interface claiming and interrupt transfer slots.

pub mod descriptor;
pub mod devfs;
pub mod device;
pub mod locator;
pub mod transfers;

pub use device::UsbDevice;
pub use locator::{DeviceLocator, LocateError, Located, UsbTarget};
pub use transfers::{Channel, ChannelTable, TransferSlot};
