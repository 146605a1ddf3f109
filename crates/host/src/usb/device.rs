//! Claimed emulator device
//!
//! Owns the open usbdevfs node together with the endpoint addresses found
//! while walking its descriptors.

use crate::usb::descriptor::{EndpointTable, INTERFACE_COUNT};
use crate::usb::devfs;
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Open, claimed emulator device
///
/// Dropping the device releases its interfaces, hands them back to the
/// kernel and closes the node, which also cancels any URB still queued.
#[derive(Debug)]
pub struct UsbDevice {
    file: File,
    path: PathBuf,
    endpoints: EndpointTable,
    claimed_interfaces: Vec<u32>,
}

impl UsbDevice {
    /// Take over the interfaces of a validated device node
    ///
    /// Kernel drivers are detached first; an interface with no driver is
    /// not an error. A failed claim is logged and the handle is returned
    /// anyway, so the first transfer submission reports the real cause.
    pub fn claim(file: File, path: PathBuf, endpoints: EndpointTable) -> Self {
        let mut device = Self {
            file,
            path,
            endpoints,
            claimed_interfaces: Vec::new(),
        };

        for interface in 0..INTERFACE_COUNT as u32 {
            match devfs::disconnect_driver(&device.file, interface) {
                Ok(()) => debug!("Detached kernel driver from interface {}", interface),
                Err(Errno::ENODATA) => {}
                Err(e) => warn!("USBDEVFS_DISCONNECT on interface {}: {}", interface, e),
            }

            match devfs::claim_interface(&device.file, interface) {
                Ok(()) => {
                    debug!(
                        "Claimed interface {} on {}",
                        interface,
                        device.path.display()
                    );
                    device.claimed_interfaces.push(interface);
                }
                Err(e) => error!("USBDEVFS_CLAIMINTERFACE on interface {}: {}", interface, e),
            }
        }

        device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }
}

impl AsFd for UsbDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for UsbDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        for &interface in &self.claimed_interfaces {
            if let Err(e) = devfs::release_interface(&self.file, interface) {
                debug!("Could not release interface {}: {}", interface, e);
            }
            if let Err(e) = devfs::connect_driver(&self.file, interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        debug!("Closed {}", self.path.display());
    }
}
