//! Device discovery over the usbdevfs node tree
//!
//! Scans `<root>/<bus>/<device>` (both levels are numeric names such as
//! `001/004`), reads each node's device descriptor, and acquires the first
//! node whose vendor/product pair matches and whose descriptors pass the
//! topology walk.

use crate::usb::descriptor::{
    DEVICE_DESCRIPTOR_LEN, DescriptorError, DeviceDescriptor, TopologyMismatch, read_fully,
    walk_descriptors,
};
use crate::usb::device::UsbDevice;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Vendor/product pair identifying the emulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbTarget {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl std::fmt::Display for UsbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Outcome of one bus scan
#[derive(Debug)]
pub enum Located {
    Found(UsbDevice),
    NotFound,
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("Failed to list {path}: {source}")]
    ListBus {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Finds the emulator among the attached USB devices
#[derive(Debug, Clone)]
pub struct DeviceLocator {
    root: PathBuf,
    target: UsbTarget,
    /// Nodes already reported as rejected while searching
    rejected: HashSet<PathBuf>,
}

impl DeviceLocator {
    pub fn new(root: impl Into<PathBuf>, target: UsbTarget) -> Self {
        Self {
            root: root.into(),
            target,
            rejected: HashSet::new(),
        }
    }

    pub fn target(&self) -> UsbTarget {
        self.target
    }

    /// Report rejected nodes again on the next search
    pub fn forget_rejections(&mut self) {
        self.rejected.clear();
    }

    /// Scan the bus once
    ///
    /// Only failing to list the root directory is an error. Nodes that
    /// cannot be opened or read are skipped, and a matching device with the
    /// wrong layout is rejected so the scan can move on to the next one.
    pub fn find(&mut self) -> Result<Located, LocateError> {
        let buses = fs::read_dir(&self.root).map_err(|source| LocateError::ListBus {
            path: self.root.clone(),
            source,
        })?;

        for bus in buses.flatten() {
            if !is_numeric_name(&bus.file_name()) {
                continue;
            }

            let Ok(nodes) = fs::read_dir(bus.path()) else {
                continue;
            };

            for node in nodes.flatten() {
                if !is_numeric_name(&node.file_name()) {
                    continue;
                }

                if let Some(device) = self.probe(&node.path()) {
                    return Ok(Located::Found(device));
                }
            }
        }

        Ok(Located::NotFound)
    }

    fn probe(&mut self, path: &Path) -> Option<UsbDevice> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                return None;
            }
        };

        let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
        let descriptor = match read_fully(&mut file, &mut raw)
            .map_err(DescriptorError::from)
            .and_then(|n| DeviceDescriptor::parse(&raw[..n]))
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                if self.note_rejection(path) {
                    warn!("{}: {}", path.display(), e);
                }
                return None;
            }
        };

        if descriptor.vendor_id != self.target.vendor_id
            || descriptor.product_id != self.target.product_id
        {
            return None;
        }

        match self.acquire(file, path, descriptor) {
            Ok(device) => {
                info!("Found {} at {}", self.target, path.display());
                Some(device)
            }
            Err(e) => {
                if self.note_rejection(path) {
                    warn!("Rejecting {}: {}", path.display(), e);
                } else {
                    debug!("Rejecting {}: {}", path.display(), e);
                }
                None
            }
        }
    }

    /// Whether this is the first rejection of `path` since the last reset
    fn note_rejection(&mut self, path: &Path) -> bool {
        self.rejected.insert(path.to_path_buf())
    }

    fn acquire(
        &self,
        mut file: File,
        path: &Path,
        descriptor: DeviceDescriptor,
    ) -> Result<UsbDevice, DescriptorError> {
        if descriptor.num_configurations != 1 {
            return Err(
                TopologyMismatch::ConfigurationCount(descriptor.num_configurations).into(),
            );
        }

        let endpoints = walk_descriptors(&mut file)?;
        debug!("{}: endpoints {:?}", path.display(), endpoints);

        Ok(UsbDevice::claim(file, path.to_path_buf(), endpoints))
    }
}

fn is_numeric_name(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::descriptor::fixtures::*;

    const TARGET: UsbTarget = UsbTarget {
        vendor_id: 0x16c0,
        product_id: 0x0486,
    };

    fn write_node(root: &Path, bus: &str, dev: &str, bytes: &[u8]) -> PathBuf {
        let dir = root.join(bus);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(dev);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn emulator_node() -> Vec<u8> {
        [device(0x16c0, 0x0486, 1), emulator_config()].concat()
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut locator = DeviceLocator::new(dir.path().join("absent"), TARGET);
        assert!(matches!(locator.find(), Err(LocateError::ListBus { .. })));
    }

    #[test]
    fn test_empty_bus_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "001", "001", &device(0x1d6b, 0x0002, 1));
        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        assert!(matches!(locator.find().unwrap(), Located::NotFound));
    }

    #[test]
    fn test_finds_matching_node() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "001", "001", &device(0x1d6b, 0x0002, 1));
        let path = write_node(dir.path(), "002", "005", &emulator_node());

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        match locator.find().unwrap() {
            Located::Found(device) => {
                assert_eq!(device.path(), path);
                assert_eq!(device.endpoints().interface(0).ep_in, 0x83);
                assert_eq!(device.endpoints().interface(1).ep_out, 0x02);
            }
            Located::NotFound => panic!("device not found"),
        }
    }

    #[test]
    fn test_non_numeric_names_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "devices", "001", &emulator_node());
        write_node(dir.path(), "001", "descriptors", &emulator_node());

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        assert!(matches!(locator.find().unwrap(), Located::NotFound));
    }

    #[test]
    fn test_bad_topology_skips_to_next_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = emulator_node();
        // second interface becomes a vendor-specific class
        let class_offset = 18 + 9 + 9 + 9 + 7 + 7 + 5;
        bad[class_offset] = 0xff;
        write_node(dir.path(), "001", "002", &bad);
        let good = write_node(dir.path(), "001", "003", &emulator_node());

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        match locator.find().unwrap() {
            Located::Found(device) => assert_eq!(device.path(), good),
            Located::NotFound => panic!("good candidate not found"),
        }
    }

    #[test]
    fn test_rejection_reported_once_per_search() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = [device(0x16c0, 0x0486, 2), emulator_config()].concat();
        let path = write_node(dir.path(), "001", "002", &bytes);

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        assert!(matches!(locator.find().unwrap(), Located::NotFound));
        assert!(locator.rejected.contains(&path));
        assert!(!locator.note_rejection(&path));

        locator.forget_rejections();
        assert!(locator.note_rejection(&path));
    }

    #[test]
    fn test_multiple_configurations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = [device(0x16c0, 0x0486, 2), emulator_config()].concat();
        write_node(dir.path(), "001", "002", &bytes);

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        assert!(matches!(locator.find().unwrap(), Located::NotFound));
    }

    #[test]
    fn test_short_node_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "001", "002", &[18, 0x01, 0x00]);

        let mut locator = DeviceLocator::new(dir.path(), TARGET);
        assert!(matches!(locator.find().unwrap(), Located::NotFound));
    }

    #[test]
    fn test_numeric_names() {
        assert!(is_numeric_name(std::ffi::OsStr::new("001")));
        assert!(!is_numeric_name(std::ffi::OsStr::new("")));
        assert!(!is_numeric_name(std::ffi::OsStr::new("usb1")));
    }
}
