//! USB descriptor parsing and topology validation
//!
//! A usbdevfs node reads back as the 18-byte device descriptor followed by
//! every configuration descriptor with its interface, class and endpoint
//! descriptors. Each record starts with `bLength` and `bDescriptorType`; the
//! walker reads that header, reads the rest of the record, and only then
//! decodes the body for the type it announced.
//!
//! The emulator is expected to expose exactly one configuration with two HID
//! interfaces (data and debug), each with one IN and one OUT interrupt
//! endpoint.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read};
use thiserror::Error;
use tracing::debug;

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_HID: u8 = 0x21;

pub const CLASS_HID: u8 = 0x03;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
const CONFIG_DESCRIPTOR_LEN: usize = 9;
const INTERFACE_DESCRIPTOR_LEN: usize = 9;
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// Number of interfaces the emulator exposes
pub const INTERFACE_COUNT: usize = 2;

const ENDPOINTS_PER_INTERFACE: u8 = 2;
const ALLOWED_MAX_PACKET_SIZES: [u16; 2] = [64, 32];

/// Endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn of_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// Ways a device can differ from the expected layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyMismatch {
    #[error("unexpected bNumConfigurations: {0}")]
    ConfigurationCount(u8),

    #[error("unexpected bNumInterfaces: {0}")]
    InterfaceCount(u8),

    #[error("unexpected interface {class:x}:{subclass:x}:{protocol:x}")]
    InterfaceClass { class: u8, subclass: u8, protocol: u8 },

    #[error("unexpected bNumEndpoints: {0}")]
    EndpointCount(u8),

    #[error("endpoint {address:02x} outside of a known interface")]
    EndpointOutsideInterface { address: u8 },

    #[error("iface {interface}, EP {address:02x}: unexpected wMaxPacketSize: {size}")]
    MaxPacketSize {
        interface: usize,
        address: u8,
        size: u16,
    },

    #[error("missing {direction} endpoint, iface: {interface}")]
    MissingEndpoint {
        interface: usize,
        direction: Direction,
    },
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("topology mismatch: {0}")]
    TopologyMismatch(#[from] TopologyMismatch),

    #[error("descriptor {kind:#04x} truncated: {actual}/{expected} bytes")]
    Truncated {
        kind: u8,
        expected: usize,
        actual: usize,
    },

    #[error("descriptor {kind:#04x} has bad bLength {length}")]
    BadLength { kind: u8, length: u8 },

    #[error("unexpected descriptor type {0:#04x}, expected device descriptor")]
    NotDevice(u8),

    #[error("descriptor read failed: {0}")]
    Io(#[from] io::Error),
}

/// The fields of the device descriptor the locator needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(DescriptorError::Truncated {
                kind: DT_DEVICE,
                expected: DEVICE_DESCRIPTOR_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[1] != DT_DEVICE {
            return Err(DescriptorError::NotDevice(bytes[1]));
        }

        Ok(Self {
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            num_configurations: bytes[17],
        })
    }
}

/// One decoded descriptor record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Configuration {
        num_interfaces: u8,
    },
    Interface {
        number: u8,
        num_endpoints: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
    },
    Endpoint {
        address: u8,
        max_packet_size: u16,
    },
    Hid,
    Other {
        kind: u8,
    },
}

impl Descriptor {
    /// Decode a complete record, header included
    pub fn parse(record: &[u8]) -> Result<Self, DescriptorError> {
        let kind = *record.get(1).ok_or(DescriptorError::Truncated {
            kind: 0,
            expected: 2,
            actual: record.len(),
        })?;
        let need = |len: usize| {
            if record.len() < len {
                Err(DescriptorError::Truncated {
                    kind,
                    expected: len,
                    actual: record.len(),
                })
            } else {
                Ok(())
            }
        };

        match kind {
            DT_CONFIG => {
                need(CONFIG_DESCRIPTOR_LEN)?;
                Ok(Descriptor::Configuration {
                    num_interfaces: record[4],
                })
            }
            DT_INTERFACE => {
                need(INTERFACE_DESCRIPTOR_LEN)?;
                Ok(Descriptor::Interface {
                    number: record[2],
                    num_endpoints: record[4],
                    class: record[5],
                    subclass: record[6],
                    protocol: record[7],
                })
            }
            DT_ENDPOINT => {
                need(ENDPOINT_DESCRIPTOR_LEN)?;
                Ok(Descriptor::Endpoint {
                    address: record[2],
                    max_packet_size: LittleEndian::read_u16(&record[4..6]),
                })
            }
            DT_HID => Ok(Descriptor::Hid),
            kind => Ok(Descriptor::Other { kind }),
        }
    }
}

/// Reads whole descriptor records off a byte stream
pub struct DescriptorReader<R> {
    reader: R,
}

impl<R: Read> DescriptorReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next complete record, or `None` at a clean end of stream
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, DescriptorError> {
        let mut header = [0u8; 2];
        let got = read_fully(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < header.len() {
            return Err(DescriptorError::Truncated {
                kind: 0,
                expected: header.len(),
                actual: got,
            });
        }

        let [length, kind] = header;
        if usize::from(length) < header.len() {
            return Err(DescriptorError::BadLength { kind, length });
        }

        let mut record = vec![0u8; usize::from(length)];
        record[..2].copy_from_slice(&header);
        let got = read_fully(&mut self.reader, &mut record[2..])?;
        if got < record.len() - 2 {
            return Err(DescriptorError::Truncated {
                kind,
                expected: record.len(),
                actual: got + 2,
            });
        }

        Ok(Some(record))
    }
}

/// Read until `buf` is full or the stream ends, returning the byte count
pub fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// IN and OUT endpoint addresses of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceEndpoints {
    pub ep_in: u8,
    pub ep_out: u8,
}

/// Endpoint addresses of both interfaces, always fully populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointTable {
    interfaces: [InterfaceEndpoints; INTERFACE_COUNT],
}

impl EndpointTable {
    pub fn new(interfaces: [InterfaceEndpoints; INTERFACE_COUNT]) -> Self {
        Self { interfaces }
    }

    pub fn interface(&self, index: usize) -> &InterfaceEndpoints {
        &self.interfaces[index]
    }
}

/// Walk state for one pass over a configuration
#[derive(Debug, Default)]
struct DescriptorCursor {
    interface: Option<usize>,
    endpoints: [[Option<u8>; 2]; INTERFACE_COUNT],
}

impl DescriptorCursor {
    fn visit(&mut self, descriptor: Descriptor) -> Result<(), TopologyMismatch> {
        match descriptor {
            Descriptor::Configuration { num_interfaces } => {
                if usize::from(num_interfaces) != INTERFACE_COUNT {
                    return Err(TopologyMismatch::InterfaceCount(num_interfaces));
                }
            }
            Descriptor::Interface {
                number,
                num_endpoints,
                class,
                subclass,
                protocol,
            } => {
                if class != CLASS_HID || subclass != 0 || protocol != 0 {
                    return Err(TopologyMismatch::InterfaceClass {
                        class,
                        subclass,
                        protocol,
                    });
                }
                if num_endpoints != ENDPOINTS_PER_INTERFACE {
                    return Err(TopologyMismatch::EndpointCount(num_endpoints));
                }
                let index = self.interface.map_or(0, |i| i + 1);
                debug!("Interface {} (bInterfaceNumber {})", index, number);
                self.interface = Some(index);
            }
            Descriptor::Endpoint {
                address,
                max_packet_size,
            } => {
                let interface = self
                    .interface
                    .filter(|&i| i < INTERFACE_COUNT)
                    .ok_or(TopologyMismatch::EndpointOutsideInterface { address })?;

                if !ALLOWED_MAX_PACKET_SIZES.contains(&max_packet_size) {
                    return Err(TopologyMismatch::MaxPacketSize {
                        interface,
                        address,
                        size: max_packet_size,
                    });
                }

                let slot = match Direction::of_address(address) {
                    Direction::In => 0,
                    Direction::Out => 1,
                };
                self.endpoints[interface][slot] = Some(address);
            }
            Descriptor::Hid => {}
            Descriptor::Other { kind } => {
                debug!("Skipping descriptor {:#04x}", kind);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<EndpointTable, TopologyMismatch> {
        let mut interfaces = [InterfaceEndpoints { ep_in: 0, ep_out: 0 }; INTERFACE_COUNT];

        for (index, ([ep_in, ep_out], out)) in
            self.endpoints.into_iter().zip(interfaces.iter_mut()).enumerate()
        {
            out.ep_in = ep_in.ok_or(TopologyMismatch::MissingEndpoint {
                interface: index,
                direction: Direction::In,
            })?;
            out.ep_out = ep_out.ok_or(TopologyMismatch::MissingEndpoint {
                interface: index,
                direction: Direction::Out,
            })?;
        }

        Ok(EndpointTable::new(interfaces))
    }
}

/// Validate the configuration descriptors following the device descriptor
///
/// Consumes `reader` to its end and returns the endpoint addresses of both
/// interfaces, or the first violation found.
pub fn walk_descriptors<R: Read>(reader: R) -> Result<EndpointTable, DescriptorError> {
    let mut records = DescriptorReader::new(reader);
    let mut cursor = DescriptorCursor::default();

    while let Some(record) = records.next_record()? {
        cursor.visit(Descriptor::parse(&record)?)?;
    }

    Ok(cursor.finish()?)
}
