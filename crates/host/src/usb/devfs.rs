//! Linux usbdevfs bindings
//!
//! Thin wrappers around the `USBDEVFS_*` ioctls used on a
//! `/dev/bus/usb/BBB/DDD` node: interface claiming, kernel driver
//! detach/reattach, and asynchronous URB submission and reaping.

use nix::errno::Errno;
use nix::libc::{c_int, c_uint, c_void};
use std::os::fd::AsRawFd;
use std::ptr;

const USBDEVFS_URB_TYPE_INTERRUPT: u8 = 1;

/// `struct usbdevfs_urb` without the trailing iso packet array
#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub kind: u8,
    pub endpoint: u8,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut c_void,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets: c_int,
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
}

impl Default for Urb {
    fn default() -> Self {
        Self {
            kind: 0,
            endpoint: 0,
            status: 0,
            flags: 0,
            buffer: ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: ptr::null_mut(),
        }
    }
}

impl Urb {
    /// Prepare an interrupt transfer over `buffer`
    ///
    /// Fails with `EMSGSIZE` when the buffer length does not fit the URB.
    pub fn interrupt(endpoint: u8, buffer: &mut [u8]) -> nix::Result<Self> {
        let buffer_length = c_int::try_from(buffer.len()).map_err(|_| Errno::EMSGSIZE)?;
        Ok(Self {
            kind: USBDEVFS_URB_TYPE_INTERRUPT,
            endpoint,
            buffer: buffer.as_mut_ptr().cast(),
            buffer_length,
            ..Self::default()
        })
    }

    /// Bytes actually transferred, never more than the buffer
    pub fn actual_len(&self) -> usize {
        usize::try_from(self.actual_length)
            .unwrap_or(0)
            .min(usize::try_from(self.buffer_length).unwrap_or(0))
    }
}

/// `struct usbdevfs_ioctl`, used to reach the hub-level driver requests
#[repr(C)]
struct UsbdevfsIoctl {
    ifno: c_int,
    ioctl_code: c_int,
    data: *mut c_void,
}

nix::ioctl_read!(usbdevfs_submiturb, b'U', 10, Urb);
nix::ioctl_write_ptr!(usbdevfs_reapurbndelay, b'U', 13, *mut c_void);
nix::ioctl_read!(usbdevfs_claiminterface, b'U', 15, c_uint);
nix::ioctl_read!(usbdevfs_releaseinterface, b'U', 16, c_uint);
nix::ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, UsbdevfsIoctl);

const USBDEVFS_DISCONNECT: c_int = nix::request_code_none!(b'U', 22) as c_int;
const USBDEVFS_CONNECT: c_int = nix::request_code_none!(b'U', 23) as c_int;

fn driver_request(fd: &impl AsRawFd, interface: u32, code: c_int) -> nix::Result<()> {
    let mut request = UsbdevfsIoctl {
        ifno: c_int::try_from(interface).map_err(|_| Errno::EINVAL)?,
        ioctl_code: code,
        data: ptr::null_mut(),
    };
    // SAFETY: `request` is a valid usbdevfs_ioctl that outlives the call and
    // carries no data pointer.
    unsafe { usbdevfs_ioctl(fd.as_raw_fd(), &mut request) }?;
    Ok(())
}

/// Detach whatever kernel driver is bound to `interface`
///
/// Fails with `ENODATA` when no driver was bound.
pub fn disconnect_driver(fd: &impl AsRawFd, interface: u32) -> nix::Result<()> {
    driver_request(fd, interface, USBDEVFS_DISCONNECT)
}

/// Let the kernel bind its driver to `interface` again
pub fn connect_driver(fd: &impl AsRawFd, interface: u32) -> nix::Result<()> {
    driver_request(fd, interface, USBDEVFS_CONNECT)
}

pub fn claim_interface(fd: &impl AsRawFd, interface: u32) -> nix::Result<()> {
    let mut ifno: c_uint = interface;
    // SAFETY: the kernel reads one unsigned int from `ifno`.
    unsafe { usbdevfs_claiminterface(fd.as_raw_fd(), &mut ifno) }?;
    Ok(())
}

pub fn release_interface(fd: &impl AsRawFd, interface: u32) -> nix::Result<()> {
    let mut ifno: c_uint = interface;
    // SAFETY: the kernel reads one unsigned int from `ifno`.
    unsafe { usbdevfs_releaseinterface(fd.as_raw_fd(), &mut ifno) }?;
    Ok(())
}

/// Queue `urb` with the kernel
///
/// # Safety
///
/// The kernel keeps the addresses of `urb` and of the buffer it points to.
/// Neither may move, be freed, or be accessed until the URB has been
/// returned by [`reap_urb_nodelay`] or the device file has been closed.
pub unsafe fn submit_urb(fd: &impl AsRawFd, urb: &mut Urb) -> nix::Result<()> {
    // SAFETY: upheld by the caller.
    unsafe { usbdevfs_submiturb(fd.as_raw_fd(), urb) }?;
    Ok(())
}

/// Collect one completed URB without blocking
///
/// Returns the address of the completed URB as it was submitted, or `None`
/// when nothing has completed yet.
pub fn reap_urb_nodelay(fd: &impl AsRawFd) -> nix::Result<Option<*const Urb>> {
    let mut reaped: *mut c_void = ptr::null_mut();
    // SAFETY: the kernel stores one pointer into `reaped`.
    let result = unsafe {
        usbdevfs_reapurbndelay(
            fd.as_raw_fd(),
            (&mut reaped as *mut *mut c_void).cast_const(),
        )
    };

    match result {
        Ok(_) => Ok(Some(reaped.cast_const().cast())),
        Err(Errno::EAGAIN) => Ok(None),
        Err(e) => Err(e),
    }
}
