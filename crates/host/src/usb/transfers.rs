//! Interrupt transfer slots
//!
//! The session keeps at most one URB in flight per channel. Each channel owns
//! a boxed slot holding the `Urb` and its buffer, so both addresses stay fixed
//! for as long as the kernel may write to them. A reaped URB is mapped back to
//! its channel by comparing addresses.

use crate::usb::descriptor::EndpointTable;
use crate::usb::devfs::{self, Urb};
use std::ops::{Index, IndexMut};
use std::os::fd::AsRawFd;

/// Size of the debug text buffer
pub const DEBUG_BUFFER_LEN: usize = 64;

/// Logical transfer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Requests from the emulator, interface 0 IN
    DataIn,
    /// Responses to the emulator, interface 0 OUT
    DataOut,
    /// Free-form text from the emulator, interface 1 IN
    DebugIn,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::DataIn, Channel::DataOut, Channel::DebugIn];

    const fn index(self) -> usize {
        match self {
            Channel::DataIn => 0,
            Channel::DataOut => 1,
            Channel::DebugIn => 2,
        }
    }

    /// Endpoint address this channel transfers on
    pub fn endpoint(self, endpoints: &EndpointTable) -> u8 {
        match self {
            Channel::DataIn => endpoints.interface(0).ep_in,
            Channel::DataOut => endpoints.interface(0).ep_out,
            Channel::DebugIn => endpoints.interface(1).ep_in,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::DataIn => write!(f, "data in"),
            Channel::DataOut => write!(f, "data out"),
            Channel::DebugIn => write!(f, "debug in"),
        }
    }
}

/// One value per channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTable<T>([T; 3]);

impl<T> ChannelTable<T> {
    pub fn from_fn(f: impl FnMut(Channel) -> T) -> Self {
        Self(Channel::ALL.map(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Channel, &mut T)> {
        Channel::ALL.into_iter().zip(self.0.iter_mut())
    }
}

impl<T> Index<Channel> for ChannelTable<T> {
    type Output = T;

    fn index(&self, channel: Channel) -> &T {
        &self.0[channel.index()]
    }
}

impl<T> IndexMut<Channel> for ChannelTable<T> {
    fn index_mut(&mut self, channel: Channel) -> &mut T {
        &mut self.0[channel.index()]
    }
}

/// Address-stable URB and buffer for one channel
#[derive(Debug)]
pub struct TransferSlot {
    urb: Urb,
    buffer: Vec<u8>,
    len: usize,
    in_flight: bool,
}

impl TransferSlot {
    pub fn new(capacity: usize) -> Box<Self> {
        Box::new(Self {
            urb: Urb::default(),
            buffer: vec![0; capacity],
            len: 0,
            in_flight: false,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Address the kernel hands back when this slot's URB is reaped
    pub fn urb_ptr(&self) -> *const Urb {
        &self.urb
    }

    /// Queue a read of up to the full buffer from `endpoint`
    ///
    /// # Safety
    ///
    /// The slot must not be dropped or moved out of its box until the URB
    /// is reaped or `fd` is closed.
    pub unsafe fn submit_in(&mut self, fd: &impl AsRawFd, endpoint: u8) -> nix::Result<()> {
        self.len = self.buffer.len();
        // SAFETY: forwarded to the caller.
        unsafe { self.submit(fd, endpoint) }
    }

    /// Queue a write of `data` to `endpoint`
    ///
    /// # Safety
    ///
    /// Same as [`TransferSlot::submit_in`].
    pub unsafe fn submit_out(
        &mut self,
        fd: &impl AsRawFd,
        endpoint: u8,
        data: &[u8],
    ) -> nix::Result<()> {
        if data.len() > self.capacity() {
            return Err(nix::errno::Errno::EMSGSIZE);
        }
        self.buffer[..data.len()].copy_from_slice(data);
        self.len = data.len();
        // SAFETY: forwarded to the caller.
        unsafe { self.submit(fd, endpoint) }
    }

    unsafe fn submit(&mut self, fd: &impl AsRawFd, endpoint: u8) -> nix::Result<()> {
        self.urb = Urb::interrupt(endpoint, &mut self.buffer[..self.len])?;
        // SAFETY: `urb` and `buffer` live inside this boxed slot, which the
        // caller keeps alive until the URB completes.
        unsafe { devfs::submit_urb(fd, &mut self.urb) }?;
        self.in_flight = true;
        Ok(())
    }

    /// Take back a reaped URB, returning its status and the bytes received
    pub fn complete(&mut self) -> (i32, &[u8]) {
        self.in_flight = false;
        let len = self.urb.actual_len().min(self.buffer.len());
        (self.urb.status, &self.buffer[..len])
    }

    /// Stand in for the kernel finishing a submitted URB
    #[cfg(test)]
    pub fn fake_completion(&mut self, status: i32, data: &[u8]) {
        self.buffer[..data.len()].copy_from_slice(data);
        self.len = self.buffer.len();
        self.urb = Urb {
            status,
            actual_length: data.len() as i32,
            buffer_length: self.buffer.len() as i32,
            ..Urb::default()
        };
        self.in_flight = true;
    }

    /// Forget an URB that died with its device
    pub fn reset(&mut self) {
        self.in_flight = false;
        self.urb = Urb::default();
    }
}

impl ChannelTable<Box<TransferSlot>> {
    /// Slots sized for `packet_len` data packets
    pub fn with_packet_len(packet_len: usize) -> Self {
        Self::from_fn(|channel| match channel {
            Channel::DataIn | Channel::DataOut => TransferSlot::new(packet_len),
            Channel::DebugIn => TransferSlot::new(DEBUG_BUFFER_LEN),
        })
    }

    /// Channel whose slot owns the URB at `urb`
    pub fn channel_of(&self, urb: *const Urb) -> Option<Channel> {
        self.iter()
            .find(|(_, slot)| std::ptr::eq(slot.urb_ptr(), urb))
            .map(|(channel, _)| channel)
    }

    pub fn reset(&mut self) {
        for (_, slot) in self.iter_mut() {
            slot.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::descriptor::InterfaceEndpoints;

    fn endpoints() -> EndpointTable {
        EndpointTable::new([
            InterfaceEndpoints {
                ep_in: 0x83,
                ep_out: 0x04,
            },
            InterfaceEndpoints {
                ep_in: 0x81,
                ep_out: 0x02,
            },
        ])
    }

    #[test]
    fn test_channel_endpoints() {
        let table = endpoints();
        assert_eq!(Channel::DataIn.endpoint(&table), 0x83);
        assert_eq!(Channel::DataOut.endpoint(&table), 0x04);
        assert_eq!(Channel::DebugIn.endpoint(&table), 0x81);
    }

    #[test]
    fn test_channel_table_indexing() {
        let mut table: ChannelTable<u32> = ChannelTable::default();
        table[Channel::DataOut] = 7;
        assert_eq!(table[Channel::DataIn], 0);
        assert_eq!(table[Channel::DataOut], 7);

        let channels: Vec<_> = table.iter().map(|(c, _)| c).collect();
        assert_eq!(channels, Channel::ALL);
    }

    #[test]
    fn test_slot_sizes() {
        let slots = ChannelTable::with_packet_len(64);
        assert_eq!(slots[Channel::DataIn].capacity(), 64);
        assert_eq!(slots[Channel::DataOut].capacity(), 64);
        assert_eq!(slots[Channel::DebugIn].capacity(), DEBUG_BUFFER_LEN);
        assert!(slots.iter().all(|(_, s)| !s.is_in_flight()));
    }

    #[test]
    fn test_channel_of_resolves_slot_addresses() {
        let slots = ChannelTable::with_packet_len(64);
        for channel in Channel::ALL {
            assert_eq!(slots.channel_of(slots[channel].urb_ptr()), Some(channel));
        }

        let stray = Urb::default();
        assert_eq!(slots.channel_of(&stray), None);
    }

    #[test]
    fn test_failed_submit_leaves_slot_idle() {
        let file = tempfile::tempfile().unwrap();
        let mut slots = ChannelTable::with_packet_len(64);
        // SAFETY: the submission fails, so the kernel never sees the slot.
        let result = unsafe { slots[Channel::DataIn].submit_in(&file, 0x83) };
        assert!(result.is_err());
        assert!(!slots[Channel::DataIn].is_in_flight());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let file = tempfile::tempfile().unwrap();
        let mut slot = TransferSlot::new(4);
        // SAFETY: rejected before reaching the kernel.
        let result = unsafe { slot.submit_out(&file, 0x04, &[0; 8]) };
        assert_eq!(result, Err(nix::errno::Errno::EMSGSIZE));
    }

    #[test]
    fn test_complete_clamps_to_actual_length() {
        let mut slot = TransferSlot::new(8);
        slot.buffer.copy_from_slice(b"hello\0\0\0");
        slot.len = 8;
        slot.urb = Urb::interrupt(0x81, &mut slot.buffer[..]).unwrap();
        slot.urb.actual_length = 5;
        slot.in_flight = true;

        let (status, data) = slot.complete();
        assert_eq!(status, 0);
        assert_eq!(data, b"hello");
        assert!(!slot.is_in_flight());
    }
}
