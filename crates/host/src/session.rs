//! Connection session
//!
//! Single-threaded event loop driving one emulator at a time. While no device
//! is attached the session polls the bus; once one is found it keeps a data
//! read and a debug read in flight, waits in `poll(2)` on the device and the
//! input devices, and answers every completed request.
//!
//! Within one wakeup all ready input events are applied before the completed
//! URB (at most one) is handled, and each idle channel gets exactly one
//! resubmission attempt per iteration.

use crate::config::UsbSettings;
use crate::input::{EvdevDevice, InputAggregator};
use crate::usb::{
    Channel, ChannelTable, DeviceLocator, LocateError, Located, TransferSlot, UsbDevice, devfs,
};
use evdevil::event::InputEvent;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use protocol::{MovieStream, PacketType, ProtocolError, WireFormat, WirePacket};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// URB statuses that mean the device went away
const DISCONNECT_STATUSES: [Errno; 4] = [
    Errno::EILSEQ,
    Errno::EPROTO,
    Errno::ESHUTDOWN,
    Errno::ENODEV,
];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transfer on {channel} failed: {source}")]
    Transfer {
        channel: Channel,
        #[source]
        source: Errno,
    },

    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Locate(#[from] LocateError),
}

/// What the loop should do after handling a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnected,
}

/// Decides what to send the emulator
///
/// Holds the movie cursor and the live button register, and queues outbound
/// packets until the data OUT channel is free. Debug text from the device is
/// written to `debug_out`.
#[derive(Debug)]
pub struct Responder<W = io::Stdout> {
    format: WireFormat,
    movie: Option<MovieStream>,
    inputs: InputAggregator,
    outbound: VecDeque<WirePacket>,
    state_changed: bool,
    debug_out: W,
}

impl Responder<io::Stdout> {
    pub fn new(format: WireFormat, movie: Option<MovieStream>, inputs: InputAggregator) -> Self {
        Self::with_debug_output(format, movie, inputs, io::stdout())
    }
}

impl<W: Write> Responder<W> {
    pub fn with_debug_output(
        format: WireFormat,
        movie: Option<MovieStream>,
        inputs: InputAggregator,
        debug_out: W,
    ) -> Self {
        Self {
            format,
            movie,
            inputs,
            outbound: VecDeque::new(),
            state_changed: false,
            debug_out,
        }
    }

    pub fn format(&self) -> &WireFormat {
        &self.format
    }

    /// Start over for a freshly attached device
    pub fn on_connect(&mut self) {
        self.outbound.clear();
        self.state_changed = false;
        if let Some(stream) = self.movie.as_mut() {
            stream.rewind();
            self.outbound.push_back(WirePacket::stream_enable());
        }
    }

    pub fn on_disconnect(&mut self) {
        self.outbound.clear();
    }

    pub fn apply_input(&mut self, event: &InputEvent) {
        self.state_changed |= self.inputs.apply(event);
    }

    /// Queue the button register if it changed since the last call
    ///
    /// Nothing is queued while a movie drives the emulator.
    pub fn queue_state(&mut self) {
        if !std::mem::take(&mut self.state_changed) || self.movie.is_some() {
            return;
        }
        self.enqueue(WirePacket::fixed_state(self.inputs.state()));
    }

    /// Next packet for the data OUT channel
    pub fn next_outbound(&mut self) -> Option<WirePacket> {
        self.outbound.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Only the newest button state matters, so a queued one is replaced
    fn enqueue(&mut self, packet: WirePacket) {
        if packet.kind == PacketType::FixedState {
            if let Some(queued) = self
                .outbound
                .iter_mut()
                .find(|p| p.kind == PacketType::FixedState)
            {
                *queued = packet;
                return;
            }
        }
        self.outbound.push_back(packet);
    }

    /// Handle one reaped URB
    ///
    /// `status` is the URB status as the kernel reports it (zero or a
    /// negative errno) and `data` the bytes actually transferred.
    pub fn handle_completion(
        &mut self,
        channel: Channel,
        status: i32,
        data: &[u8],
    ) -> Result<Flow, SessionError> {
        if status != 0 {
            let errno = Errno::from_raw(-status);
            error!("URB on {}: {}", channel, errno);
            if DISCONNECT_STATUSES.contains(&errno) {
                return Ok(Flow::Disconnected);
            }
            return Err(SessionError::Transfer {
                channel,
                source: errno,
            });
        }

        match channel {
            Channel::DataIn => self.handle_request(data)?,
            Channel::DataOut => {}
            Channel::DebugIn => self.relay_debug(data),
        }

        Ok(Flow::Continue)
    }

    fn handle_request(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Err(SessionError::ProtocolViolation(
                "zero-length read on data channel".to_string(),
            ));
        }

        let packet = match WirePacket::decode(data, &self.format) {
            Ok(packet) => packet,
            Err(ProtocolError::UnknownPacketType(tag)) => {
                warn!("Unknown packet type: {:#04x}", tag);
                return Ok(());
            }
            Err(e) => {
                warn!("Undecodable packet: {}", e);
                return Ok(());
            }
        };

        match packet.kind {
            PacketType::StreamRequest => {
                let reply = self.stream_reply();
                self.enqueue(reply);
            }
            other => warn!("Unexpected {:?} packet from device", other),
        }

        Ok(())
    }

    fn stream_reply(&mut self) -> WirePacket {
        let Some(stream) = self.movie.as_mut() else {
            debug!("Stream request without a movie");
            return WirePacket::stream_end();
        };

        debug!(
            "{}/{}",
            stream.frames_sent(),
            stream.movie().frame_count()
        );
        let was_finished = stream.is_finished();
        let reply = stream.next_packet(&self.format);
        if stream.is_finished() && !was_finished {
            info!("All {} frames sent", stream.movie().frame_count());
        }
        reply
    }

    fn relay_debug(&mut self, data: &[u8]) {
        let text = debug_text(data);
        if text.is_empty() {
            return;
        }
        if let Err(e) = self
            .debug_out
            .write_all(text)
            .and_then(|()| self.debug_out.flush())
        {
            warn!("Could not relay debug text: {}", e);
        }
    }
}

/// Device text up to the first NUL
pub fn debug_text(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    &data[..end]
}

/// The event loop
///
/// `device` is declared before `slots` so the device node is closed, and
/// its URBs cancelled, before the buffers they point at are freed.
pub struct Session {
    device: Option<UsbDevice>,
    slots: ChannelTable<Box<TransferSlot>>,
    locator: DeviceLocator,
    inputs: Vec<EvdevDevice>,
    responder: Responder,
    settings: UsbSettings,
    timeout: Option<Duration>,
    waiting: bool,
}

impl Session {
    pub fn new(
        locator: DeviceLocator,
        inputs: Vec<EvdevDevice>,
        responder: Responder,
        settings: UsbSettings,
    ) -> Self {
        let slots = ChannelTable::with_packet_len(responder.format().packet_len());
        Self {
            device: None,
            slots,
            locator,
            inputs,
            responder,
            settings,
            timeout: None,
            waiting: false,
        }
    }

    /// Run until a fatal error
    pub fn run(&mut self) -> Result<(), SessionError> {
        loop {
            if self.device.is_none() {
                self.search()?;
            } else {
                self.step()?;
            }
        }
    }

    fn search(&mut self) -> Result<(), SessionError> {
        match self.locator.find()? {
            Located::Found(device) => {
                info!("Connected to {}", device.path().display());
                self.waiting = false;
                self.slots.reset();
                self.responder.on_connect();
                // a device that already booted sends nothing, so wait once for
                // debug output before sending anything
                self.timeout = Some(self.settings.connect_timeout());
                self.device = Some(device);
            }
            Located::NotFound => {
                if !self.waiting {
                    info!("Waiting for device {}..", self.locator.target());
                    self.waiting = true;
                }
                thread::sleep(self.settings.poll_interval());
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(device) = self.device.take() {
            info!("Disconnected from {}", device.path().display());
        }
        self.slots.reset();
        self.responder.on_disconnect();
        self.locator.forget_rejections();
    }

    /// Give a vanishing device time to go away, then search again
    fn lost(&mut self) -> Flow {
        thread::sleep(self.settings.disconnect_grace());
        self.disconnect();
        Flow::Disconnected
    }

    /// One iteration of the connected loop
    fn step(&mut self) -> Result<(), SessionError> {
        if self.submit_pending()? == Flow::Disconnected {
            self.disconnect();
            return Ok(());
        }

        let Some((input_ready, device_ready)) = self.wait()? else {
            return Ok(());
        };

        self.drain_inputs(&input_ready);

        if device_ready && self.reap()? == Flow::Disconnected {
            return Ok(());
        }

        self.responder.queue_state();
        Ok(())
    }

    fn submit_pending(&mut self) -> Result<Flow, SessionError> {
        let Some(device) = self.device.as_ref() else {
            return Ok(Flow::Disconnected);
        };
        let endpoints = *device.endpoints();

        for channel in [Channel::DataIn, Channel::DebugIn] {
            let slot = &mut self.slots[channel];
            if slot.is_in_flight() {
                continue;
            }
            // SAFETY: slots outlive the device, see `Session`.
            let result = unsafe { slot.submit_in(device, channel.endpoint(&endpoints)) };
            if let Some(flow) = submit_result(channel, result)? {
                return Ok(flow);
            }
        }

        if !self.slots[Channel::DataOut].is_in_flight() {
            if let Some(packet) = self.responder.next_outbound() {
                let frame = packet
                    .encode(self.responder.format())
                    .map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;
                debug!(
                    "Sending {:?} ({} more queued)",
                    packet.kind,
                    self.responder.pending()
                );

                let endpoint = Channel::DataOut.endpoint(&endpoints);
                // SAFETY: slots outlive the device, see `Session`.
                let result =
                    unsafe { self.slots[Channel::DataOut].submit_out(device, endpoint, &frame) };
                if let Some(flow) = submit_result(Channel::DataOut, result)? {
                    return Ok(flow);
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Block in `poll(2)`, returning which inputs and whether the device are ready
    fn wait(&mut self) -> Result<Option<(Vec<bool>, bool)>, SessionError> {
        let Some(device) = self.device.as_ref() else {
            return Ok(None);
        };

        let mut fds: Vec<PollFd> = self
            .inputs
            .iter()
            .map(|input| PollFd::new(input.as_fd(), PollFlags::POLLIN))
            .collect();
        fds.push(PollFd::new(device.as_fd(), PollFlags::POLLOUT));

        let timeout = self
            .timeout
            .take()
            .map_or(PollTimeout::NONE, poll_timeout);

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(source) => return Err(SessionError::Syscall { op: "poll", source }),
        }

        let ready: Vec<bool> = fds
            .iter()
            .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
            .collect();
        let device_ready = ready.last().copied().unwrap_or(false);
        let input_ready = ready[..ready.len().saturating_sub(1)].to_vec();
        Ok(Some((input_ready, device_ready)))
    }

    fn drain_inputs(&mut self, ready: &[bool]) {
        let mut index = 0;
        self.inputs.retain_mut(|input| {
            let is_ready = ready.get(index).copied().unwrap_or(false);
            index += 1;
            if !is_ready {
                return true;
            }

            match input.read_events() {
                Ok(events) => {
                    for event in &events {
                        self.responder.apply_input(event);
                    }
                    true
                }
                Err(e) => {
                    warn!("Dropping input {}: {}", input.path().display(), e);
                    false
                }
            }
        });
    }

    fn reap(&mut self) -> Result<Flow, SessionError> {
        let Some(device) = self.device.as_ref() else {
            return Ok(Flow::Disconnected);
        };

        let urb = match devfs::reap_urb_nodelay(device) {
            Ok(Some(urb)) => urb,
            Ok(None) => return Ok(Flow::Continue),
            Err(Errno::ENODEV) => return Ok(self.lost()),
            Err(source) => {
                return Err(SessionError::Syscall {
                    op: "USBDEVFS_REAPURBNDELAY",
                    source,
                });
            }
        };

        let channel = self.slots.channel_of(urb).ok_or_else(|| {
            SessionError::ProtocolViolation(format!("reaped unknown URB {:p}", urb))
        })?;

        self.complete(channel)
    }

    /// Hand a reaped URB's result to the responder
    fn complete(&mut self, channel: Channel) -> Result<Flow, SessionError> {
        let (status, data) = self.slots[channel].complete();
        match self.responder.handle_completion(channel, status, data)? {
            Flow::Continue => Ok(Flow::Continue),
            Flow::Disconnected => Ok(self.lost()),
        }
    }
}

/// Map a submission failure to the loop's next move
fn submit_result(channel: Channel, result: nix::Result<()>) -> Result<Option<Flow>, SessionError> {
    match result {
        Ok(()) => Ok(None),
        Err(Errno::ENODEV) => {
            warn!("Device gone while submitting on {}", channel);
            Ok(Some(Flow::Disconnected))
        }
        Err(source) => Err(SessionError::Transfer { channel, source }),
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX))
}
