// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual pipe device.
//!
//! An MMIO peripheral that multiplexes fast byte-stream channels between a
//! guest kernel driver and named host-side services. The guest opens logical
//! channels identified by 64-bit opaque handles; each channel binds to a
//! service handler resolved through a [`ServiceRegistry`]. Host services
//! signal readiness back through [`PipeHost`] handles, which the device
//! surfaces to the guest as an interrupt plus a drainable list of signaled
//! channels.
//!
//! The device assumes the hosting framework serializes MMIO accesses: the
//! register entry points take `&mut self`. Host callbacks may arrive from
//! any thread at any time; the state they touch sits behind short internal
//! locks. If the framework cannot serialize MMIO, wrap the device in a
//! mutex.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
pub mod guest_memory;
pub mod irq;
pub mod service;
pub mod services;

pub use guest_memory::GuestMemory;
pub use irq::IrqLine;
pub use service::PipeHost;
pub use service::ServiceRegistry;

use crate::channel::Channel;
use crate::channel::ChannelList;
use crate::channel::ChannelMap;
use crate::guest_memory::MappedRange;
use crate::service::PipeBuffer;
use crate::services::connector::Connector;
use parking_lot::Mutex;
use pipe_protocol::AccessParams32;
use pipe_protocol::AccessParams64;
use pipe_protocol::DEVICE_VERSION;
use pipe_protocol::PIPE_ERROR_INVAL;
use pipe_protocol::PIPE_ERROR_IO;
use pipe_protocol::PipeCmd;
use pipe_protocol::PipeReg;
use pipe_protocol::PipeWake;
use std::sync::Arc;

/// Runtime capabilities the device consumes from the hosting VMM.
pub struct PipeDeviceDeps {
    /// Guest physical memory, for buffer transfers and the packed-parameter
    /// block.
    pub guest_memory: GuestMemory,
    /// The device's interrupt line.
    pub interrupt: Arc<dyn IrqLine>,
    /// The services guests may connect channels to.
    pub services: Arc<ServiceRegistry>,
}

/// State shared between the MMIO path and host-side callback threads.
pub(crate) struct DeviceShared {
    /// Live channels by id. Host callbacks resolve ids through this map
    /// under a short lock.
    channels: Mutex<ChannelMap>,
    /// Fast-path cache slots for the most recently woken channel.
    cache: Mutex<WakeCache>,
    irq: Arc<dyn IrqLine>,
}

#[derive(Default)]
struct WakeCache {
    pipe: Option<Arc<Channel>>,
    pipe_64bit: Option<Arc<Channel>>,
}

impl DeviceShared {
    pub(crate) fn lookup(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.lock().get(&id).cloned()
    }

    /// Deposits wake reasons on a channel and raises the interrupt.
    ///
    /// Channels the host has closed stay off the fast path; the final
    /// closed wake reaches the guest through the list scan.
    pub(crate) fn wake(&self, channel: &Arc<Channel>, bits: u8) {
        let (wanted, closed) = channel.or_wanted(bits);
        if !closed {
            self.cache.lock().pipe = Some(channel.clone());
        }
        self.irq.set_level(true);
        tracing::trace!(channel = channel.id, bits, wanted, "pipe wake");
    }

    /// Consumes the cached channel, preferring the pinned high-half slot.
    fn take_cached(&self) -> Option<Arc<Channel>> {
        let mut cache = self.cache.lock();
        cache.pipe_64bit.take().or_else(|| cache.pipe.take())
    }

    /// Pins a channel so the next CHANNEL (low) read delivers it, pairing
    /// it with the CHANNEL_HIGH read that found it.
    fn stash_64bit(&self, channel: Arc<Channel>) {
        self.cache.lock().pipe_64bit = Some(channel);
    }

    /// Drops any cache references to `channel`.
    fn clear_cached(&self, channel: &Arc<Channel>) {
        let mut cache = self.cache.lock();
        if cache.pipe.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
            cache.pipe = None;
        }
        if cache
            .pipe_64bit
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, channel))
        {
            cache.pipe_64bit = None;
        }
    }
}

/// Latched MMIO register values parameterizing the next command, plus the
/// device outputs.
#[derive(Default)]
struct IoRegs {
    address: u64,
    size: u32,
    channel: u64,
    params_addr: u64,
    status: i32,
    wakes: u32,
}

enum Transfer {
    /// Fill the guest buffer from the service (READ_BUFFER).
    Recv,
    /// Drain the guest buffer into the service (WRITE_BUFFER).
    Send,
}

/// The pipe device.
pub struct PipeDevice {
    mem: GuestMemory,
    services: Arc<ServiceRegistry>,
    shared: Arc<DeviceShared>,
    /// Traversal list for the wake scheduler. MMIO path only.
    list: ChannelList,
    regs: IoRegs,
}

impl PipeDevice {
    /// Creates the device.
    pub fn new(deps: PipeDeviceDeps) -> Self {
        let PipeDeviceDeps {
            guest_memory,
            interrupt,
            services,
        } = deps;
        Self {
            mem: guest_memory,
            services,
            shared: Arc::new(DeviceShared {
                channels: Mutex::new(ChannelMap::default()),
                cache: Mutex::new(WakeCache::default()),
                irq: interrupt,
            }),
            list: ChannelList::default(),
            regs: IoRegs::default(),
        }
    }

    /// Handles a 32-bit guest read at `offset` within the register window.
    pub fn read_u32(&mut self, offset: u64) -> u32 {
        match PipeReg(offset) {
            PipeReg::STATUS => self.regs.status as u32,
            PipeReg::CHANNEL => self.read_channel_low(),
            PipeReg::CHANNEL_HIGH => self.read_channel_high(),
            PipeReg::WAKES => self.regs.wakes,
            PipeReg::PARAMS_ADDR_LOW => self.regs.params_addr as u32,
            PipeReg::PARAMS_ADDR_HIGH => (self.regs.params_addr >> 32) as u32,
            PipeReg::VERSION => DEVICE_VERSION,
            _ => {
                tracing::warn!(offset, "read from unknown pipe device register");
                0
            }
        }
    }

    /// Handles a 32-bit guest write at `offset` within the register window.
    pub fn write_u32(&mut self, offset: u64, value: u32) {
        match PipeReg(offset) {
            PipeReg::COMMAND => self.run_command(value),
            PipeReg::SIZE => self.regs.size = value,
            PipeReg::ADDRESS => set_low(&mut self.regs.address, value),
            PipeReg::ADDRESS_HIGH => set_high(&mut self.regs.address, value),
            PipeReg::CHANNEL => set_low(&mut self.regs.channel, value),
            PipeReg::CHANNEL_HIGH => set_high(&mut self.regs.channel, value),
            PipeReg::PARAMS_ADDR_LOW => set_low(&mut self.regs.params_addr, value),
            PipeReg::PARAMS_ADDR_HIGH => set_high(&mut self.regs.params_addr, value),
            PipeReg::ACCESS_PARAMS => self.access_params(),
            _ => {
                tracing::warn!(offset, value, "write to unknown pipe device register");
            }
        }
    }

    /// Returns the device to its post-construction state: every channel is
    /// destroyed, caches and registers are cleared, and the interrupt line
    /// drops.
    pub fn reset(&mut self) {
        self.shared.channels.lock().clear();
        *self.shared.cache.lock() = WakeCache::default();
        self.list = ChannelList::default();
        self.regs = IoRegs::default();
        self.shared.irq.set_level(false);
    }

    fn run_command(&mut self, command: u32) {
        let command = PipeCmd(command);
        let channel = self.shared.lookup(self.regs.channel);

        let Some(channel) = channel else {
            if command == PipeCmd::OPEN {
                self.open_channel();
            } else {
                self.regs.status = PIPE_ERROR_INVAL;
            }
            return;
        };

        if command == PipeCmd::OPEN {
            // The id is already taken.
            self.regs.status = PIPE_ERROR_INVAL;
            return;
        }

        if channel.is_closed() && command != PipeCmd::CLOSE {
            self.regs.status = PIPE_ERROR_IO;
            return;
        }

        match command {
            PipeCmd::CLOSE => self.close_channel(&channel),
            PipeCmd::POLL => {
                let flags = channel.service.lock().poll();
                self.regs.status = u8::from(flags).into();
                tracing::trace!(
                    channel = channel.id,
                    status = self.regs.status,
                    "pipe poll"
                );
            }
            PipeCmd::READ_BUFFER => self.transfer(&channel, Transfer::Recv),
            PipeCmd::WRITE_BUFFER => self.transfer(&channel, Transfer::Send),
            PipeCmd::WAKE_ON_READ => {
                self.subscribe(&channel, PipeWake::new().with_read(true));
            }
            PipeCmd::WAKE_ON_WRITE => {
                self.subscribe(&channel, PipeWake::new().with_write(true));
            }
            _ => {
                tracing::warn!(command = command.0, "unknown pipe device command");
            }
        }
    }

    fn open_channel(&mut self) {
        let id = self.regs.channel;
        tracing::debug!(channel = id, "pipe open");
        let host = PipeHost {
            shared: Arc::downgrade(&self.shared),
            id,
        };
        let channel = Channel::new(id, Box::new(Connector::new(self.services.clone(), host)));
        self.list.prepend(channel.clone());
        self.shared.channels.lock().insert(id, channel);
        self.regs.status = 0;
    }

    fn close_channel(&mut self, channel: &Arc<Channel>) {
        // The walk starts at the scheduler's current head, so a channel the
        // scan already passed is not unlinkable until the walk restarts.
        let Some(channel) = self.list.unlink(channel.id) else {
            self.regs.status = PIPE_ERROR_INVAL;
            return;
        };
        tracing::debug!(channel = channel.id, "pipe close");
        self.shared.channels.lock().remove(&channel.id);
        self.shared.clear_cached(&channel);
        self.regs.status = 0;
        // The service handler drops with the last reference to the record.
    }

    fn transfer(&mut self, channel: &Arc<Channel>, kind: Transfer) {
        let size = self.regs.size as usize;
        if size == 0 {
            self.regs.status = 0;
            return;
        }

        // READ_BUFFER fills guest memory, so its mapping is writable.
        let writable = matches!(kind, Transfer::Recv);
        let mut mapping = match self.mem.map(self.regs.address, size, writable) {
            Ok(mapping) => mapping,
            Err(err) => {
                tracing::debug!(
                    channel = channel.id,
                    address = self.regs.address,
                    size,
                    error = &err as &dyn std::error::Error,
                    "pipe buffer mapping failed"
                );
                self.regs.status = PIPE_ERROR_INVAL;
                return;
            }
        };
        if mapping.mapped_len() < size {
            // The buffer runs off the end of RAM.
            self.regs.status = PIPE_ERROR_INVAL;
            return;
        }

        let result = {
            let mut bufs = [PipeBuffer {
                data: mapping.bytes(),
            }];
            let mut service = channel.service.lock();
            match kind {
                Transfer::Recv => service.recv(&mut bufs),
                Transfer::Send => service.send(&mut bufs),
            }
        };
        drop(mapping);

        self.regs.status = match result {
            Ok(transferred) => transferred as i32,
            Err(err) => err.code(),
        };
        tracing::trace!(
            channel = channel.id,
            address = self.regs.address,
            size,
            status = self.regs.status,
            "pipe transfer"
        );
    }

    fn subscribe(&mut self, channel: &Arc<Channel>, flag: PipeWake) {
        let bits = u8::from(flag);
        if channel.wanted() & bits == 0 {
            let (wanted, _closed) = channel.or_wanted(bits);
            channel.service.lock().wake_on(PipeWake::from(wanted));
        }
        self.regs.status = 0;
    }

    /// Runs a buffer command described by the packed-parameter block at
    /// `params_addr`, writing the status into the block's `result` field.
    ///
    /// The block has a 32-bit and a 64-bit guest layout. The device reads
    /// the 32-bit shape first; a nonzero `flags` word there is really the
    /// 64-bit layout's `cmd`, so the block must be re-read in the wide
    /// shape.
    fn access_params(&mut self) {
        let addr = self.regs.params_addr;
        if addr == 0 {
            return;
        }

        let params = match self.mem.read_plain::<AccessParams32>(addr) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(
                    params_addr = addr,
                    error = &err as &dyn std::error::Error,
                    "failed to read pipe access params"
                );
                return;
            }
        };

        if params.flags == 0 {
            self.regs.channel = params.channel.into();
            self.regs.size = params.size;
            self.regs.address = params.address.into();
            let cmd = PipeCmd(params.cmd);
            if cmd != PipeCmd::READ_BUFFER && cmd != PipeCmd::WRITE_BUFFER {
                return;
            }
            self.run_command(cmd.0);

            let mut params = params;
            params.result = self.regs.status as u32;
            if let Err(err) = self.mem.write_plain(addr, &params) {
                tracing::warn!(
                    params_addr = addr,
                    error = &err as &dyn std::error::Error,
                    "failed to write pipe access params result"
                );
            }
        } else {
            let mut params = match self.mem.read_plain::<AccessParams64>(addr) {
                Ok(params) => params,
                Err(err) => {
                    tracing::warn!(
                        params_addr = addr,
                        error = &err as &dyn std::error::Error,
                        "failed to read pipe access params"
                    );
                    return;
                }
            };
            self.regs.channel = params.channel;
            self.regs.size = params.size;
            self.regs.address = params.address;
            let cmd = PipeCmd(params.cmd);
            if cmd != PipeCmd::READ_BUFFER && cmd != PipeCmd::WRITE_BUFFER {
                return;
            }
            self.run_command(cmd.0);

            params.result = self.regs.status as u32;
            if let Err(err) = self.mem.write_plain(addr, &params) {
                tracing::warn!(
                    params_addr = addr,
                    error = &err as &dyn std::error::Error,
                    "failed to write pipe access params result"
                );
            }
        }
    }

    /// One low-half drain step: delivers the next signaled channel's low id
    /// bits and latches its wake mask, or 0 when the walk is exhausted.
    fn read_channel_low(&mut self) -> u32 {
        if let Some(cached) = self.shared.take_cached() {
            self.regs.wakes = cached.take_wanted().into();
            return cached.id as u32;
        }

        let had_pipes = !self.list.entries.is_empty();
        match self.list.next_signaled() {
            Some(index) => {
                let pipe = self.list.entries[index].clone();
                self.regs.wakes = pipe.take_wanted().into();
                self.list.cursor = index + 1;
                tracing::trace!(
                    channel = pipe.id,
                    wakes = self.regs.wakes,
                    "pipe drain"
                );
                pipe.id as u32
            }
            None => {
                self.list.restart();
                if had_pipes {
                    // The guest observed "no signaled channels"; stop
                    // interrupting until the next wake.
                    self.shared.irq.set_level(false);
                }
                0
            }
        }
    }

    /// One high-half drain step.
    ///
    /// The found channel is pinned in the high-half cache slot rather than
    /// consumed, so the paired low read delivers the same channel.
    ///
    /// A result of 0 ends the guest's drain loop, so a signaled channel
    /// whose id has a zero high half conflates with "nothing signaled".
    /// This is a protocol limitation kept for driver compatibility; guests
    /// that rely on wakes must not assign such ids.
    fn read_channel_high(&mut self) -> u32 {
        if let Some(cached) = self.shared.take_cached() {
            let high = (cached.id >> 32) as u32;
            self.shared.stash_64bit(cached);
            return high;
        }

        let had_pipes = !self.list.entries.is_empty();
        match self.list.next_signaled() {
            Some(index) => {
                let pipe = self.list.entries[index].clone();
                self.list.cursor = index;
                self.shared.stash_64bit(pipe.clone());
                (pipe.id >> 32) as u32
            }
            None => {
                self.list.restart();
                if had_pipes {
                    self.shared.irq.set_level(false);
                }
                0
            }
        }
    }
}

fn set_low(reg: &mut u64, value: u32) {
    *reg = (*reg & !0xffff_ffff) | u64::from(value);
}

fn set_high(reg: &mut u64, value: u32) {
    *reg = (*reg & 0xffff_ffff) | (u64::from(value) << 32);
}
