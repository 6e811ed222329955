// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire protocol definitions for the virtual pipe device.
//!
//! The pipe device multiplexes byte-stream channels between the guest kernel
//! driver and host-side services over a single MMIO register window. Every
//! value in this crate is part of the guest ABI and must match the guest
//! driver exactly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size in bytes of the device's MMIO register window.
///
/// All register accesses are 32 bits wide; 64-bit quantities are split into
/// LOW/HIGH register pairs.
pub const MMIO_WINDOW_SIZE: u64 = 0x2000;

/// Device interface version returned by [`PipeReg::VERSION`].
///
/// Bump this when the register interface changes.
pub const DEVICE_VERSION: u32 = 1;

/// Maximum length of a pipe service name, in bytes, excluding the
/// terminating NUL.
pub const MAX_SERVICE_NAME_SIZE: usize = 255;

/// Register offsets within the MMIO window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PipeReg(pub u64);

impl PipeReg {
    /// Latches an 8-bit command code and runs it (write-only).
    pub const COMMAND: Self = Self(0x00);
    /// Status of the most recent command: byte count or negative error
    /// (read-only).
    pub const STATUS: Self = Self(0x04);
    /// Low 32 bits of the channel id. Written to parameterize a command;
    /// read to dequeue the next signaled channel.
    pub const CHANNEL: Self = Self(0x08);
    /// Byte count for the next buffer transfer (write-only).
    pub const SIZE: Self = Self(0x0c);
    /// Low 32 bits of the guest physical buffer address (write-only).
    pub const ADDRESS: Self = Self(0x10);
    /// Wake mask of the last signaled channel returned through
    /// [`PipeReg::CHANNEL`] (read-only).
    pub const WAKES: Self = Self(0x14);
    /// Low 32 bits of the packed-parameter block address.
    pub const PARAMS_ADDR_LOW: Self = Self(0x18);
    /// High 32 bits of the packed-parameter block address.
    pub const PARAMS_ADDR_HIGH: Self = Self(0x1c);
    /// Runs a buffer command described by the packed-parameter block
    /// (write-only).
    pub const ACCESS_PARAMS: Self = Self(0x20);
    /// Device interface version (read-only).
    pub const VERSION: Self = Self(0x24);
    /// High 32 bits of the channel id; pairs with [`PipeReg::CHANNEL`].
    pub const CHANNEL_HIGH: Self = Self(0x30);
    /// High 32 bits of the guest physical buffer address (write-only).
    pub const ADDRESS_HIGH: Self = Self(0x34);
}

/// Command codes written to [`PipeReg::COMMAND`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PipeCmd(pub u32);

impl PipeCmd {
    /// Opens the channel currently latched in the CHANNEL registers.
    pub const OPEN: Self = Self(1);
    /// Closes the latched channel and destroys its service handler.
    pub const CLOSE: Self = Self(2);
    /// Polls the channel's service for readiness, as [`PipePoll`] bits.
    pub const POLL: Self = Self(3);
    /// Transfers the latched guest buffer into the channel's service.
    pub const WRITE_BUFFER: Self = Self(4);
    /// Asks to be woken when the channel becomes writable.
    pub const WAKE_ON_WRITE: Self = Self(5);
    /// Fills the latched guest buffer from the channel's service.
    pub const READ_BUFFER: Self = Self(6);
    /// Asks to be woken when the channel becomes readable.
    pub const WAKE_ON_READ: Self = Self(7);
}

/// Unknown channel, duplicate OPEN, unlinked CLOSE, or bad buffer mapping.
pub const PIPE_ERROR_INVAL: i32 = -1;
/// The operation cannot make progress right now; retry after a wake.
pub const PIPE_ERROR_AGAIN: i32 = -2;
/// The service could not allocate memory for the operation.
pub const PIPE_ERROR_NOMEM: i32 = -3;
/// The channel was closed by the host.
pub const PIPE_ERROR_IO: i32 = -4;

/// Wake reasons surfaced to the guest through [`PipeReg::WAKES`].
///
/// The same bits double as the driver's WAKE_ON_READ/WAKE_ON_WRITE
/// subscription mask.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PipeWake {
    /// The host closed its end of the channel.
    pub closed: bool,
    /// The channel has bytes ready to read.
    pub read: bool,
    /// The channel can accept more bytes.
    pub write: bool,
    #[bits(5)]
    _reserved: u8,
}

/// Readiness bits returned by the POLL command.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PipePoll {
    /// Reading from the channel would make progress.
    pub input: bool,
    /// Writing to the channel would make progress.
    pub output: bool,
    /// The host hung up the channel.
    pub hangup: bool,
    #[bits(5)]
    _reserved: u8,
}

/// Packed-parameter block, 32-bit guest layout.
///
/// A guest stores this block in its own memory, latches its address through
/// the PARAMS_ADDR registers, and writes [`PipeReg::ACCESS_PARAMS`] to run
/// the described buffer command in a single register access.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AccessParams32 {
    /// Channel id.
    pub channel: u32,
    /// Transfer byte count.
    pub size: u32,
    /// Guest physical buffer address.
    pub address: u32,
    /// Command code; only READ_BUFFER and WRITE_BUFFER are honored.
    pub cmd: u32,
    /// Filled by the device with the command's status.
    pub result: u32,
    /// Reserved; must be zero. A 64-bit guest's block has its (nonzero)
    /// `cmd` at this offset, which is how the device tells the layouts
    /// apart.
    pub flags: u32,
}

/// Packed-parameter block, 64-bit guest layout.
///
/// Byte-packed so that `cmd` lands at offset 20, overlapping
/// [`AccessParams32::flags`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AccessParams64 {
    /// Channel id.
    pub channel: u64,
    /// Transfer byte count.
    pub size: u32,
    /// Guest physical buffer address.
    pub address: u64,
    /// Command code; only READ_BUFFER and WRITE_BUFFER are honored.
    pub cmd: u32,
    /// Filled by the device with the command's status.
    pub result: u32,
    /// Reserved; must be nonzero for layout detection to work. The guest
    /// driver sets bit 0.
    pub flags: u32,
}
