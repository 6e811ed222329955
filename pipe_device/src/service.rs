// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Service handler traits, the service registry, and the host callback
//! surface.

use crate::DeviceShared;
use parking_lot::Mutex;
use pipe_protocol::PIPE_ERROR_AGAIN;
use pipe_protocol::PIPE_ERROR_INVAL;
use pipe_protocol::PIPE_ERROR_IO;
use pipe_protocol::PIPE_ERROR_NOMEM;
use pipe_protocol::PipePoll;
use pipe_protocol::PipeWake;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

/// An error a service reports back to the guest.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum PipeError {
    /// The request is malformed.
    #[error("invalid request")]
    InvalidArgument,
    /// The operation cannot make progress; the guest should subscribe to a
    /// wake and retry.
    #[error("would block")]
    WouldBlock,
    /// The service is out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The channel is unusable.
    #[error("i/o error")]
    Io,
}

impl PipeError {
    /// The wire status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            PipeError::InvalidArgument => PIPE_ERROR_INVAL,
            PipeError::WouldBlock => PIPE_ERROR_AGAIN,
            PipeError::OutOfMemory => PIPE_ERROR_NOMEM,
            PipeError::Io => PIPE_ERROR_IO,
        }
    }
}

/// One element of the scatter/gather vector passed to a service transfer.
pub struct PipeBuffer<'a> {
    /// The mapped guest bytes.
    pub data: &'a mut [u8],
}

/// A host service instance bound to one channel.
///
/// All methods run on the guest-facing MMIO path and must not block. A
/// service signals readiness changes through the [`PipeHost`] handle it
/// received at construction; those calls may come from any thread, including
/// re-entrantly from within these methods.
///
/// Dropping the instance is the release notification; it happens when the
/// guest closes the channel or the device resets.
pub trait PipeService: Send {
    /// Consumes bytes the guest wrote into the pipe. Returns the number of
    /// bytes accepted.
    fn send(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError>;

    /// Produces bytes for the guest to read from the pipe. Returns the
    /// number of bytes produced.
    fn recv(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError>;

    /// Reports current readiness.
    fn poll(&mut self) -> PipePoll;

    /// Subscribes the service to signal the wake reasons in `wanted` once
    /// they become possible. The mask accumulates until the guest drains the
    /// channel.
    fn wake_on(&mut self, wanted: PipeWake);
}

/// Creates service instances as guests connect to the service by name.
pub trait ServiceFactory: Send + Sync {
    /// Instantiates the service for a newly bound channel.
    ///
    /// `args` carries the text after the second `:` of the guest's
    /// `pipe:<name>:<args>` connection string, if any.
    fn open(&self, host: PipeHost, args: Option<&str>) -> Box<dyn PipeService>;
}

impl<F> ServiceFactory for F
where
    F: Fn(PipeHost, Option<&str>) -> Box<dyn PipeService> + Send + Sync,
{
    fn open(&self, host: PipeHost, args: Option<&str>) -> Box<dyn PipeService> {
        self(host, args)
    }
}

/// The named service handlers available to guests of one device.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<dyn ServiceFactory>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous
    /// registration. Names are trusted; there is no authentication.
    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.services.lock().insert(name.into(), factory);
    }

    pub(crate) fn open(
        &self,
        name: &str,
        host: PipeHost,
        args: Option<&str>,
    ) -> Option<Box<dyn PipeService>> {
        let factory = self.services.lock().get(name).cloned()?;
        Some(factory.open(host, args))
    }
}

/// Host-side handle to one channel, given to a service at construction.
///
/// This is the device's callback surface. Both methods may be called from
/// any thread; they take short internal locks and never block. The handle
/// addresses the channel by id, so calls against a channel the guest has
/// already closed fall through harmlessly.
#[derive(Clone)]
pub struct PipeHost {
    pub(crate) shared: Weak<DeviceShared>,
    pub(crate) id: u64,
}

impl PipeHost {
    /// The id of the channel this handle addresses.
    pub fn channel(&self) -> u64 {
        self.id
    }

    /// Deposits `flags` as pending wake reasons for the channel and raises
    /// the device interrupt.
    pub fn signal_wake(&self, flags: PipeWake) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(channel) = shared.lookup(self.id) else {
            return;
        };
        shared.wake(&channel, flags.into());
    }

    /// Marks the channel closed by the host and delivers a final closed
    /// wake. Idempotent. The channel record survives until the guest issues
    /// CLOSE.
    pub fn close_from_host(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(channel) = shared.lookup(self.id) else {
            return;
        };
        tracing::debug!(channel = self.id, "host closed pipe");
        if channel.mark_closed() {
            shared.wake(&channel, PipeWake::new().with_closed(true).into());
        }
    }
}
