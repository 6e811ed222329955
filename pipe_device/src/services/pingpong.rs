// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The ping-pong service: bytes the guest writes come straight back on
//! reads.

use crate::service::PipeBuffer;
use crate::service::PipeError;
use crate::service::PipeHost;
use crate::service::PipeService;
use crate::service::ServiceFactory;
use pipe_protocol::PipePoll;
use pipe_protocol::PipeWake;
use std::collections::VecDeque;

/// Factory for the `pingpong` service.
pub struct PingPong;

impl ServiceFactory for PingPong {
    fn open(&self, host: PipeHost, _args: Option<&str>) -> Box<dyn PipeService> {
        Box::new(PingPongPipe {
            host,
            data: VecDeque::new(),
            wanted: PipeWake::new(),
        })
    }
}

/// One ping-pong channel: an unbounded byte FIFO.
struct PingPongPipe {
    host: PipeHost,
    data: VecDeque<u8>,
    wanted: PipeWake,
}

impl PipeService for PingPongPipe {
    fn send(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        let mut total = 0;
        for buf in bufs.iter() {
            self.data.extend(buf.data.iter());
            total += buf.data.len();
        }
        if self.wanted.read() && !self.data.is_empty() {
            self.wanted.set_read(false);
            self.host.signal_wake(PipeWake::new().with_read(true));
        }
        Ok(total)
    }

    fn recv(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        if self.data.is_empty() {
            return Err(PipeError::WouldBlock);
        }
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = buf.data.len().min(self.data.len());
            for (dst, src) in buf.data[..n].iter_mut().zip(self.data.drain(..n)) {
                *dst = src;
            }
            total += n;
            if self.data.is_empty() {
                break;
            }
        }
        Ok(total)
    }

    fn poll(&mut self) -> PipePoll {
        PipePoll::new()
            .with_input(!self.data.is_empty())
            .with_output(true)
    }

    fn wake_on(&mut self, wanted: PipeWake) {
        self.wanted = wanted;
        // The buffer is unbounded, so a write subscription fires at once; a
        // read subscription fires if data is already queued.
        if self.wanted.write() {
            self.wanted.set_write(false);
            self.host.signal_wake(PipeWake::new().with_write(true));
        }
        if self.wanted.read() && !self.data.is_empty() {
            self.wanted.set_read(false);
            self.host.signal_wake(PipeWake::new().with_read(true));
        }
    }
}
