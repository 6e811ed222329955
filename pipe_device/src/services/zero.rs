// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The zero service: a throughput-test pipe that discards writes and
//! produces zeroes.

use crate::service::PipeBuffer;
use crate::service::PipeError;
use crate::service::PipeHost;
use crate::service::PipeService;
use crate::service::ServiceFactory;
use pipe_protocol::PipePoll;
use pipe_protocol::PipeWake;

/// The `zero` service. Stateless, so one type serves as both factory and
/// instance.
pub struct ZeroPipe;

impl ServiceFactory for ZeroPipe {
    fn open(&self, _host: PipeHost, _args: Option<&str>) -> Box<dyn PipeService> {
        Box::new(ZeroPipe)
    }
}

impl PipeService for ZeroPipe {
    fn send(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        Ok(bufs.iter().map(|buf| buf.data.len()).sum())
    }

    fn recv(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            buf.data.fill(0);
            total += buf.data.len();
        }
        Ok(total)
    }

    fn poll(&mut self) -> PipePoll {
        PipePoll::new().with_input(true).with_output(true)
    }

    fn wake_on(&mut self, _wanted: PipeWake) {
        // Always ready; there is never a wake to deliver.
    }
}
