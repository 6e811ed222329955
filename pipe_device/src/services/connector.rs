// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The open-time service that resolves the guest's service name.

use crate::service::PipeBuffer;
use crate::service::PipeError;
use crate::service::PipeHost;
use crate::service::PipeService;
use crate::service::ServiceRegistry;
use pipe_protocol::MAX_SERVICE_NAME_SIZE;
use pipe_protocol::PipePoll;
use pipe_protocol::PipeWake;
use std::sync::Arc;

/// Initial handler for every channel.
///
/// Buffers the NUL-terminated `pipe:<name>[:<args>]` string the guest
/// writes as its first payload, then binds the named service and delegates
/// everything to it.
pub(crate) struct Connector {
    state: ConnectorState,
}

enum ConnectorState {
    AwaitingName {
        registry: Arc<ServiceRegistry>,
        host: PipeHost,
        name: Vec<u8>,
    },
    Bound(Box<dyn PipeService>),
}

impl Connector {
    pub fn new(registry: Arc<ServiceRegistry>, host: PipeHost) -> Self {
        Self {
            state: ConnectorState::AwaitingName {
                registry,
                host,
                name: Vec::new(),
            },
        }
    }
}

impl PipeService for Connector {
    fn send(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        let (consumed, service) = match &mut self.state {
            ConnectorState::Bound(service) => return service.send(bufs),
            ConnectorState::AwaitingName {
                registry,
                host,
                name,
            } => {
                let mut consumed = 0;
                let mut terminated = false;
                for buf in bufs.iter() {
                    for &byte in buf.data.iter() {
                        if terminated {
                            // The NUL must end the payload.
                            return Err(PipeError::InvalidArgument);
                        }
                        consumed += 1;
                        if byte == 0 {
                            terminated = true;
                        } else if name.len() == MAX_SERVICE_NAME_SIZE {
                            return Err(PipeError::InvalidArgument);
                        } else {
                            name.push(byte);
                        }
                    }
                }
                if !terminated {
                    return Ok(consumed);
                }

                let full = std::str::from_utf8(name).map_err(|_| PipeError::InvalidArgument)?;
                let rest = full
                    .strip_prefix("pipe:")
                    .ok_or(PipeError::InvalidArgument)?;
                let (service_name, args) = match rest.split_once(':') {
                    Some((service_name, args)) => (service_name, Some(args)),
                    None => (rest, None),
                };
                let service = registry
                    .open(service_name, host.clone(), args)
                    .ok_or_else(|| {
                        tracing::warn!(service = service_name, "unknown pipe service");
                        PipeError::InvalidArgument
                    })?;
                tracing::debug!(service = service_name, channel = host.channel(), "pipe bound");
                (consumed, service)
            }
        };
        self.state = ConnectorState::Bound(service);
        Ok(consumed)
    }

    fn recv(&mut self, bufs: &mut [PipeBuffer<'_>]) -> Result<usize, PipeError> {
        match &mut self.state {
            ConnectorState::Bound(service) => service.recv(bufs),
            ConnectorState::AwaitingName { .. } => Err(PipeError::Io),
        }
    }

    fn poll(&mut self) -> PipePoll {
        match &mut self.state {
            ConnectorState::Bound(service) => service.poll(),
            ConnectorState::AwaitingName { .. } => PipePoll::new().with_output(true),
        }
    }

    fn wake_on(&mut self, wanted: PipeWake) {
        match &mut self.state {
            ConnectorState::Bound(service) => service.wake_on(wanted),
            ConnectorState::AwaitingName { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::zero::ZeroPipe;
    use std::sync::Weak;

    fn detached_host() -> PipeHost {
        PipeHost {
            shared: Weak::new(),
            id: 1,
        }
    }

    fn registry_with_zero() -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("zero", Arc::new(ZeroPipe));
        registry
    }

    fn send_bytes(connector: &mut Connector, bytes: &[u8]) -> Result<usize, PipeError> {
        let mut data = bytes.to_vec();
        let mut bufs = [PipeBuffer { data: &mut data }];
        connector.send(&mut bufs)
    }

    #[test]
    fn binds_named_service() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        assert_eq!(connector.poll(), PipePoll::new().with_output(true));
        assert_eq!(send_bytes(&mut connector, b"pipe:zero\0"), Ok(10));
        // Now delegating to the zero service, which is always readable.
        assert!(connector.poll().input());
    }

    #[test]
    fn name_may_arrive_in_pieces() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        assert_eq!(send_bytes(&mut connector, b"pipe:"), Ok(5));
        assert_eq!(send_bytes(&mut connector, b"zero\0"), Ok(5));
        assert!(connector.poll().input());
    }

    #[test]
    fn args_are_split_off() {
        struct ExpectArgs;

        impl crate::service::ServiceFactory for ExpectArgs {
            fn open(&self, _host: PipeHost, args: Option<&str>) -> Box<dyn PipeService> {
                assert_eq!(args, Some("fast:mode"));
                Box::new(ZeroPipe)
            }
        }

        let registry = Arc::new(ServiceRegistry::new());
        registry.register("echo", Arc::new(ExpectArgs));
        let mut connector = Connector::new(registry, detached_host());
        assert_eq!(send_bytes(&mut connector, b"pipe:echo:fast:mode\0"), Ok(20));
    }

    #[test]
    fn unknown_service_is_invalid() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        assert_eq!(
            send_bytes(&mut connector, b"pipe:nope\0"),
            Err(PipeError::InvalidArgument)
        );
    }

    #[test]
    fn missing_prefix_is_invalid() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        assert_eq!(
            send_bytes(&mut connector, b"zero\0"),
            Err(PipeError::InvalidArgument)
        );
    }

    #[test]
    fn trailing_bytes_are_invalid() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        assert_eq!(
            send_bytes(&mut connector, b"pipe:zero\0extra"),
            Err(PipeError::InvalidArgument)
        );
    }

    #[test]
    fn oversized_name_is_invalid() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        let long = vec![b'a'; MAX_SERVICE_NAME_SIZE + 1];
        assert_eq!(
            send_bytes(&mut connector, &long),
            Err(PipeError::InvalidArgument)
        );
    }

    #[test]
    fn recv_before_binding_fails() {
        let mut connector = Connector::new(registry_with_zero(), detached_host());
        let mut data = [0; 4];
        let mut bufs = [PipeBuffer { data: &mut data }];
        assert_eq!(connector.recv(&mut bufs), Err(PipeError::Io));
    }
}
