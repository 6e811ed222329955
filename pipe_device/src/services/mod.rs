// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Built-in services.
//!
//! The connector is part of the device's open path. The zero and ping-pong
//! services are simple test pipes; embedders register them explicitly.

pub(crate) mod connector;
pub mod pingpong;
pub mod zero;
