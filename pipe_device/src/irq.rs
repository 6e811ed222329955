// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt line capability.

/// A two-level interrupt line supplied by the hosting platform.
///
/// The device asserts the line when a host callback deposits wake reasons
/// and deasserts it once the guest has drained every signaled channel.
pub trait IrqLine: Send + Sync {
    /// Sets the line level. `true` asserts the interrupt.
    fn set_level(&self, high: bool);
}
