#![cfg_attr(not(feature = "std"), no_std)]
//! Device-side core for an EHCI-like dual-controller USB 2.0 peripheral.
//!
//! This crate drives the hardware through a DMA-linked list of transfer
//! descriptors anchored in per-endpoint queue heads, services the
//! setup/data/status phases of the control pipe, implements the mandatory
//! subset of USB 2.0 Chapter 9 standard device requests, and exposes an
//! asynchronous scheduling interface ([`Device::submit`]) to higher-level
//! class code.
//!
//! Module layout mirrors the data flow: [`regs`]/[`dma`] are the raw
//! register and DMA-structure layer, [`endpoint`]/[`queue`] are the
//! per-endpoint runtime state, [`controller`] is the register-level driver,
//! [`control_pipe`]/[`request`] implement endpoint 0's state machine and
//! Chapter 9 dispatch, and [`device`] wires all of the above into a
//! complete, interrupt-driven `Device`.
//!
//! Register definitions for concrete silicon, linker-provided alignment and
//! uncached memory regions, class-specific request handlers (HID, CDC,
//! vendor), the ringbuffer adaptor, descriptor-literal builder macros, and
//! chip clocking/PHY bring-up are external collaborators this crate does
//! not provide.

pub mod control_pipe;
pub mod controller;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod regs;
pub mod request;

pub use device::{Device, DeviceCallbacks, DeviceConfig};
pub use error::Error;
