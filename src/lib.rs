//! An embedded Bluetooth Mesh bearer and network stack.
//!
//! Bramble implements the bearer-to-network core of a mesh node: the advertising and GATT
//! bearers with their dispatch, the encrypted network pipeline with relay and proxy forwarding,
//! secure network beacons, the PB-ADV provisioning bearer, and the proxy configuration protocol.
//! Transport, access and model layers sit on top of the [`config::EventSink`] surface.
//!
//! # Using the stack
//!
//! Bramble is runtime and hardware-agnostic: it does not need an RTOS (although you can
//! certainly use one if you want) and runs inside a single-threaded cooperative event loop that
//! you provide. You have to implement a few host services, collected in the [`Config`] trait:
//!
//! * A millisecond-precision [`Timer`] and a cryptographically secure RNG.
//! * A [`Radio`] that transmits framed bearer PDUs.
//! * An asynchronous [`SecurityEngine`] wrapping your AES/CCM/CMAC primitives.
//! * The local configuration [`Store`], replay list and (optionally) friendship module.
//!
//! Everything else is driven through [`MeshStack`]: feed it inbound frames, radio-ready signals,
//! security completions and timer polls, and consume its events.
//!
//! [`Config`]: config/trait.Config.html
//! [`config::EventSink`]: config/trait.EventSink.html
//! [`Timer`]: time/trait.Timer.html
//! [`Radio`]: config/trait.Radio.html
//! [`SecurityEngine`]: security/trait.SecurityEngine.html
//! [`Store`]: config/trait.Store.html
//! [`MeshStack`]: stack/struct.MeshStack.html

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
mod log;
mod error;
pub mod utils;

pub mod address;
pub mod beacon;
pub mod bearer;
pub mod bytes;
pub mod config;
pub mod net;
pub mod prov;
pub mod proxy;
pub mod security;
pub mod stack;
pub mod time;

pub use self::error::Error;
pub use self::stack::MeshStack;
