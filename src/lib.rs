#![cfg_attr(docsrs, feature(doc_cfg))]
//! # packbms
//!
//! Client-side protocol stack for pack BMS controllers speaking a framed
//! register protocol (`7F 55 .. FD`, CRC-16/MODBUS trailer) over a
//! byte-oriented link: a serial line, or a socket tunnel relaying
//! hex-encoded frames.
//!
//! The crate builds request frames, parses and validates responses,
//! translates raw 16-bit register words into engineering-unit parameters,
//! and resolves the device-identity fields whose addresses depend on the
//! cell and sensor counts reported by the device itself.
//!
//! ## Layers
//!
//! - [`crc`] / [`frame`]: the wire codec.
//! - [`registers`]: an address-indexed view over register blocks.
//! - [`params`]: the parameter catalogue and its decode/encode engine.
//! - [`status`]: the dynamic-layout status-block decoder.
//! - [`client`]: [`client::BmsClient`], the orchestration layer over any
//!   [`transport::Transport`].
//! - [`transport`]: the transport trait plus [`transport::StreamTransport`],
//!   which turns a noisy byte/text stream into correlated request/response
//!   pairs.
//!
//! ## Features
//!
//! - `tokio-serial-async`: enables [`tokio_serial_async::SerialTransport`],
//!   a request transport over a serial port using the `tokio-serial` crate.

mod error;

pub mod client;
pub mod crc;
pub mod frame;
pub mod params;
pub mod registers;
pub mod status;
pub mod transport;

/// Serial-port transport, behind the `tokio-serial-async` feature.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;

pub use client::{BmsClient, ClientConfig, IdentityInfo, Mac};
pub use error::Error;
pub use frame::{ParsedFrame, ProtocolError};
pub use params::{Access, Category, ParamDef, ParamValue};
pub use status::BmsStatus;
pub use transport::{
    StreamEvent, StreamLink, StreamOptions, StreamTransport, Transport, TransportError,
};
