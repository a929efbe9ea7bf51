//! IPC bridge between pool workers.
//!
//! # Architecture
//!
//! - **protocol**: frame header, `WorkerId`, reassembled `Message`
//! - **codec**: splits payloads into fixed-size frames and reassembles them
//! - **transport**: framed send/receive over Unix datagram sockets

pub mod codec;
pub mod protocol;
pub mod transport;
