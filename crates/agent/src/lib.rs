//! Helion guest agent: the in-VM half of the hypervisor control channel.
//!
//! One daemon per guest. It keeps a session open over the virtio-serial
//! port, dispatches privileged requests from the host, and reports
//! telemetry. See `device` for the transport, `session` for the connection
//! lifecycle, `dispatch` and `handler` for request execution.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod handler;
pub mod outbound;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Well-known virtio-serial port name the hypervisor attaches.
pub const PORT_NAME: &str = "org.helion.agent.0";
