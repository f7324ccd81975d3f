//! Native rust implementation of the D-Bus wire protocol.  Supports TCP and UDS transports,
//! the EXTERNAL, ANONYMOUS and DBUS_COOKIE_SHA1 authentication mechanisms, and a
//! full-duplex connection that multiplexes method calls, replies and signals
//! over one transport.

pub mod address;
pub mod auth;
pub mod bus;
pub mod connection;
pub mod demarshal;
pub mod error;
pub mod marshal;
pub mod match_rule;
pub mod message;
pub mod signature;
pub mod transport;
pub mod types;

pub use crate::auth::{Capabilities, Guid};
pub use crate::bus::BusConnection;
pub use crate::connection::{Connection, PendingReply, SignalStream};
pub use crate::error::Error;
pub use crate::match_rule::MatchRule;
pub use crate::message::Message;
pub use crate::types::Value;
