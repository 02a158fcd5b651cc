//! Connections underneath the transport.
//!
//! - [`Endpoint`]: one byte stream with a peer address
//! - [`ControlEndpoint`]: the ordered connection carrying every frame header
//! - [`DataEndpoints`]: the pool of bulk-payload connections

mod control;
mod data;
mod io;

pub use control::{ControlEndpoint, ControlReader, ControlWriter};
pub use data::{DataEndpoints, ReadTicket};
pub use io::{BoxFuture, Endpoint, EndpointReader, EndpointWriter, PendingConnection};
