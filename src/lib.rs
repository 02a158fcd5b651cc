//! # chaotic-good
//!
//! A multiplexed, connection-splitting RPC transport.
//!
//! Many concurrent calls share one *control* connection that carries every
//! frame header in order, plus zero or more *data* connections that carry
//! large payloads so bulk transfers neither block small frames nor each other.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): 12-byte frame header and typed frames
//! - **Endpoints** ([`endpoint`]): control connection and data-connection pool
//! - **Transport** ([`transport`]): inline vs. offloaded payloads, alignment padding
//! - **Multiplexer** ([`ClientTransport`], [`ServerTransport`]): stream ids to calls,
//!   message chunking and reassembly
//!
//! ## Example
//!
//! ```ignore
//! use chaotic_good::{CallEvent, ClientTransport, Endpoint, Metadata, ServerCall, ServerTransport};
//!
//! #[tokio::main]
//! async fn main() -> chaotic_good::Result<()> {
//!     let (client_end, server_end) = Endpoint::pair(64 * 1024);
//!
//!     let (client, server) = tokio::join!(
//!         ClientTransport::builder().connect(client_end, Vec::new()),
//!         ServerTransport::builder().serve(server_end, Vec::new(), |mut call: ServerCall| async move {
//!             while let Some(CallEvent::Message(m)) = call.next_event().await {
//!                 let _ = call.send_message(m).await;
//!             }
//!             let _ = call.finish(Metadata::new()).await;
//!         }),
//!     );
//!     let (client, _server) = (client?, server?);
//!
//!     let mut call = client.start_call(Metadata::new().with("path", "/echo")).await?;
//!     call.send_message("ping".into()).await?;
//!     call.finish_sending().await?;
//!     while let Some(event) = call.next_event().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod protocol;
pub mod transport;
pub mod writer;

mod call;
mod client;
mod multiplex;
mod server;
mod stream;

pub use call::{ClientCall, ServerCall};
pub use client::{ClientBuilder, ClientTransport};
pub use config::{NegotiatedConfig, TransportConfig};
pub use endpoint::{ControlEndpoint, DataEndpoints, Endpoint, PendingConnection};
pub use error::{ChaoticGoodError, DecodeError, Result, Status, StatusCode};
pub use multiplex::ConnectivityState;
pub use protocol::{Frame, FrameHeader, FrameType, Metadata, Settings};
pub use server::{ServerBuilder, ServerTransport, StreamHandler};
pub use stream::{CallEvent, StreamState};
pub use transport::ChaoticGoodTransport;
