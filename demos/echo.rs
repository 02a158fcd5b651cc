//! Echo over TCP - one control connection plus two data connections.
//!
//! This example demonstrates:
//! - Serving streams with a closure handler
//! - Dialing data connections lazily with `PendingConnection`
//! - Sending typed MsgPack messages large enough to be offloaded
//!
//! ```text
//! cargo run --example echo
//! ```

use chaotic_good::codec::MsgPackCodec;
use chaotic_good::{
    CallEvent, ClientTransport, Endpoint, Metadata, PendingConnection, ServerCall, ServerTransport,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

const DATA_CONNECTIONS: usize = 2;

#[derive(Serialize, Deserialize, Debug)]
struct Blob {
    name: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

async fn echo(mut call: ServerCall) {
    while let Some(event) = call.next_event().await {
        match event {
            CallEvent::Message(m) => {
                if call.send_message(m).await.is_err() {
                    return;
                }
            }
            CallEvent::EndOfStream => break,
            _ => return,
        }
    }
    let _ = call.finish(Metadata::new().with("status", "ok")).await;
}

async fn serve(listener: TcpListener) -> chaotic_good::Result<ServerTransport> {
    let (control, peer) = listener.accept().await?;
    println!("server: control connection from {}", peer);

    let listener = std::sync::Arc::new(listener);
    let data = (0..DATA_CONNECTIONS)
        .map(|i| {
            let listener = listener.clone();
            PendingConnection::new(format!("data-{}", i), async move {
                let (stream, _) = listener.accept().await?;
                Endpoint::from_tcp(stream)
            })
        })
        .collect();

    ServerTransport::builder()
        .serve(Endpoint::from_tcp(control)?, data, echo)
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let data = (0..DATA_CONNECTIONS)
        .map(|i| {
            let addr = addr.clone();
            PendingConnection::new(format!("data-{}", i), async move {
                Endpoint::connect_tcp(&addr).await
            })
        })
        .collect();
    let control = Endpoint::connect_tcp(&addr).await?;

    let (server, client) = tokio::join!(
        serve(listener),
        ClientTransport::builder()
            .inline_payload_threshold(1024)
            .connect(control, data),
    );
    let (_server, client) = (server?, client?);

    let blob = Blob {
        name: "payload".to_string(),
        data: vec![7u8; 256 * 1024],
    };
    let mut call = client
        .start_call(Metadata::new().with("path", "/echo"))
        .await?;
    call.send_message(MsgPackCodec::encode(&blob)?.into()).await?;
    call.finish_sending().await?;

    while let Some(event) = call.next_event().await {
        match event {
            CallEvent::Message(m) => {
                let echoed: Blob = MsgPackCodec::decode(&m)?;
                println!("client: got {} ({} bytes)", echoed.name, echoed.data.len());
            }
            CallEvent::TrailingMetadata(trailers) => {
                println!("client: finished with {:?}", trailers.get("status"));
                break;
            }
            other => println!("client: {:?}", other),
        }
    }

    Ok(())
}
