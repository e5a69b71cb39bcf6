//! Two peers on one in-memory duplex stream.
//!
//! The "host" side exposes `Greet` and keeps a per-connection visit
//! counter; the "guest" side calls it through its remote record. Run with
//! `cargo run -p greeter`.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;

use autorpc::Api;
use autorpc::Connection;
use autorpc::MethodError;
use autorpc::RemoteProxies;
use autorpc::Service;
use autorpc::StreamTransport;

#[derive(Default)]
struct Visits(AtomicU64);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Host: answers Greet, counting visits per connection.
    let host_api = Api::new().method("Greet", |conn: Connection, (name,): (String,)| async move {
        let visits = conn
            .get::<Visits>()
            .map_err(|err| MethodError::new(err.to_string()))?;
        let n = visits.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((format!("hello {}, visitor #{}", name, n),))
    });
    let host = Service::builder(host_api).scoped::<Visits>().build().unwrap();

    // Guest: no local methods, only the outbound record.
    let mut proxies = RemoteProxies::new();
    let greet = proxies.function::<(String,), (String,)>("Greet");
    let guest = Service::builder(Api::new())
        .use_remote_proxies(proxies)
        .build()
        .unwrap();

    let (host_stream, guest_stream) = tokio::io::duplex(64 * 1024);

    let (host_read, host_write) = tokio::io::split(host_stream);
    let host_session = tokio::spawn(async move {
        host.handle_connection(Box::new(StreamTransport::new(host_read, host_write)), |_| {})
            .await
    });

    let (guest_read, guest_write) = tokio::io::split(guest_stream);
    let (conn_tx, conn_rx) = oneshot::channel();
    let guest_session = tokio::spawn(async move {
        guest
            .handle_connection(
                Box::new(StreamTransport::new(guest_read, guest_write)),
                move |conn| {
                    let _ = conn_tx.send(conn.clone());
                },
            )
            .await
    });

    let conn = conn_rx.await.unwrap();
    let remote = conn.remote().unwrap();

    for name in ["alice", "bob", "alice"] {
        match remote.invoke(&greet, (name.to_string(),)).await {
            Ok((greeting,)) => tracing::info!(%greeting, "greeted"),
            Err(err) => tracing::error!(%err, "call failed"),
        }
    }

    guest_session.abort();
    host_session.abort();
}
