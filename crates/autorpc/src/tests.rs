//! Scenario tests for the dispatch loop and the outbound proxy path,
//! over channel-duplex mock transports.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::api::Api;
use crate::conn::Connection;
use crate::error::CallError;
use crate::error::MethodError;
use crate::error::SessionError;
use crate::mock_transport::ChannelTransport;
use crate::remote::RemoteProxies;
use crate::service::Service;

// --- Harness ---

fn json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).expect("reply was not valid JSON")
}

fn hello_api() -> Api {
    Api::new().method("Hello", |_conn: Connection, (n,): (i64,)| async move {
        Ok::<_, MethodError>((n + 1,))
    })
}

// --- Inbound dispatch ---

#[tokio::test]
async fn test_inbound_call_returns_data() {
    let service = Service::builder(hello_api()).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service
        .send(br#"{"c":1,"f":"Hello","a":[42]}"#.to_vec())
        .unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["c"], serde_json::json!("1"));
    assert_eq!(reply["d"], serde_json::json!([43]));
    assert!(reply.get("e").is_none());

    drop(to_service);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbound_method_error() {
    let api = Api::new().method("Hello", |_conn: Connection, (_n,): (i64,)| async move {
        Err::<(i64,), _>(MethodError::from("nope"))
    });
    let service = Service::builder(api).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service
        .send(br#"{"c":2,"f":"Hello","a":[42]}"#.to_vec())
        .unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["c"], serde_json::json!("2"));
    assert_eq!(reply["e"], serde_json::json!("nope"));
    assert!(reply.get("d").is_none());

    // The reply was delivered; the session surfaces the method error.
    match session.await.unwrap() {
        Err(SessionError::Method(err)) => assert_eq!(err.to_string(), "nope"),
        other => panic!("expected Method error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_unknown_function() {
    let service = Service::builder(hello_api()).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service
        .send(br#"{"c":3,"f":"Nope","a":[]}"#.to_vec())
        .unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["c"], serde_json::json!("3"));
    assert_eq!(reply["e"], serde_json::json!("autorpc: function not found"));

    match session.await.unwrap() {
        Err(SessionError::Rpc(err)) => {
            assert_eq!(err.to_string(), "autorpc: function not found");
        }
        other => panic!("expected Rpc error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_argument_count_mismatch() {
    let service = Service::builder(hello_api()).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service
        .send(br#"{"c":4,"f":"Hello","a":[1,2]}"#.to_vec())
        .unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["e"], serde_json::json!("autorpc: internal error"));

    assert!(matches!(
        session.await.unwrap(),
        Err(SessionError::Rpc(_))
    ));
}

#[tokio::test]
async fn test_inbound_undecodable_envelope() {
    let service = Service::builder(hello_api()).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    // Valid JSON, but not a valid envelope; the call id is recoverable.
    to_service.send(br#"{"c":9,"f":17}"#.to_vec()).unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["c"], serde_json::json!("9"));
    assert_eq!(reply["e"], serde_json::json!("autorpc: internal error"));

    assert!(matches!(
        session.await.unwrap(),
        Err(SessionError::Rpc(_))
    ));
}

fn blow_up() -> Result<(), MethodError> {
    panic!("handler blew up")
}

#[tokio::test]
async fn test_panicking_method_becomes_protocol_error() {
    let api = Api::new().method("Boom", |_conn: Connection, (): ()| async move { blow_up() });
    let service = Service::builder(api).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service.send(br#"{"c":5,"f":"Boom"}"#.to_vec()).unwrap();

    let reply = json(&from_service.recv().await.unwrap());
    assert_eq!(reply["e"], serde_json::json!("autorpc: internal error"));

    assert!(matches!(
        session.await.unwrap(),
        Err(SessionError::Rpc(_))
    ));
}

// --- Connection-scoped state ---

#[derive(Default)]
struct Counter(AtomicU64);

#[tokio::test]
async fn test_scoped_value_identity_is_stable() {
    let api = Api::new().method("Bump", |conn: Connection, (): ()| async move {
        let counter = conn.get::<Counter>().map_err(|e| MethodError::new(e.to_string()))?;
        Ok::<_, MethodError>((counter.0.fetch_add(1, Ordering::SeqCst) + 1,))
    });
    let service = Service::builder(api).scoped::<Counter>().build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    let session = tokio::spawn({
        let service = service.clone();
        async move { service.handle_connection(Box::new(transport), |_| {}).await }
    });

    to_service.send(br#"{"c":1,"f":"Bump"}"#.to_vec()).unwrap();
    let first = json(&from_service.recv().await.unwrap());
    assert_eq!(first["d"], serde_json::json!([1]));

    to_service.send(br#"{"c":2,"f":"Bump"}"#.to_vec()).unwrap();
    let second = json(&from_service.recv().await.unwrap());
    assert_eq!(second["d"], serde_json::json!([2]));

    drop(to_service);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_handling_before_first_message() {
    let service = Service::builder(hello_api()).build().unwrap();
    let (transport, to_service, mut from_service) = ChannelTransport::endpoint();

    to_service
        .send(br#"{"c":1,"f":"Hello","a":[42]}"#.to_vec())
        .unwrap();

    service
        .handle_connection(Box::new(transport), |conn| conn.stop_handling())
        .await
        .unwrap();

    assert!(from_service.try_recv().is_err(), "no request should be serviced");
}

// --- Outbound proxies ---

/// Builds a proxy-only service and hands back the connection captured by
/// the init callback alongside the peer channel ends.
async fn proxy_fixture(
    proxies: RemoteProxies,
) -> (
    Service,
    Connection,
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
    tokio::task::JoinHandle<Result<(), SessionError>>,
) {
    let service = Service::builder(Api::new())
        .use_remote_proxies(proxies)
        .build()
        .unwrap();
    let (transport, to_service, from_service) = ChannelTransport::endpoint();

    let (conn_tx, conn_rx) = oneshot::channel();
    let session = tokio::spawn({
        let service = service.clone();
        async move {
            service
                .handle_connection(Box::new(transport), move |conn| {
                    let _ = conn_tx.send(conn.clone());
                })
                .await
        }
    });

    let conn = conn_rx.await.unwrap();
    (service, conn, to_service, from_service, session)
}

#[tokio::test]
async fn test_outbound_call_resolves_completion() {
    let mut proxies = RemoteProxies::new();
    let world = proxies.function::<(u32,), (String,)>("World");

    let (service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let invoke = tokio::spawn({
        let remote = remote.clone();
        let world = world.clone();
        async move { remote.invoke(&world, (123456u32,)).await }
    });

    let request = json(&from_service.recv().await.unwrap());
    assert_eq!(request["f"], serde_json::json!("World"));
    assert_eq!(request["a"], serde_json::json!([123456]));
    let id = request["c"].as_str().unwrap().to_string();

    to_service
        .send(format!(r#"{{"c":"{}","d":["hi"]}}"#, id).into_bytes())
        .unwrap();

    let (greeting,) = invoke.await.unwrap().unwrap();
    assert_eq!(greeting, "hi");
    assert_eq!(service.core.pending.len(), 0);

    drop(to_service);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_outbound_remote_error_rejects_completion() {
    let mut proxies = RemoteProxies::new();
    let world = proxies.function::<(u32,), (String,)>("World");

    let (service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let invoke = tokio::spawn({
        let remote = remote.clone();
        let world = world.clone();
        async move { remote.invoke(&world, (1u32,)).await }
    });

    let request = json(&from_service.recv().await.unwrap());
    let id = request["c"].as_str().unwrap().to_string();

    to_service
        .send(format!(r#"{{"c":"{}","e":"nope"}}"#, id).into_bytes())
        .unwrap();

    match invoke.await.unwrap() {
        Err(CallError::Remote(message)) => assert_eq!(message, "nope"),
        other => panic!("expected Remote error, got {:?}", other),
    }
    assert_eq!(service.core.pending.len(), 0);

    drop(to_service);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_outbound_encode_failure_sends_nothing() {
    let mut proxies = RemoteProxies::new();
    // Maps with non-string keys cannot be serialized to JSON.
    let bad = proxies.function::<(HashMap<(u8, u8), u8>,), ()>("Bad");

    let (service, conn, _to_service, mut from_service, _session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let mut args = HashMap::new();
    args.insert((1u8, 2u8), 3u8);

    let (done_tx, done_rx) = oneshot::channel();
    remote
        .call(&bad, (args,), move |result| {
            let _ = done_tx.send(result);
        })
        .await;

    match done_rx.await.unwrap() {
        Err(CallError::Encode(_)) => {}
        other => panic!("expected Encode error, got {:?}", other),
    }
    assert!(from_service.try_recv().is_err(), "no bytes should reach the transport");
    assert_eq!(service.core.pending.len(), 0);
}

#[tokio::test]
async fn test_outbound_return_count_mismatch() {
    let mut proxies = RemoteProxies::new();
    let pair = proxies.function::<(u32,), (String, i64)>("Pair");

    let (service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let invoke = tokio::spawn({
        let remote = remote.clone();
        let pair = pair.clone();
        async move { remote.invoke(&pair, (7u32,)).await }
    });

    let request = json(&from_service.recv().await.unwrap());
    let id = request["c"].as_str().unwrap().to_string();

    // One return where two are expected.
    to_service
        .send(format!(r#"{{"c":"{}","d":["hi"]}}"#, id).into_bytes())
        .unwrap();

    match invoke.await.unwrap() {
        Err(CallError::Protocol(message)) => {
            assert_eq!(message, "got wrong num of returns");
        }
        other => panic!("expected Protocol error, got {:?}", other),
    }
    assert_eq!(service.core.pending.len(), 0);

    // The peer is out of sync; the session sees the mismatch too.
    assert!(matches!(session.await.unwrap(), Err(SessionError::Rpc(_))));
}

#[tokio::test]
async fn test_outbound_protocol_error_rejects_completion() {
    let mut proxies = RemoteProxies::new();
    let world = proxies.function::<(u32,), (String,)>("World");

    let (service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let invoke = tokio::spawn({
        let remote = remote.clone();
        let world = world.clone();
        async move { remote.invoke(&world, (1u32,)).await }
    });

    let request = json(&from_service.recv().await.unwrap());
    let id = request["c"].as_str().unwrap().to_string();

    to_service
        .send(format!(r#"{{"c":"{}","e":"autorpc: function not found"}}"#, id).into_bytes())
        .unwrap();

    match invoke.await.unwrap() {
        Err(CallError::Protocol(message)) => assert_eq!(message, "function not found"),
        other => panic!("expected Protocol error, got {:?}", other),
    }
    assert_eq!(service.core.pending.len(), 0);

    match session.await.unwrap() {
        Err(SessionError::Rpc(err)) => {
            assert_eq!(err.to_string(), "autorpc: function not found");
        }
        other => panic!("expected Rpc error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_outbound_undeclared_function_rejected() {
    let mut proxies = RemoteProxies::new();
    let _world = proxies.function::<(u32,), (String,)>("World");

    // A stub from a record that was never enabled on this service.
    let mut other = RemoteProxies::new();
    let stray = other.function::<(u32,), (String,)>("Stray");

    let (_service, conn, _to_service, _from_service, _session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    match remote.invoke(&stray, (1u32,)).await {
        Err(CallError::Undeclared(name)) => assert_eq!(name, "Stray"),
        other => panic!("expected Undeclared error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spurious_response_is_dropped() {
    let mut proxies = RemoteProxies::new();
    let world = proxies.function::<(u32,), (String,)>("World");

    let (_service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = oneshot::channel();
    remote
        .call(&world, (1u32,), {
            let completions = completions.clone();
            move |result| {
                completions.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(result);
            }
        })
        .await;

    let request = json(&from_service.recv().await.unwrap());
    let id = request["c"].as_str().unwrap().to_string();

    let reply = format!(r#"{{"c":"{}","d":["hi"]}}"#, id).into_bytes();
    to_service.send(reply.clone()).unwrap();
    // The same response a second time: no pending entry, silently dropped.
    to_service.send(reply).unwrap();

    assert!(done_rx.await.unwrap().is_ok());

    drop(to_service);
    session.await.unwrap().unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_teardown_rejects_pending_calls() {
    let mut proxies = RemoteProxies::new();
    let world = proxies.function::<(u32,), (String,)>("World");

    let (service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let invoke = tokio::spawn({
        let remote = remote.clone();
        let world = world.clone();
        async move { remote.invoke(&world, (1u32,)).await }
    });

    // Wait for the request to be in flight, then close without replying.
    let _ = from_service.recv().await.unwrap();
    drop(to_service);

    session.await.unwrap().unwrap();
    match invoke.await.unwrap() {
        Err(CallError::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }
    assert_eq!(service.core.pending.len(), 0);
}

#[tokio::test]
async fn test_services_over_channel_pair() {
    let (side_a, side_b) = ChannelTransport::pair();

    let answering = Service::builder(hello_api()).build().unwrap();
    let answering_session = tokio::spawn(async move {
        answering.handle_connection(Box::new(side_a), |_| {}).await
    });

    let mut proxies = RemoteProxies::new();
    let hello = proxies.function::<(i64,), (i64,)>("Hello");
    let calling = Service::builder(Api::new())
        .use_remote_proxies(proxies)
        .build()
        .unwrap();

    let (conn_tx, conn_rx) = oneshot::channel();
    let calling_session = tokio::spawn(async move {
        calling
            .handle_connection(Box::new(side_b), move |conn| {
                let _ = conn_tx.send(conn.clone());
            })
            .await
    });

    let conn = conn_rx.await.unwrap();
    let remote = conn.remote().unwrap();

    let (answer,) = remote.invoke(&hello, (41,)).await.unwrap();
    assert_eq!(answer, 42);

    answering_session.abort();
    calling_session.abort();
}

/// Responses arriving in reverse order still reach their own
/// completions; correlation is by call id, not arrival order.
#[tokio::test]
async fn test_concurrent_calls_correlate_out_of_order() {
    let mut proxies = RemoteProxies::new();
    let double = proxies.function::<(u32,), (u32,)>("Double");

    let (_service, conn, to_service, mut from_service, session) = proxy_fixture(proxies).await;
    let remote = conn.remote().unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let remote = remote.clone();
        let double = double.clone();
        tasks.push(tokio::spawn(async move {
            let (doubled,) = remote.invoke(&double, (i,)).await.unwrap();
            assert_eq!(doubled, i * 2);
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..8 {
        requests.push(json(&from_service.recv().await.unwrap()));
    }

    use rand::seq::SliceRandom;
    requests.shuffle(&mut rand::thread_rng());

    for request in requests {
        let id = request["c"].as_str().unwrap();
        let input = request["a"][0].as_u64().unwrap() as u32;
        to_service
            .send(format!(r#"{{"c":"{}","d":[{}]}}"#, id, input * 2).into_bytes())
            .unwrap();
    }

    for task in tasks {
        task.await.unwrap();
    }

    drop(to_service);
    session.await.unwrap().unwrap();
}
