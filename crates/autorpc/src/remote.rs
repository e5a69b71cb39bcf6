//! # Remote proxies
//!
//! The outbound half of the binding layer. A [`RemoteProxies`] record
//! declares the functions callable on the peer; each declaration hands
//! back a typed [`RemoteFn`] stub. At connection time the record is
//! instantiated as a [`Remote`] bound to that particular connection, so
//! two concurrent connections route their calls over their own
//! transports.
//!
//! A call encodes its arguments, registers a completion under a fresh
//! call id, and writes one request envelope. The completion is invoked
//! exactly once: with the typed returns when the correlated response
//! arrives, or with the error that prevented it. `Remote` holds its
//! connection through a non-owning handle; the pending registry lives on
//! the service, so no ownership cycle forms between a connection, its
//! proxies, and the dispatch loop.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Weak;

use tokio::sync::oneshot;

use autorpc_wire::Envelope;
use autorpc_wire::Error as WireError;
use autorpc_wire::WireValues;

use crate::conn::ConnCore;
use crate::conn::Connection;
use crate::error::CallError;
use crate::error::RpcError;
use crate::pending::CompleteFn;
use crate::pending::Outcome;

/// The remote-proxies record under construction: an ordered set of named
/// function slots.
#[derive(Default)]
pub struct RemoteProxies {
    pub(crate) functions: Vec<String>,
}

impl RemoteProxies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares one outbound-callable function. `A` is the argument tuple
    /// sent on the wire, `R` the return tuple the completion receives.
    pub fn function<A, R>(&mut self, name: impl Into<String>) -> RemoteFn<A, R>
    where
        A: WireValues,
        R: WireValues,
    {
        let name = name.into();
        self.functions.push(name.clone());
        RemoteFn {
            name: Arc::from(name),
            marker: PhantomData,
        }
    }
}

/// A typed stub for one function slot of the remote record. Carries only
/// the name and the argument/return types; calls go through the
/// connection-bound [`Remote`].
pub struct RemoteFn<A, R> {
    name: Arc<str>,
    marker: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteFn<A, R> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A, R> Clone for RemoteFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            marker: PhantomData,
        }
    }
}

impl<A, R> std::fmt::Debug for RemoteFn<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFn").field("name", &self.name).finish()
    }
}

/// The remote record instantiated for one connection.
#[derive(Clone)]
pub struct Remote {
    conn: Weak<ConnCore>,
    functions: Arc<HashSet<String>>,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").field("functions", &self.functions).finish_non_exhaustive()
    }
}

impl Remote {
    pub(crate) fn bind(conn: &Connection, functions: Arc<HashSet<String>>) -> Self {
        Self {
            conn: Arc::downgrade(&conn.core),
            functions,
        }
    }

    /// Invokes a remote function, delivering the outcome to `complete`.
    ///
    /// Returns once the request has been written (or has failed to be);
    /// it never waits for the response. The completion is invoked exactly
    /// once, possibly before this returns: immediately on argument encode
    /// failure (nothing is sent, nothing registered) or on write failure
    /// (the pending entry is removed first).
    pub async fn call<A, R, C>(&self, function: &RemoteFn<A, R>, args: A, complete: C)
    where
        A: WireValues,
        R: WireValues,
        C: FnOnce(std::result::Result<R, CallError>) + Send + 'static,
    {
        let Some(core) = self.conn.upgrade() else {
            complete(Err(CallError::ConnectionClosed));
            return;
        };

        if !self.functions.contains(function.name()) {
            complete(Err(CallError::Undeclared(function.name().to_string())));
            return;
        }

        let fragments = match args.to_fragments() {
            Ok(fragments) => fragments,
            Err(err) => {
                complete(Err(CallError::Encode(err.to_string())));
                return;
            }
        };

        let shim: CompleteFn = Box::new(move |outcome| deliver::<R, C>(outcome, complete));
        let pending = &core.service.pending;
        let call_id = pending.register(core.id, shim);

        let envelope = Envelope::request(call_id, function.name(), fragments);
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(record) = pending.take(call_id) {
                    record.reject(CallError::Encode(err.to_string()));
                }
                return;
            }
        };

        if let Err(err) = core.transport().send(&bytes).await {
            if let Some(record) = pending.take(call_id) {
                record.reject(CallError::Transport(err));
            }
        }
    }

    /// The awaitable form of [`call`](Self::call): resolves when the
    /// correlated response arrives. The core imposes no timeout; race the
    /// returned future against one if you need a deadline.
    pub async fn invoke<A, R>(
        &self,
        function: &RemoteFn<A, R>,
        args: A,
    ) -> std::result::Result<R, CallError>
    where
        A: WireValues,
        R: WireValues,
    {
        let (tx, rx) = oneshot::channel();
        self.call(function, args, move |result| {
            let _ = tx.send(result);
        })
        .await;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::ConnectionClosed),
        }
    }
}

/// Decodes the typed returns and hands the outcome to the completion.
/// The error return reports a returns/shape mismatch to the dispatch
/// loop; the completion has already been rejected by then.
fn deliver<R, C>(outcome: Outcome, complete: C) -> std::result::Result<(), RpcError>
where
    R: WireValues,
    C: FnOnce(std::result::Result<R, CallError>),
{
    match outcome {
        Outcome::Failed(err) => {
            complete(Err(err));
            Ok(())
        }
        Outcome::Returns(fragments) => match R::from_fragments(&fragments) {
            Ok(returns) => {
                complete(Ok(returns));
                Ok(())
            }
            Err(WireError::CountMismatch { .. }) => {
                complete(Err(CallError::Protocol("got wrong num of returns".into())));
                Err(RpcError::new("got wrong num of returns"))
            }
            Err(err) => {
                let message = err.to_string();
                complete(Err(CallError::Protocol(message.clone())));
                Err(RpcError::new(message))
            }
        },
    }
}
