//! # Dispatch loop
//!
//! One iteration: receive one envelope, route it.
//!
//! - Requests go to the inbound handler table; the reply is written back
//!   on the same transport. A user-level method error outranks a reply
//!   write failure; a write failure is surfaced only when the method
//!   itself succeeded.
//! - Responses and protocol errors go to the pending-call registry. The
//!   record is removed before its completion runs. A response with no
//!   matching record is dropped: late or spurious.
//! - Stream EOF is a normal outcome, not an error.
//!
//! Exactly one task drives `handle_one` per connection; the envelope
//! boundary is a framed message, and the read side tolerates no
//! concurrent readers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use autorpc_wire::salvage_call_id;
use autorpc_wire::Envelope;
use autorpc_wire::Kind;

use crate::api::Failure;
use crate::conn::Connection;
use crate::error::CallError;
use crate::error::RpcError;
use crate::error::SessionError;
use crate::transport;
use crate::transport::Transport;

/// Outcome of one dispatch iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// One envelope was handled; the session may continue.
    Handled,
    /// The peer closed the stream. Normal termination.
    Eof,
}

pub(crate) async fn handle_one(conn: &Connection) -> Result<Step, SessionError> {
    let transport = conn.transport();

    let bytes = match transport.recv().await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(Step::Eof),
        Err(err) => return Err(SessionError::Transport(err)),
    };

    let envelope = match Envelope::from_bytes(&bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Best effort: tell the peer which call we are rejecting, if
            // the id survived the damage.
            let reply = Envelope::protocol_error(salvage_call_id(&bytes), "internal error");
            if let Err(write_err) = send_envelope(&transport, &reply).await {
                tracing::warn!(error = %write_err, "failed to report decode error to peer");
            }
            return Err(SessionError::Rpc(RpcError::wrap("internal error", err)));
        }
    };

    match envelope.kind() {
        Kind::Request => handle_request(conn, &transport, envelope).await,
        Kind::Response => handle_response(conn, envelope),
        Kind::ProtocolError | Kind::Malformed => handle_protocol_error(conn, envelope),
    }
}

async fn handle_request(
    conn: &Connection,
    transport: &Arc<dyn Transport>,
    envelope: Envelope,
) -> Result<Step, SessionError> {
    let call_id = envelope.call_id;
    let service = &conn.core.service;

    let Some(method) = service.methods.get(&envelope.function) else {
        let reply = Envelope::protocol_error(call_id, "function not found");
        if let Err(write_err) = send_envelope(transport, &reply).await {
            tracing::warn!(error = %write_err, "failed to report unknown function to peer");
        }
        return Err(SessionError::Rpc(RpcError::new("function not found")));
    };

    let call = (method.as_ref())(conn.clone(), envelope.args);
    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Failure::Rpc(RpcError::new("internal error"))),
    };

    let (reply, failure) = match result {
        Ok(data) => (Envelope::response(call_id, data), None),
        Err(Failure::Method(err)) => (
            Envelope::failure(call_id, err.to_string()),
            Some(SessionError::Method(err)),
        ),
        Err(Failure::Rpc(err)) => (
            Envelope::failure(call_id, err.to_string()),
            Some(SessionError::Rpc(err)),
        ),
    };

    let written = send_envelope(transport, &reply).await;
    match failure {
        // The method's own failure outranks a failed reply write.
        Some(err) => Err(err),
        None => match written {
            Ok(()) => Ok(Step::Handled),
            Err(err) => Err(SessionError::Rpc(RpcError::from_cause(err))),
        },
    }
}

fn handle_response(conn: &Connection, envelope: Envelope) -> Result<Step, SessionError> {
    let Some(record) = conn.core.service.pending.take(envelope.call_id) else {
        tracing::debug!(call_id = %envelope.call_id, "dropping response with no pending call");
        return Ok(Step::Handled);
    };

    if !envelope.error.is_empty() {
        record.reject(CallError::Remote(envelope.error));
        return Ok(Step::Handled);
    }

    record.resolve(envelope.data).map_err(SessionError::Rpc)?;
    Ok(Step::Handled)
}

fn handle_protocol_error(conn: &Connection, envelope: Envelope) -> Result<Step, SessionError> {
    let message = envelope
        .protocol_message()
        .unwrap_or("malformed envelope")
        .to_string();

    if let Some(record) = conn.core.service.pending.take(envelope.call_id) {
        record.reject(CallError::Protocol(message.clone()));
    }

    // The peer rejected an envelope outright; the session owner decides
    // whether the stream is still worth reading.
    Err(SessionError::Rpc(RpcError::new(message)))
}

async fn send_envelope(
    transport: &Arc<dyn Transport>,
    envelope: &Envelope,
) -> Result<(), transport::Error> {
    let bytes = envelope
        .to_bytes()
        .map_err(|err| transport::Error::Io(err.to_string()))?;
    transport.send(&bytes).await
}
