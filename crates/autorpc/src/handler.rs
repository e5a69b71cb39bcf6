//! # Single-peer handler
//!
//! The caller-driven façade: one connection, one transport, one
//! `handle_once` at a time. Useful when the application owns the accept
//! loop and wants to pump dispatch itself, or when exactly one peer
//! exists (a child process on a pipe, one upgraded socket).
//!
//! The transport may be rebound between iterations, never during one;
//! pending calls are not tied to the transport they were issued on.

use std::any::TypeId;
use std::sync::Arc;

use crate::api;
use crate::api::Api;
use crate::conn;
use crate::conn::Connection;
use crate::dispatch;
use crate::dispatch::Step;
use crate::error::SessionError;
use crate::service::ServiceCore;
use crate::transport::Transport;
use crate::transport::Unbound;

/// A validated API description bound to a single connection, pumped by
/// the caller.
pub struct Handler {
    conn: Connection,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

impl Handler {
    /// Validates the description and builds the dispatch tables. Every
    /// configuration error surfaces here, before any traffic.
    pub fn new(api: Api) -> api::Result<Self> {
        let core = Arc::new(ServiceCore::build(api, Vec::new(), None, false)?);
        let conn = Connection::bind(core, Arc::new(Unbound));
        Ok(Self { conn })
    }

    /// Rebinds the byte channel. Call between `handle_once` iterations.
    pub fn set_transport(&self, transport: Box<dyn Transport>) {
        self.conn.set_transport(Arc::from(transport));
    }

    /// Runs one dispatch iteration: one envelope in, routed, answered.
    pub async fn handle_once(&self) -> Result<Step, SessionError> {
        dispatch::handle_one(&self.conn).await
    }

    /// Assigns the declared connection value. Fails with a type mismatch
    /// when `T` is not the declared slot type, and with `NotRegistered`
    /// when the description declared no slot at all.
    pub fn assign_value<T: Send + Sync + 'static>(&self, value: T) -> conn::Result<()> {
        let slot = self
            .conn
            .core
            .service
            .value_slot
            .as_ref()
            .ok_or(conn::Error::NotRegistered {
                type_name: std::any::type_name::<T>(),
            })?;

        if slot.key != TypeId::of::<T>() {
            return Err(conn::Error::TypeMismatch {
                expected: slot.type_name,
                received: std::any::type_name::<T>(),
            });
        }

        self.conn.assign(value)
    }

    /// The underlying connection: scoped values, the bound remote
    /// proxies, and the stop flag.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
