//! # Connection handle and connection-scoped state
//!
//! A [`Connection`] ties one live transport to the service that accepted
//! it. It carries the connection-scoped values: typed objects created
//! lazily, at most once per connection, by factories registered on the
//! service. The bound remote-proxies instance is itself such a value.
//!
//! State lives exactly as long as the transport session; `finalize` drops
//! it and rejects any outbound calls the connection still had in flight.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::error::CallError;
use crate::remote::Remote;
use crate::service::ServiceCore;
use crate::transport::Transport;

/// Stable identity of one accepted connection within its service.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
pub enum Error {
    /// The type was never registered as connection-scoped on this service.
    NotRegistered { type_name: &'static str },
    /// The type is registered assign-only and no value has been assigned
    /// on this connection yet.
    NotAssigned { type_name: &'static str },
    /// The assigned value does not match the declared connection value.
    TypeMismatch {
        expected: &'static str,
        received: &'static str,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegistered { type_name } => {
                write!(f, "autorpc: type {} is not a connection-scoped type of this service", type_name)
            }
            Self::NotAssigned { type_name } => {
                write!(f, "autorpc: no value assigned for connection-scoped type {}", type_name)
            }
            Self::TypeMismatch { expected, received } => {
                write!(f, "autorpc: value does not match the declared connection value (wanted {} but got {})", expected, received)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Creates one connection-scoped value for a connection, on first access.
pub(crate) type ValueFactory =
    Box<dyn Fn(&Connection) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// One registered connection-scoped type: its name for diagnostics and
/// its factory. Assign-only slots (the declared connection value) have no
/// factory.
pub(crate) struct ScopedEntry {
    pub(crate) type_name: &'static str,
    pub(crate) factory: Option<ValueFactory>,
}

pub(crate) struct ConnCore {
    pub(crate) id: ConnectionId,
    pub(crate) service: Arc<ServiceCore>,
    transport: Mutex<Arc<dyn Transport>>,
    values: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    handling: AtomicBool,
}

/// Handle to one live connection. Cheap to clone; handlers receive one
/// per invocation and `init` callbacks may keep one for the session.
#[derive(Clone)]
pub struct Connection {
    pub(crate) core: Arc<ConnCore>,
}

impl Connection {
    pub(crate) fn bind(service: Arc<ServiceCore>, transport: Arc<dyn Transport>) -> Self {
        let id = ConnectionId(service.next_conn.fetch_add(1, Ordering::Relaxed));
        Self {
            core: Arc::new(ConnCore {
                id,
                service,
                transport: Mutex::new(transport),
                values: Mutex::new(HashMap::new()),
                handling: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    /// Returns the connection-scoped value for `T`, creating it through
    /// the registered factory on first access. The same instance is
    /// returned for the lifetime of the connection.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = TypeId::of::<T>();
        if let Some(existing) = lock(&self.core.values).get(&key).cloned() {
            return downcast(existing);
        }

        let entry = self
            .core
            .service
            .scoped
            .get(&key)
            .ok_or(Error::NotRegistered {
                type_name: std::any::type_name::<T>(),
            })?;
        let Some(factory) = entry.factory.as_ref() else {
            return Err(Error::NotAssigned {
                type_name: entry.type_name,
            });
        };

        // The factory runs outside the lock; if two handler workers race
        // here, the first insertion wins and both observe it.
        let created = factory(self);
        let stored = lock(&self.core.values)
            .entry(key)
            .or_insert(created)
            .clone();
        downcast(stored)
    }

    /// Replaces the connection-scoped value for `T`. The type must have
    /// been registered on the service.
    pub fn assign<T: Send + Sync + 'static>(&self, value: T) -> Result<()> {
        let key = TypeId::of::<T>();
        if !self.core.service.scoped.contains_key(&key) {
            return Err(Error::NotRegistered {
                type_name: std::any::type_name::<T>(),
            });
        }

        lock(&self.core.values).insert(key, Arc::new(value));
        Ok(())
    }

    /// The remote-proxies instance bound to this connection.
    pub fn remote(&self) -> Result<Remote> {
        self.get::<Remote>().map(|remote| remote.as_ref().clone())
    }

    /// Asks the dispatch loop to stop after the current iteration.
    pub fn stop_handling(&self) {
        self.core.handling.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_handling(&self) -> bool {
        self.core.handling.load(Ordering::Relaxed)
    }

    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) {
        *lock(&self.core.transport) = transport;
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        lock(&self.core.transport).clone()
    }

    /// Tears the connection down: scoped state is dropped and every
    /// outbound call still pending on this connection is rejected.
    pub(crate) fn finalize(&self) {
        lock(&self.core.values).clear();

        let orphaned = self.core.service.pending.drain_connection(self.core.id);
        if !orphaned.is_empty() {
            tracing::debug!(
                connection = %self.core.id,
                count = orphaned.len(),
                "rejecting pending calls for closed connection"
            );
        }
        for record in orphaned {
            record.reject(CallError::ConnectionClosed);
        }
    }
}

impl ConnCore {
    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        lock(&self.transport).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn downcast<T: Send + Sync + 'static>(value: Arc<dyn Any + Send + Sync>) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| Error::NotRegistered {
        type_name: std::any::type_name::<T>(),
    })
}
