//! # Service façade
//!
//! Composes the pieces onto accepted transports: the frozen inbound
//! handler table, the connection-scoped factory table, and the
//! service-wide pending-call registry. The builder collects registrations
//! and validates the whole description once in `build`; after that the
//! tables are read-only and any number of connections may be handled in
//! parallel.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::api;
use crate::api::Api;
use crate::api::MethodFn;
use crate::api::ValueSlot;
use crate::conn::Connection;
use crate::conn::ScopedEntry;
use crate::conn::ValueFactory;
use crate::dispatch;
use crate::dispatch::Step;
use crate::error::SessionError;
use crate::pending::PendingCalls;
use crate::remote::Remote;
use crate::remote::RemoteProxies;
use crate::transport::Transport;

/// The frozen state shared by every connection of a service (and by the
/// single connection of a [`crate::handler::Handler`]).
pub(crate) struct ServiceCore {
    pub(crate) methods: HashMap<String, MethodFn>,
    pub(crate) scoped: HashMap<TypeId, ScopedEntry>,
    pub(crate) value_slot: Option<ValueSlot>,
    pub(crate) pending: PendingCalls,
    pub(crate) next_conn: AtomicU64,
}

impl ServiceCore {
    /// Validates an API description plus builder registrations into the
    /// frozen tables. Runs once; every configuration error surfaces here.
    pub(crate) fn build(
        api: Api,
        scoped: Vec<ScopedReg>,
        remote: Option<RemoteProxies>,
        remote_dup: bool,
    ) -> api::Result<Self> {
        let mut methods = HashMap::new();
        for (name, shim) in api.methods {
            if methods.insert(name.clone(), shim).is_some() {
                return Err(api::Error::DuplicateMethod { name });
            }
        }

        if let Some((prior, current)) = api.value_dup {
            return Err(api::Error::DuplicateValueSlot { prior, current });
        }

        let mut scoped_map = HashMap::new();
        if let Some(slot) = &api.value_slot {
            scoped_map.insert(
                slot.key,
                ScopedEntry {
                    type_name: slot.type_name,
                    factory: None,
                },
            );
        }

        // Re-registering a type replaces its factory; only the tagged
        // slots are single-occupancy.
        for reg in scoped {
            scoped_map.insert(
                reg.key,
                ScopedEntry {
                    type_name: reg.type_name,
                    factory: Some(reg.factory),
                },
            );
        }

        if api.remote_dup || remote_dup || (api.remote.is_some() && remote.is_some()) {
            return Err(api::Error::DuplicateRemote);
        }
        if let Some(record) = api.remote.or(remote) {
            let mut names = HashSet::new();
            for name in record.functions {
                if !names.insert(name.clone()) {
                    return Err(api::Error::DuplicateRemoteFunction { name });
                }
            }

            let names = Arc::new(names);
            scoped_map.insert(
                TypeId::of::<Remote>(),
                ScopedEntry {
                    type_name: std::any::type_name::<Remote>(),
                    factory: Some(Box::new(move |conn: &Connection| {
                        Arc::new(Remote::bind(conn, names.clone())) as Arc<dyn Any + Send + Sync>
                    })),
                },
            );
        }

        Ok(Self {
            methods,
            scoped: scoped_map,
            value_slot: api.value_slot,
            pending: PendingCalls::new(),
            next_conn: AtomicU64::new(1),
        })
    }
}

pub(crate) struct ScopedReg {
    key: TypeId,
    type_name: &'static str,
    factory: ValueFactory,
}

/// Collects connection-scoped type registrations and the remote record
/// before freezing them into a [`Service`].
pub struct ServiceBuilder {
    api: Api,
    scoped: Vec<ScopedReg>,
    remote: Option<RemoteProxies>,
    remote_dup: bool,
}

impl ServiceBuilder {
    pub fn new(api: Api) -> Self {
        Self {
            api,
            scoped: Vec::new(),
            remote: None,
            remote_dup: false,
        }
    }

    /// Registers `T` as connection-scoped, created from its `Default` on
    /// first access.
    pub fn scoped<T: Default + Send + Sync + 'static>(mut self) -> Self {
        self.scoped.push(ScopedReg {
            key: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            factory: Box::new(|_| Arc::new(T::default()) as Arc<dyn Any + Send + Sync>),
        });
        self
    }

    /// Registers `T` as connection-scoped with a custom factory, invoked
    /// once per connection on first access.
    pub fn scoped_with<T, F>(mut self, create: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Connection) -> T + Send + Sync + 'static,
    {
        self.scoped.push(ScopedReg {
            key: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            factory: Box::new(move |conn| Arc::new(create(conn)) as Arc<dyn Any + Send + Sync>),
        });
        self
    }

    /// Enables outbound calls through the given remote-proxies record.
    pub fn use_remote_proxies(mut self, proxies: RemoteProxies) -> Self {
        if self.remote.is_some() {
            self.remote_dup = true;
        } else {
            self.remote = Some(proxies);
        }
        self
    }

    pub fn build(self) -> api::Result<Service> {
        let core = ServiceCore::build(self.api, self.scoped, self.remote, self.remote_dup)?;
        Ok(Service {
            core: Arc::new(core),
        })
    }
}

/// A built service, ready to bind accepted transports to its dispatch
/// loop. Cloning shares the same tables and pending-call registry.
#[derive(Clone)]
pub struct Service {
    pub(crate) core: Arc<ServiceCore>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    pub fn builder(api: Api) -> ServiceBuilder {
        ServiceBuilder::new(api)
    }

    /// Runs the dispatch loop for one accepted transport until EOF, a
    /// stop request, or a fatal error.
    ///
    /// `init` is called exactly once, before the first envelope is
    /// serviced; it receives the [`Connection`] through which the caller
    /// can pull connection-scoped values, notably the bound remote
    /// proxies. On exit the connection's state is dropped and its still
    /// pending outbound calls are rejected.
    pub async fn handle_connection<F>(
        &self,
        transport: Box<dyn Transport>,
        init: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&Connection),
    {
        let conn = Connection::bind(self.core.clone(), Arc::from(transport));
        init(&conn);

        let result = loop {
            if !conn.is_handling() {
                break Ok(());
            }

            match dispatch::handle_one(&conn).await {
                Ok(Step::Handled) => {}
                Ok(Step::Eof) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        conn.finalize();
        result
    }
}
