//! # API description
//!
//! The root description of a peer's RPC surface: the local methods that
//! become inbound-callable, the optional remote-proxies record whose
//! function slots become outbound stubs, and the optional connection
//! value slot a caller may assign per session.
//!
//! Registration is typed; each method is erased at registration time into
//! a shim that decodes the argument fragments, invokes the user function,
//! and encodes the returns. Shape validation runs once, when a
//! [`crate::handler::Handler`] or [`crate::service::Service`] is built
//! from the description.

use std::any::TypeId;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::value::RawValue;

use autorpc_wire::Error as WireError;
use autorpc_wire::WireValues;

use crate::conn::Connection;
use crate::error::MethodError;
use crate::error::RpcError;
use crate::remote::RemoteProxies;

/// Why an inbound dispatch did not produce return fragments.
pub(crate) enum Failure {
    /// The method ran and reported a user-level error.
    Method(MethodError),
    /// The arguments did not match the method, or the method panicked or
    /// produced unencodable returns.
    Rpc(RpcError),
}

pub(crate) type MethodFuture =
    BoxFuture<'static, std::result::Result<Vec<Box<RawValue>>, Failure>>;

/// A type-erased inbound handler: argument fragments in, return
/// fragments out.
pub(crate) type MethodFn =
    Arc<dyn Fn(Connection, Vec<Box<RawValue>>) -> MethodFuture + Send + Sync>;

pub(crate) struct ValueSlot {
    pub(crate) key: TypeId,
    pub(crate) type_name: &'static str,
}

/// Errors found while validating an API description.
#[derive(Debug)]
pub enum Error {
    /// The same method name was registered more than once.
    DuplicateMethod { name: String },
    /// More than one connection value slot was declared.
    DuplicateValueSlot {
        prior: &'static str,
        current: &'static str,
    },
    /// More than one remote-proxies record was declared.
    DuplicateRemote,
    /// The remote record declares the same function name twice.
    DuplicateRemoteFunction { name: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMethod { name } => {
                write!(f, "autorpc: method {} registered more than once", name)
            }
            Self::DuplicateValueSlot { prior, current } => {
                write!(f, "autorpc: multiple connection values declared, only one allowed (found: {} and {})", prior, current)
            }
            Self::DuplicateRemote => {
                f.write_str("autorpc: multiple remote proxy records declared, only one allowed")
            }
            Self::DuplicateRemoteFunction { name } => {
                write!(f, "autorpc: remote function {} declared more than once", name)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The API surface of one peer, under construction.
///
/// ```ignore
/// let mut proxies = RemoteProxies::new();
/// let world = proxies.function::<(u32,), (String,)>("World");
///
/// let api = Api::new()
///     .method("Hello", |_conn, (n,): (i64,)| async move {
///         Ok::<_, MethodError>((n + 1,))
///     })
///     .remote_proxies(proxies);
/// ```
#[derive(Default)]
pub struct Api {
    pub(crate) methods: Vec<(String, MethodFn)>,
    pub(crate) value_slot: Option<ValueSlot>,
    pub(crate) value_dup: Option<(&'static str, &'static str)>,
    pub(crate) remote: Option<RemoteProxies>,
    pub(crate) remote_dup: bool,
}

impl Api {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local method, inbound-callable under `name`.
    ///
    /// Arguments and returns are tuples of serde-encodable values; a
    /// `Result::Err` is reported to the caller as a user-level error,
    /// discarding the data returns.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        A: WireValues,
        R: WireValues,
        F: Fn(Connection, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, MethodError>> + Send + 'static,
    {
        let shim: MethodFn = Arc::new(move |conn, fragments| {
            let fut: MethodFuture = match A::from_fragments(&fragments) {
                Ok(args) => {
                    let call = func(conn, args);
                    Box::pin(async move {
                        match call.await {
                            Ok(returns) => returns
                                .to_fragments()
                                .map_err(|err| Failure::Rpc(RpcError::wrap("internal error", err))),
                            Err(err) => Err(Failure::Method(err)),
                        }
                    })
                }
                Err(WireError::CountMismatch { .. }) => {
                    let err = RpcError::wrap("internal error", "method input length does not match");
                    Box::pin(async move { Err(Failure::Rpc(err)) })
                }
                Err(err) => {
                    let err = RpcError::wrap("internal error", err);
                    Box::pin(async move { Err(Failure::Rpc(err)) })
                }
            };
            fut
        });

        self.methods.push((name.into(), shim));
        self
    }

    /// Declares the connection value slot: the one type a caller may
    /// assign per connection through `assign_value`/`assign`.
    pub fn connection_value<T: Send + Sync + 'static>(mut self) -> Self {
        let slot = ValueSlot {
            key: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        };
        match &self.value_slot {
            Some(prior) => {
                self.value_dup
                    .get_or_insert((prior.type_name, slot.type_name));
            }
            None => self.value_slot = Some(slot),
        }
        self
    }

    /// Attaches the remote-proxies record whose function slots become
    /// outbound stubs, bound per connection.
    pub fn remote_proxies(mut self, proxies: RemoteProxies) -> Self {
        if self.remote.is_some() {
            self.remote_dup = true;
        } else {
            self.remote = Some(proxies);
        }
        self
    }
}
