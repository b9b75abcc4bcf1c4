//! # Value Model
//!
//! The value graphs this protocol moves between realms: JSON-safe data plus
//! one extra leaf kind, live functions. A graph containing `Function` leaves
//! is a *live* graph; the JSON bridge refuses to serialize it, so live
//! references can never cross a port by accident.
//!
//! ## Invariants
//! - `to_json` fails on any `Function` leaf; `from_json` is total.
//! - Function identity is allocation identity (`FuncKey`), which is what the
//!   ticket caches key on.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;

use serde::Deserialize;
use serde::Serialize;

/// Errors in the value layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The graph contains a value the protocol cannot carry.
    BadValue(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadValue(detail) => write!(f, "Bad value: {}", detail),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The serializable error object carried in reject tickets and re-thrown at
/// the original call site. `name` classifies the failure; `message` is the
/// human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncError {
    pub name: String,
    pub message: String,
}

impl FuncError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into() }
    }

    /// An error thrown by the remote function itself.
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// The tunnel to the defining side is gone.
    pub fn disconnection(reason: Option<String>) -> Self {
        let detail = reason.unwrap_or_else(|| "tunnel destroyed".to_string());
        Self::new("DisconnectionError", detail)
    }

    /// The defining side released this function after a cleanup ticket.
    pub fn retired(fn_id: &str) -> Self {
        Self::new("TicketRetiredError", format!("function ticket '{}' has been retired", fn_id))
    }

    /// A value in the call could not be marshaled.
    pub fn bad_value(detail: impl Into<String>) -> Self {
        Self::new("BadValueError", detail)
    }

    /// A timed wait expired.
    pub fn timeout(label: &str) -> Self {
        Self::new("TimeoutError", format!("'{}' timed out", label))
    }

    pub fn is_disconnection(&self) -> bool {
        self.name == "DisconnectionError"
    }
}

impl fmt::Display for FuncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for FuncError {}

impl From<Error> for FuncError {
    fn from(e: Error) -> Self {
        Self::bad_value(e.to_string())
    }
}

/// The future returned by invoking a [`FuncRef`].
pub type CallFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, FuncError>> + Send>>;

struct FuncInner {
    name: Option<String>,
    call: Box<dyn Fn(Vec<Value>) -> CallFuture + Send + Sync>,
}

/// A cloneable handle to an async callable. This is the only live-reference
/// leaf a [`Value`] graph may contain: local functions exposed to the peer,
/// and remote-call stubs produced by materialization, are both `FuncRef`s.
#[derive(Clone)]
pub struct FuncRef {
    inner: Arc<FuncInner>,
}

/// Identity key for a [`FuncRef`]: two handles compare equal iff they clone
/// the same underlying allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncKey(usize);

/// A non-owning handle to a [`FuncRef`], for caches that must not keep the
/// function alive.
#[derive(Clone)]
pub struct WeakFuncRef {
    inner: Weak<FuncInner>,
}

impl FuncRef {
    /// Creates an anonymous function handle.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, FuncError>> + Send + 'static,
    {
        Self::build(None, f)
    }

    /// Creates a named function handle. The name seeds the `fnId` assigned
    /// when the function is first ticketed.
    pub fn named<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, FuncError>> + Send + 'static,
    {
        Self::build(Some(name.into()), f)
    }

    fn build<F, Fut>(name: Option<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, FuncError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(FuncInner {
                name,
                call: Box::new(move |args| Box::pin(f(args))),
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Invokes the function.
    pub fn call(&self, args: Vec<Value>) -> CallFuture {
        (self.inner.call)(args)
    }

    pub fn key(&self) -> FuncKey {
        FuncKey(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    pub fn downgrade(&self) -> WeakFuncRef {
        WeakFuncRef { inner: Arc::downgrade(&self.inner) }
    }
}

impl WeakFuncRef {
    pub fn upgrade(&self) -> Option<FuncRef> {
        self.inner.upgrade().map(|inner| FuncRef { inner })
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncRef({})", self.name().unwrap_or("anonymous"))
    }
}

impl PartialEq for FuncRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A JSON-safe value graph, plus `Function` leaves.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(FuncRef),
}

impl Value {
    /// Builds an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&FuncRef> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Converts to wire JSON. Fails on `Function` leaves and non-finite
    /// numbers; live graphs must be marshaled (functions replaced by tickets)
    /// before they can be sent.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Self::Null => Ok(serde_json::Value::Null),
            Self::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::BadValue(format!("non-finite number {}", n))),
            Self::String(s) => Ok(serde_json::Value::String(s.clone())),
            Self::Array(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Self::Function(f) => {
                Err(Error::BadValue(format!("{:?} is a live reference and cannot cross the wire", f)))
            }
        }
    }

    /// Converts from wire JSON. Total: every JSON document maps to a graph.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<FuncRef> for Value {
    fn from(f: FuncRef) -> Self {
        Self::Function(f)
    }
}
