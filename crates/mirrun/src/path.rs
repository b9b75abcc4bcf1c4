//! # Remote Path Dispatch
//!
//! Explicit path-based access to the live remote tree: `at` accumulates
//! segments lazily, and only `call` resolves the path against the current
//! root and invokes the function leaf. Resolution at call time is what makes
//! reconnection transparent; a path built before a reload dispatches into the
//! replacement tree afterwards.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use mirpack::FuncError;
use mirpack::FuncRef;
use mirpack::Value;

#[derive(Debug, Clone)]
pub enum Error {
    MissingSegment { path: String, segment: String },
    NotAFunction { path: String },
    /// The invocation itself failed remotely.
    Call(FuncError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSegment { path, segment } => {
                write!(f, "remote api has no member '{}' under '{}'", segment, path)
            }
            Self::NotAFunction { path } => write!(f, "'{}' is not a remote function", path),
            Self::Call(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<FuncError> for Error {
    fn from(e: FuncError) -> Self {
        Self::Call(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A lazily-accumulated path over the live remote tree.
#[derive(Clone)]
pub struct RemotePath {
    root: Arc<Mutex<Value>>,
    segments: Vec<String>,
}

impl RemotePath {
    pub(crate) fn root(root: Arc<Mutex<Value>>) -> Self {
        Self { root, segments: Vec::new() }
    }

    /// Appends one segment. Cheap; nothing is resolved until `get` or `call`.
    pub fn at(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { root: self.root.clone(), segments }
    }

    /// The dotted form of this path, for error messages.
    pub fn path(&self) -> String {
        if self.segments.is_empty() {
            "<root>".to_string()
        } else {
            self.segments.join(".")
        }
    }

    fn prefix(&self, depth: usize) -> String {
        if depth == 0 {
            "<root>".to_string()
        } else {
            self.segments[..depth].join(".")
        }
    }

    fn resolve(&self) -> Result<Value> {
        let root = lock(&self.root);
        let mut node = &*root;
        for (depth, segment) in self.segments.iter().enumerate() {
            node = node.get(segment).ok_or_else(|| Error::MissingSegment {
                path: self.prefix(depth),
                segment: segment.clone(),
            })?;
        }
        Ok(node.clone())
    }

    /// A snapshot of the value this path currently names.
    pub fn get(&self) -> Result<Value> {
        self.resolve()
    }

    /// Resolves the path against the current root and invokes the function
    /// leaf there.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let function: FuncRef = match self.resolve()? {
            Value::Function(f) => f,
            _ => return Err(Error::NotAFunction { path: self.path() }),
        };
        function.call(args).await.map_err(Error::Call)
    }
}

impl fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePath({})", self.path())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
