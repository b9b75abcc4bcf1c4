pub mod envelope;
pub mod value;
pub mod walk;

pub use value::CallFuture;
pub use value::Error;
pub use value::FuncError;
pub use value::FuncKey;
pub use value::FuncRef;
pub use value::Result;
pub use value::Value;
pub use value::WeakFuncRef;

pub use walk::walk;

pub use envelope::ROOT_KEY;
pub use envelope::unwrap;
pub use envelope::unwrap_value;
pub use envelope::wrap;
pub use envelope::wrap_value;

#[cfg(test)]
mod tests;
