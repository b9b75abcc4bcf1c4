pub mod channel;
pub mod cleanup;
pub mod emitter;
pub mod receiver;
pub mod sender;
pub mod simulate;
pub mod subject;
pub mod task;
pub mod ticket;

pub use channel::EventFrame;
pub use channel::Port;

pub use emitter::CONNECTED_EVENT;
pub use emitter::DISCONNECTED_EVENT;
pub use emitter::DataEmitter;
pub use emitter::Subscription;

pub use subject::Mapper;
pub use subject::RemoteSubject;

pub use sender::RejectionPool;
pub use sender::make_call_sender;

pub use receiver::receive_calls;
pub use receiver::receive_retired;

pub use simulate::ObjectSimulator;

pub use cleanup::CleanupGuard;
