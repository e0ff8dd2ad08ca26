// Election core
pub mod raft;
pub mod transport;

// Application layer
pub mod config;
pub mod job;

// Public exports
pub use config::Config;
pub use job::{RetryPolicy, Retrying};
pub use raft::{HookContext, Message, MessageType, NodeHooks, NodeRole, Raft, RaftConfig, RaftError};
pub use transport::{MemoryMesh, MemoryTransport, Transport, TransportError};
