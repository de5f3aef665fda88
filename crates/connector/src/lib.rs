//! # Share Connector
//!
//! A local connector that exposes file-share operations over a Unix socket.
//!
//! ## Overview
//!
//! One process runs as the **server**: it serves listing, download, upload,
//! folder creation, deletion and reachability checks from a file backend.
//! Another runs as the **client**: it performs one exchange and reports the
//! outcome.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Server / Client connector                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌──────────────────┐   ┌────────────────┐  │
//! │  │  Reactor   │──►│  SessionManager  │──►│ Processing     │  │
//! │  │ (tokio)    │   │  request/response│   │ worker thread  │  │
//! │  └────────────┘   │  queues          │   └───────┬────────┘  │
//! │                   └──────────────────┘           │           │
//! │                                        ┌─────────▼────────┐  │
//! │                                        │ Processor +      │  │
//! │                                        │ AsyncWorker      │  │
//! │                                        └─────────┬────────┘  │
//! │                                        ┌─────────▼────────┐  │
//! │                                        │   FileBackend    │  │
//! │                                        └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`transport`]: Non-blocking byte-stream transport
//! - [`session`]: Packet reassembly, queues and the processing worker
//! - [`processor`]: Per-family request processors
//! - [`backend`]: File backend abstraction and the local implementation
//! - [`reactor`]: Readiness loop shared by both roles
//! - [`server`]: Server role
//! - [`client`]: Client role

pub mod backend;
pub mod client;
pub mod config;
pub mod processor;
pub mod reactor;
pub mod server;
pub mod session;
pub(crate) mod sync;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use processor::{ExchangeOutcome, Processor, ProcessorContext, Role, TransferSettings};
pub use server::Server;
pub use session::{IdleTimer, SessionError, SessionManager, SessionSettings};
