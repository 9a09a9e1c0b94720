//! SSH agent core for ssh-agentx.
//!
//! A standard in-memory agent ([`KeyRing`]) with two additions: observers
//! that learn about keys as they are added and removed, and a registry of
//! named extension handlers reached through `SSH_AGENTC_EXTENSION`.
//!
//! # Architecture
//!
//! ```text
//!  Transport (unix socket / named pipe)
//!      │ per connection
//!      ▼
//!  serve_connection ── extension ──► ExtensionRegistry (blocking pool)
//!      │
//!      ▼ standard request
//!  AgentService ──► KeyAgent (RwLock<KeyRing>)
//!      │
//!      └─► KeyObserver (add / remove / remove-all)
//! ```

pub mod extension;
pub mod keyring;
pub mod service;
pub mod session;
pub mod transport;

pub use extension::{ExtensionError, ExtensionHandler, ExtensionRegistry};
pub use keyring::{KeyAgent, KeyConstraints, KeyRing, KeyRingError, KeySummary};
pub use service::{AgentService, KeyObserver};
pub use session::{MAX_MESSAGE_LEN, serve_connection};
#[cfg(windows)]
pub use transport::{NamedPipeTransport, OPENSSH_PIPE};
#[cfg(unix)]
pub use transport::UnixSocketTransport;
pub use transport::{Transport, TransportError, serve_all};
