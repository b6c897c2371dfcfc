//! Server components: client sessions, their registry and TLS setup.

pub mod session;
pub mod state;
pub mod tls;

pub use session::{Session, SessionEnv, SessionError};
pub use state::{session_cleanup_task, SessionManager};
pub use tls::{build_tls_server_config, load_certs, load_key, load_server_certificate};
