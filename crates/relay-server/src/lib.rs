pub mod auth;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::JwtIdentityDecoder;
pub use config::{ConfigError, RelayConfig};
pub use registry::{Connection, ConnectionRegistry};
pub use server::{build_router, build_state, start, AppState, RelayServices, ServerConfig, ServerHandle};
pub use session::{Heartbeat, Session, SessionContext, SessionState};
