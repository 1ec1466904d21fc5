pub mod config;
pub mod error;
pub mod session;
pub mod types;

pub use config::DocchatConfig;
pub use error::{DocchatError, Result};
pub use session::{
    AuthError, AuthEvent, AuthProvider, Session, SessionGate, SessionState, SignUpOutcome, User,
};
pub use types::*;
