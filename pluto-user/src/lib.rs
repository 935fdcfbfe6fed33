pub mod config;
pub mod login;
pub mod tls;

pub use config::*;
pub use login::{ArcLoginProvider, AuthError, LoginProvider, UserDescriptor};
