pub mod command;
pub mod parse;
pub mod response;
pub mod session;

pub use command::Command;
pub use response::Response;
pub use session::{CommandOutcome, Session, State};
