pub mod distributor;
pub mod imap;
pub mod rpc;

pub use distributor::Distributor;
