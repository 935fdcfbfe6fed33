use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The replica name of the storage node. Workers have configured names;
/// storage is the single hub every subnet shares.
pub const STORAGE_NAME: &str = "storage";

/// One TOML file describes the whole deployment; each process picks its
/// role (and for workers, its name) on the command line.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub distributor: DistributorConfig,
    pub storage: StorageConfig,
    pub workers: HashMap<String, WorkerConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    /// Certificate presented on every listener and as client certificate on
    /// internal links.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Root used to verify peers on the mutually-authenticated internal
    /// surfaces.
    pub ca_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    /// Flat-file user database (TOML), see `UserList`.
    pub user_list: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DistributorConfig {
    /// Public IMAP listener.
    pub mail_bind: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub rpc_bind: SocketAddr,
    pub rpc_public: String,
    pub sync_bind: SocketAddr,
    pub sync_public: String,
    pub maildir_root: PathBuf,
    pub crdt_root: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    pub rpc_bind: SocketAddr,
    pub rpc_public: String,
    pub sync_bind: SocketAddr,
    pub sync_public: String,
    pub maildir_root: PathBuf,
    pub crdt_root: PathBuf,
    /// Contiguous range of user ids this worker is authoritative for.
    pub user_id_min: u32,
    pub user_id_max: u32,
}

impl Config {
    /// The worker owning a given user id, if any range covers it.
    pub fn worker_for_user(&self, user_id: u32) -> Option<(&str, &WorkerConfig)> {
        self.workers
            .iter()
            .find(|(_, w)| w.user_id_min <= user_id && user_id <= w.user_id_max)
            .map(|(name, w)| (name.as_str(), w))
    }
}

/// The flat user database: login name to entry.
pub type UserList = HashMap<String, UserEntry>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    /// Argon2 hash, as produced by `login::hash_password`.
    pub password: String,
    /// Routing key into the worker ranges.
    pub user_id: u32,
}

pub fn read_config<T>(config_file: PathBuf) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}
