//! Machines configuration: the JSON array describing the worker fleet.
//!
//! An entry whose `hostname` is `default` supplies fallback values copied
//! into every other entry for keys it leaves unset, and is itself excluded
//! from the fleet. Any other entry missing `hostname` is a fatal
//! configuration error.

use std::fs;

use camino::Utf8Path;
use color_eyre::eyre::{Context, eyre};
use serde::Deserialize;

use crate::error::ConfigResult;

const DEFAULT_WD: &str = ".";
const DEFAULT_CONNECT_CMD: &str = "ssh";
const DEFAULT_POLL_INTERVAL: u64 = 10;
const DEFAULT_POLL_TIMEOUT: u64 = 5;
const DEFAULT_TRANSFER_TIMEOUT: u64 = 20;

/// One raw element of the machines array; every key optional until merged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MachineEntry {
    hostname: Option<String>,
    username: Option<String>,
    wd: Option<String>,
    connect_cmd: Option<String>,
    poll_interval: Option<u64>,
    poll_timeout: Option<u64>,
    upload_timeout: Option<u64>,
    download_timeout: Option<u64>,
    init_timeout: Option<u64>,
}

/// A fully resolved machines entry.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Hostname the transport connects to.
    pub hostname: String,
    /// Login name; the address is `user@host` when set, bare `host` otherwise.
    pub username: Option<String>,
    /// Remote working directory the run's files live in.
    pub wd: String,
    /// Opaque transport prefix, split into argv at load time.
    pub connect_cmd: String,
    /// Initial seconds between liveness polls.
    pub poll_interval: u64,
    /// Initial timeout for CHECK transactions, in seconds.
    pub poll_timeout: u64,
    /// Initial timeout for START transactions, in seconds.
    pub upload_timeout: u64,
    /// Initial timeout for FETCH transactions, in seconds.
    pub download_timeout: u64,
    /// Timeout for initialization transactions, in seconds.
    pub init_timeout: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: None,
            wd: DEFAULT_WD.into(),
            connect_cmd: DEFAULT_CONNECT_CMD.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            upload_timeout: DEFAULT_TRANSFER_TIMEOUT,
            download_timeout: DEFAULT_TRANSFER_TIMEOUT,
            init_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

impl MachineConfig {
    /// Splits the transport prefix into argv.
    pub fn connect_argv(&self) -> ConfigResult<Vec<String>> {
        let argv = shlex::split(&self.connect_cmd)
            .ok_or_else(|| eyre!("connect_cmd {:?} is not splittable", self.connect_cmd))?;
        if argv.is_empty() {
            return Err(eyre!("connect_cmd for {} is empty", self.hostname).into());
        }
        Ok(argv)
    }
}

/// Loads and resolves the machines file at `path`.
pub fn load(path: &Utf8Path) -> ConfigResult<Vec<MachineConfig>> {
    let body = fs::read_to_string(path.as_std_path())
        .with_context(|| format!("read machines file {path}"))?;
    let entries: Vec<MachineEntry> = serde_json::from_str(&body)
        .with_context(|| format!("parse machines file {path}"))?;
    resolve(entries)
}

fn resolve(entries: Vec<MachineEntry>) -> ConfigResult<Vec<MachineConfig>> {
    let defaults = entries
        .iter()
        .find(|entry| entry.hostname.as_deref() == Some("default"))
        .cloned()
        .unwrap_or_default();

    let mut resolved = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        if entry.hostname.as_deref() == Some("default") {
            continue;
        }
        let Some(hostname) = entry.hostname else {
            return Err(eyre!("machines entry {index} is missing \"hostname\"").into());
        };
        resolved.push(MachineConfig {
            hostname,
            username: entry.username.or_else(|| defaults.username.clone()),
            wd: entry
                .wd
                .or_else(|| defaults.wd.clone())
                .unwrap_or_else(|| DEFAULT_WD.into()),
            connect_cmd: entry
                .connect_cmd
                .or_else(|| defaults.connect_cmd.clone())
                .unwrap_or_else(|| DEFAULT_CONNECT_CMD.into()),
            poll_interval: entry
                .poll_interval
                .or(defaults.poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            poll_timeout: entry
                .poll_timeout
                .or(defaults.poll_timeout)
                .unwrap_or(DEFAULT_POLL_TIMEOUT),
            upload_timeout: entry
                .upload_timeout
                .or(defaults.upload_timeout)
                .unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
            download_timeout: entry
                .download_timeout
                .or(defaults.download_timeout)
                .unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
            init_timeout: entry
                .init_timeout
                .or(defaults.init_timeout)
                .unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
        });
    }
    Ok(resolved)
}
