use std::net::{SocketAddr, ToSocketAddrs};

use rotcp_core::{ReactorConfig, Role};
use thiserror::Error;

use crate::cli::Cli;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("could not resolve address {addr}: {source}")]
    Resolve { addr: String, #[source] source: std::io::Error },

    #[error("address {addr} resolved to no usable socket address")]
    NoAddress { addr: String },
}

/// Fully resolved, typed configuration built once at startup and handed to
/// the reactor by reference. Address resolution (including DNS) happens
/// here, never on the hot path: a lookup failure is always a startup
/// error, never a runtime one.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub backlog: i32,
    pub connections: usize,
    pub debug: u8,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, StartupError> {
        Ok(Self {
            role: cli.role(),
            local_addr: resolve_one(&cli.laddr)?,
            remote_addr: resolve_one(&cli.raddr)?,
            backlog: cli.listen,
            connections: cli.connections,
            debug: cli.debug_level(),
        })
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            role: self.role,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            backlog: self.backlog,
            connections: self.connections,
        }
    }
}

fn resolve_one(addr: &str) -> Result<SocketAddr, StartupError> {
    addr.to_socket_addrs()
        .map_err(|source| StartupError::Resolve { addr: addr.to_owned(), source })?
        .next()
        .ok_or_else(|| StartupError::NoAddress { addr: addr.to_owned() })
}
