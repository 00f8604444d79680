use clap::{ArgAction, Args, Parser};

/// A pair-mode TCP multiplexer: stripes one logical stream across N
/// parallel connections between a proxy and a relay.
#[derive(Debug, Parser)]
#[command(name = "rotcp", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub mode: Mode,

    /// Local bind address, `host:port`.
    pub laddr: String,

    /// Peer address to dial, `host:port`.
    pub raddr: String,

    /// Listen backlog.
    #[arg(long, default_value_t = rotcp_core::ReactorConfig::DEFAULT_BACKLOG)]
    pub listen: i32,

    /// Number of striped connections (proxy mode only).
    #[arg(long, default_value_t = rotcp_core::ReactorConfig::DEFAULT_CONNECTIONS)]
    pub connections: usize,

    /// Increase log verbosity (repeatable, up to 3).
    #[arg(short, long = "debug", action = ArgAction::Count)]
    pub debug: u8,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct Mode {
    /// Run as proxy: accept a local client, stripe to the relay.
    #[arg(long)]
    pub proxy: bool,

    /// Run as relay: accept striped connections, forward to the upstream.
    #[arg(long)]
    pub relay: bool,
}

impl Cli {
    pub fn debug_level(&self) -> u8 {
        self.debug.min(3)
    }

    pub fn role(&self) -> rotcp_core::Role {
        if self.mode.proxy { rotcp_core::Role::Proxy } else { rotcp_core::Role::Relay }
    }
}
