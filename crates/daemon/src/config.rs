// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;

use clap::Parser;

/// Daemon configuration, from CLI flags with `LIUBOER_*` env fallbacks.
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// WebSocket listen address.
    #[arg(long, default_value = "127.0.0.1:9300", env = "LIUBOER_BIND")]
    pub bind: String,

    /// Daemon name; the unix socket lands at
    /// `${TMPDIR:-/tmp}/liuboer-<name>.sock`.
    #[arg(long = "socket-name", default_value = "hub", env = "LIUBOER_SOCKET_NAME")]
    pub socket_name: String,

    /// Disable the unix socket listener.
    #[arg(long)]
    pub no_unix_socket: bool,

    /// Log filter (overridden by RUST_LOG when left at "info").
    #[arg(long, default_value = "info", env = "LIUBOER_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" or "json".
    #[arg(long, default_value = "text", env = "LIUBOER_LOG_FORMAT")]
    pub log_format: String,

    /// Per-event fan-out accounting in the router.
    #[arg(long)]
    pub debug: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if !matches!(self.log_format.as_str(), "text" | "json") {
            anyhow::bail!("--log-format must be \"text\" or \"json\", got {:?}", self.log_format);
        }
        if self.socket_name.is_empty() || self.socket_name.contains('/') {
            anyhow::bail!("--socket-name must be a bare name, got {:?}", self.socket_name);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid --bind address {:?}: {err}", self.bind))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
