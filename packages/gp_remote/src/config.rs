use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vpn_supervisor::ClientCommand;

// =============================================================================
// Config (figment-deserialized from defaults / config file / env vars)
// =============================================================================
//
//   config.toml:     server_listen = "127.0.0.1:8080"
//                    [client]
//                    program = "/usr/sbin/openconnect"
//
//   env var:         GP_SAML_CLIENT_REMOTE_SERVER_LISTEN=:8080
//                    GP_SAML_CLIENT_REMOTE_CLIENT__PROGRAM=/usr/sbin/openconnect
//                    (double underscore = nesting)

pub const ENV_PREFIX: &str = "GP_SAML_CLIENT_REMOTE_";

/// Listen address used when nothing else is configured
pub const DEFAULT_LISTEN: &str = ":8080";

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_server_listen")]
    pub server_listen: String,
    #[serde(default)]
    pub client: ClientFileConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            server_listen: default_server_listen(),
            client: ClientFileConfig::default(),
        }
    }
}

impl FileConfig {
    /// Listen address to bind; an empty value counts as unset
    pub fn listen(&self) -> &str {
        let listen = self.server_listen.trim();
        if listen.is_empty() {
            DEFAULT_LISTEN
        } else {
            listen
        }
    }
}

/// VPN client invocation (lives under `[client]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the protocol flags, e.g. `program = "sudo"`
    /// with `leading_args = ["openconnect"]`
    #[serde(default)]
    pub leading_args: Vec<String>,
    /// Seconds to wait after SIGTERM before killing the client (0 = wait forever)
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            leading_args: Vec::new(),
            terminate_grace_secs: default_terminate_grace_secs(),
        }
    }
}

impl ClientFileConfig {
    pub fn to_command(&self) -> ClientCommand {
        ClientCommand {
            program: PathBuf::from(&self.program),
            leading_args: self.leading_args.clone(),
            terminate_grace: if self.terminate_grace_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.terminate_grace_secs))
            },
        }
    }
}

fn default_server_listen() -> String {
    DEFAULT_LISTEN.to_string()
}
fn default_program() -> String {
    "openconnect".to_string()
}
fn default_terminate_grace_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults -> config file -> GP_SAML_CLIENT_REMOTE_* env vars.
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces
pub fn parse_listen_addr(listen: &str) -> Result<SocketAddr> {
    let listen = listen.trim();
    if listen.is_empty() {
        bail!("Listen address must not be empty");
    }
    if let Some(port) = listen.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("Invalid port in listen address {:?}", listen))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    listen
        .parse()
        .with_context(|| format!("Invalid listen address {:?}", listen))
}
