//! Runtime configuration (§10.3): environment variables at startup, with a
//! `clap` CLI mirroring the same fields for local runs.

use clap::Parser;

/// Process configuration, loaded from the environment (matching the
/// teacher's `EnsembleConfig::default()` env-var pattern) and overridable
/// from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_base_url: String,
    pub gateway_api_key: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub default_max_iterations: u32,
    pub staging_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_base_url: std::env::var("MADE_GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            gateway_api_key: std::env::var("MADE_GATEWAY_API_KEY").ok(),
            bind_addr: std::env::var("MADE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            bind_port: std::env::var("MADE_BIND_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            default_max_iterations: std::env::var("MADE_DEFAULT_MAX_ITERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            staging_ttl_secs: std::env::var("MADE_STAGING_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        }
    }
}

/// Command-line overrides for [`Config`], mirroring the teacher's `Args`.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-agent deliberation engine server", long_about = None)]
pub struct Args {
    /// Base URL of the upstream chat-completions gateway (overrides MADE_GATEWAY_BASE_URL)
    #[arg(long)]
    pub gateway_base_url: Option<String>,

    /// API key for the upstream gateway (overrides MADE_GATEWAY_API_KEY)
    #[arg(long)]
    pub gateway_api_key: Option<String>,

    /// Address to bind the HTTP server to (overrides MADE_BIND_ADDR)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to bind the HTTP server to (overrides MADE_BIND_PORT)
    #[arg(long)]
    pub bind_port: Option<u16>,

    /// Default max_iterations for DxO when the caller omits it
    #[arg(long)]
    pub default_max_iterations: Option<u32>,

    /// Upload staging-token TTL in seconds
    #[arg(long)]
    pub staging_ttl_secs: Option<u64>,
}

impl Args {
    /// Layer CLI flags over environment-derived defaults.
    pub fn resolve(self) -> Config {
        let mut config = Config::default();
        if let Some(v) = self.gateway_base_url {
            config.gateway_base_url = v;
        }
        if self.gateway_api_key.is_some() {
            config.gateway_api_key = self.gateway_api_key;
        }
        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.bind_port {
            config.bind_port = v;
        }
        if let Some(v) = self.default_max_iterations {
            config.default_max_iterations = v;
        }
        if let Some(v) = self.staging_ttl_secs {
            config.staging_ttl_secs = v;
        }
        config
    }
}
