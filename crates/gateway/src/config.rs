use serde::Deserialize;

pub const ENV_PREFIX: &str = "QUAY_GW";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub tunnel: TunnelConfig,
    pub hijack: HijackConfig,
    pub limits: LimitsConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Max time a request waits for an edge tunnel address to become
    /// available. This is the one place a request may stall; the caller's
    /// own deadline still applies.
    #[serde(default = "default_tunnel_resolve_wait_secs")]
    pub resolve_wait_secs: u64,
    /// Poll interval while waiting for a tunnel to (re)connect.
    #[serde(default = "default_tunnel_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HijackConfig {
    /// TCP keep-alive period on the backend-side socket. Attach sessions can
    /// sit idle for long stretches; without keep-alive, intermediate network
    /// equipment silently drops the connection.
    #[serde(default = "default_hijack_keepalive_secs")]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Shared secret for signing requests to non-edge agents. Required only
    /// when an agent-backed endpoint is actually proxied.
    #[serde(default)]
    pub shared_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Max body size buffered for decoration or create pre-checks.
    pub proxy_body_bytes: usize,
}

fn default_tunnel_resolve_wait_secs() -> u64 {
    30
}

fn default_tunnel_poll_interval_ms() -> u64 {
    200
}

fn default_hijack_keepalive_secs() -> u64 {
    30
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("tunnel.poll_interval_ms must be > 0");
        }
        Ok(())
    }
}

impl HijackConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_secs == 0 {
            anyhow::bail!("hijack.keepalive_secs must be > 0");
        }
        Ok(())
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxy_body_bytes == 0 {
            anyhow::bail!("limits.proxy_body_bytes must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 9000)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9100)?
        .set_default(
            "tunnel.resolve_wait_secs",
            default_tunnel_resolve_wait_secs(),
        )?
        .set_default("tunnel.poll_interval_ms", default_tunnel_poll_interval_ms())?
        .set_default("hijack.keepalive_secs", default_hijack_keepalive_secs())?
        .set_default("limits.proxy_body_bytes", (2 * 1024 * 1024) as i64)?
        .set_default("agent.shared_secret", "")?;

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.tunnel.validate()?;
    cfg.hijack.validate()?;
    cfg.limits.validate()?;
    Ok(cfg)
}
