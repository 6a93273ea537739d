use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// Redis configuration
///
/// The connection URL is resolved through one level of indirection:
/// `REDIS_PROVIDER` names the environment variable that actually holds the
/// URL (default `REDIS_URL`). Deployments on hosted platforms can point at
/// the add-on's variable (e.g. `REDIS_PROVIDER=REDISTOGO_URL`) without a
/// code change.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let provider = env_or_default("REDIS_PROVIDER", "REDIS_URL");
        Ok(Self {
            url: env_required(&provider)?,
        })
    }
}
