use std::time::Duration;

use envconfig::Envconfig;
use lazy_static::lazy_static;

lazy_static! {
    pub static ref ENV_VARS: EnvVars = EnvVars::from_env().unwrap();
}

#[derive(Clone, Debug, Envconfig)]
struct Inner {
    /// How long a checkout may wait for a free connection before the
    /// acquisition fails as exhausted
    #[envconfig(from = "TENANT_STORE_CONNECTION_TIMEOUT", default = "5000")]
    connection_timeout_in_msec: u64,
    #[envconfig(from = "TENANT_STORE_CONNECTION_MIN_IDLE")]
    connection_min_idle: Option<u32>,
    #[envconfig(from = "TENANT_STORE_CONNECTION_IDLE_TIMEOUT", default = "600")]
    connection_idle_timeout_in_sec: u64,
    #[envconfig(from = "TENANT_STORE_CONNECTION_MAX_LIFETIME", default = "1800")]
    connection_max_lifetime_in_sec: u64,
    /// Size of the separate pool for no-timeout connections; these are
    /// reserved for schema provisioning and long migrations
    #[envconfig(from = "TENANT_STORE_NO_TIMEOUT_POOL_SIZE", default = "2")]
    no_timeout_pool_size: u32,
    /// Ordinary leases held longer than this are logged with the holder's
    /// identity when they are returned
    #[envconfig(from = "TENANT_STORE_MAX_LEASE_DURATION", default = "120")]
    max_lease_duration_in_sec: u64,
}

/// Tunables that should not need a topology file change. Most of these
/// exist so operators can react to pool sizing problems without a restart
/// of every node.
#[derive(Clone, Debug)]
pub struct EnvVars {
    inner: Inner,
}

impl EnvVars {
    pub fn from_env() -> Result<Self, envconfig::Error> {
        let inner = Inner::init_from_env()?;
        Ok(Self { inner })
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.connection_timeout_in_msec)
    }

    pub fn connection_min_idle(&self) -> Option<u32> {
        self.inner.connection_min_idle
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.inner.connection_idle_timeout_in_sec)
    }

    pub fn connection_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.inner.connection_max_lifetime_in_sec)
    }

    pub fn no_timeout_pool_size(&self) -> u32 {
        self.inner.no_timeout_pool_size
    }

    pub fn max_lease_duration(&self) -> Duration {
        Duration::from_secs(self.inner.max_lease_duration_in_sec)
    }
}
