//! Redis-backed tenant balance cache.

use async_trait::async_trait;
use redis::AsyncCommands;

use super::store::{BalanceCache, DEFAULT_BALANCE_TTL_SECS, StoreError, TenantId};

// Adjusts a cached balance only when one is present, so a miss is never turned into a bogus value.
const INCREMENT_IF_EXISTS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
"#;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(format!("redis error: {err}"))
    }
}

#[derive(Clone, Debug)]
pub struct RedisBalanceCache {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
}

impl RedisBalanceCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "relaygate".to_string(),
            ttl_secs: DEFAULT_BALANCE_TTL_SECS,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs.max(1);
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key_balance(&self, tenant: TenantId) -> String {
        format!("{}:tenant_balance:{tenant}", self.prefix)
    }
}

#[async_trait]
impl BalanceCache for RedisBalanceCache {
    async fn get(&self, tenant: TenantId) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(self.key_balance(tenant)).await?;
        Ok(value)
    }

    async fn set(&self, tenant: TenantId, balance: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key_balance(tenant))
            .arg(balance)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(&self, tenant: TenantId, delta: i64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(INCREMENT_IF_EXISTS_SCRIPT);
        let value: Option<i64> = script
            .key(self.key_balance(tenant))
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn invalidate(&self, tenant: TenantId) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.key_balance(tenant)).await?;
        Ok(())
    }
}
