use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Organization whose admins may fully edit leads.
    pub privileged_org_name: String,
    pub request_timeout_secs: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub event_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_source(|key| std::env::var(key).ok())?;

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Privileged organization: {}", config.privileged_org_name);
        tracing::debug!(
            "Rate limit: {}/s (burst {}), request timeout: {}s",
            config.rate_limit_per_second,
            config.rate_limit_burst,
            config.request_timeout_secs
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_url: lookup("DB_URL")
                .or_else(|| lookup("DATABASE_URL"))
                .ok_or_else(|| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: lookup("PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            jwt_secret: lookup("JWT_SECRET")
                .ok_or_else(|| anyhow::anyhow!("JWT_SECRET environment variable required"))
                .and_then(|secret| {
                    if secret.trim().len() < 16 {
                        anyhow::bail!("JWT_SECRET must be at least 16 characters");
                    }
                    Ok(secret)
                })?,
            jwt_expiry_hours: lookup("JWT_EXPIRY_HOURS")
                .unwrap_or_else(|| "24".to_string())
                .parse()
                .ok()
                .filter(|h: &i64| *h > 0)
                .ok_or_else(|| anyhow::anyhow!("JWT_EXPIRY_HOURS must be a positive number"))?,
            privileged_org_name: lookup("PRIVILEGED_ORG_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Reddington".to_string()),
            request_timeout_secs: parse_positive(&lookup, "REQUEST_TIMEOUT_SECS", 10)?,
            rate_limit_per_second: parse_positive(&lookup, "RATE_LIMIT_PER_SECOND", 20)?,
            rate_limit_burst: parse_positive(&lookup, "RATE_LIMIT_BURST", 50)?,
            event_channel_capacity: parse_positive(&lookup, "EVENT_CHANNEL_CAPACITY", 256)?,
        })
    }
}

fn parse_positive<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => anyhow::bail!("{} must be a positive number", key),
    }
}
