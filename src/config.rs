/// Host-level settings read from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub log_level: String,
    pub db_max_connections: u32,
}

impl Config {
    /// Loads `.env` when present, then reads the environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let db_max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(10);

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            log_level,
            db_max_connections,
        }
    }
}
