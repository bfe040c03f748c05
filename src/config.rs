use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Absolute URL prefix used when minting pagination Link headers.
    pub base_url: String,
    /// Epic creations allowed per author per window. 0 disables.
    pub epic_create_limit: u32,
    pub epic_create_window_secs: u64,
    pub max_body_bytes: usize,
    /// Run background jobs inline instead of on the worker task.
    pub inline_jobs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 4000,
            base_url: "http://localhost:4000".into(),
            epic_create_limit: 200,
            epic_create_window_secs: 60,
            max_body_bytes: 10 * 1024 * 1024,
            inline_jobs: false,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    Ok(Config {
        port: env_parse("GATEHOUSE_PORT", defaults.port),
        base_url: std::env::var("GATEHOUSE_BASE_URL").unwrap_or(defaults.base_url),
        epic_create_limit: env_parse("GATEHOUSE_EPIC_CREATE_LIMIT", defaults.epic_create_limit),
        epic_create_window_secs: env_parse(
            "GATEHOUSE_EPIC_CREATE_WINDOW_SECS",
            defaults.epic_create_window_secs,
        ),
        max_body_bytes: env_parse("GATEHOUSE_MAX_BODY_BYTES", defaults.max_body_bytes),
        inline_jobs: env_parse("GATEHOUSE_INLINE_JOBS", defaults.inline_jobs),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
