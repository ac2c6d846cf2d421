use std::{env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;

pub const PAGE_PLACEHOLDER: &str = "{page}";
const DEFAULT_BASE_URL: &str = "https://dentalstall.com/shop/page/{page}/";
const DEFAULT_TOKEN: &str = "mysecrettoken";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CATALOG_BASE_URL must contain `{{page}}`: {0}")]
    MissingPagePlaceholder(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub scrape_token: String,
    pub metrics_key: Option<String>,
    pub queue_capacity: usize,
    pub jobs_retained: usize,
    pub catalog: CatalogConfig,
    pub fetch: FetchConfig,
    pub cache: CacheConfig,
}

/// Where the catalogue lives upstream and on disk.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub default_pages: u32,
    pub max_pages: u32,
    pub data_file: PathBuf,
    pub images_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let scrape_token = match env::var("SCRAPE_TOKEN") {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => {
                warn!(
                    target = "catalog.api",
                    "SCRAPE_TOKEN not set; falling back to the demo token"
                );
                DEFAULT_TOKEN.to_string()
            }
        };

        let base_url = env::var("CATALOG_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        if !base_url.contains(PAGE_PLACEHOLDER) {
            return Err(ConfigError::MissingPagePlaceholder(base_url));
        }

        let fetch_defaults = FetchConfig::default();
        Ok(Self {
            port: env_parse("PORT").unwrap_or(8000),
            scrape_token,
            metrics_key: env::var("METRICS_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            queue_capacity: env_parse("QUEUE_CAPACITY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(16),
            jobs_retained: env_parse("JOBS_RETAINED")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(256),
            catalog: CatalogConfig {
                base_url,
                default_pages: env_parse("CATALOG_DEFAULT_PAGES")
                    .filter(|v: &u32| *v >= 1)
                    .unwrap_or(5),
                max_pages: env_parse("CATALOG_MAX_PAGES")
                    .filter(|v: &u32| *v >= 1)
                    .unwrap_or(100),
                data_file: env::var("CATALOG_DATA_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("scraped_data.json")),
                images_dir: env::var("CATALOG_IMAGES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("images")),
            },
            fetch: FetchConfig {
                timeout: env_parse("HTTP_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(fetch_defaults.timeout),
                connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(fetch_defaults.connect_timeout),
                attempts: env_parse("FETCH_ATTEMPTS")
                    .filter(|v: &u32| *v >= 1)
                    .unwrap_or(fetch_defaults.attempts),
                retry_delay: env_parse("FETCH_RETRY_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(fetch_defaults.retry_delay),
            },
            cache: CacheConfig {
                redis_url: env::var("REDIS_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                timeout: Duration::from_millis(env_parse("CACHE_TIMEOUT_MS").unwrap_or(1000)),
            },
        })
    }
}

impl CatalogConfig {
    pub fn page_url(&self, page: u32) -> String {
        self.base_url.replace(PAGE_PLACEHOLDER, &page.to_string())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            attempts: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_substitutes_page_number() {
        let catalog = CatalogConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_pages: 5,
            max_pages: 100,
            data_file: PathBuf::from("scraped_data.json"),
            images_dir: PathBuf::from("images"),
        };
        assert_eq!(
            catalog.page_url(3),
            "https://dentalstall.com/shop/page/3/"
        );
    }

    #[test]
    fn fetch_defaults_match_retry_policy() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.attempts, 3);
        assert_eq!(fetch.retry_delay, Duration::from_secs(3));
    }
}
