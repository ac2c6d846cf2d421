use crate::config::FetchConfig;
use reqwest::{Client, Proxy};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Client with the browser identity and timeouts applied; `proxy` routes every
/// scheme through the given forward proxy.
pub fn build_client(config: &FetchConfig, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout);
    if let Some(url) = proxy {
        builder = builder.proxy(Proxy::all(url)?);
    }
    builder.build()
}
