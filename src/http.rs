use crate::config::HttpSettings;
use reqwest::Client;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub fn build_client(settings: &HttpSettings, user_agent: Option<&str>) -> Client {
    let mut builder = Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout);
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent);
    }
    builder.build().unwrap_or_else(|_| Client::new())
}
