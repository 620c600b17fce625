use std::time::Duration;

use reqwest::StatusCode;

use super::{SourceClient, SourceError};

const USER_AGENT: &str = concat!("armory/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP transport with a per-request timeout.
pub struct HttpSourceClient {
    client: reqwest::blocking::Client,
}

impl HttpSourceClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl SourceClient for HttpSourceClient {
    fn get(&self, url: &str) -> Result<Option<String>, SourceError> {
        log::debug!("{url}: requesting");
        let resp = self.client.get(url).send().map_err(classify)?;
        let status = resp.status();

        if status.is_success() {
            return resp.text().map(Some).map_err(classify);
        }

        log::debug!("{url}: {status}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SourceError::Status(status.as_u16()));
        }

        // 404, 410 and the rest of 4xx will not change on retry
        Ok(None)
    }
}

fn classify(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        SourceError::Connection(err.to_string())
    } else {
        SourceError::Other(err.to_string())
    }
}
