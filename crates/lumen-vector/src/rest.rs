//! Minimal JSON-over-HTTP client shared by the remote providers.
use std::time::Duration;

use lumen_core::{Error, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) struct RestClient {
    client: reqwest::Client,
    base: String,
    auth: Option<(&'static str, String)>,
    provider: &'static str,
}

impl RestClient {
    pub(crate) fn new(
        provider: &'static str,
        base: &str,
        auth: Option<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("{provider}: failed to build HTTP client: {e}")))?;
        Ok(Self { client, base: base.trim_end_matches('/').to_string(), auth, provider })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base, path));
        if let Some((header, value)) = &self.auth {
            req = req.header(*header, value);
        }
        req
    }

    async fn execute<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<Option<T>> {
        let resp = req.send().await.map_err(|e| Error::backend(self.provider, e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::backend(self.provider, format!("{status}: {body}")));
        }
        resp.json::<T>().await.map(Some).map_err(|e| Error::backend(self.provider, e))
    }

    fn not_found(&self, path: &str) -> Error {
        Error::backend(self.provider, format!("404 Not Found: {path}"))
    }

    /// GET that reports 404 as `Ok(None)`.
    pub(crate) async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.execute(self.request(Method::GET, path)).await
    }

    pub(crate) async fn send<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.request(method, path).json(body)).await?.ok_or_else(|| self.not_found(path))
    }
}
