//! A client for the Jaeger query service HTTP API.

use super::{ApiError, Jaeger, Response, Trace, TraceQuery};
use anyhow::Error;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use surf::{StatusCode, Url};

/// A client for the Jaeger query service.
#[derive(Clone)]
pub struct Client {
    client: surf::Client,
}

impl Client {
    /// Connect to the Jaeger query service at `endpoint`.
    ///
    /// `endpoint` is the root of the query service (e.g. `http://localhost:16686`); API paths are
    /// resolved relative to it.
    pub fn new(mut endpoint: Url) -> Result<Self, Error> {
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            client: surf::Config::default()
                .set_base_url(endpoint)
                .try_into()
                .map_err(Error::msg)?,
        })
    }

    fn request(&self, path: impl AsRef<str>) -> Request {
        Request::new(&self.client, path.as_ref())
    }
}

#[async_trait]
impl Jaeger for Client {
    async fn services(&self) -> Result<Vec<String>, Error> {
        let mut services: Vec<String> = self
            .request("api/services")
            .get()
            .await?
            .unwrap_or_default();
        services.sort();
        Ok(services)
    }

    async fn traces(&self, service: &str, query: &TraceQuery) -> Result<Vec<Trace>, Error> {
        let lookback: Duration = query.lookback.into();
        let end = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(Error::msg)?;
        let start = end.saturating_sub(lookback);

        let mut req = self
            .request("api/traces")
            .param("service", service)
            .param("start", start.as_micros().to_string())
            .param("end", end.as_micros().to_string())
            .param("lookback", query.lookback.to_string());
        if let Some(operation) = &query.operation {
            req = req.param("operation", operation);
        }
        if query.limit > 0 {
            req = req.param("limit", query.limit.to_string());
        }
        Ok(req.get().await?.unwrap_or_default())
    }

    async fn trace(&self, id: &str) -> Result<Option<Trace>, Error> {
        let traces: Option<Vec<Trace>> = self
            .request(format!("api/traces/{id}"))
            .allow_not_found()
            .get()
            .await?;
        Ok(traces.and_then(|traces| traces.into_iter().find(|trace| trace.trace_id == id)))
    }
}

struct Request {
    builder: surf::RequestBuilder,
    params: Vec<(String, String)>,
    allow_not_found: bool,
}

impl Request {
    fn new(client: &surf::Client, path: &str) -> Self {
        Self {
            builder: client.get(path),
            params: vec![],
            allow_not_found: false,
        }
    }

    fn param(mut self, param: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((param.into(), value.into()));
        self
    }

    /// Treat a "not found" response as a missing object rather than an error.
    fn allow_not_found(mut self) -> Self {
        self.allow_not_found = true;
        self
    }

    /// Send the request and extract the `"data"` payload of the response.
    ///
    /// Returns [`None`] if the response has no data, or if Jaeger reports that the requested
    /// object was not found and the request allows it.
    async fn get<T: DeserializeOwned>(self) -> Result<Option<T>, Error> {
        tracing::info!(?self.builder, ?self.params, "Jaeger request");
        let allow_not_found = self.allow_not_found;
        let mut builder = self.builder;
        if !self.params.is_empty() {
            builder = builder.query(&self.params).map_err(Error::msg)?;
        }
        let mut res = builder.send().await.map_err(Error::msg)?;
        let status = res.status();

        let body: Response<T> = match res.body_json().await {
            Ok(body) => body,
            Err(err) if status.is_success() => {
                return Err(Error::msg(format!("malformed Jaeger response: {err}")));
            }
            Err(_) if allow_not_found && status == StatusCode::NotFound => return Ok(None),
            Err(_) => {
                return Err(Error::msg(format!(
                    "Jaeger request failed with status {}",
                    u16::from(status)
                )));
            }
        };

        let errors = body.errors.unwrap_or_default();
        if !errors.is_empty() {
            let not_found =
                status == StatusCode::NotFound || errors.iter().all(|err| err.code == 404);
            if allow_not_found && not_found {
                return Ok(None);
            }
            return Err(Error::msg(format!(
                "Jaeger API error: {}",
                errors
                    .iter()
                    .map(ApiError::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }
        match body.data {
            Some(data) => Ok(Some(data)),
            None if allow_not_found && status == StatusCode::NotFound => Ok(None),
            None if status.is_success() => Ok(None),
            None => Err(Error::msg(format!(
                "Jaeger request failed with status {}",
                u16::from(status)
            ))),
        }
    }
}
