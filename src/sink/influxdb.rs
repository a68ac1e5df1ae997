//! InfluxDB v2 HTTP writer.
//!
//! Points are posted one request per write to `/api/v2/write` with
//! nanosecond precision.

use super::{Sink, SinkError};
use crate::config::InfluxDbConfig;
use crate::sink::line_protocol::DataPoint;
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

pub struct InfluxDbSink {
    client: Option<Client>,
    endpoint: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxDbSink {
    pub fn new(config: &InfluxDbConfig, bucket: &str) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client: Some(client),
            endpoint: write_endpoint(&config.url),
            org: config.org.clone(),
            bucket: bucket.to_string(),
            token: config.token.clone(),
        })
    }
}

fn write_endpoint(url: &str) -> String {
    format!("{}/api/v2/write", url.trim_end_matches('/'))
}

impl Sink for InfluxDbSink {
    fn write<'a>(&'a mut self, point: &'a DataPoint) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let client = self.client.as_ref().ok_or(SinkError::Closed)?;
            point.check_writable()?;
            let response = client
                .post(&self.endpoint)
                .query(&[
                    ("org", self.org.as_str()),
                    ("bucket", self.bucket.as_str()),
                    ("precision", "ns"),
                ])
                .header(AUTHORIZATION, format!("Token {}", self.token))
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(point.to_string())
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(SinkError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the client closes its idle connections.
            self.client = None;
        })
    }
}
