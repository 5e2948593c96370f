use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};
use log::{debug, error};
use url::{form_urlencoded, Url};

use crate::config::MapConfig;
use crate::error::MapMarkError;

/// Query parameter carrying the API key. Only the configured key is ever
/// sent upstream.
const KEY_PARAM: &str = "key";

/// Forwards static-map requests to the configured map service, injecting the
/// server-side API key.
#[derive(Debug, Clone)]
pub struct MapProxy {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl MapProxy {
    pub fn new(map: &MapConfig, timeout: Duration) -> Result<Self, MapMarkError> {
        let endpoint = Url::parse(&map.static_map_url).map_err(|e| {
            MapMarkError::ConfigError(format!(
                "Invalid map.static_map_url '{}': {}",
                map.static_map_url, e
            ))
        })?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            api_key: map.api_key.clone(),
        })
    }

    /// Upstream URL for a raw client query string: the configured key first,
    /// then every client pair except `key`, re-encoded.
    pub fn upstream_url(&self, raw_query: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(KEY_PARAM, &self.api_key);

            let client_pairs = form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes());
            for (name, value) in client_pairs {
                if name != KEY_PARAM {
                    pairs.append_pair(&name, &value);
                }
            }
        }
        url
    }

    /// Sends the request upstream and streams status, headers and body back.
    /// Only transport failures are errors; upstream error statuses pass
    /// through unchanged.
    pub async fn forward(&self, raw_query: Option<&str>) -> Result<Response, MapMarkError> {
        let url = self.upstream_url(raw_query);

        let upstream = self.client.get(url).send().await.map_err(|e| {
            error!("Static map request to {} failed: {}", self.endpoint, e);
            MapMarkError::UpstreamError(e)
        })?;

        debug!("Static map upstream answered {}", upstream.status());

        let status = upstream.status();
        let headers = passthrough_headers(upstream.headers());

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );

        Ok(response)
    }
}

/// Upstream headers minus the hop-by-hop ones that describe the upstream
/// connection rather than the content.
fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
