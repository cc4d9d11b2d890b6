use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Response, StatusCode};
use url::Url;

use crate::config::SyncConfig;

// Header names travel lowercased; servers match them case-insensitively.
const APP_NAME_HEADER: HeaderName = HeaderName::from_static("unleash-appname");
const INSTANCE_ID_HEADER: HeaderName = HeaderName::from_static("unleash-instanceid");

/// The result of one conditional fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchResponse {
    /// The server sent a new payload, with the cache token to present next time.
    Changed {
        payload: String,
        etag: Option<String>,
    },
    /// The payload is the one identified by the token that was presented.
    NotChanged,
    /// The server did not deliver features. `location` is the redirect target, if there was one.
    Unavailable {
        status: u16,
        location: Option<String>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("could not fetch toggles: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Retrieves the features document from the server.
#[async_trait]
pub trait FeatureFetcher: Send + Sync {
    /// Fetches the features, presenting `etag` so an unchanged document need not be resent.
    async fn fetch_features(&self, etag: Option<&str>) -> Result<FetchResponse, FetchError>;
}

/// Fetches features over HTTP from the URL in the [SyncConfig].
pub struct HttpFeatureFetcher {
    client: Client,
    url: Url,
}

impl HttpFeatureFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            // Redirects are followed by hand so that only one is ever taken.
            .redirect(redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .default_headers(default_headers(config)?)
            .build()?;

        Ok(HttpFeatureFetcher {
            client,
            url: config.fetch_url().clone(),
        })
    }

    async fn get(&self, url: Url, etag: Option<&str>) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        Ok(request.send().await?)
    }

    // Only 301, 302 and 303 are followed, and only from the configured URL.
    fn redirect_target(&self, response: &Response) -> Result<Option<Url>, FetchError> {
        let is_redirect = matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
        );
        if !is_redirect {
            return Ok(None);
        }
        match location_header(response) {
            Some(location) => response
                .url()
                .join(&location)
                .map(Some)
                .map_err(|_| FetchError::InvalidRedirect(location)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FeatureFetcher for HttpFeatureFetcher {
    async fn fetch_features(&self, etag: Option<&str>) -> Result<FetchResponse, FetchError> {
        let response = self.get(self.url.clone(), etag).await?;
        let response = match self.redirect_target(&response)? {
            Some(target) => {
                info!(
                    "Redirecting from {} to {}. Please consider updating your config.",
                    self.url, target
                );
                self.get(target, etag).await?
            }
            None => response,
        };
        interpret(response).await
    }
}

async fn interpret(response: Response) -> Result<FetchResponse, FetchError> {
    let status = response.status();
    debug!("features request to {} returned {}", response.url(), status);

    if status.is_success() {
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let payload = response.text().await?;
        if payload.is_empty() {
            return Ok(FetchResponse::Unavailable {
                status: status.as_u16(),
                location: None,
            });
        }
        return Ok(FetchResponse::Changed { payload, etag });
    }

    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchResponse::NotChanged);
    }

    Ok(FetchResponse::Unavailable {
        status: status.as_u16(),
        location: location_header(&response),
    })
}

fn location_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn default_headers(config: &SyncConfig) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(APP_NAME_HEADER, header_value(config.app_name())?);
    headers.insert(INSTANCE_ID_HEADER, header_value(config.instance_id())?);
    headers.insert(header::USER_AGENT, header_value(config.app_name())?);
    if let Some(api_key) = config.api_key() {
        headers.insert(header::AUTHORIZATION, header_value(api_key)?);
    }
    for (name, value) in config.custom_headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(value.to_string()))
}
