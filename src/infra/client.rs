//! HTTP client for the CV API, used as the fetcher behind the value cache.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;
use vitae_api_types::{Envelope, ErrorBody, SaveOutcome, codes};

use crate::application::cv::{BackendError, CvBackend};
use crate::domain::CvDocument;

const CV_ROUTE: &str = "api/v1/cv";

#[derive(Debug, Clone)]
pub struct HttpCvBackend {
    client: Client,
    cv_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpCvBackend {
    pub fn new(base_url: &Url, token: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        let mut base = base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let cv_url = base
            .join(CV_ROUTE)
            .map_err(|err| BackendError::upstream(None, format!("invalid api base url: {err}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::upstream(None, format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            cv_url,
            token,
            timeout,
        })
    }

    pub fn cv_url(&self) -> &Url {
        &self.cv_url
    }

    fn transport(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::upstream(None, err.to_string())
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, BackendError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(|err| self.transport(err))?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes).map_err(|err| {
            BackendError::upstream(
                Some(status.as_u16()),
                format!("response is not a valid envelope: {err}"),
            )
        })?;
        envelope
            .into_result()
            .map_err(|body| classify(status, body, self.timeout))
    }
}

/// Map a failure envelope to a backend error; `timeout` is reported for upstream timeouts.
fn classify(status: StatusCode, body: ErrorBody, timeout: Duration) -> BackendError {
    match (status, body.code.as_str()) {
        (StatusCode::NOT_FOUND, _) | (_, codes::NOT_FOUND) => BackendError::NotFound,
        (_, codes::INVALID_DOCUMENT) | (StatusCode::BAD_REQUEST, _) => {
            BackendError::Invalid(body.message)
        }
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            BackendError::Unauthorized(body.message)
        }
        (StatusCode::GATEWAY_TIMEOUT, _) | (_, codes::UPSTREAM_TIMEOUT) => {
            BackendError::Timeout(timeout)
        }
        _ => BackendError::upstream(Some(status.as_u16()), body.to_string()),
    }
}

#[async_trait]
impl CvBackend for HttpCvBackend {
    async fn fetch(&self) -> Result<CvDocument, BackendError> {
        let response = self
            .client
            .get(self.cv_url.clone())
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        let value: Value = self.decode(response).await?;
        CvDocument::from_value(value).map_err(|err| BackendError::Invalid(err.to_string()))
    }

    async fn save(&self, document: &CvDocument) -> Result<String, BackendError> {
        let Some(token) = self.token.as_deref() else {
            return Err(BackendError::Unauthorized(
                "no admin token configured".to_string(),
            ));
        };
        let response = self
            .client
            .post(self.cv_url.clone())
            .bearer_auth(token)
            .json(document.as_map())
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        let outcome: SaveOutcome = self.decode(response).await?;
        Ok(outcome.version)
    }
}
