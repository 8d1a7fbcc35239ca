//! KV namespace adapters: Workers KV over its REST API, and an in-process map.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::application::kv::{BindingSlot, KvError, KvNamespace};
use crate::config::KvSettings;

/// Workers KV accessed through `accounts/{account}/storage/kv/namespaces/{ns}/values/{key}`.
#[derive(Debug, Clone)]
pub struct CloudflareKv {
    client: Client,
    values_url: Url,
    api_token: String,
    timeout: Duration,
}

impl CloudflareKv {
    pub fn new(
        api_base_url: &Url,
        account_id: &str,
        namespace_id: &str,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, KvError> {
        let mut values_url = api_base_url.clone();
        values_url
            .path_segments_mut()
            .map_err(|_| KvError::transport("kv api base url cannot carry a path"))?
            .pop_if_empty()
            .extend([
                "accounts",
                account_id,
                "storage",
                "kv",
                "namespaces",
                namespace_id,
                "values",
            ]);

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| KvError::transport(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            values_url,
            api_token: api_token.into(),
            timeout,
        })
    }

    /// Turn configuration into a binding slot without failing startup.
    pub fn binding(settings: &KvSettings) -> BindingSlot {
        let credentials = [
            ("kv.account_id", settings.account_id.as_deref()),
            ("kv.namespace_id", settings.namespace_id.as_deref()),
            ("kv.api_token", settings.api_token.as_deref()),
        ];
        let missing: Vec<&str> = credentials
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();

        match (settings.account_id.as_deref(), settings.namespace_id.as_deref(), settings.api_token.as_deref()) {
            (Some(account_id), Some(namespace_id), Some(api_token)) => match Self::new(
                &settings.api_base_url,
                account_id,
                namespace_id,
                api_token,
                settings.request_timeout,
            ) {
                Ok(kv) => BindingSlot::bound(Arc::new(kv)),
                Err(err) => BindingSlot::Misconfigured(err.to_string()),
            },
            _ if missing.len() == credentials.len() => BindingSlot::Missing,
            _ => BindingSlot::Misconfigured(format!("{} not set", missing.join(", "))),
        }
    }

    fn value_url(&self, key: &str) -> Result<Url, KvError> {
        let mut url = self.values_url.clone();
        url.path_segments_mut()
            .map_err(|_| KvError::transport("kv api base url cannot carry a path"))?
            .push(key);
        Ok(url)
    }

    fn classify(&self, err: reqwest::Error) -> KvError {
        if err.is_timeout() {
            KvError::Timeout(self.timeout)
        } else {
            KvError::transport(err.to_string())
        }
    }

    async fn status_error(response: reqwest::Response) -> KvError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        KvError::Status { status, message }
    }
}

#[async_trait]
impl KvNamespace for CloudflareKv {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, KvError> {
        let response = self
            .client
            .get(self.value_url(key)?)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(|err| self.classify(err))?;
                debug!(
                    target = "vitae::kv",
                    op = "get_json",
                    key,
                    bytes = bytes.len(),
                    "KV value fetched"
                );
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(KvError::Decode)
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn put_json(&self, key: &str, value: &Value) -> Result<(), KvError> {
        let body = serde_json::to_vec(value).map_err(KvError::Decode)?;
        let response = self
            .client
            .put(self.value_url(key)?)
            .bearer_auth(&self.api_token)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }
}

/// In-process namespace for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KvNamespace for MemoryKv {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.get(key))
    }

    async fn put_json(&self, key: &str, value: &Value) -> Result<(), KvError> {
        self.insert(key, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    fn settings(account: Option<&str>, namespace: Option<&str>, token: Option<&str>) -> KvSettings {
        KvSettings {
            account_id: account.map(str::to_string),
            namespace_id: namespace.map(str::to_string),
            api_token: token.map(str::to_string),
            api_base_url: Url::parse("https://api.cloudflare.com/client/v4").unwrap(),
            key: "cv-data".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn binding_reflects_credentials() {
        assert!(matches!(
            CloudflareKv::binding(&settings(None, None, None)),
            BindingSlot::Missing
        ));
        match CloudflareKv::binding(&settings(Some("acc"), None, None)) {
            BindingSlot::Misconfigured(reason) => {
                assert!(reason.contains("kv.namespace_id"));
                assert!(reason.contains("kv.api_token"));
            }
            other => panic!("expected misconfigured slot, got {other:?}"),
        }
        assert!(matches!(
            CloudflareKv::binding(&settings(Some("acc"), Some("ns"), Some("tok"))),
            BindingSlot::Bound(_)
        ));
    }

    #[test]
    fn keys_are_percent_encoded_into_one_segment() {
        let kv = CloudflareKv::new(
            &Url::parse("https://api.cloudflare.com/client/v4/").unwrap(),
            "acc",
            "ns",
            "tok",
            Duration::from_secs(1),
        )
        .unwrap();
        let url = kv.value_url("cv data/../x").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.cloudflare.com/client/v4/accounts/acc/storage/kv/namespaces/ns/values/cv%20data%2F..%2Fx"
        );
    }

    #[derive(Clone, Default)]
    struct Stub {
        store: Arc<MemoryKv>,
    }

    async fn stub_get(
        State(stub): State<Stub>,
        Path(key): Path<String>,
        headers: HeaderMap,
    ) -> Result<String, AxumStatus> {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer tok") {
            return Err(AxumStatus::FORBIDDEN);
        }
        stub.store
            .get(&key)
            .map(|value| value.to_string())
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn stub_put(State(stub): State<Stub>, Path(key): Path<String>, body: Bytes) -> AxumStatus {
        match serde_json::from_slice(&body) {
            Ok(value) => {
                stub.store.insert(key, value);
                AxumStatus::OK
            }
            Err(_) => AxumStatus::BAD_REQUEST,
        }
    }

    async fn spawn_stub() -> (Url, Stub) {
        let stub = Stub::default();
        let app = Router::new()
            .route(
                "/client/v4/accounts/acc/storage/kv/namespaces/ns/values/{key}",
                get(stub_get).put(stub_put),
            )
            .with_state(stub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        let base = Url::parse(&format!("http://{addr}/client/v4")).unwrap();
        (base, stub)
    }

    #[tokio::test]
    async fn rest_adapter_round_trips_through_http() {
        let (base, stub) = spawn_stub().await;
        let kv = CloudflareKv::new(&base, "acc", "ns", "tok", Duration::from_secs(5)).unwrap();

        assert_eq!(kv.get_json("cv-data").await.unwrap(), None);

        let document = json!({"personalInfo": {"name": "Ada"}});
        kv.put_json("cv-data", &document).await.unwrap();
        assert_eq!(stub.store.get("cv-data"), Some(document.clone()));
        assert_eq!(kv.get_json("cv-data").await.unwrap(), Some(document));
    }

    #[tokio::test]
    async fn rest_adapter_surfaces_status_errors() {
        let (base, _) = spawn_stub().await;
        let kv = CloudflareKv::new(&base, "acc", "ns", "wrong", Duration::from_secs(5)).unwrap();

        match kv.get_json("cv-data").await {
            Err(KvError::Status { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
