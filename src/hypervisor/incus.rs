//! Incus REST client over the local Unix socket.
//!
//! Every response is wrapped in an envelope `{type, status_code, metadata, error,
//! error_code, operation}`. `type == "async"` responses are awaited through
//! `GET <operation>/wait` before returning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::{
    ConfigMap, DeviceConfig, FileMode, Hypervisor, HypervisorResult, Instance, InstanceSpec,
    InstanceState, OperationOutcome, Profile,
};
use crate::errors::HypervisorError;

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    operation: String,
}

enum Body {
    Empty,
    Json(Value),
    File {
        content: Vec<u8>,
        kind: &'static str,
        mode: FileMode,
    },
}

#[derive(Clone)]
pub struct IncusClient {
    socket: PathBuf,
    timeout: Duration,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl std::fmt::Debug for IncusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncusClient")
            .field("socket", &self.socket)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IncusClient {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
            client: Client::unix(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn instance_path(name: &str) -> String {
        format!("/1.0/instances/{}", urlencoding::encode(name))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Body,
        timeout: Option<Duration>,
    ) -> HypervisorResult<Envelope> {
        let uri: Uri = HyperlocalUri::new(&self.socket, path).into();
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let payload = match body {
            Body::Empty => Full::new(Bytes::new()),
            Body::Json(v) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(v.to_string()))
            }
            Body::File {
                content,
                kind,
                mode,
            } => {
                builder = builder
                    .header("content-type", "application/octet-stream")
                    .header("X-Incus-uid", mode.uid.to_string())
                    .header("X-Incus-gid", mode.gid.to_string())
                    .header("X-Incus-mode", format!("{:04o}", mode.mode))
                    .header("X-Incus-type", kind)
                    .header("X-Incus-write", "overwrite");
                Full::new(Bytes::from(content))
            }
        };
        let request = builder
            .body(payload)
            .map_err(|e| HypervisorError::new(format!("invalid request for {path}: {e}")))?;

        trace!(%method, path, "incus request");
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                HypervisorError::new(format!(
                    "cannot reach Incus at {}: {}",
                    self.socket.display(),
                    e
                ))
            })?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| HypervisorError::new(format!("failed to read Incus response: {e}")))?
                .to_bytes();
            Ok::<_, HypervisorError>((status, bytes))
        };
        let (status, bytes) = match timeout {
            Some(t) => tokio::time::timeout(t, exchange).await.map_err(|_| {
                HypervisorError::new(format!(
                    "Incus request {} {} timed out after {}",
                    method,
                    path,
                    humantime::format_duration(t)
                ))
            })??,
            None => exchange.await?,
        };

        let envelope: Envelope = serde_json::from_slice(&bytes).unwrap_or_default();
        if envelope.kind == "error" || !status.is_success() {
            let message = if envelope.error.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                envelope.error.clone()
            };
            let code = if envelope.error_code != 0 {
                envelope.error_code
            } else {
                status.as_u16()
            };
            debug!(%method, path, code, "incus error: {message}");
            return Err(HypervisorError::with_code(message, code));
        }
        Ok(envelope)
    }

    async fn sync_request(&self, method: Method, path: &str, body: Body) -> HypervisorResult<Value> {
        let envelope = self.send(method, path, body, Some(self.timeout)).await?;
        if envelope.kind == "async" {
            self.wait_operation(&envelope.operation).await?;
            return Ok(Value::Null);
        }
        Ok(envelope.metadata)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> HypervisorResult<T> {
        let metadata = self.sync_request(Method::GET, path, Body::Empty).await?;
        serde_json::from_value(metadata)
            .map_err(|e| HypervisorError::new(format!("unexpected Incus response for {path}: {e}")))
    }

    /// Submit a request that starts a background operation and wait for its outcome.
    async fn operation(&self, method: Method, path: &str, body: Body) -> HypervisorResult<OperationOutcome> {
        let envelope = self.send(method, path, body, Some(self.timeout)).await?;
        if envelope.kind != "async" || envelope.operation.is_empty() {
            return Ok(OperationOutcome::success());
        }
        self.wait_operation(&envelope.operation).await
    }

    async fn wait_operation(&self, operation: &str) -> HypervisorResult<OperationOutcome> {
        let path = format!("{}/wait", operation.trim_end_matches('/'));
        debug!(operation, "waiting for incus operation");
        // Image downloads outlive any sensible request timeout.
        let envelope = self.send(Method::GET, &path, Body::Empty, None).await?;
        serde_json::from_value(envelope.metadata)
            .map_err(|e| HypervisorError::new(format!("unexpected operation payload: {e}")))
    }

    async fn files_post(&self, name: &str, path: &str, body: Body) -> HypervisorResult<()> {
        let url = format!(
            "{}/files?path={}",
            Self::instance_path(name),
            urlencoding::encode(path)
        );
        self.sync_request(Method::POST, &url, body).await.map(|_| ())
    }

    async fn change_state(&self, name: &str, action: &str, force: bool) -> HypervisorResult<OperationOutcome> {
        let path = format!("{}/state", Self::instance_path(name));
        let body = json!({ "action": action, "timeout": 30, "force": force });
        self.operation(Method::PUT, &path, Body::Json(body)).await
    }
}

#[async_trait]
impl Hypervisor for IncusClient {
    async fn is_available(&self) -> bool {
        self.sync_request(Method::GET, "/1.0", Body::Empty)
            .await
            .is_ok()
    }

    async fn list_instances(&self) -> HypervisorResult<Vec<Instance>> {
        self.get("/1.0/instances?recursion=1").await
    }

    async fn instance_exists(&self, name: &str) -> HypervisorResult<bool> {
        match self.get_instance(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_instance(&self, name: &str) -> HypervisorResult<Instance> {
        self.get(&Self::instance_path(name)).await
    }

    async fn get_instance_state(&self, name: &str) -> HypervisorResult<InstanceState> {
        self.get(&format!("{}/state", Self::instance_path(name))).await
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> HypervisorResult<OperationOutcome> {
        let body = serde_json::to_value(spec)
            .map_err(|e| HypervisorError::new(format!("cannot encode instance spec: {e}")))?;
        self.operation(Method::POST, "/1.0/instances", Body::Json(body))
            .await
    }

    async fn start_instance(&self, name: &str) -> HypervisorResult<OperationOutcome> {
        self.change_state(name, "start", false).await
    }

    async fn stop_instance(&self, name: &str, force: bool) -> HypervisorResult<OperationOutcome> {
        self.change_state(name, "stop", force).await
    }

    async fn delete_instance(&self, name: &str) -> HypervisorResult<OperationOutcome> {
        self.operation(Method::DELETE, &Self::instance_path(name), Body::Empty)
            .await
    }

    async fn add_instance_device(
        &self,
        name: &str,
        device_name: &str,
        device: &DeviceConfig,
    ) -> HypervisorResult<()> {
        let instance = self.get_instance(name).await?;
        let mut devices = instance.devices;
        if let Some(existing) = devices.get(device_name) {
            if existing == device {
                return Ok(());
            }
            return Err(HypervisorError::with_code(
                format!("Device \"{device_name}\" already exists"),
                409,
            ));
        }
        devices.insert(device_name.to_string(), device.clone());
        let body = json!({ "devices": devices });
        self.operation(Method::PATCH, &Self::instance_path(name), Body::Json(body))
            .await
            .and_then(ensure_success)
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: FileMode,
    ) -> HypervisorResult<()> {
        let body = Body::File {
            content: content.to_vec(),
            kind: "file",
            mode,
        };
        self.files_post(name, path, body).await
    }

    async fn create_symlink(
        &self,
        name: &str,
        path: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> HypervisorResult<()> {
        let body = Body::File {
            content: target.as_bytes().to_vec(),
            kind: "symlink",
            mode: FileMode::new(uid, gid, 0o777),
        };
        self.files_post(name, path, body).await
    }

    async fn mkdir(&self, name: &str, path: &str, mode: FileMode) -> HypervisorResult<()> {
        let body = Body::File {
            content: Vec::new(),
            kind: "directory",
            mode,
        };
        self.files_post(name, path, body).await
    }

    async fn patch_instance_config(&self, name: &str, patch: &ConfigMap) -> HypervisorResult<()> {
        // PATCH replaces the config map as a whole, so merge first.
        let instance = self.get_instance(name).await?;
        let mut config = instance.config;
        config.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        let body = json!({ "config": config });
        self.operation(Method::PATCH, &Self::instance_path(name), Body::Json(body))
            .await
            .and_then(ensure_success)
    }

    async fn profile_exists(&self, name: &str) -> HypervisorResult<bool> {
        match self.get_profile(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_profile(&self, name: &str) -> HypervisorResult<Profile> {
        self.get(&format!("/1.0/profiles/{}", urlencoding::encode(name)))
            .await
    }

    async fn create_profile(&self, profile: &Profile) -> HypervisorResult<()> {
        let body = serde_json::to_value(profile)
            .map_err(|e| HypervisorError::new(format!("cannot encode profile: {e}")))?;
        self.sync_request(Method::POST, "/1.0/profiles", Body::Json(body))
            .await
            .map(|_| ())
    }

    async fn update_profile(&self, profile: &Profile) -> HypervisorResult<()> {
        let body = json!({
            "description": profile.description,
            "config": profile.config,
            "devices": profile.devices,
        });
        let path = format!("/1.0/profiles/{}", urlencoding::encode(&profile.name));
        self.sync_request(Method::PUT, &path, Body::Json(body))
            .await
            .map(|_| ())
    }
}

fn ensure_success(outcome: OperationOutcome) -> HypervisorResult<()> {
    if outcome.is_success() {
        Ok(())
    } else {
        Err(HypervisorError::new(outcome.reason().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_paths_are_encoded() {
        assert_eq!(IncusClient::instance_path("dev"), "/1.0/instances/dev");
        assert_eq!(IncusClient::instance_path("a b"), "/1.0/instances/a%20b");
    }

    #[test]
    fn error_envelope_parses() {
        let e: Envelope = serde_json::from_str(
            r#"{"type":"error","error":"Instance not found","error_code":404,"metadata":null}"#,
        )
        .unwrap();
        assert_eq!(e.kind, "error");
        assert_eq!(e.error_code, 404);
        assert!(e.operation.is_empty());
    }

    #[tokio::test]
    async fn missing_socket_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = IncusClient::new(dir.path().join("absent.socket"), Duration::from_secs(2));
        assert!(!client.is_available().await);
        let err = client.get_instance("dev").await.unwrap_err();
        assert!(err.message.contains("cannot reach Incus"));
    }
}
