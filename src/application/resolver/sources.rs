use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::application::kv::{BindingSlot, KvError};

use super::{DataSource, SourceError};

/// Reads the document through the KV binding. Only used at runtime.
pub struct KvSource {
    binding: BindingSlot,
    key: String,
}

impl KvSource {
    pub fn new(binding: BindingSlot, key: impl Into<String>) -> Self {
        Self {
            binding,
            key: key.into(),
        }
    }
}

#[async_trait]
impl DataSource for KvSource {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn fetch(&self) -> Result<Value, SourceError> {
        let Some(namespace) = self.binding.namespace() else {
            return Err(SourceError::Unavailable(self.binding.describe()));
        };

        match namespace.get_json(&self.key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(SourceError::failed(format!(
                "key `{}` not found in namespace",
                self.key
            ))),
            Err(KvError::Timeout(after)) => Err(SourceError::Timeout(after)),
            Err(err) => Err(SourceError::failed(err.to_string())),
        }
    }
}

/// Shells out to the KV CLI. Only used during builds, where the CLI is installed.
pub struct CliSource {
    program: PathBuf,
    key: String,
    namespace_id: Option<String>,
    timeout: Duration,
}

impl CliSource {
    pub fn new(
        program: impl Into<PathBuf>,
        key: impl Into<String>,
        namespace_id: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            key: key.into(),
            namespace_id,
            timeout,
        }
    }
}

#[async_trait]
impl DataSource for CliSource {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn fetch(&self) -> Result<Value, SourceError> {
        let Some(namespace_id) = self.namespace_id.as_deref() else {
            return Err(SourceError::Unavailable(
                "kv.namespace_id is not set".to_string(),
            ));
        };

        let started_at = Instant::now();
        // Key and namespace travel as separate argv entries; no shell is involved.
        let pending = Command::new(&self.program)
            .arg("kv")
            .arg("key")
            .arg("get")
            .arg(&self.key)
            .arg("--namespace-id")
            .arg(namespace_id)
            .arg("--remote")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!(
                    "`{}` not found",
                    self.program.display()
                )));
            }
            Ok(Err(err)) => {
                return Err(SourceError::failed(format!("failed to spawn CLI: {err}")));
            }
            Err(_) => return Err(SourceError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::failed(format!(
                "CLI exited with {exit_code}: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = extract_json(&stdout)
            .ok_or_else(|| SourceError::failed("CLI output contained no JSON object"))?;

        debug!(
            target = "vitae::resolver::cli",
            op = "cli_fetch",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            stdout_bytes = output.stdout.len(),
            "KV CLI returned a JSON document"
        );
        Ok(value)
    }
}

/// Parse the first JSON object in CLI output, skipping any banner lines before it.
///
/// Parsing starts at the first line whose trimmed text begins with `{`; text
/// after the end of that object is ignored.
pub fn extract_json(stdout: &str) -> Option<Value> {
    let mut offset = 0;
    for line in stdout.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            let start = offset + (line.len() - trimmed.len());
            let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
            return match stream.next() {
                Some(Ok(value)) => Some(value),
                _ => None,
            };
        }
        offset += line.len();
    }
    None
}

/// Reads the bundled document from disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self) -> Result<Value, SourceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!(
                    "`{}` does not exist",
                    self.path.display()
                )));
            }
            Err(err) => {
                return Err(SourceError::failed(format!(
                    "failed to read `{}`: {err}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_slice(&bytes).map_err(|err| {
            SourceError::failed(format!("`{}` is not JSON: {err}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::infra::kv::MemoryKv;

    #[test]
    fn extract_json_skips_banners() {
        let stdout = " ⛅️ wrangler 3.0.0\n-------------------\n{\n  \"personalInfo\": {\"name\": \"Ada\"}\n}\n";
        assert_eq!(
            extract_json(stdout),
            Some(json!({"personalInfo": {"name": "Ada"}}))
        );
    }

    #[test]
    fn extract_json_ignores_trailing_text() {
        let stdout = "  {\"a\": 1}\nupdate available\n";
        assert_eq!(extract_json(stdout), Some(json!({"a": 1})));
    }

    #[test]
    fn extract_json_rejects_output_without_object() {
        assert_eq!(extract_json("no data\n[1, 2]\n"), None);
        assert_eq!(extract_json("{ broken"), None);
        assert_eq!(extract_json(""), None);
    }

    #[tokio::test]
    async fn kv_source_reports_unbound_slot_as_unavailable() {
        let source = KvSource::new(BindingSlot::Misconfigured("no token".into()), "cv-data");
        let err = source.fetch().await.expect_err("unbound");
        assert!(matches!(err, SourceError::Unavailable(reason) if reason.contains("no token")));
    }

    #[tokio::test]
    async fn kv_source_reads_bound_namespace() {
        let kv = Arc::new(MemoryKv::new());
        kv.insert("cv-data", json!({"personalInfo": {"name": "Ada"}}));
        let source = KvSource::new(BindingSlot::bound(kv), "cv-data");
        assert_eq!(
            source.fetch().await.unwrap(),
            json!({"personalInfo": {"name": "Ada"}})
        );

        let missing = KvSource::new(BindingSlot::bound(Arc::new(MemoryKv::new())), "cv-data");
        assert!(matches!(missing.fetch().await, Err(SourceError::Failed(_))));
    }

    #[tokio::test]
    async fn cli_source_needs_namespace_id() {
        let source = CliSource::new("wrangler", "cv-data", None, Duration::from_secs(1));
        assert!(matches!(
            source.fetch().await,
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_cli_binary_is_unavailable() {
        let source = CliSource::new(
            "/nonexistent/vitae-test-cli",
            "cv-data",
            Some("ns".into()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            source.fetch().await,
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn file_source_reads_and_reports() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("cv.json");
        std::fs::write(&path, br#"{"personalInfo": {"name": "Ada"}}"#).unwrap();

        let value = FileSource::new(&path).fetch().await.unwrap();
        assert_eq!(value["personalInfo"]["name"], "Ada");

        let missing = FileSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.fetch().await,
            Err(SourceError::Unavailable(_))
        ));

        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            FileSource::new(&path).fetch().await,
            Err(SourceError::Failed(_))
        ));
    }
}
