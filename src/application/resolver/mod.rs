//! Multi-source CV data resolution.
//!
//! Sources are tried in a fixed order that depends on where the process runs:
//!
//! - runtime: KV binding, then the bundled file
//! - build/CI: KV CLI, then the bundled file
//!
//! Every result passes the structural validator; invalid data is handled like
//! a failed source and resolution moves on to the next one.

mod sources;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ContextMode, KvSettings, SourceSettings};
use crate::domain::CvDocument;

use super::kv::BindingSlot;

pub use sources::{CliSource, FileSource, KvSource, extract_json};

const BUILD_PHASE_VAR: &str = "VITAE_PHASE";

/// Where the resolver is running, which decides the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Runtime,
    Build,
}

impl ExecutionContext {
    /// `Auto` picks build when `CI` is truthy or `VITAE_PHASE=build`.
    pub fn detect(mode: ContextMode, lookup: impl Fn(&str) -> Option<String>) -> Self {
        match mode {
            ContextMode::Runtime => Self::Runtime,
            ContextMode::Build => Self::Build,
            ContextMode::Auto => {
                let ci = lookup("CI").is_some_and(|value| is_truthy(&value));
                let phase = lookup(BUILD_PHASE_VAR)
                    .is_some_and(|value| value.trim().eq_ignore_ascii_case("build"));
                if ci || phase { Self::Build } else { Self::Runtime }
            }
        }
    }

    pub fn from_env(mode: ContextMode) -> Self {
        Self::detect(mode, |name| std::env::var(name).ok())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Build => "build",
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Why a single source produced nothing usable.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed: {0}")]
    Failed(String),
    #[error("invalid document: {0}")]
    Invalid(String),
}

impl SourceError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub name: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to fetch CV data from any source")]
    Exhausted { failures: Vec<SourceFailure> },
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self) -> Result<Value, SourceError>;
}

/// Inputs needed to build the default source chain.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub key: String,
    pub namespace_id: Option<String>,
    pub cli_path: PathBuf,
    pub cli_timeout: Duration,
    pub fallback_file: PathBuf,
}

impl ResolverOptions {
    pub fn from_settings(kv: &KvSettings, source: &SourceSettings) -> Self {
        Self {
            key: kv.key.clone(),
            namespace_id: kv.namespace_id.clone(),
            cli_path: source.cli_path.clone(),
            cli_timeout: source.cli_timeout,
            fallback_file: source.fallback_file.clone(),
        }
    }
}

pub struct DataResolver {
    context: ExecutionContext,
    sources: Vec<Box<dyn DataSource>>,
}

impl DataResolver {
    pub fn new(context: ExecutionContext, sources: Vec<Box<dyn DataSource>>) -> Self {
        Self { context, sources }
    }

    /// The standard chain for `context`.
    pub fn for_context(
        context: ExecutionContext,
        binding: BindingSlot,
        options: ResolverOptions,
    ) -> Self {
        let file: Box<dyn DataSource> = Box::new(FileSource::new(options.fallback_file));
        let sources: Vec<Box<dyn DataSource>> = match context {
            ExecutionContext::Runtime => {
                vec![Box::new(KvSource::new(binding, options.key)), file]
            }
            ExecutionContext::Build => {
                if binding.namespace().is_none() {
                    debug!(
                        target = "vitae::resolver",
                        context = context.as_str(),
                        binding = %binding.describe(),
                        "KV binding not used in build context"
                    );
                }
                vec![
                    Box::new(CliSource::new(
                        options.cli_path,
                        options.key,
                        options.namespace_id,
                        options.cli_timeout,
                    )),
                    file,
                ]
            }
        };
        Self::new(context, sources)
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    pub async fn resolve(&self) -> Result<CvDocument, ResolveError> {
        let started_at = Instant::now();
        let mut failures = Vec::new();

        for source in &self.sources {
            let name = source.name();
            let outcome = match source.fetch().await {
                Ok(value) => CvDocument::from_value(value)
                    .map_err(|err| SourceError::Invalid(err.to_string())),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(document) => {
                    info!(
                        target = "vitae::resolver",
                        op = "resolve",
                        result = "ok",
                        source = name,
                        context = self.context.as_str(),
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "Resolved CV document"
                    );
                    return Ok(document);
                }
                Err(err) => {
                    self.log_fall_through(name, &err);
                    failures.push(SourceFailure {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        error!(
            target = "vitae::resolver",
            op = "resolve",
            result = "exhausted",
            context = self.context.as_str(),
            attempted = failures.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Failed to fetch CV data from any source"
        );
        Err(ResolveError::Exhausted { failures })
    }

    fn log_fall_through(&self, name: &'static str, err: &SourceError) {
        let expected = self.context == ExecutionContext::Build
            && matches!(err, SourceError::Unavailable(_));
        if expected {
            debug!(
                target = "vitae::resolver",
                op = "resolve",
                result = "skipped",
                source = name,
                context = self.context.as_str(),
                error = %err,
                "Source unavailable; trying next"
            );
        } else {
            warn!(
                target = "vitae::resolver",
                op = "resolve",
                result = "fall_through",
                source = name,
                context = self.context.as_str(),
                error = %err,
                "Source failed; trying next"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Scripted {
        name: &'static str,
        result: fn() -> Result<Value, SourceError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataSource for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self) -> Result<Value, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scripted(
        name: &'static str,
        result: fn() -> Result<Value, SourceError>,
    ) -> (Box<dyn DataSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                result,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn auto_detection_reads_ci_and_phase() {
        assert_eq!(
            ExecutionContext::detect(ContextMode::Auto, env(&[])),
            ExecutionContext::Runtime
        );
        assert_eq!(
            ExecutionContext::detect(ContextMode::Auto, env(&[("CI", "true")])),
            ExecutionContext::Build
        );
        assert_eq!(
            ExecutionContext::detect(ContextMode::Auto, env(&[("CI", "0")])),
            ExecutionContext::Runtime
        );
        assert_eq!(
            ExecutionContext::detect(ContextMode::Auto, env(&[("VITAE_PHASE", "Build")])),
            ExecutionContext::Build
        );
        assert_eq!(
            ExecutionContext::detect(ContextMode::Runtime, env(&[("CI", "1")])),
            ExecutionContext::Runtime
        );
    }

    #[tokio::test]
    async fn first_valid_source_wins_and_later_ones_are_skipped() {
        let (first, first_calls) =
            scripted("first", || Ok(json!({"personalInfo": {"name": "A"}})));
        let (second, second_calls) =
            scripted("second", || Ok(json!({"personalInfo": {"name": "B"}})));

        let resolver = DataResolver::new(ExecutionContext::Runtime, vec![first, second]);
        let document = resolver.resolve().await.expect("resolved");

        assert_eq!(document.section("personalInfo"), Some(&json!({"name": "A"})));
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_data_falls_through_like_a_failure() {
        let (bad, _) = scripted("bad", || Ok(json!({"summary": "no personal info"})));
        let (good, good_calls) =
            scripted("good", || Ok(json!({"personalInfo": {"name": "C"}})));

        let resolver = DataResolver::new(ExecutionContext::Runtime, vec![bad, good]);
        let document = resolver.resolve().await.expect("resolved");

        assert_eq!(document.section("personalInfo"), Some(&json!({"name": "C"})));
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_every_attempt() {
        let (a, _) = scripted("a", || Err(SourceError::Unavailable("nope".into())));
        let (b, _) = scripted("b", || Err(SourceError::failed("boom")));

        let resolver = DataResolver::new(ExecutionContext::Build, vec![a, b]);
        let err = resolver.resolve().await.expect_err("must fail");

        assert_eq!(err.to_string(), "Failed to fetch CV data from any source");
        let ResolveError::Exhausted { failures } = err;
        let names: Vec<_> = failures.iter().map(|failure| failure.name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn chains_follow_context() {
        let options = ResolverOptions {
            key: "cv-data".into(),
            namespace_id: Some("ns".into()),
            cli_path: "wrangler".into(),
            cli_timeout: Duration::from_secs(10),
            fallback_file: "data/cv-data.json".into(),
        };

        let runtime = DataResolver::for_context(
            ExecutionContext::Runtime,
            BindingSlot::Missing,
            options.clone(),
        );
        assert_eq!(runtime.source_names(), ["kv", "file"]);

        let build =
            DataResolver::for_context(ExecutionContext::Build, BindingSlot::Missing, options);
        assert_eq!(build.source_names(), ["cli", "file"]);
    }
}
