use std::{io::Write, path::Path, process, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::watch};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use vitae::{
    application::{
        cv::{CvDataContext, CvDataService, KvCvStore},
        error::AppError,
        kv::BindingSlot,
        resolver::{DataResolver, ExecutionContext, ResolverOptions},
    },
    cache::{CacheService, RetryPolicy},
    config,
    domain::CvDocument,
    infra::{
        client::HttpCvBackend,
        error::InfraError,
        http::{self, ApiState},
        kv::CloudflareKv,
        telemetry,
    },
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Resolve(args) => run_resolve(settings, args).await,
        config::Command::Fetch(args) => run_fetch(settings, args).await,
    }
}

fn source_chain(settings: &config::Settings) -> (DataResolver, BindingSlot) {
    let binding = CloudflareKv::binding(&settings.kv);
    let context = ExecutionContext::from_env(settings.source.context);
    let options = ResolverOptions::from_settings(&settings.kv, &settings.source);
    let resolver = DataResolver::for_context(context, binding.clone(), options);

    info!(
        target = "vitae::bootstrap",
        context = context.as_str(),
        sources = ?resolver.source_names(),
        binding = %binding.describe(),
        "Configured CV source chain"
    );
    (resolver, binding)
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (resolver, binding) = source_chain(&settings);
    if let BindingSlot::Misconfigured(reason) = &binding {
        warn!(
            target = "vitae::bootstrap",
            reason = %reason,
            "KV binding misconfigured; writes will be rejected"
        );
    }
    let store = KvCvStore::new(binding, settings.kv.key.clone(), Arc::new(resolver));

    let state = ApiState::from_settings(&settings, Arc::new(store)).await;
    let cache = state.cv.cache().clone();
    cache.start_cleanup();
    if settings.api.admin_token.is_none() {
        warn!(
            target = "vitae::bootstrap",
            "No admin token configured; write endpoints are disabled"
        );
    }

    let result = serve_http(&settings.server, http::build_router(state)).await;
    cache.destroy().await;
    result
}

async fn serve_http(
    server: &config::ServerSettings,
    router: axum::Router,
) -> Result<(), AppError> {
    let listener = TcpListener::bind(server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "vitae::bootstrap",
        addr = %server.addr,
        "Listening for HTTP requests"
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server_task => return flatten_server_result(joined),
        () = shutdown_signal() => {}
    }

    info!(
        target = "vitae::bootstrap",
        grace_secs = server.graceful_shutdown.as_secs(),
        "Shutdown requested; draining connections"
    );
    let _ = stop_tx.send(true);

    match tokio::time::timeout(server.graceful_shutdown, &mut server_task).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            warn!(
                target = "vitae::bootstrap",
                "Graceful shutdown timed out; aborting open connections"
            );
            server_task.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(InfraError::from(err).into()),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "vitae::bootstrap", error = %err, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(target = "vitae::bootstrap", error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run_resolve(settings: config::Settings, args: config::ResolveArgs) -> Result<(), AppError> {
    let (resolver, _) = source_chain(&settings);
    let document = resolver.resolve().await?;
    write_document(&document, args.pretty, args.output.as_deref()).await
}

async fn run_fetch(settings: config::Settings, args: config::FetchArgs) -> Result<(), AppError> {
    let backend = HttpCvBackend::new(
        &settings.api.base_url,
        settings.api.admin_token.clone(),
        FETCH_TIMEOUT,
    )
    .map_err(|err| AppError::unexpected(err.to_string()))?;

    let cache = CacheService::from_settings(&settings.cache, RetryPolicy::default()).await;
    let context = CvDataContext::new(CvDataService::new(cache.clone(), Arc::new(backend)));

    let outcome = if args.refresh {
        context.refresh().await
    } else {
        context.load().await
    };
    let stats = cache.stats();
    info!(
        target = "vitae::fetch",
        hits = stats.hits,
        misses = stats.misses,
        stale_hits = stats.stale_hits,
        "Value cache statistics"
    );

    let written = match outcome {
        Ok(document) => write_document(&document, args.pretty, None).await,
        Err(err) => Err(err.into()),
    };
    cache.destroy().await;
    written
}

async fn write_document(
    document: &CvDocument,
    pretty: bool,
    output: Option<&Path>,
) -> Result<(), AppError> {
    let mut text = if pretty {
        serde_json::to_string_pretty(document.as_map())
    } else {
        serde_json::to_string(document.as_map())
    }
    .map_err(|err| AppError::unexpected(format!("failed to encode document: {err}")))?;
    text.push('\n');

    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(InfraError::from)?;
            }
            tokio::fs::write(path, text).await.map_err(InfraError::from)?;
            info!(
                target = "vitae::resolve",
                path = %path.display(),
                version = %document.version(),
                "Wrote CV document"
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|()| stdout.flush())
                .map_err(InfraError::from)?;
        }
    }
    Ok(())
}
