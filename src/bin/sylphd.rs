//! Sylph server binary.
//!
//! Loads configuration, wires providers, and serves the websocket
//! gateway until ctrl-c. `SYLPH_CONFIG` (or the first CLI argument)
//! overrides the config path; a missing file falls back to defaults.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use sylph::brain::fallback::FallbackBrain;
use sylph::brain::http::HttpBrain;
use sylph::brain::mock::MockBrain;
use sylph::brain::ReasoningAdapter;
use sylph::config::{BrainConfig, BrainProvider, VoiceProviderKind};
use sylph::gateway;
use sylph::memory::sqlite::SqliteMemoryStore;
use sylph::memory::MemoryStore;
use sylph::metrics::Metrics;
use sylph::stt::mock::MockSttProvider;
use sylph::stt::SttProvider;
use sylph::tts::eleven::ElevenTtsProvider;
use sylph::tts::mock::MockTtsProvider;
use sylph::tts::TtsProvider;
use sylph::{CompanionConfig, SessionDeps, SessionManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Arc::new(load_config()?);
    let metrics = Arc::new(Metrics::new());
    let sessions = SessionManager::new(
        config.session.inactivity_timeout(),
        config.session.retention(),
    );

    let server_cancel = CancellationToken::new();
    let janitor = sessions.spawn_janitor(
        config.session.janitor_interval(),
        server_cancel.child_token(),
    );

    let deps = SessionDeps {
        stt: build_stt(),
        tts: build_tts(&config),
        brain: build_brain(&config.brain)?,
        memory: build_memory(&config)?,
        tasks: None,
        sessions,
        metrics: Arc::clone(&metrics),
        config: Arc::clone(&config),
    };

    let router = gateway::router(deps, server_cancel.clone());
    let listener = tokio::net::TcpListener::bind(&config.gateway.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.gateway.bind_addr))?;
    info!(addr = config.gateway.bind_addr.as_str(), "sylph listening");

    let shutdown = server_cancel.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    if let Err(e) = serve.await {
        warn!(error = %e, "server exited with error");
    }

    server_cancel.cancel();
    let _ = tokio::time::timeout(config.session.shutdown_timeout(), janitor).await;
    metrics.log_snapshot();
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(dir) = std::env::var_os("SYLPH_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "sylphd.log");
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<CompanionConfig> {
    let path = std::env::var_os("SYLPH_CONFIG")
        .map(PathBuf::from)
        .or_else(|| std::env::args_os().nth(1).map(PathBuf::from))
        .unwrap_or_else(CompanionConfig::default_config_path);
    if path.exists() {
        info!(path = %path.display(), "loading config");
        CompanionConfig::from_file(&path).with_context(|| format!("load {}", path.display()))
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        Ok(CompanionConfig::default())
    }
}

fn build_stt() -> Arc<dyn SttProvider> {
    // Remote STT adapters plug in here; the bundled provider is the
    // scriptable mock.
    Arc::new(MockSttProvider::new())
}

fn build_tts(config: &CompanionConfig) -> Arc<dyn TtsProvider> {
    let use_eleven = match config.voice.provider {
        VoiceProviderKind::Elevenlabs => true,
        VoiceProviderKind::Auto => !config.voice.endpoint.is_empty(),
        VoiceProviderKind::Mock => false,
    };
    if use_eleven {
        info!(endpoint = config.voice.endpoint.as_str(), "using elevenlabs tts");
        Arc::new(ElevenTtsProvider::new(&config.voice))
    } else {
        info!("using mock tts");
        Arc::new(MockTtsProvider::new())
    }
}

fn build_brain(config: &BrainConfig) -> anyhow::Result<Arc<dyn ReasoningAdapter>> {
    match config.provider {
        BrainProvider::Mock => {
            info!("using mock brain");
            Ok(Arc::new(MockBrain::new()))
        }
        BrainProvider::Http => {
            let primary: Arc<dyn ReasoningAdapter> =
                Arc::new(HttpBrain::new(config).context("primary brain")?);
            if config.fallback_url.is_empty() {
                info!(url = config.url.as_str(), "using http brain");
                return Ok(primary);
            }
            let fallback_config = BrainConfig {
                url: config.fallback_url.clone(),
                ..config.clone()
            };
            let secondary: Arc<dyn ReasoningAdapter> =
                Arc::new(HttpBrain::new(&fallback_config).context("fallback brain")?);
            info!(
                url = config.url.as_str(),
                fallback = config.fallback_url.as_str(),
                "using http brain with fallback"
            );
            Ok(Arc::new(FallbackBrain::new(
                primary,
                secondary,
                config.fallback_first_delta(),
            )))
        }
    }
}

fn build_memory(config: &CompanionConfig) -> anyhow::Result<Option<Arc<dyn MemoryStore>>> {
    if !config.memory.enabled {
        return Ok(None);
    }
    let path = config.memory.resolved_db_path();
    let store = SqliteMemoryStore::open(&path)
        .with_context(|| format!("open memory db {}", path.display()))?;
    Ok(Some(Arc::new(store)))
}
