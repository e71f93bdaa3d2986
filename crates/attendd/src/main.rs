use anyhow::{Context, Result};
use attend_capture::{CameraSource, CaptureWorker, DirectorySource, FrameSource, LatestFrame};
use attend_core::{FaceEmbedder, NearestNeighborMatcher, RecognitionSession};
use attend_store::{SqliteStore, StoreReader};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use zbus::connection;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config, SourceKind};
use dbus_interface::{AttendService, BUS_NAME, OBJECT_PATH};
use engine::{EngineParts, EngineStatus};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");

    let config = Config::load()?;
    let policy = config.commit_policy()?;
    let threshold = config.threshold();

    let store = SqliteStore::open(&config.db_path).context("opening attendance store")?;
    store
        .ensure_camera(
            &config.camera_id,
            config.camera_label.as_deref(),
            config.camera_location.as_deref(),
        )
        .context("registering camera")?;
    let reader = StoreReader::open(&config.db_path)
        .await
        .context("opening read-only store connection")?;

    let detector_path = config
        .detector_path
        .to_str()
        .context("detector path is not valid UTF-8")?;
    let model_path = config
        .model_path
        .to_str()
        .context("model path is not valid UTF-8")?;
    let embedder = FaceEmbedder::load(detector_path, model_path)?;

    let source: Box<dyn FrameSource> = match config.source {
        SourceKind::Camera => Box::new(
            CameraSource::open(&config.camera_device, config.camera_width, config.camera_height)
                .with_context(|| format!("opening camera {}", config.camera_device))?,
        ),
        SourceKind::Directory => Box::new(DirectorySource::open(&config.frames_dir, config.loop_frames)?),
    };

    let frames = Arc::new(LatestFrame::new());
    let session = RecognitionSession::new(config.camera_id.clone(), config.session_config(), policy)?;
    let (engine, engine_thread) = engine::spawn_engine(EngineParts {
        store,
        embedder: Box::new(embedder),
        matcher: NearestNeighborMatcher::new(config.metric, threshold),
        session,
        frames: Arc::clone(&frames),
        tick_interval: config.tick_interval(),
    })?;

    let capture = CaptureWorker::spawn(source, Arc::clone(&frames), config.frame_interval())?;

    let service = AttendService {
        engine: engine.clone(),
        reader,
        frames,
        capture: capture.liveness(),
        metric: config.metric,
        threshold,
    };
    let builder = match config.bus {
        BusKind::System => connection::Builder::system()?,
        BusKind::Session => connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    let forwarder = tokio::spawn(forward_state(conn.clone(), engine.subscribe()));

    tracing::info!(
        camera = %config.camera_id,
        metric = %config.metric,
        threshold,
        %policy,
        source = ?config.source,
        bus = ?config.bus,
        "attendd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");

    forwarder.abort();
    capture.stop();
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine already stopped");
    }
    tokio::task::spawn_blocking(move || {
        capture.join();
        if engine_thread.join().is_err() {
            tracing::error!("engine thread panicked");
        }
    })
    .await?;

    Ok(())
}

/// Re-emit every engine status change as a `StateChanged` signal.
async fn forward_state(
    conn: zbus::Connection,
    mut rx: watch::Receiver<EngineStatus>,
) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, AttendService>(OBJECT_PATH)
        .await?;
    while rx.changed().await.is_ok() {
        let json = {
            let status = rx.borrow_and_update();
            serde_json::to_string(&*status)
        };
        let json = match json {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "could not serialize status");
                continue;
            }
        };
        if let Err(e) = AttendService::state_changed(iface.signal_emitter(), &json).await {
            tracing::warn!(error = %e, "StateChanged emit failed");
        }
    }
    Ok(())
}
