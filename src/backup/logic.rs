// dumpship/src/backup/logic.rs
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::capture::{DumpArtifact, ScratchFile, capture_to_file, start_stream};
use super::db_dump::{self, ProcessSpec};
use super::sink::{Location, UploadSink};
use crate::config::{BackupPlan, BackupSettings, CaptureMode, ContainerTarget, ExecutionContext};
use crate::errors::{BackupError, PipelineError, Stage};
use crate::utils::container::ContainerResolver;
use crate::utils::identity::{IdentityProvider, ensure_os_user};

type StageResult<T> = Result<T, PipelineError>;

/// Fixes the execution context. A configured container id is used as is; a pattern goes
/// through the resolver.
pub async fn resolve_execution(
    plan: BackupPlan,
    resolver: &dyn ContainerResolver,
) -> StageResult<BackupSettings> {
    let execution = match &plan.container {
        None => ExecutionContext::LocalProcess,
        Some(request) => {
            let container_id = match &request.target {
                ContainerTarget::Id(id) => id.clone(),
                ContainerTarget::Pattern(pattern) => resolver
                    .resolve(pattern)
                    .await
                    .map_err(PipelineError::at(Stage::ResolveContainer))?,
            };
            ExecutionContext::ContainerizedProcess {
                container_id,
                cli: request.cli.clone(),
            }
        }
    };
    if let ExecutionContext::ContainerizedProcess { container_id, cli } = &execution {
        info!(state = "ContainerResolved", container_id = %container_id, cli = %cli);
    }
    Ok(plan.into_settings(execution))
}

/// Builds the command and checks the run may start.
pub async fn prepare_run(
    settings: &BackupSettings,
    sink: &UploadSink,
    identity: &dyn IdentityProvider,
) -> StageResult<ProcessSpec> {
    let spec = db_dump::build(settings);
    info!(state = "CommandBuilt", command = %spec.redacted());

    if settings.requires_os_identity() {
        ensure_os_user(identity, &settings.os_user).map_err(PipelineError::at(Stage::Preflight))?;
    }
    sink.preflight()
        .await
        .map_err(PipelineError::at(Stage::Preflight))?;
    Ok(spec)
}

async fn create_temp_dir(dir: &Path) -> Result<(), BackupError> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Captures the dump and hands it to the sink exactly once.
pub async fn capture_and_deliver(
    settings: &BackupSettings,
    spec: &ProcessSpec,
    sink: &UploadSink,
    cancel: &CancellationToken,
) -> StageResult<Location> {
    let mode = settings.capture_mode();
    info!(mode = ?mode, destination = %sink.describe(), "Capturing backup");

    match mode {
        CaptureMode::File => {
            create_temp_dir(&settings.temp_dir)
                .await
                .map_err(PipelineError::at(Stage::Capture))?;
            let scratch = ScratchFile::new(settings.dump_path());
            let outcome = capture_file_then_deliver(spec, &scratch, sink, cancel).await;
            scratch.remove().await;
            outcome
        }
        CaptureMode::Streaming => {
            let live = start_stream(spec, settings.dump_file_name())
                .map_err(PipelineError::at(Stage::Capture))?;
            info!(state = "Captured", artifact = %live.name(), streaming = true);
            sink.deliver(DumpArtifact::Stream(live), cancel)
                .await
                .map_err(PipelineError::at(Stage::Deliver))
        }
    }
}

async fn capture_file_then_deliver(
    spec: &ProcessSpec,
    scratch: &ScratchFile,
    sink: &UploadSink,
    cancel: &CancellationToken,
) -> StageResult<Location> {
    let dump = capture_to_file(spec, scratch.path(), cancel)
        .await
        .map_err(PipelineError::at(Stage::Capture))?;
    info!(state = "Captured", artifact = %dump.name, bytes = dump.len);

    sink.deliver(DumpArtifact::File(dump), cancel)
        .await
        .map_err(PipelineError::at(Stage::Deliver))
}

/// Runs every stage after container resolution and reports where the dump went.
pub async fn perform_backup(
    settings: &BackupSettings,
    identity: &dyn IdentityProvider,
    sink: &UploadSink,
    cancel: &CancellationToken,
) -> StageResult<Location> {
    let spec = prepare_run(settings, sink, identity).await?;
    let location = capture_and_deliver(settings, &spec, sink, cancel).await;
    match &location {
        Ok(location) => info!(state = "Delivered", location = %location),
        Err(e) => warn!(state = "Failed", stage = %e.stage, error = %e.source),
    }
    location
}
