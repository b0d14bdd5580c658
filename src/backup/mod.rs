mod logic;
pub(crate) mod capture;
pub(crate) mod contents_upload;
pub(crate) mod db_dump;
pub(crate) mod s3_upload;
pub(crate) mod sink;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BackupPlan, DEFAULT_CONTAINER_CLI};
use crate::errors::{PipelineError, Stage};
use crate::utils::container::CliContainerResolver;
use crate::utils::identity::OsIdentity;
pub use sink::Location;
use sink::UploadSink;

/// Public entry point for the backup process.
///
/// Returns `None` for a dry run, which stops once the command and destination are known.
pub async fn run_backup_flow(
    plan: BackupPlan,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<Option<Location>, PipelineError> {
    let cli = plan
        .container
        .as_ref()
        .map_or(DEFAULT_CONTAINER_CLI, |request| request.cli.as_str());
    let resolver = CliContainerResolver::new(cli);

    info!(
        state = "ConfigResolved",
        scope = %plan.scope.label(),
        containerized = plan.container.is_some()
    );
    let settings = logic::resolve_execution(plan, &resolver).await?;

    // Built only once the container is known; a failure here stops the run before any dump.
    let sink = UploadSink::for_settings(&settings)
        .await
        .map_err(PipelineError::at(Stage::Preflight))?;

    if dry_run {
        let spec = db_dump::build(&settings);
        println!("Command:     {}", spec.redacted());
        println!("Capture:     {:?}", settings.capture_mode());
        println!("Destination: {}", sink.describe());
        info!("Dry run, nothing captured");
        return Ok(None);
    }

    logic::perform_backup(&settings, &OsIdentity, &sink, cancel)
        .await
        .map(Some)
}
