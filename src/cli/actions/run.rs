use crate::cli::actions::Action;
use crate::{config, exporter, manager};
use anyhow::Result;
use std::sync::Arc;

/// Handle the run action: load config, wire the managers for the region
/// and serve scrapes.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the AWS clients cannot be
/// initialized, or the exporter fails to start.
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run { config, port } => {
            let settings = Arc::new(config::load(&config, port)?);

            let scheduler = manager::build_scheduler(Arc::clone(&settings)).await?;

            exporter::serve(settings, scheduler).await?;
        }
    }

    Ok(())
}
