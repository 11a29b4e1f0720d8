//! Shipper module construction.

use tokio::sync::mpsc;

use opsentra_core::config::OpsentraConfig;
use opsentra_core::error::OpsentraError;
use opsentra_shipper::config::ShipperPipelineConfig;
use opsentra_shipper::shipper::ShipperPipelineBuilder;

use super::ModuleHandle;

/// Build the shipper module from the loaded configuration.
///
/// Returns the module handle and the fatal-error channel the orchestrator
/// watches to turn broker exhaustion into a non-zero exit.
pub fn build(
    config: &OpsentraConfig,
) -> Result<(ModuleHandle, mpsc::Receiver<OpsentraError>), OpsentraError> {
    config.shipper.validate().map_err(OpsentraError::from)?;

    let pipeline_config = ShipperPipelineConfig::from_core(&config.shipper);
    let (pipeline, fatal_rx) = ShipperPipelineBuilder::new()
        .config(pipeline_config)
        .build()
        .map_err(OpsentraError::from)?;

    Ok((ModuleHandle::new("shipper", Box::new(pipeline)), fatal_rx))
}
