//! Aggregator module construction.

use tokio::sync::mpsc;

use opsentra_aggregator::aggregator::AggregatorPipelineBuilder;
use opsentra_aggregator::config::AggregatorPipelineConfig;
use opsentra_core::config::OpsentraConfig;
use opsentra_core::error::OpsentraError;

use super::ModuleHandle;

/// Build the aggregator module from the loaded configuration.
///
/// Returns the module handle and the fatal-error channel the orchestrator
/// watches to turn broker exhaustion into a non-zero exit.
pub fn build(
    config: &OpsentraConfig,
) -> Result<(ModuleHandle, mpsc::Receiver<OpsentraError>), OpsentraError> {
    config.aggregator.validate().map_err(OpsentraError::from)?;

    let pipeline_config = AggregatorPipelineConfig::from_core(&config.aggregator);
    let (pipeline, fatal_rx) = AggregatorPipelineBuilder::new()
        .config(pipeline_config)
        .build()
        .map_err(OpsentraError::from)?;

    Ok((ModuleHandle::new("aggregator", Box::new(pipeline)), fatal_rx))
}
