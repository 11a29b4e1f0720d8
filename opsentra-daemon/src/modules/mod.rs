//! Module registry and initialization.
//!
//! Each OpSentra role crate is wrapped as a [`ModuleHandle`] that provides
//! uniform lifecycle management via the [`DynPipeline`] trait.
//!
//! The [`ModuleRegistry`] tracks registered modules and supports ordered
//! start/stop operations: start in registration order, stop in reverse.

pub mod aggregator;
pub mod shipper;

use opsentra_core::error::OpsentraError;
use opsentra_core::pipeline::DynPipeline;
use tracing::{error, info, warn};

use crate::health::ModuleHealth;

/// A handle to a registered module.
///
/// Wraps a `Box<dyn DynPipeline>` with its name for logging and health
/// reporting.
pub struct ModuleHandle {
    /// Module name for logging and health reporting.
    pub name: String,
    /// The module's pipeline implementation (start/stop/health_check).
    pub pipeline: Box<dyn DynPipeline>,
}

impl ModuleHandle {
    /// Create a new module handle.
    pub fn new(name: impl Into<String>, pipeline: Box<dyn DynPipeline>) -> Self {
        Self {
            name: name.into(),
            pipeline,
        }
    }
}

/// Ordered collection of modules.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleHandle>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Registration order is start order.
    pub fn register(&mut self, handle: ModuleHandle) {
        self.modules.push(handle);
    }

    /// Number of registered modules.
    pub fn count(&self) -> usize {
        self.modules.len()
    }

    /// Start all modules in registration order.
    ///
    /// On failure, already-started modules are stopped in reverse order
    /// before the error is returned.
    pub async fn start_all(&mut self) -> Result<(), OpsentraError> {
        let mut started = 0;

        for index in 0..self.modules.len() {
            let name = self.modules[index].name.clone();
            info!(module = %name, "starting module");
            if let Err(e) = self.modules[index].pipeline.start().await {
                error!(module = %name, error = %e, "module start failed, rolling back");
                for rollback in (0..started).rev() {
                    let rollback_name = self.modules[rollback].name.clone();
                    if let Err(stop_err) = self.modules[rollback].pipeline.stop().await {
                        warn!(
                            module = %rollback_name,
                            error = %stop_err,
                            "rollback stop failed"
                        );
                    }
                }
                return Err(e);
            }
            started += 1;
        }

        Ok(())
    }

    /// Stop all modules in reverse registration order.
    ///
    /// Every module is attempted; the first error is returned after all
    /// stops have run.
    pub async fn stop_all(&mut self) -> Result<(), OpsentraError> {
        let mut first_error = None;

        for handle in self.modules.iter_mut().rev() {
            info!(module = %handle.name, "stopping module");
            if let Err(e) = handle.pipeline.stop().await {
                warn!(module = %handle.name, error = %e, "module stop failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Collect every module's current health.
    pub async fn health_check_all(&self) -> Vec<ModuleHealth> {
        let mut reports = Vec::with_capacity(self.modules.len());
        for handle in &self.modules {
            reports.push(ModuleHealth {
                name: handle.name.clone(),
                status: handle.pipeline.health_check().await,
            });
        }
        reports
    }
}
