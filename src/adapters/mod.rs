use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::JobApi;

mod http;
mod simulated;

pub use http::HttpJobApi;
pub use simulated::{ApiCall, SimulatedApi};

pub fn get_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn JobApi>> {
    if config.simulation {
        info!("Using simulated job service");
        return Ok(Arc::new(SimulatedApi::with_defaults()));
    }

    info!(base_url = %config.api_base_url, "Using remote job service");
    let api = HttpJobApi::new(config.api_base_url.clone(), config.request_timeout())?;
    Ok(Arc::new(api))
}
