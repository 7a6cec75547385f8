use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

pub fn start_metrics(config: Config) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.bind)
        .add_global_label("system", "mutations")
        .install()?;

    Ok(())
}
