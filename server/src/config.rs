use anyhow::Result;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{metrics, queue, store};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationsConfig {
    pub store: store::Config,
    pub queue: queue::Config,
    pub metrics: metrics::Config,
}

impl MutationsConfig {
    pub fn to_string_pretty(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub fn binary_config() -> Result<MutationsConfig> {
    let config = Config::builder()
        .add_source(File::with_name("/etc/mutations.yaml").required(false))
        .add_source(File::with_name("./mutations.yaml").required(false))
        .add_source(File::with_name("/etc/mutations.toml").required(false))
        .add_source(File::with_name("./mutations.toml").required(false))
        .add_source(
            config::Environment::with_prefix("MUTATIONS")
                .try_parsing(true)
                .separator("__"),
        )
        .build()?;

    let config: MutationsConfig = config.try_deserialize()?;

    for line in config.to_string_pretty()?.lines() {
        info!("config toml: {}", line);
    }

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use config::FileFormat;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_layered_toml() -> Result<()> {
        let config: MutationsConfig = Config::builder()
            .add_source(File::from_str(
                r#"
                [store]
                data_path = "/var/lib/mutations/db.sqlite"
                busy_timeout = "250ms"

                [queue]
                read_batch_size = 7
                "#,
                FileFormat::Toml,
            ))
            .build()?
            .try_deserialize()?;

        assert_eq!(
            config.store.data_path,
            PathBuf::from("/var/lib/mutations/db.sqlite")
        );
        assert_eq!(config.store.busy_timeout, Duration::from_millis(250));
        assert_eq!(
            config.store.acquire_timeout,
            store::Config::default().acquire_timeout
        );
        assert_eq!(config.queue.read_batch_size, 7);
        assert!(!config.metrics.enabled);

        Ok(())
    }

    #[test]
    fn test_pretty_roundtrip() -> Result<()> {
        let config = MutationsConfig::default();
        let pretty = config.to_string_pretty()?;
        let back: MutationsConfig = toml::from_str(&pretty)?;
        assert_eq!(back.store.max_connections, config.store.max_connections);
        assert_eq!(back.metrics.bind, config.metrics.bind);
        Ok(())
    }
}
