use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::federation::object_model::ObjectModel;

/// Default port the RTI listens on for federate connections.
pub const DEFAULT_LISTEN_PORT: u16 = 50_800;
/// How long registrations of the same sync point label may race before the lowest
/// handle is announced as registrant.
pub const DEFAULT_SYNC_GRACE_PERIOD: Duration = Duration::from_millis(250);
/// How long a federate waits for the reply to a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an owner has to answer a divestiture request before the acquisition fails.
pub const DEFAULT_DIVESTITURE_TIMEOUT: Duration = Duration::from_secs(10);
/// Capacity of the per-federation event queue and of each federate's outgoing queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
/// Largest frame accepted on a network connection.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "rti", about = "Runtime infrastructure for federated simulations")]
pub struct ConfigArgs {
    /// Path to a TOML configuration file. Command line arguments take precedence.
    #[arg(long, env = "RTI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on for federate connections.
    #[arg(long, env = "RTI_LISTEN_ADDRESS")]
    pub listen_address: Option<IpAddr>,

    #[arg(long, env = "RTI_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Race window for sync point registrations, in milliseconds.
    #[arg(long, env = "RTI_SYNC_GRACE_PERIOD_MS")]
    pub sync_grace_period_ms: Option<u64>,

    #[arg(long, env = "RTI_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    #[arg(long, env = "RTI_DIVESTITURE_TIMEOUT_MS")]
    pub divestiture_timeout_ms: Option<u64>,

    #[arg(long, env = "RTI_CHANNEL_CAPACITY")]
    pub channel_capacity: Option<usize>,

    #[arg(long, env = "RTI_MAX_FRAME_SIZE")]
    pub max_frame_size: Option<usize>,

    /// Object model shared by every federation this RTI hosts.
    #[arg(long, env = "RTI_OBJECT_MODEL")]
    pub object_model: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

impl ConfigArgs {
    fn read_config(path: &Path) -> anyhow::Result<ConfigFile> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing configuration file {}", path.display()))
    }

    /// Merges the command line over the configuration file (if any) over the defaults.
    pub fn build(mut self) -> anyhow::Result<Config> {
        if let Some(path) = self.config.as_ref() {
            let cfg = Self::read_config(path)?;
            tracing::debug!(path = %path.display(), "Loaded configuration file");
            if let Some(address) = cfg.listen_address {
                self.listen_address.get_or_insert(address);
            }
            if let Some(port) = cfg.listen_port {
                self.listen_port.get_or_insert(port);
            }
            if let Some(ms) = cfg.sync_grace_period_ms {
                self.sync_grace_period_ms.get_or_insert(ms);
            }
            if let Some(ms) = cfg.request_timeout_ms {
                self.request_timeout_ms.get_or_insert(ms);
            }
            if let Some(ms) = cfg.divestiture_timeout_ms {
                self.divestiture_timeout_ms.get_or_insert(ms);
            }
            if let Some(capacity) = cfg.channel_capacity {
                self.channel_capacity.get_or_insert(capacity);
            }
            if let Some(size) = cfg.max_frame_size {
                self.max_frame_size.get_or_insert(size);
            }
            if let Some(path) = cfg.object_model {
                self.object_model.get_or_insert(path);
            }
            if let Some(level) = cfg.log_level {
                self.log_level.get_or_insert(level);
            }
        }

        let rti = RtiConfig {
            sync_grace_period: self
                .sync_grace_period_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SYNC_GRACE_PERIOD),
            request_timeout: self
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            divestiture_timeout: self
                .divestiture_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DIVESTITURE_TIMEOUT),
            channel_capacity: self.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
        };
        rti.validate()?;

        let max_frame_size = self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        anyhow::ensure!(max_frame_size > 0, "max frame size must be positive");

        Ok(Config {
            listen_address: self
                .listen_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            listen_port: self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
            max_frame_size,
            object_model: self.object_model,
            log_level: self.log_level.unwrap_or(LevelFilter::INFO),
            rti,
        })
    }
}

/// On-disk form of the configuration. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    listen_address: Option<IpAddr>,
    listen_port: Option<u16>,
    sync_grace_period_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    divestiture_timeout_ms: Option<u64>,
    channel_capacity: Option<usize>,
    max_frame_size: Option<usize>,
    object_model: Option<PathBuf>,
    #[serde(default, with = "serde_log_level_filter::option")]
    log_level: Option<LevelFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub max_frame_size: usize,
    pub object_model: Option<PathBuf>,
    #[serde(with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
    pub rti: RtiConfig,
}

impl Config {
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    /// Loads the configured object model, or an empty one when none is configured.
    pub fn load_object_model(&self) -> anyhow::Result<ObjectModel> {
        match &self.object_model {
            Some(path) => ObjectModel::load(path)
                .with_context(|| format!("loading object model {}", path.display())),
            None => Ok(ObjectModel::new()),
        }
    }
}

/// Timing and queueing parameters shared by the RTI and federate stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtiConfig {
    #[serde(with = "duration_ms")]
    pub sync_grace_period: Duration,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub divestiture_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for RtiConfig {
    fn default() -> Self {
        Self {
            sync_grace_period: DEFAULT_SYNC_GRACE_PERIOD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            divestiture_timeout: DEFAULT_DIVESTITURE_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl RtiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.sync_grace_period.is_zero(),
            "sync grace period must be positive"
        );
        anyhow::ensure!(
            self.sync_grace_period < self.request_timeout,
            "sync grace period ({:?}) must be shorter than the request timeout ({:?})",
            self.sync_grace_period,
            self.request_timeout
        );
        anyhow::ensure!(
            !self.divestiture_timeout.is_zero(),
            "divestiture timeout must be positive"
        );
        anyhow::ensure!(self.channel_capacity > 0, "channel capacity must be positive");
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn parse_log_level_str<'a, D>(level: &str) -> Result<LevelFilter, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        parse_log_level_str::<D>(&level)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<LevelFilter>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|level| parse_log_level_str::<D>(&level))
                .transpose()
        }
    }
}

/// Installs the global tracing subscriber once; later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let config = ConfigArgs::default().build().unwrap();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.rti, RtiConfig::default());
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.log_level, LevelFilter::INFO);
    }

    #[test]
    fn arguments_override_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
            listen-port = 6000
            sync-grace-period-ms = 100
            divestiture-timeout-ms = 2000
            log-level = "debug"
            "#
        )?;
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            listen_port: Some(7000),
            ..Default::default()
        };
        let config = args.build()?;
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.rti.sync_grace_period, Duration::from_millis(100));
        assert_eq!(config.rti.divestiture_timeout, Duration::from_secs(2));
        assert_eq!(config.rti.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        Ok(())
    }

    #[test]
    fn grace_period_must_fit_in_request_timeout() {
        let args = ConfigArgs {
            sync_grace_period_ms: Some(6_000),
            request_timeout_ms: Some(5_000),
            ..Default::default()
        };
        assert!(args.build().is_err());

        let args = ConfigArgs {
            sync_grace_period_ms: Some(0),
            ..Default::default()
        };
        assert!(args.build().is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "grace = 3")?;
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(args.build().is_err());
        Ok(())
    }

    #[test]
    fn object_model_is_loaded_from_path() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
            [[classes]]
            handle = 1
            name = "Vehicle"
            attributes = [1, 2]
            "#
        )?;
        let config = ConfigArgs {
            object_model: Some(file.path().to_path_buf()),
            ..Default::default()
        }
        .build()?;
        let model = config.load_object_model()?;
        assert_eq!(model.classes().count(), 1);
        Ok(())
    }
}
