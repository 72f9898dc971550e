use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use api_types::SchedulerPolicy;
use clap::Parser;
use clap::Subcommand;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use utils::version;

use crate::device::cambricon::CambriconConfig;
use crate::device::hygon::HygonConfig;
use crate::device::nvidia::NvidiaConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {message}")]
    Read { message: String },
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Per-vendor device settings, usually loaded from YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub nvidia: NvidiaConfig,
    pub hygon: HygonConfig,
    pub cambricon: CambriconConfig,
}

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cluster-side scheduling loop
    Scheduler(SchedulerArgs),
    /// Publish this node's device inventory
    Register(RegisterArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct SchedulerArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "hami-scheduler",
        help = "Only pods with this schedulerName are scheduled"
    )]
    pub scheduler_name: String,

    #[arg(
        long,
        env = "HAMI_DEVICE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the per-vendor device config, e.g. /etc/hami/device-config.yaml"
    )]
    pub device_config: Option<PathBuf>,

    #[arg(
        long,
        help = "Rank nodes by usage with 'binpack' or 'spread' instead of by free device share"
    )]
    pub node_scheduler_policy: Option<SchedulerPolicy>,

    #[arg(
        long,
        default_value_t = SchedulerPolicy::Spread,
        help = "Device scheduling policy within a node, either 'binpack' or 'spread'"
    )]
    pub gpu_scheduler_policy: SchedulerPolicy,

    #[arg(
        long,
        env = "HAMI_NODELOCK_EXPIRE",
        default_value = "300",
        help = "Seconds after which a node lock is considered stale"
    )]
    pub node_lock_expire: u64,

    #[arg(
        long,
        default_value = "15",
        help = "Seconds between full node and pod resyncs"
    )]
    pub resync_interval: u64,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Write allocation decisions to this daily-rolling file"
    )]
    pub audit_log: Option<PathBuf>,
}

impl SchedulerArgs {
    pub fn node_lock_expire(&self) -> Duration {
        Duration::from_secs(self.node_lock_expire)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct RegisterArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "NODE_NAME", help = "Name of the node to register")]
    pub node_name: String,

    #[arg(
        long,
        default_value = "NVIDIA",
        help = "Vendor tag of the devices on this node, e.g. NVIDIA, DCU or MLU"
    )]
    pub device_type: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file listing this node's devices"
    )]
    pub inventory: PathBuf,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between registrations"
    )]
    pub register_interval: u64,

    #[arg(
        long,
        env = "HAMI_DEVICE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the per-vendor device config"
    )]
    pub device_config: Option<PathBuf>,
}

impl RegisterArgs {
    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval)
    }
}

/// Load the device config, falling back to built-in defaults without a path.
///
/// # Errors
///
/// - [`ConfigError::Read`] if the file cannot be read
/// - [`ConfigError::Parse`] if the file is not valid YAML for [`DeviceConfig`]
pub async fn load_device_config(path: Option<&Path>) -> Result<DeviceConfig, Report<ConfigError>> {
    let Some(path) = path else {
        tracing::info!("No device config given, using defaults");
        return Ok(DeviceConfig::default());
    };
    tracing::info!("Loading device configuration from {:?}", path);

    let content = tokio::fs::read_to_string(path)
        .await
        .change_context_lazy(|| ConfigError::Read {
            message: path.display().to_string(),
        })?;
    serde_yaml::from_str(&content).change_context_lazy(|| ConfigError::Parse {
        message: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;
    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::device::ring::AllocationPolicy;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn scheduler_flags_parse() {
        let cli = Cli::try_parse_from([
            "hami",
            "scheduler",
            "--node-scheduler-policy",
            "spread",
            "--node-lock-expire",
            "60",
        ])
        .unwrap();
        let Commands::Scheduler(args) = cli.command else {
            panic!("expected scheduler subcommand");
        };
        assert_eq!(args.node_scheduler_policy, Some(SchedulerPolicy::Spread));
        assert_eq!(args.gpu_scheduler_policy, SchedulerPolicy::Spread);
        assert_eq!(args.node_lock_expire(), Duration::from_secs(60));
        assert_eq!(args.scheduler_name, "hami-scheduler");
    }

    #[test]
    fn node_policy_is_opt_in() {
        let cli = Cli::try_parse_from(["hami", "scheduler"]).unwrap();
        let Commands::Scheduler(args) = cli.command else {
            panic!("expected scheduler subcommand");
        };
        assert_eq!(args.node_scheduler_policy, None);
    }

    #[tokio::test]
    async fn partial_yaml_keeps_defaults() {
        let yaml_content = r#"
nvidia:
  resourceCountName: example.com/gpu
  defaultMemory: 1024
cambricon:
  allocationPolicy: restricted
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = load_device_config(Some(temp_file.path())).await.unwrap();
        assert_eq!(config.nvidia.resource_count_name, "example.com/gpu");
        assert_eq!(config.nvidia.default_memory, 1024);
        assert_eq!(config.nvidia.resource_core_name, "nvidia.com/gpucores");
        assert_eq!(config.nvidia.default_gpu_num, 1);
        assert_eq!(config.cambricon.allocation_policy, AllocationPolicy::Restricted);
        assert_eq!(config.hygon, HygonConfig::default());
    }

    #[tokio::test]
    async fn missing_path_uses_defaults() {
        assert_eq!(load_device_config(None).await.unwrap(), DeviceConfig::default());
    }

    #[tokio::test]
    async fn invalid_yaml_is_a_parse_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"nvidia: [1, 2").unwrap();
        let err = load_device_config(Some(temp_file.path())).await.unwrap_err();
        assert!(matches!(err.current_context(), ConfigError::Parse { .. }));
    }
}
