use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kbroker_core::{Format, TopicDetail};
use kbroker_reconcile::{Configs, RetryConfig};

#[derive(Parser, Debug)]
#[command(name = "kbroker-controller", version, about = "Kafka Broker control plane")]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the Broker controller (default)
    Run,
    /// Print the decoded data-plane artifact
    Inspect {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Namespace of the data-plane pods and the defaults ConfigMap
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = "knative-eventing")]
    pub system_namespace: String,

    #[arg(long, env = "DATA_PLANE_CONFIG_MAP_NAMESPACE", default_value = "knative-eventing")]
    pub data_plane_config_map_namespace: String,

    #[arg(long, env = "DATA_PLANE_CONFIG_MAP_NAME", default_value = "kafka-broker-brokers-triggers")]
    pub data_plane_config_map_name: String,

    /// Artifact encoding, must match the data plane: json or protobuf
    #[arg(long, env = "DATA_PLANE_CONFIG_FORMAT", default_value = "json")]
    pub data_plane_config_format: Format,

    /// ConfigMap holding cluster-wide topic and bootstrap defaults
    #[arg(long, env = "GENERAL_CONFIG_MAP_NAME", default_value = "kafka-broker-config")]
    pub general_config_map_name: String,

    #[arg(long, env = "RECEIVER_SELECTOR", default_value = "app=kafka-broker-receiver")]
    pub receiver_selector: String,

    #[arg(long, env = "DISPATCHER_SELECTOR", default_value = "app=kafka-broker-dispatcher")]
    pub dispatcher_selector: String,

    /// Host of the ingress Service, used for Broker addresses
    #[arg(long, env = "INGRESS_HOST", default_value = "kafka-broker-receiver.knative-eventing.svc.cluster.local")]
    pub ingress_host: String,

    #[arg(long, env = "KBROKER_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    #[arg(long, env = "KBROKER_RETRY_BACKOFF_MS", default_value_t = 10)]
    pub retry_backoff_ms: u64,

    /// Used until the defaults ConfigMap says otherwise
    #[arg(long, env = "KBROKER_DEFAULT_PARTITIONS", default_value_t = 10)]
    pub default_partitions: i32,

    #[arg(long, env = "KBROKER_DEFAULT_REPLICATION_FACTOR", default_value_t = 1)]
    pub default_replication_factor: i16,

    #[arg(long, env = "KBROKER_ADMIN_TIMEOUT_MS", default_value_t = 5000)]
    pub admin_timeout_ms: i32,
}

impl Settings {
    pub fn configs(&self) -> Configs {
        Configs {
            system_namespace: self.system_namespace.clone(),
            data_plane_config_map_namespace: self.data_plane_config_map_namespace.clone(),
            data_plane_config_map_name: self.data_plane_config_map_name.clone(),
            data_plane_config_format: self.data_plane_config_format,
            defaults_config_map_name: self.general_config_map_name.clone(),
            receiver_selector: self.receiver_selector.clone(),
            dispatcher_selector: self.dispatcher_selector.clone(),
            ingress_host: self.ingress_host.clone(),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(self.retry_backoff_ms),
                ..RetryConfig::with_max_attempts(self.retry_attempts)
            },
        }
    }

    pub fn topic_detail(&self) -> TopicDetail {
        TopicDetail { num_partitions: self.default_partitions, replication_factor: self.default_replication_factor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configs_defaults() {
        let cli = Cli::try_parse_from(["kbroker-controller"]).unwrap();
        assert_eq!(cli.command, None);
        let configs = cli.settings.configs();
        let expected = Configs::default();
        assert_eq!(configs.data_plane_config_map_as_string(), expected.data_plane_config_map_as_string());
        assert_eq!(configs.receiver_selector, expected.receiver_selector);
        assert_eq!(configs.retry, expected.retry);
        assert_eq!(cli.settings.topic_detail(), TopicDetail::default());
    }

    #[test]
    fn retry_overrides_keep_other_defaults() {
        let cli = Cli::try_parse_from(["kbroker-controller", "--retry-attempts", "9", "--retry-backoff-ms", "50"]).unwrap();
        let retry = cli.settings.configs().retry;
        assert_eq!(retry.max_attempts, 9);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, RetryConfig::default().max_delay);
    }

    #[test]
    fn format_and_subcommand() {
        let cli = Cli::try_parse_from(["kbroker-controller", "--data-plane-config-format", "protobuf", "inspect", "-o", "json"]).unwrap();
        assert_eq!(cli.settings.data_plane_config_format, Format::Protobuf);
        assert_eq!(cli.command, Some(Commands::Inspect { output: Output::Json }));
        assert!(Cli::try_parse_from(["kbroker-controller", "--data-plane-config-format", "yaml"]).is_err());
    }
}
