//! Command-line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use kubez_autoscaler::queue::BackoffConfig;
use kubez_autoscaler::{AnnotationKeys, ControllerConfig};
use kubez_common::leader_election::LeaderElectionConfig;
use kubez_common::telemetry::LogFormat;
use kubez_common::{CONTROLLER_NAME, DEFAULT_ANNOTATION_ROOT};

/// kubez-autoscaler - keeps HorizontalPodAutoscalers in sync with workload annotations
#[derive(Parser, Debug)]
#[command(name = "kubez-autoscaler", version, about, long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig; defaults to in-cluster config, then ~/.kube/config
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "KUBEZ_WORKERS", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Root prefix of the scaling annotations
    #[arg(long, env = "KUBEZ_ANNOTATION_ROOT", default_value = DEFAULT_ANNOTATION_ROOT)]
    pub annotation_root: String,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, env = "KUBEZ_API_TIMEOUT_SECS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub api_timeout_secs: u64,

    /// Retry delay after the first failure, in milliseconds
    #[arg(long, env = "KUBEZ_BACKOFF_INITIAL_MS", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub backoff_initial_ms: u64,

    /// Upper bound for retry delays, in seconds
    #[arg(long, env = "KUBEZ_BACKOFF_MAX_SECS", default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub backoff_max_secs: u64,

    /// Interval between full resyncs, in seconds (0 disables)
    #[arg(long, env = "KUBEZ_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Log output format: json or text
    #[arg(long, env = "KUBEZ_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Run leader election before starting the controller
    #[arg(long, env = "KUBEZ_LEADER_ELECT", default_value_t = true, action = ArgAction::Set)]
    pub leader_elect: bool,

    /// Name of the leader election Lease
    #[arg(long, env = "KUBEZ_LEADER_ELECT_LEASE_NAME", default_value = CONTROLLER_NAME)]
    pub leader_elect_lease_name: String,

    /// Namespace of the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    pub leader_elect_namespace: String,

    /// Holder identity; defaults to the pod name or hostname
    #[arg(long, env = "KUBEZ_LEADER_ELECT_IDENTITY")]
    pub leader_elect_identity: Option<String>,

    /// Lease duration, in seconds
    #[arg(long, default_value_t = 15)]
    pub leader_elect_lease_duration_secs: u64,

    /// Renew deadline, in seconds
    #[arg(long, default_value_t = 10)]
    pub leader_elect_renew_deadline_secs: u64,

    /// Retry period, in seconds
    #[arg(long, default_value_t = 2)]
    pub leader_elect_retry_period_secs: u64,
}

impl Cli {
    /// Reject combinations clap cannot check on its own
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_initial_ms > self.backoff_max_secs.saturating_mul(1000) {
            anyhow::bail!(
                "--backoff-initial-ms ({}) exceeds --backoff-max-secs ({})",
                self.backoff_initial_ms,
                self.backoff_max_secs
            );
        }
        if self.leader_elect
            && self.leader_elect_renew_deadline_secs >= self.leader_elect_lease_duration_secs
        {
            anyhow::bail!(
                "--leader-elect-renew-deadline-secs ({}) must be less than --leader-elect-lease-duration-secs ({})",
                self.leader_elect_renew_deadline_secs,
                self.leader_elect_lease_duration_secs
            );
        }
        if self.annotation_root.trim().is_empty() || self.annotation_root.contains('/') {
            anyhow::bail!("--annotation-root must be a non-empty DNS prefix without '/'");
        }
        Ok(())
    }

    /// Settings for the controller runner
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: usize::from(self.workers),
            annotation_keys: AnnotationKeys::new(self.annotation_root.trim()),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            backoff: BackoffConfig::new(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_secs(self.backoff_max_secs),
            ),
            resync_interval: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
        }
    }

    /// Lease settings, or `None` when leader election is disabled
    pub fn leader_election_config(&self) -> Option<LeaderElectionConfig> {
        if !self.leader_elect {
            return None;
        }
        let mut config = LeaderElectionConfig::new(
            &self.leader_elect_lease_name,
            &self.leader_elect_namespace,
            self.identity(),
        );
        config.lease_duration = Duration::from_secs(self.leader_elect_lease_duration_secs);
        config.renew_interval = Duration::from_secs(self.leader_elect_renew_deadline_secs);
        config.retry_interval = Duration::from_secs(self.leader_elect_retry_period_secs);
        Some(config)
    }

    fn identity(&self) -> String {
        self.leader_elect_identity
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{}", CONTROLLER_NAME, std::process::id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["kubez-autoscaler"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        cli.validate().unwrap();
        assert_eq!(cli.workers, 2);
        assert_eq!(cli.annotation_root, "hpa.caoyingjunz.autoscaler");
        assert!(cli.leader_elect);

        let config = cli.controller_config();
        assert_eq!(config.api_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(5));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(1000));
        assert_eq!(config.resync_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn leader_election_can_be_disabled() {
        let cli = parse(&["--leader-elect", "false"]);
        assert!(cli.leader_election_config().is_none());
    }

    #[test]
    fn leader_election_settings() {
        let cli = parse(&[
            "--leader-elect-identity",
            "pod-a",
            "--leader-elect-lease-duration-secs",
            "30",
            "--leader-elect-renew-deadline-secs",
            "20",
        ]);
        cli.validate().unwrap();
        let config = cli.leader_election_config().unwrap();
        assert_eq!(config.identity, "pod-a");
        assert_eq!(config.lease_name, "kubez-autoscaler");
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.renew_interval, Duration::from_secs(20));
        assert_eq!(config.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn custom_root_and_text_logs() {
        let cli = parse(&[
            "--annotation-root",
            "scaling.example.com",
            "--log-format",
            "text",
            "--resync-secs",
            "0",
        ]);
        cli.validate().unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        let config = cli.controller_config();
        assert_eq!(config.annotation_keys.root(), "scaling.example.com");
        assert_eq!(config.resync_interval, None);
    }

    #[test]
    fn rejects_zero_workers_and_unknown_log_format() {
        let argv = ["kubez-autoscaler", "--workers", "0"];
        assert!(Cli::try_parse_from(argv).is_err());
        let argv = ["kubez-autoscaler", "--log-format", "xml"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn rejects_inconsistent_settings() {
        assert!(parse(&["--backoff-initial-ms", "5000", "--backoff-max-secs", "1"])
            .validate()
            .is_err());
        assert!(parse(&["--leader-elect-renew-deadline-secs", "15"])
            .validate()
            .is_err());
        assert!(parse(&["--annotation-root", "a/b"]).validate().is_err());
    }
}
