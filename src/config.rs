use chrono::NaiveDate;
use clap::{Args, ValueEnum};

pub const DEFAULT_HISTORY_EPOCH: &str = "2024-01-01";

/// What to do when a student already has a record for the same date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DuplicatePolicy {
    /// Store every submission.
    #[default]
    Allow,
    /// Reject a second record for the same student and date.
    OnePerDay,
}

#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// First day considered by `fullHistory=true` statistics
    #[arg(long, env = "ATTENDANCE_EPOCH", default_value = DEFAULT_HISTORY_EPOCH)]
    pub history_epoch: NaiveDate,
    #[arg(
        long,
        env = "ATTENDANCE_DUPLICATE_POLICY",
        value_enum,
        default_value_t = DuplicatePolicy::Allow
    )]
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub history_epoch: NaiveDate,
    pub duplicate_policy: DuplicatePolicy,
}

impl From<ServiceArgs> for ServiceConfig {
    fn from(args: ServiceArgs) -> Self {
        Self {
            history_epoch: args.history_epoch,
            duplicate_policy: args.duplicate_policy,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            history_epoch: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or(NaiveDate::MIN),
            duplicate_policy: DuplicatePolicy::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        service: ServiceArgs,
    }

    #[test]
    fn defaults_match_service_config_default() {
        let harness = Harness::parse_from(["attendance"]);
        let config = ServiceConfig::from(harness.service);
        let default = ServiceConfig::default();
        assert_eq!(config.history_epoch, default.history_epoch);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Allow);
    }

    #[test]
    fn parses_policy_and_epoch() {
        let harness = Harness::parse_from([
            "attendance",
            "--history-epoch",
            "2023-09-01",
            "--duplicate-policy",
            "one-per-day",
        ]);
        assert_eq!(
            harness.service.history_epoch,
            NaiveDate::from_ymd_opt(2023, 9, 1).unwrap()
        );
        assert_eq!(harness.service.duplicate_policy, DuplicatePolicy::OnePerDay);
    }
}
