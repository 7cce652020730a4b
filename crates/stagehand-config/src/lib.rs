//! Process configuration, read once from the environment and threaded
//! explicitly through every component that needs it.

pub mod error;

pub use error::ConfigError;

use std::collections::HashMap;
use std::time::Duration;

/// Per-kind checkout timeouts.
///
/// Production deployments run with an hour per resource kind; tests override
/// these with second-level values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub iut: Duration,
    pub execution_space: Duration,
    pub log_area: Duration,
    pub event_data: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            iut: Duration::from_secs(3600),
            execution_space: Duration::from_secs(3600),
            log_area: Duration::from_secs(3600),
            event_data: Duration::from_secs(10),
        }
    }
}

impl Timeouts {
    /// The overall checkout deadline: the three kind timeouts plus slack for
    /// the bookkeeping between driver calls.
    pub fn checkout(&self) -> Duration {
        self.iut + self.execution_space + self.log_area + Duration::from_secs(10)
    }
}

/// RabbitMQ discovery parameters forwarded to remote providers so that the
/// test runner they spin up can reach the event bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RabbitMq {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub vhost: String,
    pub ssl: bool,
}

/// How published environments surface externally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishMode {
    /// Upload the sub-suite to the log area and announce the upload URI.
    Upload,
    /// Create an Environment resource through the cluster API. Carries the
    /// names of the originating EnvironmentRequest and TestRun resources.
    Orchestrated { request: String, testrun: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub timeouts: Timeouts,
    /// Upper bound on IUTs reserved in one orchestrator iteration.
    pub max_parallel_iuts: Option<usize>,
    /// Symmetric key for sealing credentials sent to remote providers.
    pub encryption_key: Option<String>,
    pub publish_mode: PublishMode,
    pub etcd_host: String,
    pub etcd_port: u16,
    pub etos_api: String,
    pub graphql_server: String,
    pub source_host: String,
    pub test_runner_version: String,
    pub rabbitmq: RabbitMq,
}

impl Config {
    /// Read the full configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Same as [`Config::from_env`] but from an explicit map, so tests never
    /// touch process globals.
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let timeouts = Timeouts {
            iut: seconds(env, "WAIT_FOR_IUT_TIMEOUT", 3600)?,
            execution_space: seconds(env, "WAIT_FOR_EXECUTION_SPACE_TIMEOUT", 3600)?,
            log_area: seconds(env, "WAIT_FOR_LOG_AREA_TIMEOUT", 3600)?,
            event_data: seconds(env, "EVENT_DATA_TIMEOUT", 10)?,
        };

        let max_parallel_iuts = match env.get("MAX_PARALLEL_IUTS") {
            Some(raw) => Some(raw.parse::<usize>().map_err(|e| {
                ConfigError::invalid("MAX_PARALLEL_IUTS", e.to_string())
            })?),
            None => None,
        };

        let publish_mode = match (env.get("REQUEST"), env.get("TESTRUN")) {
            (Some(request), Some(testrun)) => PublishMode::Orchestrated {
                request: request.clone(),
                testrun: testrun.clone(),
            },
            (None, None) => PublishMode::Upload,
            _ => {
                return Err(ConfigError::invalid(
                    "REQUEST",
                    "REQUEST and TESTRUN must be set together for orchestrated mode",
                ))
            }
        };

        let rabbitmq = RabbitMq {
            host: string(env, "RABBITMQ_HOST", "rabbitmq"),
            port: number(env, "RABBITMQ_PORT", 5672)? as u16,
            username: string(env, "RABBITMQ_USERNAME", "guest"),
            password: string(env, "RABBITMQ_PASSWORD", "guest"),
            exchange: string(env, "RABBITMQ_EXCHANGE", "amq.fanout"),
            vhost: string(env, "RABBITMQ_VHOST", "/"),
            ssl: env.get("RABBITMQ_SSL").map(|v| v == "true").unwrap_or(false),
        };

        Ok(Config {
            timeouts,
            max_parallel_iuts,
            encryption_key: env.get("ENCRYPTION_KEY").cloned(),
            publish_mode,
            etcd_host: string(env, "ETCD_HOST", "etcd-client"),
            etcd_port: number(env, "ETCD_PORT", 2379)? as u16,
            etos_api: string(env, "ETOS_API", "http://etos-api"),
            graphql_server: string(env, "ETOS_GRAPHQL_SERVER", "http://etos-graphql"),
            source_host: string(env, "SOURCE_HOST", ""),
            test_runner_version: string(env, "ETR_VERSION", ""),
            rabbitmq,
        })
    }

    pub fn etcd_endpoint(&self) -> String {
        format!("http://{}:{}", self.etcd_host, self.etcd_port)
    }
}

fn string(env: &HashMap<String, String>, name: &str, default: &str) -> String {
    env.get(name).cloned().unwrap_or_else(|| default.to_string())
}

fn number(env: &HashMap<String, String>, name: &str, default: u64) -> Result<u64, ConfigError> {
    match env.get(name) {
        Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::invalid(name, e.to_string())),
        None => Ok(default),
    }
}

fn seconds(
    env: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    number(env, name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_to_upload_mode_with_hour_timeouts() {
        let config = Config::from_map(&env(&[])).unwrap();
        assert_eq!(config.publish_mode, PublishMode::Upload);
        assert_eq!(config.timeouts.iut, Duration::from_secs(3600));
        assert_eq!(config.timeouts.checkout(), Duration::from_secs(3 * 3600 + 10));
    }

    #[test]
    fn timeouts_read_from_environment() {
        let config = Config::from_map(&env(&[
            ("WAIT_FOR_IUT_TIMEOUT", "1"),
            ("WAIT_FOR_EXECUTION_SPACE_TIMEOUT", "1"),
            ("WAIT_FOR_LOG_AREA_TIMEOUT", "1"),
        ]))
        .unwrap();
        assert_eq!(config.timeouts.checkout(), Duration::from_secs(13));
    }

    #[test]
    fn orchestrated_mode_requires_both_resource_names() {
        let config = Config::from_map(&env(&[("REQUEST", "req-1"), ("TESTRUN", "tr-1")])).unwrap();
        assert!(matches!(config.publish_mode, PublishMode::Orchestrated { .. }));

        assert!(Config::from_map(&env(&[("REQUEST", "req-1")])).is_err());
    }

    #[test]
    fn bad_timeout_is_rejected() {
        assert!(Config::from_map(&env(&[("WAIT_FOR_IUT_TIMEOUT", "soon")])).is_err());
    }
}
