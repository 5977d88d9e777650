use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const LOGS_PREFIX: &str = "logs:";

/// A named broadcast channel viewers can subscribe to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Pods,
    Deployments,
    Metrics,
    /// Log tail of a single target (pod name)
    Logs(String),
}

impl Topic {
    pub fn logs(target: impl Into<String>) -> Self {
        Self::Logs(target.into())
    }

    /// Target name for `logs:<target>` topics
    pub fn log_target(&self) -> Option<&str> {
        match self {
            Self::Logs(target) => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pods => f.write_str("pods"),
            Self::Deployments => f.write_str("deployments"),
            Self::Metrics => f.write_str("metrics"),
            Self::Logs(target) => write!(f, "{LOGS_PREFIX}{target}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicParseError {
    #[error("unknown topic '{0}'")]
    Unknown(String),
    #[error("log topic is missing a target name")]
    EmptyTarget,
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pods" => Ok(Self::Pods),
            "deployments" => Ok(Self::Deployments),
            "metrics" => Ok(Self::Metrics),
            other => match other.strip_prefix(LOGS_PREFIX) {
                Some(target) if target.trim().is_empty() => Err(TopicParseError::EmptyTarget),
                Some(target) => Ok(Self::Logs(target.to_string())),
                None => Err(TopicParseError::Unknown(other.to_string())),
            },
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}
