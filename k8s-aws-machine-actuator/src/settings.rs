use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Controller timings, read from the environment.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ActuatorSettings {
    /// How often a healthy machine is reconciled again.
    #[serde(
        rename = "RESYNC_PERIOD",
        default = "default_resync_period",
        deserialize_with = "deserialize_duration"
    )]
    pub resync_period: Duration,

    #[serde(
        rename = "ERROR_REQUEUE_PERIOD",
        default = "default_requeue_period",
        deserialize_with = "deserialize_duration"
    )]
    pub error_requeue_period: Duration,

    /// Instances still pending get polled at this rate until their addresses settle.
    #[serde(
        rename = "PENDING_REQUEUE_PERIOD",
        default = "default_requeue_period",
        deserialize_with = "deserialize_duration"
    )]
    pub pending_requeue_period: Duration,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        ActuatorSettings {
            resync_period: default_resync_period(),
            error_requeue_period: default_requeue_period(),
            pending_requeue_period: default_requeue_period(),
        }
    }
}

/// Environment values only ever arrive as strings, so the duration is read as
/// one and parsed from its human form (`10m`, `1h`, `20s`).
fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = String::deserialize(deserializer)?;
    duration_str::parse(&value).map_err(serde::de::Error::custom)
}

fn default_resync_period() -> Duration {
    Duration::from_secs(600)
}

fn default_requeue_period() -> Duration {
    Duration::from_secs(20)
}
