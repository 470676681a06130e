//! Durations written as (fractional) seconds in config files

use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "invalid duration: {} seconds",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}
