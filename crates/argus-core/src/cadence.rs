//! Cadence policies: how often a subscriber receives a topic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery cadence for one subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Cadence {
    /// Deliver on every scheduling pass.
    #[default]
    EveryTick,
    /// Deliver at most `per_second` times per second.
    Throttled {
        /// Maximum deliveries per second (must be non-zero).
        #[serde(rename = "perSecond")]
        per_second: u32,
    },
    /// Deliver only when the snapshot content differs from the last delivery.
    OnChange,
}

impl Cadence {
    /// Minimum spacing between deliveries, if throttled.
    pub fn min_interval(self) -> Option<Duration> {
        match self {
            Self::Throttled { per_second } if per_second > 0 => {
                Some(Duration::from_secs(1) / per_second)
            }
            _ => None,
        }
    }

    /// Reject cadences that can never deliver.
    pub fn validate(self) -> Result<Self, String> {
        match self {
            Self::Throttled { per_second: 0 } => {
                Err("throttled cadence needs perSecond > 0".to_owned())
            }
            other => Ok(other),
        }
    }

    /// Parse the query-string form used by the event-stream endpoint:
    /// `every-tick`, `on-change`, or `throttled` with a `rate`.
    pub fn parse(mode: &str, rate: Option<u32>) -> Result<Self, String> {
        let cadence = match mode {
            "every-tick" | "tick" => Self::EveryTick,
            "on-change" | "change" => Self::OnChange,
            "throttled" => Self::Throttled {
                per_second: rate.ok_or_else(|| "throttled cadence needs a rate".to_owned())?,
            },
            other => return Err(format!("unknown cadence '{other}'")),
        };
        cadence.validate()
    }

    /// Short label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::EveryTick => "every-tick",
            Self::Throttled { .. } => "throttled",
            Self::OnChange => "on-change",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn throttled_interval() {
        let c = Cadence::Throttled { per_second: 4 };
        assert_eq!(c.min_interval(), Some(Duration::from_millis(250)));
        assert_eq!(Cadence::EveryTick.min_interval(), None);
        assert_eq!(Cadence::OnChange.min_interval(), None);
    }

    #[test]
    fn zero_rate_is_invalid() {
        assert!(Cadence::Throttled { per_second: 0 }.validate().is_err());
        assert!(Cadence::OnChange.validate().is_ok());
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            serde_json::to_value(Cadence::Throttled { per_second: 10 }).unwrap(),
            json!({"mode": "throttled", "perSecond": 10})
        );
        assert_eq!(
            serde_json::to_value(Cadence::OnChange).unwrap(),
            json!({"mode": "on-change"})
        );
        let back: Cadence = serde_json::from_value(json!({"mode": "every-tick"})).unwrap();
        assert_eq!(back, Cadence::EveryTick);
    }

    #[test]
    fn parse_query_forms() {
        assert_eq!(Cadence::parse("on-change", None).unwrap(), Cadence::OnChange);
        assert_eq!(Cadence::parse("tick", None).unwrap(), Cadence::EveryTick);
        assert_eq!(
            Cadence::parse("throttled", Some(2)).unwrap(),
            Cadence::Throttled { per_second: 2 }
        );
        assert!(Cadence::parse("throttled", None).is_err());
        assert!(Cadence::parse("throttled", Some(0)).is_err());
        assert!(Cadence::parse("sometimes", None).is_err());
    }
}
