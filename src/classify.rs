//! Disaster-type and safety classification over finalized counts.

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateSummary;

/// Default persons-per-frame above which a scene is labelled a stampede.
pub const DEFAULT_STAMPEDE_CUTOFF: u64 = 40;
/// Default persons-per-frame above which a scene is UNSAFE.
pub const DEFAULT_UNSAFE_THRESHOLD: u64 = 30;

/// Coarse scene label derived from counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisasterType {
    Stampede,
    Riot,
    Fire,
    Accident,
    Unknown,
}

impl DisasterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisasterType::Stampede => "stampede",
            DisasterType::Riot => "riot",
            DisasterType::Fire => "fire",
            DisasterType::Accident => "accident",
            DisasterType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DisasterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyStatus {
    Safe,
    Unsafe,
}

impl SafetyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyStatus::Safe => "SAFE",
            SafetyStatus::Unsafe => "UNSAFE",
        }
    }
}

impl std::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label reported when fire-class detections are present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireLabel {
    /// Fire/smoke in a crowd scene is read as unrest.
    #[default]
    Riot,
    Fire,
}

impl FireLabel {
    fn disaster_type(self) -> DisasterType {
        match self {
            FireLabel::Riot => DisasterType::Riot,
            FireLabel::Fire => DisasterType::Fire,
        }
    }
}

impl std::str::FromStr for FireLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "riot" => Ok(FireLabel::Riot),
            "fire" => Ok(FireLabel::Fire),
            other => Err(anyhow::anyhow!(
                "unknown fire label '{}'; expected 'riot' or 'fire'",
                other
            )),
        }
    }
}

/// Numeric cutoffs and labels used by `classify`.
///
/// `stampede_cutoff` and `unsafe_threshold` are independent: one picks the
/// label, the other the safety status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationPolicy {
    pub stampede_cutoff: u64,
    pub unsafe_threshold: u64,
    pub fire_label: FireLabel,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            stampede_cutoff: DEFAULT_STAMPEDE_CUTOFF,
            unsafe_threshold: DEFAULT_UNSAFE_THRESHOLD,
            fire_label: FireLabel::default(),
        }
    }
}

/// Result of classifying one processing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub disaster_type: DisasterType,
    pub status: SafetyStatus,
    pub summary: AggregateSummary,
}

/// Label a finalized aggregate. First matching rule wins:
/// crowd above the stampede cutoff, then any fire, then any car.
pub fn disaster_type(summary: &AggregateSummary, policy: &ClassificationPolicy) -> DisasterType {
    if summary.max_persons_per_frame > policy.stampede_cutoff {
        DisasterType::Stampede
    } else if summary.total_fires > 0 {
        policy.fire_label.disaster_type()
    } else if summary.total_cars > 0 {
        DisasterType::Accident
    } else {
        DisasterType::Unknown
    }
}

/// UNSAFE iff the busiest sampled frame holds more than `unsafe_threshold` persons.
pub fn safety_status(max_persons: u64, unsafe_threshold: u64) -> SafetyStatus {
    if max_persons > unsafe_threshold {
        SafetyStatus::Unsafe
    } else {
        SafetyStatus::Safe
    }
}

pub fn classify(summary: AggregateSummary, policy: &ClassificationPolicy) -> Classification {
    Classification {
        disaster_type: disaster_type(&summary, policy),
        status: safety_status(summary.max_persons_per_frame, policy.unsafe_threshold),
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(persons: u64, fires: u64, cars: u64) -> AggregateSummary {
        AggregateSummary {
            max_persons_per_frame: persons,
            total_cars: cars,
            total_fires: fires,
            frames_sampled: 1,
            frames_total: 1,
        }
    }

    #[test]
    fn precedence_picks_first_matching_rule() {
        let policy = ClassificationPolicy::default();
        let cases = [
            (summary(41, 0, 0), DisasterType::Stampede),
            (summary(41, 3, 9), DisasterType::Stampede),
            (summary(5, 1, 3), DisasterType::Riot),
            (summary(5, 0, 2), DisasterType::Accident),
            (summary(0, 0, 0), DisasterType::Unknown),
            (summary(40, 0, 0), DisasterType::Unknown),
        ];
        for (s, expected) in cases {
            assert_eq!(disaster_type(&s, &policy), expected, "{s:?}");
        }
    }

    #[test]
    fn fire_label_is_configurable() {
        let policy = ClassificationPolicy {
            fire_label: FireLabel::Fire,
            ..ClassificationPolicy::default()
        };
        assert_eq!(disaster_type(&summary(5, 1, 3), &policy), DisasterType::Fire);
        assert_eq!("FIRE".parse::<FireLabel>().unwrap(), FireLabel::Fire);
        assert!("flood".parse::<FireLabel>().is_err());
    }

    #[test]
    fn status_boundary_is_safe() {
        assert_eq!(safety_status(30, 30), SafetyStatus::Safe);
        assert_eq!(safety_status(31, 30), SafetyStatus::Unsafe);
        assert_eq!(safety_status(0, 0), SafetyStatus::Safe);
    }

    #[test]
    fn cutoffs_are_independent() {
        let policy = ClassificationPolicy {
            stampede_cutoff: 40,
            unsafe_threshold: 10,
            fire_label: FireLabel::Riot,
        };
        let c = classify(summary(20, 0, 0), &policy);
        assert_eq!(c.disaster_type, DisasterType::Unknown);
        assert_eq!(c.status, SafetyStatus::Unsafe);
    }

    #[test]
    fn enums_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&DisasterType::Stampede).unwrap(),
            "\"stampede\""
        );
        assert_eq!(
            serde_json::to_string(&SafetyStatus::Unsafe).unwrap(),
            "\"UNSAFE\""
        );
    }
}
