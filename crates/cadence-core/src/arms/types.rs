//! Types describing the decision dimensions and the arms built from them

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One decision dimension of an arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    PostType,
    Topic,
    HourBin,
    CtaVariant,
    Intensity,
}

impl Dimension {
    /// All dimensions, in arm tuple order
    pub const ALL: [Dimension; 5] = [
        Dimension::PostType,
        Dimension::Topic,
        Dimension::HourBin,
        Dimension::CtaVariant,
        Dimension::Intensity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostType => "post_type",
            Self::Topic => "topic",
            Self::HourBin => "hour_bin",
            Self::CtaVariant => "cta_variant",
            Self::Intensity => "intensity",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "post_type" => Ok(Self::PostType),
            "topic" => Ok(Self::Topic),
            "hour_bin" | "hour" => Ok(Self::HourBin),
            "cta_variant" | "cta" => Ok(Self::CtaVariant),
            "intensity" => Ok(Self::Intensity),
            _ => Err(Error::InvalidInput(format!("unknown dimension '{}'", s))),
        }
    }
}

/// An immutable combination of decision-dimension values.
///
/// Identity is the tuple itself; [`Arm::fingerprint`] gives the stable hash
/// used as the persistence key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Arm {
    pub post_type: String,
    pub topic: String,
    pub hour_bin: u8,
    pub cta_variant: String,
    pub intensity: u8,
}

impl Arm {
    pub fn new(
        post_type: impl Into<String>,
        topic: impl Into<String>,
        hour_bin: u8,
        cta_variant: impl Into<String>,
        intensity: u8,
    ) -> Self {
        Self {
            post_type: post_type.into(),
            topic: topic.into(),
            hour_bin,
            cta_variant: cta_variant.into(),
            intensity,
        }
    }

    /// Stable SHA-256 fingerprint of the dimension tuple (hex encoded)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.post_type.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.topic.as_bytes());
        hasher.update([0x1f]);
        hasher.update([self.hour_bin]);
        hasher.update([0x1f]);
        hasher.update(self.cta_variant.as_bytes());
        hasher.update([0x1f]);
        hasher.update([self.intensity]);
        hex::encode(hasher.finalize())
    }

    /// The value of a single dimension, rendered as a string
    pub fn value(&self, dimension: Dimension) -> String {
        match dimension {
            Dimension::PostType => self.post_type.clone(),
            Dimension::Topic => self.topic.clone(),
            Dimension::HourBin => self.hour_bin.to_string(),
            Dimension::CtaVariant => self.cta_variant.clone(),
            Dimension::Intensity => self.intensity.to_string(),
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{:02}h/{}/i{}",
            self.post_type, self.topic, self.hour_bin, self.cta_variant, self.intensity
        )
    }
}

/// Legal values for every decision dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmDomains {
    pub post_types: Vec<String>,
    pub topics: Vec<String>,
    pub hour_bins: Vec<u8>,
    pub cta_variants: Vec<String>,
    pub intensities: Vec<u8>,
}

impl Default for ArmDomains {
    fn default() -> Self {
        Self {
            post_types: strings(&["proposal", "thread", "question", "insight"]),
            topics: strings(&[
                "technology",
                "economics",
                "coordination",
                "energy",
                "policy",
                "automation",
            ]),
            hour_bins: (0..24).collect(),
            cta_variants: strings(&[
                "learn_more",
                "join_pilot",
                "provide_feedback",
                "share_experience",
                "book_call",
            ]),
            intensities: vec![1, 2, 3, 4],
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl ArmDomains {
    /// Values of a dimension rendered as strings, in declared order
    pub fn values(&self, dimension: Dimension) -> Vec<String> {
        match dimension {
            Dimension::PostType => self.post_types.clone(),
            Dimension::Topic => self.topics.clone(),
            Dimension::HourBin => self.hour_bins.iter().map(u8::to_string).collect(),
            Dimension::CtaVariant => self.cta_variants.clone(),
            Dimension::Intensity => self.intensities.iter().map(u8::to_string).collect(),
        }
    }

    /// Whether `value` is legal for `dimension`
    pub fn contains(&self, dimension: Dimension, value: &str) -> bool {
        self.values(dimension).iter().any(|v| v == value)
    }

    /// Size of the full cross product
    pub fn cardinality(&self) -> usize {
        self.post_types.len()
            * self.topics.len()
            * self.hour_bins.len()
            * self.cta_variants.len()
            * self.intensities.len()
    }

    /// Check the domains themselves are usable
    pub fn validate(&self) -> Result<()> {
        for dimension in Dimension::ALL {
            let values = self.values(dimension);
            if values.is_empty() {
                return Err(Error::ConfigError(format!(
                    "dimension '{}' has an empty domain",
                    dimension
                )));
            }
            let mut deduped = values.clone();
            deduped.sort();
            deduped.dedup();
            if deduped.len() != values.len() {
                return Err(Error::ConfigError(format!(
                    "dimension '{}' has duplicate values",
                    dimension
                )));
            }
        }
        if let Some(hour) = self.hour_bins.iter().find(|h| **h > 23) {
            return Err(Error::ConfigError(format!("hour bin {} is not 0-23", hour)));
        }
        if self.intensities.contains(&0) {
            return Err(Error::ConfigError("intensity levels start at 1".to_string()));
        }
        Ok(())
    }

    /// Narrow the domains with a filter.
    ///
    /// Every filter value must itself be legal, otherwise the request is an
    /// `InvalidArm`. An empty intersection is also rejected.
    pub fn restrict(&self, filter: &ArmFilter) -> Result<ArmDomains> {
        Ok(ArmDomains {
            post_types: restrict_values(Dimension::PostType, &self.post_types, &filter.post_types)?,
            topics: restrict_values(Dimension::Topic, &self.topics, &filter.topics)?,
            hour_bins: restrict_values(Dimension::HourBin, &self.hour_bins, &filter.hour_bins)?,
            cta_variants: restrict_values(
                Dimension::CtaVariant,
                &self.cta_variants,
                &filter.cta_variants,
            )?,
            intensities: restrict_values(
                Dimension::Intensity,
                &self.intensities,
                &filter.intensities,
            )?,
        })
    }
}

fn restrict_values<T>(dimension: Dimension, domain: &[T], allowed: &Option<Vec<T>>) -> Result<Vec<T>>
where
    T: Clone + PartialEq + fmt::Display,
{
    let Some(allowed) = allowed else {
        return Ok(domain.to_vec());
    };

    if let Some(bad) = allowed.iter().find(|v| !domain.contains(v)) {
        return Err(Error::InvalidArm(format!(
            "{}={} is outside the configured domain",
            dimension, bad
        )));
    }

    let kept: Vec<T> = domain.iter().filter(|v| allowed.contains(v)).cloned().collect();
    if kept.is_empty() {
        return Err(Error::InvalidArm(format!(
            "no legal values left for dimension '{}'",
            dimension
        )));
    }
    Ok(kept)
}

/// Optional per-dimension value restriction.
///
/// Used for goal-mode restrictions and for action-kind pins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_bins: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cta_variants: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensities: Option<Vec<u8>>,
}

impl ArmFilter {
    /// Pin the post type
    pub fn with_post_type(mut self, post_type: impl Into<String>) -> Self {
        self.post_types = Some(vec![post_type.into()]);
        self
    }

    /// Restrict topics
    pub fn with_topics(mut self, topics: &[&str]) -> Self {
        self.topics = Some(strings(topics));
        self
    }

    /// Restrict call-to-action variants
    pub fn with_cta_variants(mut self, variants: &[&str]) -> Self {
        self.cta_variants = Some(strings(variants));
        self
    }

    /// Restrict hour bins
    pub fn with_hour_bins(mut self, hours: Vec<u8>) -> Self {
        self.hour_bins = Some(hours);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.post_types.is_none()
            && self.topics.is_none()
            && self.hour_bins.is_none()
            && self.cta_variants.is_none()
            && self.intensities.is_none()
    }
}
