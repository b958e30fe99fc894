use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of an evaluation
pub type EvaluationIdentifier = String;

/// Identifier of a group within an evaluation (e.g. a geographic feature)
pub type GroupIdentifier = String;

/// Output format tag which may be declared by an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Line-oriented tabular output
    Csv,
    /// Self-describing binary records
    Binary,
    /// Rendered graphics
    Png,
    /// Gridded output
    Netcdf,
}

impl Format {
    /// Every known format
    pub const ALL: [Format; 4] = [Format::Csv, Format::Binary, Format::Png, Format::Netcdf];

    /// Textual tag used in configuration and on the command line
    pub fn tag(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Binary => "binary",
            Format::Png => "png",
            Format::Netcdf => "netcdf",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Tag that does not name a known [`Format`]
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown output format '{0}'")]
pub struct UnknownFormatError(String);

impl FromStr for Format {
    type Err = UnknownFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();

        Format::ALL
            .iter()
            .find(|format| format.tag() == tag)
            .copied()
            .ok_or_else(|| UnknownFormatError(s.to_owned()))
    }
}

/// Information about the measured quantity of an evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementMetadata {
    /// Name of the evaluated variable (e.g. `streamflow`)
    pub variable: String,
    /// Measurement unit of the evaluated variable (e.g. `CMS`)
    pub unit: String,
    /// Free-form additional labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Identity and shape of one evaluation, shared with every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationDescriptor {
    /// Unique identifier
    pub id: EvaluationIdentifier,
    /// Formats in which output has been requested
    pub formats: BTreeSet<Format>,
    /// Description of the measured quantity
    pub measurement: MeasurementMetadata,
}

impl EvaluationDescriptor {
    /// Creates a descriptor with a random identifier
    pub fn new(formats: impl IntoIterator<Item = Format>, measurement: MeasurementMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            formats: formats.into_iter().collect(),
            measurement,
        }
    }

    /// Replaces the identifier
    pub fn with_id(mut self, id: impl Into<EvaluationIdentifier>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether a consumer producing any of the given formats is useful for this evaluation
    pub fn accepts(&self, formats: &BTreeSet<Format>) -> bool {
        !self.formats.is_disjoint(formats)
    }
}

/// One computed statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Metric name, e.g. `MEAN_ERROR`
    pub metric: String,
    /// Label of the pool the statistic was computed for (e.g. a lead time window)
    pub pool: String,
    /// Statistic value, `NaN` for missing values
    #[serde(with = "missing_value")]
    pub value: f64,
    /// Number of pairs the statistic is based on
    #[serde(default)]
    pub sample_size: Option<u64>,
}

impl Statistic {
    /// Creates a new statistic without sample size
    pub fn new(metric: impl Into<String>, pool: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            pool: pool.into(),
            value,
            sample_size: None,
        }
    }
}

/// Encodes `NaN` as `null` as JSON has no representation for it
mod missing_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Batch of statistics belonging to one group of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsMessage {
    /// Evaluation the statistics belong to
    pub evaluation_id: EvaluationIdentifier,
    /// Group the statistics belong to
    pub group_id: GroupIdentifier,
    /// Publication order within the evaluation
    pub sequence: u64,
    /// Computed statistics
    pub statistics: Vec<Statistic>,
}

impl StatisticsMessage {
    /// Distinct metric names contained in this batch, in order of appearance
    pub fn metrics(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();

        self.statistics
            .iter()
            .map(|statistic| statistic.metric.as_str())
            .filter(|metric| seen.insert(*metric))
            .collect()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_format_tags() {
        assert_eq!("CSV".parse::<Format>().unwrap(), Format::Csv);
        assert_eq!(" binary ".parse::<Format>().unwrap(), Format::Binary);
        assert!("protobuf".parse::<Format>().is_err());
    }

    #[test]
    fn accept_overlapping_formats() {
        let descriptor =
            EvaluationDescriptor::new(vec![Format::Csv, Format::Png], Default::default());

        assert!(descriptor.accepts(&vec![Format::Csv].into_iter().collect()));
        assert!(!descriptor.accepts(&vec![Format::Binary].into_iter().collect()));
    }

    #[test]
    fn list_metrics_once() {
        let message = StatisticsMessage {
            evaluation_id: "e".into(),
            group_id: "DRRC2".into(),
            sequence: 0,
            statistics: vec![
                Statistic::new("MEAN_ERROR", "0-6h", 0.1),
                Statistic::new("BIAS_FRACTION", "0-6h", 0.2),
                Statistic::new("MEAN_ERROR", "6-12h", 0.3),
            ],
        };

        assert_eq!(message.metrics(), vec!["MEAN_ERROR", "BIAS_FRACTION"]);
    }

    #[test]
    fn transport_missing_values() {
        let json = serde_json::to_string(&Statistic::new("MEAN_ERROR", "0-6h", f64::NAN)).unwrap();
        let statistic: Statistic = serde_json::from_str(&json).unwrap();

        assert!(json.contains("\"value\":null"));
        assert!(statistic.value.is_nan());
    }
}
