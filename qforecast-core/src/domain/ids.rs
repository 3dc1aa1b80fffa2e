use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the hex prefix kept from a BLAKE3 digest for version identifiers.
const VERSION_HEX_LEN: usize = 16;

fn short_hex(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    hex.as_str()[..VERSION_HEX_LEN].to_string()
}

/// Version of a feature-set definition: a human label plus a content hash of the
/// definitions. Changing any feature's logic changes the hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureSetVersion {
    pub label: String,
    pub hash: String,
}

impl FeatureSetVersion {
    pub fn from_definition(label: &str, canonical: &[u8]) -> Self {
        Self {
            label: label.to_string(),
            hash: short_hex(canonical),
        }
    }
}

impl fmt::Display for FeatureSetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.label, self.hash)
    }
}

/// Deterministic model version (hash of family, hyperparameters, training window,
/// feature-set version and dataset snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelVersion(pub String);

impl ModelVersion {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(short_hex(bytes))
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of an ensemble (member versions + blend parameters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnsembleVersion(pub String);

impl EnsembleVersion {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(short_hex(bytes))
    }
}

impl fmt::Display for EnsembleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of an observation snapshot (or of a derived dataset).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetHash(pub String);

impl DatasetHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Combine two hashes into one (order-sensitive).
    pub fn combine(&self, other: &str) -> Self {
        Self::from_bytes(format!("{}+{}", self.0, other).as_bytes())
    }
}

impl fmt::Display for DatasetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
