use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One input file of a datum: the path it is materialized at inside the
/// datum's input directory, and the content digest it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputRef {
    pub name: String,
    pub reference: String,
}

impl InputRef {
    pub fn new(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: reference.into(),
        }
    }
}

/// Stable content-derived identifier of a datum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, enough to tell datums apart in logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work as produced by the datum enumeration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumDescriptor {
    pub inputs: Vec<InputRef>,
}

impl DatumDescriptor {
    pub fn new(inputs: Vec<InputRef>) -> Self {
        Self { inputs }
    }

    pub fn single(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::new(vec![InputRef::new(name, reference)])
    }

    /// SHA-256 over the sorted `(name, reference)` pairs.
    ///
    /// References are content digests, so two descriptors with the same
    /// fingerprint name content-identical input regardless of input order.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut inputs: Vec<&InputRef> = self.inputs.iter().collect();
        inputs.sort();

        let mut hasher = Sha256::new();
        for input in inputs {
            hasher.update((input.name.len() as u64).to_be_bytes());
            hasher.update(input.name.as_bytes());
            hasher.update((input.reference.len() as u64).to_be_bytes());
            hasher.update(input.reference.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}
