//! Value provenance records.

use serde::Serialize;
use serde_json::Value;

/// One hop in an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailEntry {
    /// Name of the task that produced the value, or `None` for an
    /// externally supplied root.
    pub source: Option<String>,
    /// The value as it stood at this hop.
    pub value: Value,
}

/// Provenance of a single value: the producing source, the current payload,
/// and the ordered chain of `(source, value)` pairs from root to current.
///
/// Audits are never mutated. Every transformation returns a new `Audit`
/// extending the parent's trail, so a trail held anywhere stays valid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Audit {
    key: Option<String>,
    value: Value,
    trail: Vec<TrailEntry>,
}

impl Audit {
    /// Wrap an externally supplied value, seeding the trail with a root hop.
    pub fn root(value: Value) -> Self {
        let trail = vec![TrailEntry {
            source: None,
            value: value.clone(),
        }];
        Self {
            key: None,
            value,
            trail,
        }
    }

    /// Wrap a value without recording a trail. Used when audit mode is off;
    /// bare audits stay bare through every transformation.
    pub fn bare(value: Value) -> Self {
        Self {
            key: None,
            value,
            trail: Vec::new(),
        }
    }

    /// A produced value with no recorded lineage (audit mode off).
    pub(crate) fn produced(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value,
            trail: Vec::new(),
        }
    }

    /// The producing task's name, or `None` for an external root.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The current payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the audit, keeping only the payload.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// The `(source, value)` chain, root first.
    pub fn trail(&self) -> &[TrailEntry] {
        &self.trail
    }

    fn recorded(&self) -> bool {
        !self.trail.is_empty()
    }

    /// New audit for a value `key` produced from this one, extending the
    /// trail by one hop.
    pub fn derive(&self, key: impl Into<String>, value: Value) -> Self {
        Self::merge(std::slice::from_ref(self), key, value)
    }

    /// New audit for a value `key` produced from several audited parents.
    ///
    /// The parents' trails are concatenated in argument order, then the
    /// `(key, value)` hop is appended. Bare parents contribute nothing, so
    /// a merge of bare audits is itself bare.
    pub fn merge(parents: &[Audit], key: impl Into<String>, value: Value) -> Self {
        let key = Some(key.into());
        if !parents.is_empty() && parents.iter().all(|p| !p.recorded()) {
            return Self {
                key,
                value,
                trail: Vec::new(),
            };
        }
        let mut trail: Vec<TrailEntry> = parents
            .iter()
            .flat_map(|p| p.trail.iter().cloned())
            .collect();
        trail.push(TrailEntry {
            source: key.clone(),
            value: value.clone(),
        });
        Self { key, value, trail }
    }

    /// Explode an audit whose value is an array of N members into N audits
    /// sharing the trail prefix and diverging only in the final element.
    ///
    /// Returns `None` when the value is not an array.
    pub fn splat(&self) -> Option<Vec<Audit>> {
        let Value::Array(members) = &self.value else {
            return None;
        };
        let prefix: &[TrailEntry] = if self.trail.is_empty() {
            &[]
        } else {
            &self.trail[..self.trail.len() - 1]
        };
        Some(
            members
                .iter()
                .map(|member| {
                    let mut trail = prefix.to_vec();
                    if self.recorded() {
                        trail.push(TrailEntry {
                            source: self.key.clone(),
                            value: member.clone(),
                        });
                    }
                    Audit {
                        key: self.key.clone(),
                        value: member.clone(),
                        trail,
                    }
                })
                .collect(),
        )
    }
}
