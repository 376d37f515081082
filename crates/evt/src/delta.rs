use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A flat key→value bag applied to a model instance with "last write wins"
/// semantics and no deep paths. The richer `lit.Val` delta language the
/// reference draws from is an excluded collaborator; nested object or array
/// values are rejected with [`Error::NestedDelta`] rather than silently
/// mis-merged, per the unspecified-until-documented rule around deep paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Delta(pub Map<String, Value>);

impl Delta {
    pub fn new() -> Self {
        Delta(Map::new())
    }

    /// Checks every value is a scalar or array-of-scalars, not a nested object.
    pub fn validate(&self) -> Result<()> {
        for (k, v) in &self.0 {
            if v.is_object() {
                return Err(Error::NestedDelta(k.clone()));
            }
        }
        Ok(())
    }

    /// Applies this delta onto `target`, a JSON object, overwriting any existing
    /// key and adding new ones. Last write wins: a key present in both `target`
    /// and `self` ends up with `self`'s value.
    pub fn apply(&self, target: &mut Map<String, Value>) -> Result<()> {
        self.validate()?;
        for (k, v) in &self.0 {
            target.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}
