use crate::{error::ConfigError, template::Placeholders};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An ordered sequence of unique values. Built once from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDomain<T> {
    values: Vec<T>,
}
impl<T> ValueDomain<T> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.values.get(idx)
    }

    pub fn last(&self) -> Option<&T> {
        self.values.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}
impl ValueDomain<i64> {
    /// Sorts and deduplicates `values`.
    pub fn from_values(values: impl IntoIterator<Item = i64>) -> Self {
        let values = values.into_iter().sorted().dedup().collect_vec();
        Self { values }
    }

    pub fn single(value: i64) -> Self {
        Self {
            values: vec![value],
        }
    }

    /// Renders every value through a template holding a single `{i}` placeholder. The
    /// numeric order of the values is kept.
    pub fn render(&self, template: &str) -> Result<ValueDomain<String>, ConfigError> {
        let values = self
            .values
            .iter()
            .map(|i| Placeholders::new().with("i", i).render(template))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ValueDomain { values })
    }
}
impl<'a, T> IntoIterator for &'a ValueDomain<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RangeSpec {
    pub min: i64,
    pub max: i64,
    pub step: i64,
}
impl RangeSpec {
    /// `min, min + step, ...` up to and including `max`.
    pub fn expand(&self) -> Result<Vec<i64>, ConfigError> {
        if self.step <= 0 || self.max < self.min {
            return Err(ConfigError::InvalidRange {
                min: self.min,
                max: self.max,
                step: self.step,
            });
        }
        Ok((self.min..=self.max).step_by(self.step as usize).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DomainElement {
    Literal(Vec<i64>),
    Range(RangeSpec),
    Unrecognized(serde_json::Value),
}

/// A sweep axis as written in the config, e.g.
/// `{ "values": [[5, 6], {"min": 1, "max": 3, "step": 1}], "str_format": "10.0.0.{i}" }`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DomainSpec {
    pub values: Vec<DomainElement>,
    #[serde(default)]
    pub str_format: Option<String>,
}
impl DomainSpec {
    pub fn new(values: Vec<DomainElement>) -> Self {
        Self {
            values,
            str_format: None,
        }
    }

    pub fn literal(values: Vec<i64>) -> Self {
        Self::new(vec![DomainElement::Literal(values)])
    }

    pub fn with_format(mut self, str_format: &str) -> Self {
        self.str_format = Some(str_format.to_string());
        self
    }

    /// The ascending, deduplicated union of all elements. Elements of unknown shape are
    /// skipped so that one bad entry does not abort the campaign.
    pub fn expand(&self) -> Result<ValueDomain<i64>, ConfigError> {
        let mut combined = vec![];
        for element in self.values.iter() {
            match element {
                DomainElement::Literal(values) => combined.extend(values.iter().copied()),
                DomainElement::Range(range) => combined.extend(range.expand()?),
                DomainElement::Unrecognized(value) => {
                    warn!("Cannot handle sweep value {}, skipping this item", value)
                }
            }
        }
        Ok(ValueDomain::from_values(combined))
    }

    /// Like [`DomainSpec::expand`] but renders each value through `str_format`. Without a
    /// format the values are rendered as plain integers.
    pub fn expand_strings(&self) -> Result<ValueDomain<String>, ConfigError> {
        let domain = self.expand()?;
        match &self.str_format {
            Some(fmt) => domain.render(fmt),
            None => domain.render("{i}"),
        }
    }
}

/// Axes such as `initial_size` accept either a plain list or a full domain spec.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Values(Vec<i64>),
    Domain(DomainSpec),
}
impl AxisSpec {
    pub fn expand(&self) -> Result<ValueDomain<i64>, ConfigError> {
        match self {
            AxisSpec::Values(values) => Ok(ValueDomain::from_values(values.iter().copied())),
            AxisSpec::Domain(spec) => spec.expand(),
        }
    }
}
impl Default for AxisSpec {
    fn default() -> Self {
        AxisSpec::Values(vec![0])
    }
}
