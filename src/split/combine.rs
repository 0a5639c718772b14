//! Folding per-instance results back into the shape a task declares.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::SplitSpec;
use crate::error::{ErrorCode, Result, SplitflowError};

/// Split fields whose dimension is merged back after execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CombineRepr", into = "Vec<String>")]
pub struct CombineSpec {
    fields: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CombineRepr {
    One(String),
    Many(Vec<String>),
}

impl From<CombineRepr> for CombineSpec {
    fn from(repr: CombineRepr) -> Self {
        match repr {
            CombineRepr::One(field) => CombineSpec::new([field]),
            CombineRepr::Many(fields) => CombineSpec::new(fields),
        }
    }
}

impl From<CombineSpec> for Vec<String> {
    fn from(spec: CombineSpec) -> Self {
        spec.fields
    }
}

impl CombineSpec {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Every combined field must be a split field
    pub fn validate(&self, split: Option<&SplitSpec>) -> Result<()> {
        if self.fields.is_empty() {
            return Err(invalid_combiner("combine declaration names no fields", None));
        }
        let Some(split) = split else {
            return Err(invalid_combiner(
                "combine declared on a task without a split",
                None,
            ));
        };
        for field in &self.fields {
            if !split.contains(field) {
                return Err(invalid_combiner(
                    format!("combine field '{}' is not split (split is '{}')", field, split),
                    Some(field.clone()),
                ));
            }
        }
        Ok(())
    }

    /// Positions of the split groups that survive the fold
    fn retained_groups(&self, split: &SplitSpec) -> Vec<usize> {
        (0..split.groups().len())
            .filter(|&g| {
                !self
                    .fields
                    .iter()
                    .any(|field| split.groups()[g].contains(field))
            })
            .collect()
    }
}

fn invalid_combiner(message: impl Into<String>, field: Option<String>) -> SplitflowError {
    SplitflowError::configuration_with_code(ErrorCode::CONFIG_INVALID_COMBINER, message, field)
}

/// A value tagged with its split position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedItem<T> {
    pub index: Vec<usize>,
    pub value: T,
}

/// Values sharing the same retained indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedGroup<T> {
    /// Indices of the retained split groups; empty when everything was combined
    pub retained: Vec<usize>,
    pub values: Vec<T>,
}

/// The externally visible shape of a task's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Folded<T> {
    /// Unsplit task
    Single(T),
    /// Split task without combine, in enumeration order
    Split(Vec<IndexedItem<T>>),
    /// Split task folded over the combined dimensions
    Combined(Vec<CombinedGroup<T>>),
}

impl<T> Folded<T> {
    /// Total number of values across every position
    pub fn len(&self) -> usize {
        match self {
            Folded::Single(_) => 1,
            Folded::Split(items) => items.len(),
            Folded::Combined(groups) => groups.iter().map(|g| g.values.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every value in enumeration order, ignoring the grouping
    pub fn values(&self) -> Vec<&T> {
        match self {
            Folded::Single(value) => vec![value],
            Folded::Split(items) => items.iter().map(|i| &i.value).collect(),
            Folded::Combined(groups) => groups.iter().flat_map(|g| g.values.iter()).collect(),
        }
    }

    pub fn as_single(&self) -> Option<&T> {
        match self {
            Folded::Single(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_split(&self) -> Option<&[IndexedItem<T>]> {
        match self {
            Folded::Split(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_combined(&self) -> Option<&[CombinedGroup<T>]> {
        match self {
            Folded::Combined(groups) => Some(groups),
            _ => None,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Folded<U> {
        match self {
            Folded::Single(value) => Folded::Single(f(value)),
            Folded::Split(items) => Folded::Split(
                items
                    .into_iter()
                    .map(|i| IndexedItem {
                        index: i.index,
                        value: f(i.value),
                    })
                    .collect(),
            ),
            Folded::Combined(groups) => Folded::Combined(
                groups
                    .into_iter()
                    .map(|g| CombinedGroup {
                        retained: g.retained,
                        values: g.values.into_iter().map(&mut f).collect(),
                    })
                    .collect(),
            ),
        }
    }
}

/// Fold results, given in enumeration order, into the declared shape.
///
/// Purely structural: values are moved, never inspected.
pub fn fold<T>(
    split: Option<&SplitSpec>,
    combine: Option<&CombineSpec>,
    items: Vec<(Vec<usize>, T)>,
) -> Result<Folded<T>> {
    let Some(split) = split else {
        if let Some(combine) = combine {
            combine.validate(None)?;
        }
        let mut items = items.into_iter();
        return match (items.next(), items.next()) {
            (Some((_, value)), None) => Ok(Folded::Single(value)),
            _ => Err(SplitflowError::other(
                "an unsplit task must produce exactly one result",
            )),
        };
    };

    let Some(combine) = combine else {
        return Ok(Folded::Split(
            items
                .into_iter()
                .map(|(index, value)| IndexedItem { index, value })
                .collect(),
        ));
    };

    combine.validate(Some(split))?;
    let retained = combine.retained_groups(split);

    let mut groups: IndexMap<Vec<usize>, Vec<T>> = IndexMap::new();
    for (index, value) in items {
        let key: Vec<usize> = retained
            .iter()
            .filter_map(|&g| index.get(g).copied())
            .collect();
        groups.entry(key).or_default().push(value);
    }

    Ok(Folded::Combined(
        groups
            .into_iter()
            .map(|(retained, values)| CombinedGroup { retained, values })
            .collect(),
    ))
}
