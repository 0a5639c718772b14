//! Splitting task inputs into instances and folding results back.
//!
//! A [`SplitSpec`] is an outer product over groups; every group zips one or
//! more fields of equal length. Enumeration is row-major: the first group
//! varies slowest and the last group fastest. [`combine`] uses the same
//! convention, so positions line up between the two.
//!
//! The textual form follows the usual splitter notation:
//!
//! - `a` splits a single field
//! - `(a, b)` zips `a` and `b` (scalar split)
//! - `[a, b]` takes the outer product of `a` and `b`
//! - `[(a, b), c]` outer product of the zipped pair with `c`

pub mod combine;
mod parse;

pub use combine::{CombineSpec, CombinedGroup, Folded, IndexedItem};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, Result, SplitflowError};
use crate::task::value::{Bindings, Value};

/// Fields zipped together into one split dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitGroup {
    fields: Vec<String>,
}

impl SplitGroup {
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

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

/// Outer product over zipped groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SplitSpec {
    groups: Vec<SplitGroup>,
}

/// One concrete binding produced by the splitter
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Position in the enumeration order
    pub ordinal: usize,
    /// One index per split group; empty for an unsplit task
    pub index: Vec<usize>,
    pub bindings: Bindings,
}

impl SplitSpec {
    /// Split over a single field
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            groups: vec![SplitGroup::new([name.into()])],
        }
    }

    /// Zip the given fields into one dimension
    pub fn scalar<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_groups(vec![SplitGroup::new(fields)])
    }

    /// Outer product over single-field groups
    pub fn outer<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_groups(fields.into_iter().map(|f| SplitGroup::new([f])).collect())
    }

    pub fn from_groups(groups: Vec<SplitGroup>) -> Result<Self> {
        if groups.is_empty() || groups.iter().any(|g| g.fields.is_empty()) {
            return Err(invalid_splitter("split declaration names no fields"));
        }

        let mut seen = HashSet::new();
        for field in groups.iter().flat_map(|g| g.fields.iter()) {
            if field.is_empty() {
                return Err(invalid_splitter("split field name is empty"));
            }
            if !seen.insert(field.as_str()) {
                return Err(invalid_splitter(format!(
                    "field '{}' appears more than once in the split declaration",
                    field
                )));
            }
        }

        Ok(Self { groups })
    }

    /// Parse the textual splitter notation
    pub fn parse(expression: &str) -> Result<Self> {
        Self::from_groups(parse::parse_groups(expression)?)
    }

    pub fn groups(&self) -> &[SplitGroup] {
        &self.groups
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().flat_map(|g| g.fields.iter().map(String::as_str))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.groups.iter().any(|g| g.contains(field))
    }

    /// Index of the group holding `field`
    pub fn group_of(&self, field: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.contains(field))
    }

    /// Number of values in each group, validated against the bindings
    pub fn cardinalities(&self, bindings: &Bindings) -> Result<Vec<usize>> {
        self.groups
            .iter()
            .map(|group| group_cardinality(group, bindings))
            .collect()
    }
}

fn group_cardinality(group: &SplitGroup, bindings: &Bindings) -> Result<usize> {
    let mut cardinality: Option<(usize, &str)> = None;

    for field in &group.fields {
        let value = bindings.get(field).ok_or_else(|| {
            SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_MISSING_FIELD,
                format!("split field '{}' is not an input of the task", field),
                Some(field.clone()),
            )
        })?;

        let items = value.as_sequence().ok_or_else(|| {
            SplitflowError::configuration_with_code(
                ErrorCode::CONFIG_INVALID_SPLITTER,
                format!("split field '{}' must be a sequence, got '{}'", field, value),
                Some(field.clone()),
            )
        })?;

        match cardinality {
            None => cardinality = Some((items.len(), field)),
            Some((len, first)) if len != items.len() => {
                return Err(SplitflowError::configuration_with_code(
                    ErrorCode::CONFIG_SPLIT_LENGTH_MISMATCH,
                    format!(
                        "scalar split fields must have equal length: '{}' has {}, '{}' has {}",
                        first,
                        len,
                        field,
                        items.len()
                    ),
                    Some(field.clone()),
                ));
            }
            Some(_) => {}
        }
    }

    Ok(cardinality.map(|(len, _)| len).unwrap_or(0))
}

/// Expand bindings into the ordered list of instances.
///
/// Without a split declaration the result is a single instance carrying the
/// bindings unchanged. Non-split fields are copied into every instance.
pub fn expand(bindings: &Bindings, split: Option<&SplitSpec>) -> Result<Vec<Instance>> {
    let Some(split) = split else {
        return Ok(vec![Instance {
            ordinal: 0,
            index: Vec::new(),
            bindings: bindings.clone(),
        }]);
    };

    let cardinalities = split.cardinalities(bindings)?;
    let total: usize = cardinalities.iter().product();
    let mut instances = Vec::with_capacity(total);

    for (ordinal, index) in RowMajor::new(&cardinalities).enumerate() {
        let mut resolved = bindings.clone();
        for (group, &position) in split.groups.iter().zip(index.iter()) {
            for field in &group.fields {
                let element = bindings
                    .get(field)
                    .and_then(Value::as_sequence)
                    .and_then(|items| items.get(position))
                    .cloned()
                    .ok_or_else(|| {
                        SplitflowError::configuration(format!(
                            "split field '{}' has no element {}",
                            field, position
                        ))
                    })?;
                resolved.insert(field.clone(), element);
            }
        }
        instances.push(Instance {
            ordinal,
            index,
            bindings: resolved,
        });
    }

    Ok(instances)
}

/// Odometer over index tuples, last dimension fastest
pub(crate) struct RowMajor {
    bounds: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl RowMajor {
    pub(crate) fn new(bounds: &[usize]) -> Self {
        let next = if bounds.iter().any(|&b| b == 0) {
            None
        } else {
            Some(vec![0; bounds.len()])
        };
        Self {
            bounds: bounds.to_vec(),
            next,
        }
    }
}

impl Iterator for RowMajor {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;

        let mut following = current.clone();
        let mut carried = true;
        for dim in (0..following.len()).rev() {
            following[dim] += 1;
            if following[dim] < self.bounds[dim] {
                carried = false;
                break;
            }
            following[dim] = 0;
        }
        if !carried {
            self.next = Some(following);
        }

        Some(current)
    }
}

fn invalid_splitter(message: impl Into<String>) -> SplitflowError {
    SplitflowError::configuration_with_code(ErrorCode::CONFIG_INVALID_SPLITTER, message, None)
}

impl fmt::Display for SplitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render_group = |group: &SplitGroup| {
            if group.fields.len() == 1 {
                group.fields[0].clone()
            } else {
                format!("({})", group.fields.join(", "))
            }
        };

        if self.groups.len() == 1 {
            f.write_str(&render_group(&self.groups[0]))
        } else {
            let rendered: Vec<String> = self.groups.iter().map(render_group).collect();
            write!(f, "[{}]", rendered.join(", "))
        }
    }
}

impl FromStr for SplitSpec {
    type Err = SplitflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SplitSpec {
    type Error = SplitflowError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SplitSpec> for String {
    fn from(spec: SplitSpec) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: Vec<(&str, Value)>) -> Bindings {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_no_split_yields_single_instance() {
        let inputs = bindings(vec![("executable", "echo".into()), ("args", "one".into())]);
        let instances = expand(&inputs, None).unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].bindings, inputs);
        assert!(instances[0].index.is_empty());
    }

    #[test]
    fn test_single_field_split() {
        let inputs = bindings(vec![
            ("executable", "echo".into()),
            ("args", vec!["one", "two", "three"].into()),
        ]);
        let split = SplitSpec::field("args");
        let instances = expand(&inputs, Some(&split)).unwrap();

        assert_eq!(instances.len(), 3);
        for (j, expected) in ["one", "two", "three"].iter().enumerate() {
            assert_eq!(instances[j].ordinal, j);
            assert_eq!(instances[j].index, vec![j]);
            assert_eq!(instances[j].bindings["args"], Value::from(*expected));
            assert_eq!(instances[j].bindings["executable"], Value::from("echo"));
        }
    }

    #[test]
    fn test_scalar_split_zips_fields() {
        let inputs = bindings(vec![
            ("a", vec![1i64, 2, 3].into()),
            ("b", vec!["x", "y", "z"].into()),
        ]);
        let split = SplitSpec::parse("(a, b)").unwrap();
        let instances = expand(&inputs, Some(&split)).unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(instances[2].bindings["a"], Value::from(3i64));
        assert_eq!(instances[2].bindings["b"], Value::from("z"));
        assert_eq!(instances[2].index, vec![2]);
    }

    #[test]
    fn test_scalar_split_length_mismatch_is_configuration_error() {
        let inputs = bindings(vec![
            ("a", vec![1i64, 2, 3].into()),
            ("b", vec!["x", "y"].into()),
        ]);
        let split = SplitSpec::parse("(a, b)").unwrap();
        let err = expand(&inputs, Some(&split)).unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(err.code(), ErrorCode::CONFIG_SPLIT_LENGTH_MISMATCH);
    }

    #[test]
    fn test_outer_split_is_row_major() {
        let inputs = bindings(vec![
            ("a", vec![1i64, 2].into()),
            ("b", vec!["x", "y", "z"].into()),
        ]);
        let split = SplitSpec::parse("[a, b]").unwrap();
        let instances = expand(&inputs, Some(&split)).unwrap();

        let indices: Vec<Vec<usize>> = instances.iter().map(|i| i.index.clone()).collect();
        assert_eq!(
            indices,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(instances[4].bindings["a"], Value::from(2i64));
        assert_eq!(instances[4].bindings["b"], Value::from("y"));
    }

    #[test]
    fn test_outer_split_covers_product_space_without_duplicates() {
        let inputs = bindings(vec![
            ("a", vec![1i64, 2, 3].into()),
            ("b", vec!["x", "y"].into()),
            ("c", vec![true, false].into()),
            ("d", vec!["p", "q"].into()),
        ]);
        let split = SplitSpec::parse("[a, (c, d), b]").unwrap();
        let instances = expand(&inputs, Some(&split)).unwrap();

        assert_eq!(instances.len(), 3 * 2 * 2);
        let unique: HashSet<Vec<usize>> = instances.iter().map(|i| i.index.clone()).collect();
        assert_eq!(unique.len(), instances.len());
        for a in 0..3 {
            for cd in 0..2 {
                for b in 0..2 {
                    assert!(unique.contains(&vec![a, cd, b]));
                }
            }
        }
    }

    #[test]
    fn test_nested_sequence_elements_survive_split() {
        let executable = Value::Sequence(vec![
            Value::from("pwd"),
            Value::from("ls"),
            Value::from(vec!["echo", "hi"]),
        ]);
        let inputs = bindings(vec![("executable", executable)]);
        let split = SplitSpec::field("executable");
        let instances = expand(&inputs, Some(&split)).unwrap();

        assert_eq!(instances.len(), 3);
        assert_eq!(
            instances[2].bindings["executable"],
            Value::from(vec!["echo", "hi"])
        );
    }

    #[test]
    fn test_missing_and_scalar_fields_rejected() {
        let inputs = bindings(vec![("args", "one".into())]);

        let err = expand(&inputs, Some(&SplitSpec::field("missing"))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_MISSING_FIELD);

        let err = expand(&inputs, Some(&SplitSpec::field("args"))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_SPLITTER);
    }

    #[test]
    fn test_empty_sequence_yields_no_instances() {
        let inputs = bindings(vec![("args", Value::Sequence(vec![]))]);
        let instances = expand(&inputs, Some(&SplitSpec::field("args"))).unwrap();
        assert!(instances.is_empty());
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        assert!(SplitSpec::parse("[a, a]").is_err());
        assert!(SplitSpec::outer(["a", "b", "a"]).is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        let split = SplitSpec::parse("[ (a,b) , [c, d] ]").unwrap();
        assert_eq!(split.to_string(), "[(a, b), c, d]");
        assert_eq!(SplitSpec::field("args").to_string(), "args");
    }
}
