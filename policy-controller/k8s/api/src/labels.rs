use crate::LabelSelector;
use anyhow::{bail, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A parsed label selector.
///
/// An empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Selector {
    match_labels: Map,
    match_expressions: BTreeSet<Expression>,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: impl IntoIterator<Item = Expression>) -> Self {
        Self {
            match_labels: Map::default(),
            match_expressions: exprs.into_iter().collect(),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: map,
            match_expressions: BTreeSet::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in &self.match_expressions {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        for (k, v) in &self.match_labels {
            if labels.0.get(k) != Some(v) {
                return false;
            }
        }

        true
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = anyhow::Error;

    fn try_from(selector: &LabelSelector) -> Result<Self> {
        let match_expressions = selector
            .match_expressions
            .iter()
            .flatten()
            .map(|req| {
                let values = req.values.iter().flatten().cloned().collect::<BTreeSet<_>>();
                let operator = match req.operator.as_str() {
                    "In" => Operator::In,
                    "NotIn" => Operator::NotIn,
                    "Exists" => Operator::Exists,
                    "DoesNotExist" => Operator::DoesNotExist,
                    op => bail!("invalid label selector operator: {op}"),
                };
                match operator {
                    Operator::In | Operator::NotIn if values.is_empty() => {
                        bail!("{operator:?} requires values for key {}", req.key)
                    }
                    Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                        bail!("{operator:?} must not have values for key {}", req.key)
                    }
                    _ => {}
                }
                Ok(Expression {
                    key: req.key.clone(),
                    operator,
                    values,
                })
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            match_labels: selector.match_labels.clone().unwrap_or_default(),
            match_expressions,
        })
    }
}

/// Renders the selector canonically, so that equivalent selectors render identically.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str(",")
            }
        };
        for (k, v) in &self.match_labels {
            sep(f)?;
            write!(f, "{k}={v}")?;
        }
        for expr in &self.match_expressions {
            sep(f)?;
            expr.fmt(f)?;
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter)
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LabelSelectorRequirement;
    use maplit::btreemap;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "label mismatch",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::In,
                    Some("bar".to_string()),
                ))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::NotIn,
                    Some("bar".to_string()),
                ))),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "notin excludes",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::NotIn,
                    Some("bar".to_string()),
                ))),
                Labels::default(),
                true,
                "notin admits missing key",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::Exists, None))),
                Labels::from_iter(Some(("foo", "x"))),
                true,
                "exists",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::DoesNotExist, None))),
                Labels::from_iter(Some(("foo", "x"))),
                false,
                "does not exist",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn parse_label_selector() {
        let selector = Selector::try_from(&LabelSelector {
            match_labels: Some(btreemap! { "name".to_string() => "ns2".to_string() }),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["web".to_string(), "db".to_string()]),
            }]),
        })
        .expect("selector must parse");
        assert_eq!(selector.to_string(), "name=ns2,tier in (db,web)");
        assert!(!selector.is_empty());

        let empty = Selector::try_from(&LabelSelector::default()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.to_string(), "");
    }

    #[test]
    fn reject_invalid_selectors() {
        let bad_op = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "Matches".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(Selector::try_from(&bad_op).is_err());

        let missing_values = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec![]),
            }]),
            ..Default::default()
        };
        assert!(Selector::try_from(&missing_values).is_err());
    }
}
