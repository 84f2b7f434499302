//! Target layer selection.
//!
//! Grad-CAM needs a convolutional layer to attribute to. Layers are named
//! `features.N` after the feature stack index, with `features.last` (or
//! `features.-1`) for the final one. An ordered list of selectors is tried
//! until one exists in the model at hand.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};

const PREFIX: &str = "features.";

/// One named extraction point in the feature stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LayerSelector {
    /// The final feature layer.
    Last,
    /// Feature layer by index.
    Index(usize),
}

impl LayerSelector {
    /// Resolve against a stack of `n_layers` feature layers.
    pub fn resolve(&self, n_layers: usize) -> Option<usize> {
        match *self {
            LayerSelector::Last => n_layers.checked_sub(1),
            LayerSelector::Index(idx) if idx < n_layers => Some(idx),
            LayerSelector::Index(_) => None,
        }
    }
}

impl fmt::Display for LayerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSelector::Last => write!(f, "{}last", PREFIX),
            LayerSelector::Index(idx) => write!(f, "{}{}", PREFIX, idx),
        }
    }
}

/// Error for a selector string that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid target layer '{0}', expected 'features.last' or 'features.N'")]
pub struct ParseLayerError(String);

impl FromStr for LayerSelector {
    type Err = ParseLayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix(PREFIX)
            .ok_or_else(|| ParseLayerError(s.to_string()))?;

        match rest {
            "last" | "-1" => Ok(LayerSelector::Last),
            idx => idx
                .parse::<usize>()
                .map(LayerSelector::Index)
                .map_err(|_| ParseLayerError(s.to_string())),
        }
    }
}

impl TryFrom<String> for LayerSelector {
    type Error = ParseLayerError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LayerSelector> for String {
    fn from(value: LayerSelector) -> Self {
        value.to_string()
    }
}

/// Ordered target layer preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetLayers(Vec<LayerSelector>);

impl Default for TargetLayers {
    /// Last feature layer, falling back to `features.6`.
    fn default() -> Self {
        Self(vec![LayerSelector::Last, LayerSelector::Index(6)])
    }
}

impl TargetLayers {
    /// Create from an explicit list.
    pub fn new(selectors: Vec<LayerSelector>) -> Self {
        Self(selectors)
    }

    /// Parse a list of selector strings.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> std::result::Result<Self, ParseLayerError> {
        names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Selectors in preference order.
    pub fn selectors(&self) -> &[LayerSelector] {
        &self.0
    }

    /// Whether no selector is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first selector that exists in a stack of `n_layers`.
    pub fn resolve(&self, n_layers: usize) -> Result<usize> {
        self.0
            .iter()
            .find_map(|selector| selector.resolve(n_layers))
            .ok_or_else(|| ExplainError::NoTargetLayer {
                requested: self
                    .0
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                available: n_layers,
            })
    }
}
