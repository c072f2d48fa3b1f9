//! Structured input batches.
//!
//! A batch is a small tree: tensor leaves, a few plain-value leaves, ordered
//! sequences and string-keyed maps. Loss functions usually receive a map of
//! feature tensors (plus labels and weights), but any shape is allowed.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{TensorError, TensorResult};

/// A nested structure of tensors passed to a model for one step.
#[derive(Debug, Clone)]
pub enum Nested {
    /// Tensor leaf.
    Tensor(Tensor),
    /// String leaf.
    Str(String),
    /// Integer leaf.
    I64(i64),
    /// Float leaf.
    F64(f64),
    /// Boolean leaf.
    Bool(bool),
    /// Null/None leaf.
    Null,
    /// Ordered collection.
    Seq(Vec<Nested>),
    /// String-keyed map.
    Map(BTreeMap<String, Nested>),
}

impl Nested {
    /// Builds a map node from `(key, tensor)` pairs.
    ///
    /// # Example
    ///
    /// ```
    /// use candle_core::{Device, Tensor};
    /// use trellis_tensor::Nested;
    ///
    /// let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap();
    /// let batch = Nested::map_of([("user_id", ids)]);
    /// assert!(batch.tensor("user_id").is_ok());
    /// ```
    pub fn map_of<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Tensor)>,
    {
        Nested::Map(
            pairs
                .into_iter()
                .map(|(k, t)| (k.into(), Nested::Tensor(t)))
                .collect(),
        )
    }

    /// Returns the variant name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Nested::Tensor(_) => "Tensor",
            Nested::Str(_) => "Str",
            Nested::I64(_) => "I64",
            Nested::F64(_) => "F64",
            Nested::Bool(_) => "Bool",
            Nested::Null => "Null",
            Nested::Seq(_) => "Seq",
            Nested::Map(_) => "Map",
        }
    }

    /// Returns the tensor if this node is a tensor leaf.
    pub fn as_tensor(&self) -> TensorResult<&Tensor> {
        match self {
            Nested::Tensor(t) => Ok(t),
            other => Err(TensorError::UnexpectedStructure {
                expected: "Tensor",
                found: other.kind(),
            }),
        }
    }

    /// Returns the items if this node is a sequence.
    pub fn as_seq(&self) -> TensorResult<&[Nested]> {
        match self {
            Nested::Seq(items) => Ok(items),
            other => Err(TensorError::UnexpectedStructure {
                expected: "Seq",
                found: other.kind(),
            }),
        }
    }

    /// Returns the entries if this node is a map.
    pub fn as_map(&self) -> TensorResult<&BTreeMap<String, Nested>> {
        match self {
            Nested::Map(m) => Ok(m),
            other => Err(TensorError::UnexpectedStructure {
                expected: "Map",
                found: other.kind(),
            }),
        }
    }

    /// Looks up a child of a map node.
    ///
    /// Returns `None` for missing keys and for non-map nodes.
    pub fn get(&self, key: &str) -> Option<&Nested> {
        match self {
            Nested::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Looks up a tensor leaf of a map node.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::MissingKey`] if the key is absent, and
    /// [`TensorError::UnexpectedStructure`] if this node is not a map or the
    /// child is not a tensor.
    pub fn tensor(&self, key: &str) -> TensorResult<&Tensor> {
        self.as_map()?
            .get(key)
            .ok_or_else(|| TensorError::MissingKey {
                key: key.to_string(),
            })?
            .as_tensor()
    }

    /// Collects all tensor leaves in traversal order.
    ///
    /// Map children are visited in key order.
    pub fn flatten_tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Nested::Tensor(t) => out.push(t),
            Nested::Seq(items) => items.iter().for_each(|x| x.collect_tensors(out)),
            Nested::Map(m) => m.values().for_each(|x| x.collect_tensors(out)),
            _ => {}
        }
    }
}

impl From<Tensor> for Nested {
    fn from(t: Tensor) -> Self {
        Nested::Tensor(t)
    }
}

impl From<Vec<Nested>> for Nested {
    fn from(items: Vec<Nested>) -> Self {
        Nested::Seq(items)
    }
}

impl From<BTreeMap<String, Nested>> for Nested {
    fn from(m: BTreeMap<String, Nested>) -> Self {
        Nested::Map(m)
    }
}

impl<K: Into<String>> FromIterator<(K, Nested)> for Nested {
    fn from_iter<I: IntoIterator<Item = (K, Nested)>>(iter: I) -> Self {
        Nested::Map(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Normalizes a batch before it reaches a loss function.
///
/// Data pipelines that have no separate label tensor hand batches over as a
/// one-element sequence `(features,)`. This unwraps exactly that case.
///
/// Pre: any batch.
/// Post: if `inputs` is `Seq` with exactly one element, that element is
/// returned (one level only, the element itself is not inspected); every
/// other batch is returned unchanged.
///
/// # Example
///
/// ```
/// use trellis_tensor::{normalize_inputs, Nested};
///
/// let wrapped = Nested::Seq(vec![Nested::I64(7)]);
/// assert!(matches!(normalize_inputs(wrapped), Nested::I64(7)));
///
/// let pair = Nested::Seq(vec![Nested::I64(1), Nested::I64(2)]);
/// assert!(matches!(normalize_inputs(pair), Nested::Seq(v) if v.len() == 2));
/// ```
pub fn normalize_inputs(inputs: Nested) -> Nested {
    match inputs {
        Nested::Seq(mut items) if items.len() == 1 => items.swap_remove(0),
        other => other,
    }
}
