//! Scoped gradient recording.
//!
//! The runtime tracks every operation derived from a [`Var`] on its own; the
//! computation graph lives inside the resulting tensors and goes away when
//! they are dropped. [`GradientTape`] gives that implicit behaviour an
//! explicit shape: a loss is produced inside [`GradientTape::record`], and
//! the tape is then consumed by [`GradientTape::gradient`], which runs one
//! backward pass and hands back a [`Gradients`] set keyed by the requested
//! source variables.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::debug;

use crate::error::{TensorError, TensorResult};

/// A non-persistent gradient recording context.
///
/// A tape can be differentiated once. Recording resources are owned by the
/// tensors produced inside [`record`](Self::record), so they are released on
/// every exit path, including early returns through `?`.
#[derive(Debug)]
pub struct GradientTape {
    span: tracing::Span,
    recorded: bool,
}

impl Default for GradientTape {
    fn default() -> Self {
        Self::new()
    }
}

impl GradientTape {
    /// Creates an empty tape.
    pub fn new() -> Self {
        Self {
            span: tracing::debug_span!("gradient_tape"),
            recorded: false,
        }
    }

    /// Runs `f` inside the recording scope and returns its result.
    ///
    /// Errors from `f` are returned unchanged.
    pub fn record<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let _entered = self.span.enter();
        self.recorded = true;
        f()
    }

    /// Returns whether [`record`](Self::record) has run on this tape.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    /// Differentiates `target` with respect to each of `sources`.
    ///
    /// `target` must hold exactly one element. Sources that did not take part
    /// in computing `target` get no gradient; that is not an error.
    ///
    /// # Errors
    ///
    /// - [`TensorError::TapeNotRecorded`] if nothing was recorded.
    /// - [`TensorError::NonScalar`] if `target` has more than one element.
    /// - [`TensorError::Candle`] if the backward pass fails.
    pub fn gradient(self, target: &Tensor, sources: &[Var]) -> TensorResult<Gradients> {
        if !self.recorded {
            return Err(TensorError::TapeNotRecorded);
        }
        let _entered = self.span.enter();
        ensure_scalar(target)?;

        let store = target.backward()?;
        let gradients = Gradients {
            store,
            sources: sources.to_vec(),
        };

        let absent = gradients.num_absent();
        if absent > 0 {
            debug!(
                absent,
                total = sources.len(),
                "Some variables received no gradient"
            );
        }
        Ok(gradients)
    }
}

/// Gradients from one backward pass, paired with their source variables.
pub struct Gradients {
    store: GradStore,
    sources: Vec<Var>,
}

impl std::fmt::Debug for Gradients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gradients")
            .field("sources", &self.sources.len())
            .field("absent", &self.num_absent())
            .finish()
    }
}

impl Gradients {
    /// Returns the gradient for `var`, or `None` if it was not involved.
    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.store.get(var.as_tensor())
    }

    /// Returns the source variables in the order they were requested.
    pub fn sources(&self) -> &[Var] {
        &self.sources
    }

    /// Iterates `(gradient, variable)` pairs in source order.
    pub fn pairs(&self) -> impl Iterator<Item = (Option<&Tensor>, &Var)> + '_ {
        self.sources.iter().map(move |v| (self.get(v), v))
    }

    /// Returns the number of sources without a gradient.
    pub fn num_absent(&self) -> usize {
        self.sources.iter().filter(|v| self.get(v).is_none()).count()
    }

    /// Returns the underlying runtime gradient store.
    pub fn store(&self) -> &GradStore {
        &self.store
    }
}

fn ensure_scalar(t: &Tensor) -> TensorResult<()> {
    if t.elem_count() == 1 {
        Ok(())
    } else {
        Err(TensorError::NonScalar {
            shape: t.dims().to_vec(),
        })
    }
}

/// Reads a one-element tensor of any rank as `f64`.
///
/// # Errors
///
/// Returns [`TensorError::NonScalar`] if the tensor does not hold exactly one
/// element.
pub fn scalar_value(t: &Tensor) -> TensorResult<f64> {
    ensure_scalar(t)?;
    let values = t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    values.first().copied().ok_or_else(|| TensorError::NonScalar {
        shape: t.dims().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_gradient_of_simple_product() {
        let w = Var::new(&[2.0f32, -1.0], &Device::Cpu).unwrap();
        let x = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();

        let mut tape = GradientTape::new();
        let loss = tape.record(|| w.as_tensor().mul(&x)?.sum_all()).unwrap();
        let grads = tape.gradient(&loss, &[w.clone()]).unwrap();

        assert_eq!(grads.get(&w).unwrap().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
        assert_eq!(grads.num_absent(), 0);
    }

    #[test]
    fn test_uninvolved_variable_has_no_gradient() {
        let used = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let unused = Var::new(&[5.0f32], &Device::Cpu).unwrap();

        let mut tape = GradientTape::new();
        let loss = tape.record(|| used.as_tensor().sqr()?.sum_all()).unwrap();
        let grads = tape
            .gradient(&loss, &[used.clone(), unused.clone()])
            .unwrap();

        assert!(grads.get(&used).is_some());
        assert!(grads.get(&unused).is_none());
        assert_eq!(grads.num_absent(), 1);

        let pairs: Vec<bool> = grads.pairs().map(|(g, _)| g.is_some()).collect();
        assert_eq!(pairs, vec![true, false]);
    }

    #[test]
    fn test_gradient_requires_recording() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let loss = w.as_tensor().sum_all().unwrap();
        let tape = GradientTape::new();
        assert!(!tape.is_recorded());
        assert!(matches!(
            tape.gradient(&loss, &[w]),
            Err(TensorError::TapeNotRecorded)
        ));
    }

    #[test]
    fn test_gradient_rejects_non_scalar_target() {
        let w = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let mut tape = GradientTape::new();
        let out = tape.record(|| w.as_tensor().sqr()).unwrap();
        assert!(matches!(
            tape.gradient(&out, &[w]),
            Err(TensorError::NonScalar { shape }) if shape == vec![2]
        ));
    }

    #[test]
    fn test_record_propagates_errors() {
        let mut tape = GradientTape::new();
        let result: TensorResult<Tensor> = tape.record(|| {
            Err(TensorError::MissingKey {
                key: "rating".to_string(),
            })
        });
        assert!(matches!(result, Err(TensorError::MissingKey { .. })));
    }

    #[test]
    fn test_scalar_value() {
        let rank0 = Tensor::new(1.5f32, &Device::Cpu).unwrap();
        assert!((scalar_value(&rank0).unwrap() - 1.5).abs() < 1e-9);

        let one_elem = Tensor::new(&[[2.25f64]], &Device::Cpu).unwrap();
        assert!((scalar_value(&one_elem).unwrap() - 2.25).abs() < 1e-9);

        let many = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        assert!(matches!(
            scalar_value(&many),
            Err(TensorError::NonScalar { .. })
        ));
    }
}
