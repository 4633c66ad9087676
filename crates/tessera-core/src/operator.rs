//! Operator contract shared by all operator variants.

use crate::context::Context;
use crate::execution::ExecutionContext;
use crate::tensor::Tensor;
use crate::types::{DataType, Shape, TensorSpecs};
use crate::Result;

/// Result of [`Operator::setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSetup {
    /// Specs of the tensors `forward` will write.
    pub outputs: Vec<TensorSpecs>,

    /// Scratch memory the operator allocated for itself, in bytes.
    pub workspace: usize,
}

/// Lifecycle state of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    /// Constructed; `setup` has not run.
    Unconfigured,
    /// Parameters and kernels exist; `reshape` and `forward` may be called.
    Ready,
}

/// Trait for tensor operators.
///
/// An operator is configured once with [`setup`](Operator::setup), which fixes
/// channel counts and allocates parameters, workspace and kernels. After that
/// [`reshape`](Operator::reshape) may adapt output shapes to a new batch size or
/// spatial extent and [`forward`](Operator::forward) may run any number of
/// times.
///
/// # Example
///
/// ```ignore
/// let mut conv = Convolution2D::new(&ctx, config, DataType::F32)?;
/// let setup = conv.setup(&[TensorSpecs::new([2, 3, 8, 8], DataType::F32)])?;
/// let mut out = Tensor::new(&ctx, setup.outputs[0].clone())?;
/// conv.forward(&[input], std::slice::from_mut(&mut out), &ExecutionContext::new(&ctx))?;
/// ```
pub trait Operator: Send + Sync {
    /// Operator type name, as used by the registry (e.g. "Convolution2D").
    fn name(&self) -> &str;

    fn state(&self) -> OperatorState;

    /// Configure the operator for inputs with the given specs.
    fn setup(&mut self, inputs: &[TensorSpecs]) -> Result<OperatorSetup>;

    /// Output shapes for new input shapes, without reallocating parameters.
    fn reshape(&mut self, inputs: &[Shape]) -> Result<Vec<Shape>>;

    /// Compute `outputs` from `inputs`.
    ///
    /// GPU work is enqueued through `ectx` and may still be running when this
    /// returns.
    fn forward(
        &mut self,
        inputs: &[Tensor],
        outputs: &mut [Tensor],
        ectx: &ExecutionContext,
    ) -> Result<()>;

    /// Propagate `output_diff` into `input_diff`.
    fn backward_data(
        &mut self,
        outputs: &[Tensor],
        output_diff: &[Tensor],
        inputs: &[Tensor],
        input_diff: &mut [Tensor],
        ectx: &ExecutionContext,
    ) -> Result<()>;

    /// Accumulate parameter gradients into `param_diff`.
    fn backward_param(
        &mut self,
        outputs: &[Tensor],
        output_diff: &[Tensor],
        inputs: &[Tensor],
        param_diff: &mut [Tensor],
        ectx: &ExecutionContext,
    ) -> Result<()>;

    /// Learnable tensors owned by the operator.
    fn parameters(&self) -> &[Tensor] {
        &[]
    }

    fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut []
    }
}

/// Parameter tensors and workspace owned by an operator.
///
/// Storage is allocated on the side of the operator's [`Context`].
pub struct ParameterStore {
    ctx: Context,
    parameters: Vec<Tensor>,
    workspace: Option<Tensor>,
}

impl ParameterStore {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            parameters: Vec::new(),
            workspace: None,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Allocate parameters matching `specs`.
    ///
    /// Existing parameters are kept when their specs already match, so a
    /// repeated setup does not discard loaded weights.
    pub fn setup_parameters(&mut self, specs: Vec<TensorSpecs>) -> Result<()> {
        let unchanged = self.parameters.len() == specs.len()
            && self.parameters.iter().zip(&specs).all(|(p, s)| p.specs() == s);
        if unchanged {
            return Ok(());
        }

        self.parameters = specs
            .into_iter()
            .map(|s| Tensor::new(&self.ctx, s))
            .collect::<Result<_>>()?;
        Ok(())
    }

    pub fn parameters(&self) -> &[Tensor] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut self.parameters
    }

    /// Make sure the workspace holds at least `bytes` bytes.
    pub fn ensure_workspace(&mut self, bytes: usize) -> Result<()> {
        let elements = bytes.div_ceil(DataType::F32.size());
        if self.workspace.as_ref().is_some_and(|w| w.len() >= elements) {
            return Ok(());
        }

        tracing::debug!(bytes, "allocating workspace");
        let specs = TensorSpecs::new([elements.max(1)], DataType::F32);
        self.workspace = Some(Tensor::new(&self.ctx, specs)?);
        Ok(())
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace
            .as_ref()
            .map_or(0, |w| w.len() * DataType::F32.size())
    }

    /// Parameters and workspace borrowed together.
    pub fn split_mut(&mut self) -> (&[Tensor], Option<&mut Tensor>) {
        (&self.parameters, self.workspace.as_mut())
    }
}
