use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backprop;
use crate::error::Result;
use crate::shape::Shape;
use crate::tape::{self, OpId};
use crate::tensor::Tensor;

// Variable: a node of the computation graph
//
// A Variable is a cheap handle (Rc) around a tensor value, its accumulated
// gradient and a note on where the value came from:
//
//   Leaf         created by the user (parameters, inputs) or unchained
//   Recorded(op) produced by a recorded operation on the tape
//   Detached     produced while recording was disabled
//
// Gradients are Variables too; with create_graph they carry a graph of
// their own and can be differentiated again.

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Provenance of a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Leaf,
    Recorded(OpId),
    Detached,
}

struct VariableInner {
    id: u64,
    data: Tensor,
    grad: Option<Variable>,
    origin: Origin,
    requires_grad: bool,
    name: Option<String>,
}

/// Shared handle to a graph node. Clones alias the same node.
#[derive(Clone)]
pub struct Variable(Rc<RefCell<VariableInner>>);

/// Non-owning handle, held by the tape for operation outputs.
#[derive(Clone)]
pub struct WeakVariable(Weak<RefCell<VariableInner>>);

impl WeakVariable {
    pub fn upgrade(&self) -> Option<Variable> {
        self.0.upgrade().map(Variable)
    }
}

impl Variable {
    fn build(data: Tensor, origin: Origin, requires_grad: bool) -> Self {
        Variable(Rc::new(RefCell::new(VariableInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            data,
            grad: None,
            origin,
            requires_grad,
            name: None,
        })))
    }

    /// A trainable leaf.
    pub fn new(data: Tensor) -> Self {
        Self::build(data, Origin::Leaf, true)
    }

    /// A leaf that never receives a gradient.
    pub fn constant(data: Tensor) -> Self {
        Self::build(data, Origin::Leaf, false)
    }

    pub fn named(data: Tensor, name: impl Into<String>) -> Self {
        let v = Self::new(data);
        v.set_name(name);
        v
    }

    pub(crate) fn detached(data: Tensor) -> Self {
        Self::build(data, Origin::Detached, false)
    }

    /// Output of an operation that is about to be recorded; `set_creator`
    /// completes it.
    pub(crate) fn pending(data: Tensor, requires_grad: bool) -> Self {
        Self::build(data, Origin::Detached, requires_grad)
    }

    pub(crate) fn set_creator(&self, op: OpId) {
        self.0.borrow_mut().origin = Origin::Recorded(op);
    }

    pub(crate) fn downgrade(&self) -> WeakVariable {
        WeakVariable(Rc::downgrade(&self.0))
    }

    fn inner(&self) -> Ref<'_, VariableInner> {
        self.0.borrow()
    }

    /// Process-unique id, stable for the node's lifetime.
    pub fn id(&self) -> u64 {
        self.inner().id
    }

    /// Whether two handles refer to the same node.
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // Value

    /// The node's value. Returns a handle sharing storage with the node.
    pub fn data(&self) -> Tensor {
        self.inner().data.clone()
    }

    /// Replace the value (optimizer updates, loading weights). Does not touch
    /// the graph.
    pub fn set_data(&self, data: Tensor) {
        self.0.borrow_mut().data = data;
    }

    pub fn shape(&self) -> Shape {
        self.inner().data.shape().clone()
    }

    pub fn dims(&self) -> Vec<usize> {
        self.inner().data.dims().to_vec()
    }

    pub fn rank(&self) -> usize {
        self.inner().data.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner().data.elem_count()
    }

    /// The single value of a one-element node.
    pub fn item(&self) -> Result<f32> {
        self.inner().data.to_scalar()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.inner().data.to_vec()
    }

    // Gradient

    pub fn grad(&self) -> Option<Variable> {
        self.inner().grad.clone()
    }

    pub fn set_grad(&self, grad: Option<Variable>) {
        self.0.borrow_mut().grad = grad;
    }

    pub fn cleargrad(&self) {
        self.set_grad(None);
    }

    pub fn requires_grad(&self) -> bool {
        self.inner().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.0.borrow_mut().requires_grad = requires_grad;
    }

    // Graph

    pub fn origin(&self) -> Origin {
        self.inner().origin
    }

    /// The recorded operation that produced this node, if any.
    pub fn creator(&self) -> Option<OpId> {
        match self.origin() {
            Origin::Recorded(op) => Some(op),
            _ => None,
        }
    }

    /// Forget the creator; the node becomes a leaf.
    pub fn unchain(&self) {
        let mut inner = self.0.borrow_mut();
        if matches!(inner.origin, Origin::Recorded(_)) {
            inner.origin = Origin::Leaf;
        }
    }

    /// Unchain every node upstream of this one, cutting the graph behind it.
    /// Operations already cleared from the tape are skipped.
    pub fn unchain_backward(&self) {
        let mut stack: Vec<OpId> = self.creator().into_iter().collect();
        while let Some(op) = stack.pop() {
            let Ok(entry) = tape::entry(op) else {
                continue;
            };
            for input in entry.inputs() {
                if let Some(prev) = input.creator() {
                    stack.push(prev);
                    input.unchain();
                }
            }
        }
    }

    /// A new constant leaf sharing this node's value.
    pub fn detach(&self) -> Variable {
        Variable::constant(self.data())
    }

    pub fn name(&self) -> Option<String> {
        self.inner().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.0.borrow_mut().name = Some(name.into());
    }

    /// Reverse-mode differentiation from this node. See
    /// [`backprop::backward`].
    pub fn backward(&self, retain_grad: bool, create_graph: bool) -> Result<()> {
        backprop::backward(self, retain_grad, create_graph)
    }

    /// `backward(false, false)`.
    pub fn backward_default(&self) -> Result<()> {
        self.backward(false, false)
    }
}

impl From<Tensor> for Variable {
    fn from(t: Tensor) -> Self {
        Variable::new(t)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        let mut s = f.debug_struct("Variable");
        if let Some(name) = &inner.name {
            s.field("name", name);
        }
        s.field("origin", &inner.origin)
            .field("requires_grad", &inner.requires_grad)
            .field("data", &inner.data)
            .finish()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        match &inner.name {
            Some(name) => write!(f, "variable({name}, {:?})", inner.data),
            None => write!(f, "variable({:?})", inner.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::functions;

    #[test]
    fn test_constructors() {
        let x = Variable::new(Tensor::ones((2, 3)));
        assert!(x.requires_grad());
        assert_eq!(x.origin(), Origin::Leaf);
        assert_eq!(x.dims(), vec![2, 3]);

        let c = Variable::constant(Tensor::zeros(4));
        assert!(!c.requires_grad());
        assert!(c.grad().is_none());
        assert_ne!(x.id(), c.id());
    }

    #[test]
    fn test_clones_alias() {
        let x = Variable::new(Tensor::scalar(1.0));
        let y = x.clone();
        y.set_name("x");
        assert_eq!(x.name().as_deref(), Some("x"));
        assert!(x.ptr_eq(&y));
    }

    #[test]
    fn test_recorded_and_detached() -> Result<()> {
        let x = Variable::new(Tensor::scalar(2.0));
        let y = functions::square(&x)?;
        assert!(matches!(y.origin(), Origin::Recorded(_)));
        assert!(y.requires_grad());

        let z = {
            let _g = config::no_grad();
            functions::square(&x)?
        };
        assert_eq!(z.origin(), Origin::Detached);
        assert!(!z.requires_grad());
        Ok(())
    }

    #[test]
    fn test_unchain_backward() -> Result<()> {
        let x = Variable::new(Tensor::scalar(2.0));
        let a = functions::square(&x)?;
        let b = functions::exp(&a)?;
        let c = functions::square(&b)?;
        c.unchain_backward();
        assert!(c.creator().is_some());
        assert_eq!(b.origin(), Origin::Leaf);
        assert_eq!(a.origin(), Origin::Leaf);

        c.backward(false, false)?;
        assert!(b.grad().is_some());
        assert!(x.grad().is_none());
        Ok(())
    }

    #[test]
    fn test_set_data_keeps_grad() {
        let x = Variable::new(Tensor::scalar(1.0));
        x.set_grad(Some(Variable::constant(Tensor::scalar(3.0))));
        x.set_data(Tensor::scalar(5.0));
        assert_eq!(x.item().unwrap(), 5.0);
        assert_eq!(x.grad().unwrap().item().unwrap(), 3.0);
        x.cleargrad();
        assert!(x.grad().is_none());
    }
}
