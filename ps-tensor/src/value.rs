//! Per-row payload: the parameter tensor plus its optimizer state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tensor::DenseTensor;

/// Tags the optimizer-state slots a `Value` may carry. Which ones are
/// populated depends on the optimizer in use (see `ps-table`'s optimizer
/// implementations); every slot is allocated lazily on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Steps,
    MomentumBuffer,
    StateSum,
    FirstMoment,
    SecondMoment,
    SecondMomentMax,
    SquareAverage,
    GAve,
}

/// One row of a table: the trained value and whatever optimizer state has
/// been allocated for it so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub val: DenseTensor,
    pub states: HashMap<StateKind, DenseTensor>,
    pub state_counters: HashMap<StateKind, i64>,
}

impl Value {
    pub fn new(val: DenseTensor) -> Self {
        Value {
            val,
            states: HashMap::new(),
            state_counters: HashMap::new(),
        }
    }

    /// Fetch a state tensor, allocating it as a same-shaped zero tensor on
    /// first touch. Mirrors the `if (value->states.find(..) == end())
    /// emplace(.., grad.Like().Zero())` pattern repeated across every
    /// optimizer's `Update`.
    pub fn state_or_zero_like(&mut self, kind: StateKind, like: &DenseTensor) -> &mut DenseTensor {
        self.states
            .entry(kind)
            .or_insert_with(|| like.zero_like())
    }

    /// Increment and return a step counter, used by Adam's bias correction.
    pub fn bump_steps(&mut self, kind: StateKind) -> i64 {
        let c = self.state_counters.entry(kind).or_insert(0);
        *c += 1;
        *c
    }
}
