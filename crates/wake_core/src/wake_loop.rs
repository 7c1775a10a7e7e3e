//! Bookkeeping records tying wake unknowns into the global implicit solve.

use crate::edge::EdgeRef;
use serde::{Deserialize, Serialize};

/// One agglomerated wake loop between two neighbouring trails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalWakeLoop {
    pub stall_factor: f64,
    pub delta_stall_factor: f64,
    pub vortex_stretching_ratio: f64,
    pub delta_vortex_stretching_ratio: f64,
    pub stall_equation: usize,
    pub stretching_equation: usize,
}

impl Default for GlobalWakeLoop {
    fn default() -> Self {
        Self {
            stall_factor: 1.0,
            delta_stall_factor: 0.0,
            vortex_stretching_ratio: 1.0,
            delta_vortex_stretching_ratio: 0.0,
            stall_equation: 0,
            stretching_equation: 0,
        }
    }
}

impl GlobalWakeLoop {
    /// Takes the next two equation numbers and returns the one after them.
    pub fn assign_equations(&mut self, next: usize) -> usize {
        self.stall_equation = next;
        self.stretching_equation = next + 1;
        next + 2
    }

    /// Reads this loop's deltas out of a global solution vector.
    pub fn load_deltas(&mut self, solution: &[f64]) {
        self.delta_stall_factor = solution.get(self.stall_equation).copied().unwrap_or(0.0);
        self.delta_vortex_stretching_ratio = solution
            .get(self.stretching_equation)
            .copied()
            .unwrap_or(0.0);
    }

    pub fn apply_deltas(&mut self) {
        self.stall_factor += self.delta_stall_factor;
        self.vortex_stretching_ratio += self.delta_vortex_stretching_ratio;
        self.delta_stall_factor = 0.0;
        self.delta_vortex_stretching_ratio = 0.0;
    }
}

/// Residual equations of one leaf wake edge and the loops on either side of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEdge {
    pub residual_equations: [usize; 3],
    /// Loop indices to the left and right; equal at the sheet boundary.
    pub loops: (usize, usize),
    pub edge: EdgeRef,
}
