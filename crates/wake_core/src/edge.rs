//! Per-level arena of straight vortex edges for one trailing filament.
//!
//! Level 0 holds the `N` finest edges, every level above merges consecutive
//! pairs, and the last level holds a single edge spanning the whole finite
//! part of the filament. Children are addressed by [`EdgeRef`] rather than
//! by pointer, so rebuilding a level never invalidates another.

use crate::biot_savart::{core_width, segment_velocity, semi_infinite_velocity};
use crate::error::{WakeError, WakeResult};
use nalgebra::Vector3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRef {
    pub level: usize,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct VortexEdge {
    pub start: Vector3<f64>,
    pub end: Vector3<f64>,
    pub midpoint: Vector3<f64>,
    pub length: f64,
    /// Sum of the leaf lengths below this edge.
    pub reference_length: f64,
    pub gamma: f64,
    pub sigma: f64,
    /// Arc length from the trailing edge to `start`.
    pub arc_start: f64,
    /// Mean wake age of the two end nodes.
    pub age: f64,
    /// Velocity sampled at the midpoint by the outer solver.
    pub velocity: Vector3<f64>,
    pub children: Option<[EdgeRef; 2]>,
}

impl Default for VortexEdge {
    fn default() -> Self {
        Self {
            start: Vector3::zeros(),
            end: Vector3::zeros(),
            midpoint: Vector3::zeros(),
            length: 0.0,
            reference_length: 0.0,
            gamma: 0.0,
            sigma: 0.0,
            arc_start: 0.0,
            age: 0.0,
            velocity: Vector3::zeros(),
            children: None,
        }
    }
}

impl VortexEdge {
    pub fn set_endpoints(&mut self, start: Vector3<f64>, end: Vector3<f64>) {
        self.start = start;
        self.end = end;
        self.midpoint = 0.5 * (start + end);
        self.length = (end - start).norm();
    }

    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    pub fn direction(&self) -> Vector3<f64> {
        let d = self.end - self.start;
        let n = d.norm();
        if n > 0.0 {
            d / n
        } else {
            Vector3::zeros()
        }
    }

    pub fn induced_velocity(&self, point: &Vector3<f64>, core: f64) -> Vector3<f64> {
        self.induced_velocity_for(point, self.gamma, core)
    }

    pub fn induced_velocity_for(
        &self,
        point: &Vector3<f64>,
        gamma: f64,
        core: f64,
    ) -> Vector3<f64> {
        let width = core_width(core, gamma, self.age);
        segment_velocity(&self.start, &self.end, point, gamma, width)
    }

    /// Treats the edge as the first piece of a filament that never ends.
    pub fn induced_velocity_to_infinity(
        &self,
        point: &Vector3<f64>,
        gamma: f64,
        core: f64,
    ) -> Vector3<f64> {
        let width = core_width(core, gamma, self.age);
        semi_infinite_velocity(&self.start, &(self.end - self.start), point, gamma, width)
    }
}

#[derive(Debug, Clone)]
pub struct EdgeHierarchy {
    levels: Vec<Vec<VortexEdge>>,
    tail: VortexEdge,
}

impl EdgeHierarchy {
    /// Allocates the arena for `num_sub_vortices` finest edges.
    pub fn new(num_sub_vortices: usize) -> WakeResult<Self> {
        if !num_sub_vortices.is_power_of_two() {
            return Err(WakeError::NotPowerOfTwo(num_sub_vortices));
        }
        let number_of_levels = num_sub_vortices.trailing_zeros() as usize + 1;
        let mut levels = Vec::with_capacity(number_of_levels);
        let mut count = num_sub_vortices;
        for level in 0..number_of_levels {
            let mut edges = vec![VortexEdge::default(); count];
            if level > 0 {
                for (i, edge) in edges.iter_mut().enumerate() {
                    edge.children = Some([
                        EdgeRef { level: level - 1, index: 2 * i },
                        EdgeRef { level: level - 1, index: 2 * i + 1 },
                    ]);
                }
            }
            levels.push(edges);
            count /= 2;
        }
        Ok(Self {
            levels,
            tail: VortexEdge::default(),
        })
    }

    pub fn number_of_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn number_of_sub_vortices(&self) -> usize {
        self.levels[0].len()
    }

    pub fn level(&self, level: usize) -> &[VortexEdge] {
        &self.levels[level]
    }

    pub fn level_mut(&mut self, level: usize) -> &mut [VortexEdge] {
        &mut self.levels[level]
    }

    pub fn edge(&self, edge: EdgeRef) -> &VortexEdge {
        &self.levels[edge.level][edge.index]
    }

    pub fn tail(&self) -> &VortexEdge {
        &self.tail
    }

    pub fn tail_mut(&mut self) -> &mut VortexEdge {
        &mut self.tail
    }

    /// Re-derives every edge from the node list.
    ///
    /// `nodes`, `arc` and `age` hold `N + 2` entries; the last node only
    /// orients the tail.
    pub fn rebuild(&mut self, nodes: &[Vector3<f64>], arc: &[f64], age: &[f64], sigma: f64) {
        let n = self.number_of_sub_vortices();
        let mut stride = 1;
        for level in 0..self.levels.len() {
            for j in 0..self.levels[level].len() {
                let i = j * stride;
                let reference_length = if level == 0 {
                    (nodes[i + stride] - nodes[i]).norm()
                } else {
                    let below = &self.levels[level - 1];
                    below[2 * j].reference_length + below[2 * j + 1].reference_length
                };
                let edge = &mut self.levels[level][j];
                edge.set_endpoints(nodes[i], nodes[i + stride]);
                edge.reference_length = reference_length;
                edge.sigma = sigma;
                edge.arc_start = arc[i];
                edge.age = 0.5 * (age[i] + age[i + stride]);
            }
            stride *= 2;
        }

        self.tail.set_endpoints(nodes[n], nodes[n + 1]);
        self.tail.reference_length = self.tail.length;
        self.tail.sigma = sigma;
        self.tail.arc_start = arc[n];
        self.tail.age = 0.5 * (age[n] + age[n + 1]);
    }

    pub fn set_uniform_gamma(&mut self, gamma: f64) {
        for edge in self.levels.iter_mut().flatten() {
            edge.gamma = gamma;
        }
        self.tail.gamma = gamma;
    }

    /// Loads the finest level and merges upward with length weights.
    pub fn set_leaf_gammas(&mut self, leaves: &[f64], tail: f64) {
        let merged = self.merged_gammas(leaves);
        for (edges, gammas) in self.levels.iter_mut().zip(merged) {
            for (edge, gamma) in edges.iter_mut().zip(gammas) {
                edge.gamma = gamma;
            }
        }
        self.tail.gamma = tail;
    }

    /// Per-level circulation obtained by merging `leaves` pairwise, weighted
    /// by each child's reference length.
    pub fn merged_gammas(&self, leaves: &[f64]) -> Vec<Vec<f64>> {
        let mut merged = Vec::with_capacity(self.levels.len());
        let mut current: Vec<f64> = self.levels[0]
            .iter()
            .enumerate()
            .map(|(i, _)| leaves.get(i).copied().unwrap_or(0.0))
            .collect();
        for level in 1..self.levels.len() {
            let below = &self.levels[level - 1];
            let next = (0..self.levels[level].len())
                .map(|j| {
                    let (w1, w2) = merge_weights(
                        below[2 * j].reference_length,
                        below[2 * j + 1].reference_length,
                    );
                    w1 * current[2 * j] + w2 * current[2 * j + 1]
                })
                .collect();
            merged.push(std::mem::replace(&mut current, next));
        }
        merged.push(current);
        merged
    }

    /// Hierarchical Biot-Savart sum using the circulation stored on each edge.
    pub fn induced_velocity(
        &self,
        point: &Vector3<f64>,
        core: f64,
        far_away: f64,
        include_tail: bool,
    ) -> Vector3<f64> {
        let tail = include_tail.then_some(self.tail.gamma);
        self.induced_velocity_with(point, core, far_away, tail, &|edge: EdgeRef| {
            self.edge(edge).gamma
        })
    }

    /// Hierarchical sum with circulation supplied by `gamma_of`; the tail is
    /// evaluated only when `tail_gamma` is given.
    pub fn induced_velocity_with<G>(
        &self,
        point: &Vector3<f64>,
        core: f64,
        far_away: f64,
        tail_gamma: Option<f64>,
        gamma_of: &G,
    ) -> Vector3<f64>
    where
        G: Fn(EdgeRef) -> f64,
    {
        let top = self.levels.len() - 1;
        let mut q = Vector3::zeros();
        for index in 0..self.levels[top].len() {
            let edge = EdgeRef { level: top, index };
            self.accumulate(edge, point, core, far_away, gamma_of, &mut q);
        }
        if let Some(gamma) = tail_gamma {
            q += self.tail.induced_velocity_to_infinity(point, gamma, core);
        }
        q
    }

    /// Leaf-by-leaf sum with no agglomeration.
    pub fn direct_induced_velocity(
        &self,
        point: &Vector3<f64>,
        core: f64,
        include_tail: bool,
    ) -> Vector3<f64> {
        let mut q: Vector3<f64> = self.levels[0]
            .iter()
            .map(|edge| edge.induced_velocity(point, core))
            .sum();
        if include_tail {
            q += self.tail.induced_velocity_to_infinity(point, self.tail.gamma, core);
        }
        q
    }

    fn accumulate<G>(
        &self,
        edge_ref: EdgeRef,
        point: &Vector3<f64>,
        core: f64,
        far_away: f64,
        gamma_of: &G,
        q: &mut Vector3<f64>,
    ) where
        G: Fn(EdgeRef) -> f64,
    {
        let edge = self.edge(edge_ref);
        let ratio = if edge.reference_length > 0.0 {
            (edge.midpoint - point).norm() / edge.reference_length
        } else {
            f64::INFINITY
        };
        match edge.children {
            Some([c1, c2]) if ratio < far_away => {
                self.accumulate(c1, point, core, far_away, gamma_of, q);
                self.accumulate(c2, point, core, far_away, gamma_of, q);
            }
            _ => *q += edge.induced_velocity_for(point, gamma_of(edge_ref), core),
        }
    }

    pub fn zero_velocities(&mut self) {
        for edge in self.levels.iter_mut().flatten() {
            edge.velocity = Vector3::zeros();
        }
        self.tail.velocity = Vector3::zeros();
    }

    /// Adds each coarse edge velocity into both of its children, top down.
    pub fn prolongate_velocities(&mut self) {
        for level in (1..self.levels.len()).rev() {
            let (below, above) = self.levels.split_at_mut(level);
            let below = &mut below[level - 1];
            for (j, edge) in above[0].iter().enumerate() {
                below[2 * j].velocity += edge.velocity;
                below[2 * j + 1].velocity += edge.velocity;
            }
        }
    }
}

/// Length-proportional weights; equal split when both lengths vanish.
pub fn merge_weights(length1: f64, length2: f64) -> (f64, f64) {
    let total = length1 + length2;
    if total > 0.0 {
        let w1 = length1 / total;
        (w1, 1.0 - w1)
    } else {
        (0.5, 0.5)
    }
}
