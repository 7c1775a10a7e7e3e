//! Span-wise agglomeration tree over the trails of one lifting surface.
//!
//! Level 0 holds one sheet between every pair of neighbouring trails; each
//! coarser level pairs the sheets below it. When a sheet is far enough from
//! an evaluation point its interior trails are folded into its two bounding
//! trails and only those are evaluated. The folding works on a per-query copy
//! of the circulation, so evaluation never mutates the sheet and can run on
//! many points at once.
//!
//! A periodic sheet closes on itself: the first trail is booked twice, once
//! at each end of the span, with half of its circulation on each copy.

use crate::edge::{EdgeRef, VortexEdge};
use crate::error::{WakeError, WakeResult};
use crate::settings::WakeConfig;
use crate::trail::{ConvectionType, RelaxationResidual, TrailSetup, VortexTrail};
use crate::traits::{InducedVelocityField, WakeLinearOperator};
use crate::wake_loop::{GlobalWakeLoop, WakeEdge};
use anyhow::Context;
use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use rayon::prelude::*;
use std::io::{Read, Write};

/// Distance from the mid-span, in spans, beyond which a sheet is agglomerated.
const SHEET_FAR_AWAY: f64 = 2.0;

/// Below this many trails every trail is evaluated individually.
const MIN_TRAILS_FOR_AGGLOMERATION: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SheetChildren {
    None,
    One(usize),
    Two(usize, usize),
}

#[derive(Debug, Clone)]
struct SheetNode {
    /// Bounding trails, as indices into the (possibly periodic) trail list.
    trail1: usize,
    trail2: usize,
    children: SheetChildren,
    span: f64,
    mid_span: Vector3<f64>,
    /// Bound vortices shed at earlier time steps, one per leaf edge.
    starting: Vec<VortexEdge>,
    starting_gamma: Vec<f64>,
}

impl SheetNode {
    fn is_far_away(&self, point: &Vector3<f64>) -> bool {
        if self.span <= 0.0 {
            return false;
        }
        let dy = point.y - self.mid_span.y;
        let dz = point.z - self.mid_span.z;
        (dy * dy + dz * dz).sqrt() / self.span > SHEET_FAR_AWAY
    }
}

/// Which trails and sheets one evaluation point sees, and with what circulation.
#[derive(Debug)]
struct Interaction {
    gammas: Vec<Vec<f64>>,
    trail_active: Vec<bool>,
    sheet_active: Vec<Vec<bool>>,
}

#[derive(Debug, Clone)]
pub struct VortexSheet {
    config: WakeConfig,
    periodic: bool,
    trails: Vec<VortexTrail>,
    levels: Vec<Vec<SheetNode>>,
    core_width: f64,
    trailing_gamma: Vec<Vec<f64>>,
    max_convected_distance: f64,
    is_rotor: bool,
    wake_loops: Vec<GlobalWakeLoop>,
    number_of_kutta_edges: usize,
}

/// Validates `config` and builds a sheet from the trailing-edge geometry.
pub fn setup_vortex_sheet(
    setups: &[TrailSetup],
    periodic: bool,
    config: WakeConfig,
) -> anyhow::Result<VortexSheet> {
    config.validate().context("invalid wake configuration")?;
    VortexSheet::new(setups, periodic, config).context("failed to set up vortex sheet")
}

impl VortexSheet {
    pub fn new(setups: &[TrailSetup], periodic: bool, config: WakeConfig) -> WakeResult<Self> {
        if setups.len() < 2 {
            return Err(WakeError::TooFewTrailingVortices {
                required: 2,
                found: setups.len(),
            });
        }
        let trails = setups
            .iter()
            .map(|setup| VortexTrail::new(setup, config))
            .collect::<WakeResult<Vec<_>>>()?;
        let n = trails[0].number_of_sub_vortices();
        if let Some(other) = trails.iter().find(|t| t.number_of_sub_vortices() != n) {
            return Err(WakeError::MismatchedSubVortices {
                expected: n,
                found: other.number_of_sub_vortices(),
            });
        }

        let core_scale = if periodic { 2.0 } else { 1.0 };
        let mean_square = trails
            .iter()
            .map(|t| (core_scale * t.sigma()).powi(2))
            .sum::<f64>()
            / trails.len() as f64;
        let core_width = mean_square.sqrt() * config.settings.core_size_factor;

        let virtual_count = trails.len() + usize::from(periodic);
        let trailing_gamma = trails.iter().map(|t| t.gamma().to_vec()).collect();
        let mut sheet = Self {
            config,
            periodic,
            trails,
            levels: build_levels(virtual_count, periodic),
            core_width,
            trailing_gamma,
            max_convected_distance: 0.0,
            is_rotor: false,
            wake_loops: Vec::new(),
            number_of_kutta_edges: 0,
        };
        sheet.update_sheet_geometry();
        sheet.size_wake_loop_list();

        let degenerate = sheet
            .levels
            .iter()
            .flatten()
            .filter(|node| node.span <= 0.0)
            .count();
        if degenerate > 0 {
            warn!("{degenerate} vortex sheets have zero span and are never agglomerated");
        }
        debug!(
            "vortex sheet: {} trails, {} levels, periodic {}, core width {:.4e}",
            sheet.trails.len(),
            sheet.levels.len(),
            periodic,
            core_width
        );
        Ok(sheet)
    }

    /// Re-derives spans and starting-vortex segments from the current trails.
    fn update_sheet_geometry(&mut self) {
        let trails = &self.trails;
        let count = trails.len();
        for node in self.levels.iter_mut().flatten() {
            let first = &trails[node.trail1 % count];
            let second = &trails[node.trail2 % count];
            let (a, b) = (first.te_node(), second.te_node());
            node.span = ((a.y - b.y).powi(2) + (a.z - b.z).powi(2)).sqrt();
            node.mid_span = 0.5 * (a + b);

            let n = first.number_of_sub_vortices();
            node.starting.resize_with(n, VortexEdge::default);
            node.starting_gamma.resize(n, 0.0);
            for (j, edge) in node.starting.iter_mut().enumerate() {
                edge.set_endpoints(first.nodes()[j + 1], second.nodes()[j + 1]);
                edge.reference_length = edge.length;
                edge.sigma = first.sigma();
                edge.arc_start = first.arc()[j];
                edge.age = first.wake_age()[j + 1];
            }
        }
    }

    pub fn config(&self) -> &WakeConfig {
        &self.config
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn number_of_trailing_vortices(&self) -> usize {
        self.trails.len()
    }

    pub fn number_of_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn number_of_sheets(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    pub fn number_of_sub_vortices(&self) -> usize {
        self.trails[0].number_of_sub_vortices()
    }

    pub fn core_width(&self) -> f64 {
        self.core_width
    }

    pub fn max_convected_distance(&self) -> f64 {
        self.max_convected_distance
    }

    pub fn is_rotor(&self) -> bool {
        self.is_rotor
    }

    pub fn trails(&self) -> &[VortexTrail] {
        &self.trails
    }

    pub fn trail(&self, index: usize) -> WakeResult<&VortexTrail> {
        let count = self.trails.len();
        self.trails
            .get(index)
            .ok_or(WakeError::TrailIndexOutOfRange { index, count })
    }

    pub fn trail_mut(&mut self, index: usize) -> WakeResult<&mut VortexTrail> {
        let count = self.trails.len();
        self.trails
            .get_mut(index)
            .ok_or(WakeError::TrailIndexOutOfRange { index, count })
    }

    /// Sets the bound circulation shed into trail `index`.
    pub fn set_trailing_edge_circulation(&mut self, index: usize, gamma: f64) -> WakeResult<()> {
        self.trail_mut(index)?.set_bound_circulation(gamma);
        Ok(())
    }

    pub fn wake_loops(&self) -> &[GlobalWakeLoop] {
        &self.wake_loops
    }

    pub fn number_of_wake_loops(&self) -> usize {
        self.wake_loops.len()
    }

    pub fn number_of_kutta_edges(&self) -> usize {
        self.number_of_kutta_edges
    }

    pub fn size_wake_loop_list(&mut self) {
        let segments = self.trails[0].number_of_nodes() - 1;
        let count = self.trails.len();
        let mut loops = (count - 1) * segments;
        self.number_of_kutta_edges = count - 1;
        if self.periodic {
            loops += segments;
            self.number_of_kutta_edges += 1;
        }
        self.wake_loops = vec![GlobalWakeLoop::default(); loops];
    }

    /// Leaf wake edges of every trail with the loops on either side.
    pub fn wake_edges(&self) -> Vec<WakeEdge> {
        let segments = self.trails[0].number_of_nodes() - 1;
        let sheets = self.levels[0].len();
        let mut edges = Vec::new();
        for (t, trail) in self.trails.iter().enumerate() {
            let left = match t {
                0 if self.periodic => sheets - 1,
                0 => 0,
                _ => t - 1,
            };
            let right = t.min(sheets - 1);
            for j in 0..trail.number_of_sub_vortices() {
                edges.push(WakeEdge {
                    residual_equations: trail.equation_numbers()[j + 1],
                    loops: (left * segments + j, right * segments + j),
                    edge: EdgeRef { level: 0, index: j },
                });
            }
        }
        edges
    }

    /// Numbers the node equations of every trail, then the stall equations
    /// of every wake loop. Returns the next free equation number.
    pub fn assign_wake_equations(&mut self, first: usize) -> usize {
        let mut next = first;
        for trail in &mut self.trails {
            next = trail.assign_equations(next);
        }
        for wake_loop in &mut self.wake_loops {
            next = wake_loop.assign_equations(next);
        }
        next
    }

    /// Applies the stall and stretching updates found in a global solution.
    pub fn update_wake_loops(&mut self, solution: &[f64]) {
        for wake_loop in &mut self.wake_loops {
            wake_loop.load_deltas(solution);
            wake_loop.apply_deltas();
        }
    }

    pub fn set_mach_number(&mut self, mach: f64) {
        self.config.settings.mach = mach;
        for trail in &mut self.trails {
            trail.set_mach_number(mach);
        }
    }

    pub fn turn_wake_damping_on(&mut self) {
        for trail in &mut self.trails {
            trail.set_damping(true);
        }
    }

    pub fn turn_wake_damping_off(&mut self) {
        for trail in &mut self.trails {
            trail.set_damping(false);
        }
    }

    /// Flags every trail whose component is in `components` as a rotor wake.
    pub fn update_rotor_flags(&mut self, components: &[bool]) {
        self.is_rotor = false;
        for trail in &mut self.trails {
            let flagged = components
                .get(trail.component_id())
                .copied()
                .unwrap_or(false);
            trail.set_rotor(flagged);
            self.is_rotor |= trail.is_rotor();
        }
    }

    pub fn update_convected_distance(&mut self, step: usize, time: f64) {
        self.max_convected_distance = self.config.freestream.speed() * time;
        for trail in &mut self.trails {
            trail.set_time(step, time);
        }
    }

    pub fn save_vortex_state(&mut self) {
        for trail in &mut self.trails {
            trail.save_vortex_state();
        }
    }

    /// Propagates the bound circulation into the wake and snapshots it for
    /// evaluation.
    pub fn update_vortex_strengths(&mut self, convection: ConvectionType) {
        for trail in &mut self.trails {
            trail.update_vortex_strength(convection);
        }
        self.trailing_gamma = self.trails.iter().map(|t| t.gamma().to_vec()).collect();
        if self.config.mode.is_time_accurate() {
            self.update_sheet_geometry();
            self.update_starting_gammas();
        }
    }

    /// Bound circulation between two trails is the running span-wise sum of
    /// trailing circulation; what was shed between two time levels is its
    /// stream-wise difference.
    fn update_starting_gammas(&mut self) {
        let count = self.trails.len();
        let n = self.number_of_sub_vortices();
        let mut cumulative = vec![0.0; n + 2];
        for (k, node) in self.levels[0].iter_mut().enumerate() {
            for (c, g) in cumulative.iter_mut().zip(&self.trailing_gamma[k % count]) {
                *c += g;
            }
            for j in 0..n {
                node.starting_gamma[j] = cumulative[j + 1] - cumulative[j + 2];
            }
        }
        for level in 1..self.levels.len() {
            let (below, above) = self.levels.split_at_mut(level);
            let below = &below[level - 1];
            for node in above[0].iter_mut() {
                node.starting_gamma = match node.children {
                    SheetChildren::Two(a, b) => below[a]
                        .starting_gamma
                        .iter()
                        .zip(&below[b].starting_gamma)
                        .map(|(x, y)| 0.5 * (x + y))
                        .collect(),
                    SheetChildren::One(a) => below[a].starting_gamma.clone(),
                    SheetChildren::None => vec![0.0; n],
                };
            }
        }
    }

    fn interaction(&self, point: &Vector3<f64>) -> Interaction {
        let count = self.trails.len();
        let virtual_count = count + usize::from(self.periodic);
        let mut gammas: Vec<Vec<f64>> = (0..virtual_count)
            .map(|v| self.trailing_gamma[v % count].clone())
            .collect();
        if self.periodic {
            for v in [0, count] {
                for g in &mut gammas[v] {
                    *g *= 0.5;
                }
            }
        }

        let mut interaction = Interaction {
            gammas,
            trail_active: vec![true; virtual_count],
            sheet_active: self.levels.iter().map(|l| vec![false; l.len()]).collect(),
        };
        if count >= MIN_TRAILS_FOR_AGGLOMERATION {
            let top = self.levels.len() - 1;
            for k in 0..self.levels[top].len() {
                self.build_interaction_list(top, k, point, &mut interaction);
            }
        } else {
            interaction.sheet_active[0].fill(true);
        }
        interaction
    }

    fn build_interaction_list(
        &self,
        level: usize,
        k: usize,
        point: &Vector3<f64>,
        interaction: &mut Interaction,
    ) {
        let node = &self.levels[level][k];
        if node.children == SheetChildren::None || node.is_far_away(point) {
            self.inject_circulation(level, k, interaction);
            interaction.sheet_active[level][k] = true;
            return;
        }
        interaction.sheet_active[level][k] = false;
        match node.children {
            SheetChildren::Two(a, b) => {
                self.build_interaction_list(level - 1, a, point, interaction);
                self.build_interaction_list(level - 1, b, point, interaction);
            }
            SheetChildren::One(a) => self.build_interaction_list(level - 1, a, point, interaction),
            SheetChildren::None => {}
        }
    }

    /// Folds every trail inside the sheet into its two bounding trails.
    fn inject_circulation(&self, level: usize, k: usize, interaction: &mut Interaction) {
        let node = &self.levels[level][k];
        match node.children {
            SheetChildren::Two(a, b) => {
                self.inject_circulation(level - 1, a, interaction);
                self.inject_circulation(level - 1, b, interaction);
                let middle = self.levels[level - 1][a].trail2;
                let half: Vec<f64> = interaction.gammas[middle].iter().map(|g| 0.5 * g).collect();
                for v in [node.trail1, node.trail2] {
                    for (g, h) in interaction.gammas[v].iter_mut().zip(&half) {
                        *g += h;
                    }
                }
                interaction.trail_active[middle] = false;
                interaction.sheet_active[level - 1][a] = false;
                interaction.sheet_active[level - 1][b] = false;
            }
            SheetChildren::One(a) => {
                self.inject_circulation(level - 1, a, interaction);
                interaction.sheet_active[level - 1][a] = false;
            }
            SheetChildren::None => interaction.sheet_active[level][k] = true,
        }
    }

    fn sum_over_active<F>(&self, interaction: &Interaction, contribution: F) -> Vector3<f64>
    where
        F: Fn(&VortexTrail, &[f64]) -> Vector3<f64> + Sync + Send,
    {
        let count = self.trails.len();
        (0..interaction.trail_active.len())
            .into_par_iter()
            .filter(|&v| interaction.trail_active[v])
            .map(|v| contribution(&self.trails[v % count], &interaction.gammas[v]))
            .reduce(Vector3::zeros, |a, b| a + b)
    }

    fn starting_velocity(
        &self,
        level: usize,
        k: usize,
        point: &Vector3<f64>,
        interaction: &Interaction,
    ) -> Vector3<f64> {
        let node = &self.levels[level][k];
        if interaction.sheet_active[level][k] {
            return node
                .starting
                .iter()
                .zip(&node.starting_gamma)
                .filter(|(edge, _)| edge.arc_start <= self.max_convected_distance)
                .map(|(edge, gamma)| edge.induced_velocity_for(point, *gamma, edge.sigma))
                .sum();
        }
        match node.children {
            SheetChildren::Two(a, b) => {
                self.starting_velocity(level - 1, a, point, interaction)
                    + self.starting_velocity(level - 1, b, point, interaction)
            }
            SheetChildren::One(a) => self.starting_velocity(level - 1, a, point, interaction),
            SheetChildren::None => Vector3::zeros(),
        }
    }

    /// Starting vortices of every sheet the point does not agglomerate away,
    /// evaluated at the point `at` picks for each top-level sheet.
    fn starting_vortices_velocity<P>(&self, interaction: &Interaction, at: P) -> Vector3<f64>
    where
        P: Fn(&SheetNode) -> Vector3<f64>,
    {
        if !self.config.mode.is_time_accurate() {
            return Vector3::zeros();
        }
        let top = self.levels.len() - 1;
        self.levels[top]
            .iter()
            .enumerate()
            .map(|(k, node)| self.starting_velocity(top, k, &at(node), interaction))
            .sum()
    }

    /// Induced velocity ignoring trails shed within half a core of `te`.
    pub fn induced_velocity_excluding(
        &self,
        point: &Vector3<f64>,
        te: &Vector3<f64>,
    ) -> Vector3<f64> {
        let interaction = self.interaction(point);
        let core = self.core_width;
        let q = self.sum_over_active(&interaction, |trail, gamma| {
            if (te - trail.te_node()).norm() >= 0.5 * trail.sigma() {
                trail.induced_velocity_with_gamma(point, core, gamma)
            } else {
                Vector3::zeros()
            }
        });
        q + self.starting_vortices_velocity(&interaction, |_| *point)
    }

    /// Velocity used by the Kutta condition: each trail is sampled at the
    /// point moved along the freestream to that trail's trailing edge.
    pub fn induced_kutta_velocity(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let interaction = self.interaction(point);
        let core = self.core_width;
        let direction = self.config.freestream.direction();
        let q = self.sum_over_active(&interaction, |trail, gamma| {
            let te = trail.te_node();
            let kutta_point = point + direction * (te - point).dot(&direction);
            if (te - kutta_point).norm_squared() > 0.01 * trail.sigma() {
                trail.induced_velocity_with_gamma(&kutta_point, core, gamma)
            } else {
                Vector3::zeros()
            }
        }) * self.config.settings.karman_tsien_factor();

        let count = self.trails.len();
        q + self.starting_vortices_velocity(&interaction, |node| {
            let x = self.trails[node.trail1 % count].te_node().x;
            Vector3::new(x, point.y, point.z)
        })
    }

    /// Samples freestream plus sheet-induced velocity on every leaf edge and
    /// the tail of every trail.
    pub fn update_edge_velocities(&mut self) {
        let freestream = self.config.freestream.velocity;
        let velocities: Vec<Vec<Vector3<f64>>> = self
            .trails
            .par_iter()
            .map(|trail| {
                (0..=trail.number_of_sub_vortices())
                    .map(|i| {
                        let midpoint = trail.edge_midpoint(i);
                        trail.limit_velocity(freestream + self.induced_velocity(&midpoint))
                    })
                    .collect()
            })
            .collect();
        for (trail, velocities) in self.trails.iter_mut().zip(velocities) {
            for (i, velocity) in velocities.into_iter().enumerate() {
                trail.set_edge_velocity(i, velocity);
            }
        }
    }

    /// Relaxes every movable trail; time-accurate sheets take the unsteady
    /// update instead.
    pub fn update_wake_location(&mut self) -> RelaxationResidual {
        let unsteady = self.config.mode.is_time_accurate();
        let residual = self
            .trails
            .par_iter_mut()
            .filter(|trail| !trail.is_fixed())
            .map(|trail| {
                if unsteady {
                    trail.update_unsteady_wake_location()
                } else {
                    trail.update_wake_location()
                }
            })
            .reduce(RelaxationResidual::default, RelaxationResidual::combine);
        self.update_sheet_geometry();
        info!(
            "wake relaxation: max {:.4e}, l2 {:.4e}",
            residual.max, residual.l2
        );
        residual
    }

    pub fn store_wake_location(&mut self) {
        for trail in &mut self.trails {
            trail.store_wake_location();
        }
    }

    pub fn update_unsteady_wake_location(&mut self) -> RelaxationResidual {
        let residual = self
            .trails
            .par_iter_mut()
            .filter(|trail| !trail.is_fixed())
            .map(|trail| trail.update_unsteady_wake_location())
            .reduce(RelaxationResidual::default, RelaxationResidual::combine);
        self.update_sheet_geometry();
        info!(
            "unsteady wake update: max {:.4e}, l2 {:.4e}",
            residual.max, residual.l2
        );
        residual
    }

    pub fn update_geometry_location(
        &mut self,
        translation: &Vector3<f64>,
        origin: &Vector3<f64>,
        rotation: &UnitQuaternion<f64>,
    ) {
        for trail in &mut self.trails {
            trail.update_geometry_location(translation, origin, rotation);
        }
        self.update_sheet_geometry();
    }

    pub fn smooth_wake(&mut self) {
        for trail in &mut self.trails {
            trail.smooth_wake();
        }
        self.update_sheet_geometry();
    }

    pub fn save_wake_shape(&mut self) {
        for trail in &mut self.trails {
            trail.save_wake_shape();
        }
    }

    pub fn restore_wake_shape(&mut self) {
        for trail in &mut self.trails {
            trail.restore_wake_shape();
        }
        self.update_sheet_geometry();
    }

    pub fn write_records<W: Write>(&self, writer: &mut W) -> WakeResult<()> {
        for trail in &self.trails {
            trail.write_record(writer)?;
        }
        Ok(())
    }

    pub fn read_records<R: Read>(&mut self, reader: &mut R) -> WakeResult<()> {
        for trail in &mut self.trails {
            trail.read_record(reader)?;
        }
        self.update_sheet_geometry();
        Ok(())
    }
}

/// Lays out the sheet levels over `virtual_count` trails. Planar sheets
/// coarsen to a single sheet, periodic ones stop at four or fewer.
fn build_levels(virtual_count: usize, periodic: bool) -> Vec<Vec<SheetNode>> {
    let coarsest = if periodic { 4 } else { 1 };
    let mut counts = vec![virtual_count - 1];
    loop {
        let count = counts[counts.len() - 1];
        if count <= coarsest {
            break;
        }
        counts.push(count.div_ceil(2));
    }

    counts
        .iter()
        .enumerate()
        .map(|(level, &count)| {
            let stride = 1usize << level;
            let mut bounds: Vec<usize> = (0..virtual_count).step_by(stride).collect();
            if bounds.last() != Some(&(virtual_count - 1)) {
                bounds.push(virtual_count - 1);
            }
            (0..count)
                .map(|k| {
                    let children = if level == 0 {
                        SheetChildren::None
                    } else if 2 * k + 1 < counts[level - 1] {
                        SheetChildren::Two(2 * k, 2 * k + 1)
                    } else {
                        SheetChildren::One(2 * k)
                    };
                    SheetNode {
                        trail1: bounds[k],
                        trail2: bounds[k + 1],
                        children,
                        span: 0.0,
                        mid_span: Vector3::zeros(),
                        starting: Vec::new(),
                        starting_gamma: Vec::new(),
                    }
                })
                .collect()
        })
        .collect()
}

impl InducedVelocityField for VortexSheet {
    fn induced_velocity(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let interaction = self.interaction(point);
        let core = self.core_width;
        let q = self.sum_over_active(&interaction, |trail, gamma| {
            trail.induced_velocity_with_gamma(point, core, gamma)
        });
        q + self.starting_vortices_velocity(&interaction, |_| *point)
    }
}

impl WakeLinearOperator for VortexSheet {
    fn calculate_wake_residual(&self, residual: &mut [f64]) {
        for trail in &self.trails {
            trail.calculate_wake_residual(residual);
        }
    }

    fn wake_matrix_multiply(&self, vector: &[f64], product: &mut [f64]) {
        for trail in &self.trails {
            trail.wake_matrix_multiply(vector, product);
        }
    }

    fn wake_forward_precondition(&self, residual: &mut [f64]) {
        for trail in &self.trails {
            trail.wake_forward_precondition(residual);
        }
    }

    fn wake_transpose_multiply(&self, vector: &[f64], product: &mut [f64]) {
        for trail in &self.trails {
            trail.wake_transpose_multiply(vector, product);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biot_savart::{core_width, segment_velocity};
    use crate::settings::{RotorSettings, SolverMode, WakeSettings};
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn trail_setup(te: Vector3<f64>, n: usize, node_id: i32) -> TrailSetup {
        TrailSetup {
            num_sub_vortices: n,
            far_distance: 5.0,
            te_node: te,
            far_node: te + Vector3::new(1000.0, 0.0, 0.0),
            sigma: 0.01,
            node_id,
            span_fraction: 0.0,
            component_id: 0,
        }
    }

    fn planar_setups(count: usize, n: usize, span: f64) -> Vec<TrailSetup> {
        (0..count)
            .map(|i| {
                let y = -0.5 * span + span * i as f64 / (count - 1) as f64;
                trail_setup(Vector3::new(0.0, y, 0.0), n, i as i32)
            })
            .collect()
    }

    fn ring_setups(count: usize, n: usize) -> Vec<TrailSetup> {
        (0..count)
            .map(|i| {
                let theta = 2.0 * PI * i as f64 / count as f64;
                trail_setup(Vector3::new(0.0, theta.cos(), theta.sin()), n, i as i32)
            })
            .collect()
    }

    fn sheet_with_gammas(
        setups: &[TrailSetup],
        periodic: bool,
        config: WakeConfig,
        gammas: &[f64],
    ) -> VortexSheet {
        let mut sheet = VortexSheet::new(setups, periodic, config).expect("valid sheet");
        for (i, gamma) in gammas.iter().enumerate() {
            sheet
                .set_trailing_edge_circulation(i, *gamma)
                .expect("index in range");
        }
        sheet.update_vortex_strengths(ConvectionType::All);
        sheet
    }

    fn planar_sheet(count: usize, n: usize, span: f64, gammas: &[f64]) -> VortexSheet {
        sheet_with_gammas(&planar_setups(count, n, span), false, WakeConfig::default(), gammas)
    }

    fn direct_sum(sheet: &VortexSheet, point: &Vector3<f64>) -> Vector3<f64> {
        sheet
            .trails
            .iter()
            .zip(&sheet.trailing_gamma)
            .map(|(trail, gamma)| trail.induced_velocity_with_gamma(point, sheet.core_width, gamma))
            .sum()
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn planar_levels_halve_down_to_one_sheet() {
        let sheet = VortexSheet::new(&planar_setups(9, 2, 8.0), false, WakeConfig::default())
            .expect("sheet");
        let counts: Vec<usize> = (0..sheet.number_of_levels())
            .map(|l| sheet.number_of_sheets(l))
            .collect();
        assert_eq!(counts, vec![8, 4, 2, 1]);
        let top = &sheet.levels[3][0];
        assert_eq!((top.trail1, top.trail2), (0, 8));
        assert_eq!(top.children, SheetChildren::Two(0, 1));
    }

    #[test]
    fn odd_sheet_counts_end_in_a_single_child() {
        let sheet = VortexSheet::new(&planar_setups(6, 2, 5.0), false, WakeConfig::default())
            .expect("sheet");
        assert_eq!(sheet.number_of_sheets(0), 5);
        assert_eq!(sheet.number_of_sheets(1), 3);
        let last = &sheet.levels[1][2];
        assert_eq!((last.trail1, last.trail2), (4, 5));
        assert_eq!(last.children, SheetChildren::One(4));
        for level in 1..sheet.number_of_levels() {
            for node in &sheet.levels[level] {
                if let SheetChildren::Two(a, b) = node.children {
                    let below = &sheet.levels[level - 1];
                    assert_eq!(below[a].trail1, node.trail1);
                    assert_eq!(below[a].trail2, below[b].trail1);
                    assert_eq!(below[b].trail2, node.trail2);
                }
            }
        }
    }

    #[test]
    fn periodic_sheet_closes_and_stops_at_four() {
        let sheet = VortexSheet::new(&ring_setups(6, 2), true, WakeConfig::default())
            .expect("sheet");
        assert_eq!(sheet.number_of_sheets(0), 6);
        assert_eq!(sheet.number_of_sheets(1), 3);
        assert_eq!(sheet.number_of_levels(), 2);
        assert_eq!(sheet.levels[0][5].trail2, 6);
        assert_relative_eq!(sheet.core_width(), 0.02, epsilon = 1e-15);
        assert_eq!(sheet.number_of_kutta_edges(), 6);
    }

    #[test]
    fn setup_errors_are_typed() {
        let err = VortexSheet::new(&planar_setups(2, 2, 1.0)[..1], false, WakeConfig::default())
            .expect_err("one trail");
        assert!(matches!(
            err,
            WakeError::TooFewTrailingVortices { required: 2, found: 1 }
        ));

        let mut setups = planar_setups(3, 4, 2.0);
        setups[2].num_sub_vortices = 8;
        let err = VortexSheet::new(&setups, false, WakeConfig::default()).expect_err("mismatch");
        assert!(matches!(
            err,
            WakeError::MismatchedSubVortices { expected: 4, found: 8 }
        ));

        let mut sheet = VortexSheet::new(&planar_setups(3, 4, 2.0), false, WakeConfig::default())
            .expect("sheet");
        let err = sheet
            .set_trailing_edge_circulation(3, 1.0)
            .expect_err("out of range");
        assert!(matches!(err, WakeError::TrailIndexOutOfRange { index: 3, count: 3 }));
    }

    #[test]
    fn invalid_configuration_is_reported_with_context() {
        let config = WakeConfig {
            settings: WakeSettings {
                far_away: -1.0,
                ..WakeSettings::default()
            },
            ..WakeConfig::default()
        };
        let err = setup_vortex_sheet(&planar_setups(3, 2, 2.0), false, config)
            .expect_err("negative far_away");
        let message = format!("{err:#}");
        assert!(message.contains("invalid wake configuration"), "{message}");
        assert!(message.contains("far_away"), "{message}");
    }

    #[test]
    fn distant_points_see_only_the_outer_trails() {
        let gammas: Vec<f64> = (1..=8).map(f64::from).collect();
        let sheet = planar_sheet(8, 4, 7.0, &gammas);
        let interaction = sheet.interaction(&Vector3::new(0.0, 1000.0, 0.0));
        let active: Vec<usize> = (0..8).filter(|&v| interaction.trail_active[v]).collect();
        assert_eq!(active, vec![0, 7]);
        let total: f64 = active.iter().map(|&v| interaction.gammas[v][0]).sum();
        assert_relative_eq!(total, 36.0, epsilon = 1e-12);
        assert!(interaction.sheet_active[3][0]);
    }

    #[test]
    fn injection_conserves_circulation_near_the_sheet() {
        let gammas = [
            0.3, -1.2, 2.0, 0.7, -0.4, 1.1, 0.9, -2.5, 0.05, 1.6, -0.8, 0.2, 0.6, -0.1, 1.3, -0.9,
        ];
        let sheet = planar_sheet(16, 2, 15.0, &gammas);
        let expected: f64 = gammas.iter().sum();
        for point in [
            Vector3::new(1.0, -6.8, 0.2),
            Vector3::new(3.0, 0.1, -1.0),
            Vector3::new(0.0, 40.0, 0.0),
        ] {
            let interaction = sheet.interaction(&point);
            let total: f64 = (0..16)
                .filter(|&v| interaction.trail_active[v])
                .map(|v| interaction.gammas[v][0])
                .sum();
            assert_relative_eq!(total, expected, epsilon = 1e-12);
        }
        let near = sheet.interaction(&Vector3::new(1.0, -6.8, 0.2));
        assert!(near.trail_active[0] && near.trail_active[1]);
        assert!(!near.trail_active[10]);
        assert!(near.trail_active[12]);
    }

    #[test]
    fn small_sheets_sum_every_trail() {
        let sheet = planar_sheet(3, 8, 2.0, &[-1.0, 0.5, 0.5]);
        let point = Vector3::new(2.0, 0.3, -0.5);
        assert_relative_eq!(
            sheet.induced_velocity(&point),
            direct_sum(&sheet, &point),
            epsilon = 1e-12
        );
    }

    #[test]
    fn periodic_closure_splits_the_first_trail() {
        let gammas = [1.0, 2.0, 3.0, 4.0];
        let sheet = sheet_with_gammas(&ring_setups(4, 4), true, WakeConfig::default(), &gammas);
        let point = Vector3::new(2.0, 0.1, 0.2);
        let interaction = sheet.interaction(&point);
        assert_eq!(interaction.gammas[0][0], 0.5);
        assert_eq!(interaction.gammas[4][0], 0.5);
        assert!(interaction.trail_active.iter().all(|a| *a));
        assert_relative_eq!(
            sheet.induced_velocity(&point),
            direct_sum(&sheet, &point),
            epsilon = 1e-12
        );
    }

    #[test]
    fn kutta_velocity_of_a_horseshoe() {
        let mut sheet = planar_sheet(2, 8, 2.0, &[-1.0, 1.0]);
        let q = sheet.induced_kutta_velocity(&Vector3::zeros());
        assert!(q.z < 0.0);
        assert!((q.norm() - 1.0 / (2.0 * PI)).abs() < 1e-3 / (2.0 * PI));

        sheet.set_mach_number(0.5);
        let compressible = sheet.induced_kutta_velocity(&Vector3::zeros());
        assert_relative_eq!(compressible, q * (1.0_f64 + 0.0625).powi(2), epsilon = 1e-12);

        let one_leg =
            sheet.induced_velocity_excluding(&Vector3::zeros(), &Vector3::new(0.0, -1.0, 0.0));
        assert_relative_eq!(one_leg.norm(), 0.5 * q.norm(), epsilon = 1e-6);
    }

    #[test]
    fn starting_vortices_follow_the_shed_circulation() {
        let config = WakeConfig {
            mode: SolverMode::TimeAccurate { time_step: 0.1 },
            ..WakeConfig::default()
        };
        let mut sheet = VortexSheet::new(&planar_setups(3, 4, 2.0), false, config).expect("sheet");
        sheet.update_convected_distance(1, 0.1);
        for (i, gamma) in [1.0, 2.0, -3.0].into_iter().enumerate() {
            sheet.set_trailing_edge_circulation(i, gamma).expect("in range");
        }
        sheet.save_vortex_state();
        sheet.update_vortex_strengths(ConvectionType::All);

        assert_eq!(sheet.levels[0][0].starting_gamma[0], 1.0);
        assert_eq!(sheet.levels[0][1].starting_gamma[0], 3.0);
        assert_eq!(sheet.levels[0][0].starting_gamma[1], 0.0);
        assert_eq!(sheet.levels[1][0].starting_gamma[0], 2.0);

        let point = Vector3::new(0.05, 0.3, -0.4);
        let shed = sheet.induced_velocity(&point) - direct_sum(&sheet, &point);
        let node = |t: usize| sheet.trails[t].nodes()[1];
        let age = sheet.trails[0].wake_age()[1];
        let expected = segment_velocity(&node(0), &node(1), &point, 1.0, core_width(0.01, 1.0, age))
            + segment_velocity(&node(1), &node(2), &point, 3.0, core_width(0.01, 3.0, age));
        assert!(expected.norm() > 1e-3);
        assert_relative_eq!(shed, expected, epsilon = 1e-12);
    }

    #[test]
    fn quiet_wake_relaxes_to_zero_residual() {
        let mut sheet = planar_sheet(4, 4, 3.0, &[0.0; 4]);
        sheet.update_edge_velocities();
        let residual = sheet.update_wake_location();
        assert!(residual.max < 1e-12);

        let mut loaded = planar_sheet(4, 4, 3.0, &[-1.0, 0.0, 0.0, 1.0]);
        loaded.update_edge_velocities();
        let first = loaded.update_wake_location();
        assert!(first.max > 0.0);
        assert!(first.l2 > 0.0);
    }

    #[test]
    fn time_accurate_sheets_convect_from_the_stored_shape() {
        let config = WakeConfig {
            mode: SolverMode::TimeAccurate { time_step: 0.1 },
            ..WakeConfig::default()
        };
        let mut sheet = sheet_with_gammas(&planar_setups(3, 4, 2.0), false, config, &[0.0; 3]);
        sheet.update_convected_distance(2, 0.2);
        sheet.store_wake_location();
        sheet.update_edge_velocities();
        let residual = sheet.update_wake_location();
        assert!(residual.max < 1e-12);
        assert_relative_eq!(sheet.max_convected_distance(), 0.2, epsilon = 1e-15);
        assert_relative_eq!(sheet.trails()[1].nodes()[2].x, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn frozen_trails_do_not_move() {
        let mut sheet = planar_sheet(3, 4, 2.0, &[-1.0, 0.0, 1.0]);
        sheet.trail_mut(1).expect("in range").set_frozen(true);
        let before = sheet.trails[1].nodes().to_vec();
        sheet.update_edge_velocities();
        sheet.update_wake_location();
        assert_eq!(sheet.trails[1].nodes(), before.as_slice());
    }

    #[test]
    fn wake_loops_are_sized_per_sheet_segment() {
        let mut sheet = VortexSheet::new(&planar_setups(5, 4, 4.0), false, WakeConfig::default())
            .expect("sheet");
        assert_eq!(sheet.number_of_wake_loops(), 4 * 5);
        assert_eq!(sheet.number_of_kutta_edges(), 4);

        let next = sheet.assign_wake_equations(0);
        assert_eq!(next, 5 * 6 * 3 + 20 * 2);
        let edges = sheet.wake_edges();
        assert_eq!(edges.len(), 5 * 4);
        assert_eq!(edges[0].loops, (0, 0));
        let last = edges[edges.len() - 1];
        assert_eq!(last.loops, (3 * 5 + 3, 3 * 5 + 3));
        assert_eq!(last.residual_equations, sheet.trails[4].equation_numbers()[4]);

        let ring = VortexSheet::new(&ring_setups(5, 4), true, WakeConfig::default()).expect("ring");
        assert_eq!(ring.number_of_wake_loops(), 5 * 5);
        assert_eq!(ring.wake_edges()[0].loops, (4 * 5, 0));
    }

    #[test]
    fn wake_loop_updates_come_from_the_solution_vector() {
        let mut sheet = VortexSheet::new(&planar_setups(2, 2, 1.0), false, WakeConfig::default())
            .expect("sheet");
        let size = sheet.assign_wake_equations(0);
        let mut solution = vec![0.0; size];
        let stall = sheet.wake_loops()[1].stall_equation;
        solution[stall] = -0.5;
        sheet.update_wake_loops(&solution);
        assert_eq!(sheet.wake_loops()[1].stall_factor, 0.5);
        assert_eq!(sheet.wake_loops()[0].stall_factor, 1.0);
    }

    #[test]
    fn rotor_flags_follow_components() {
        let config = WakeConfig {
            rotor: Some(RotorSettings {
                rpm: 1000.0,
                origin: Vector3::zeros(),
                thrust_vector: Vector3::new(-1.0, 0.0, 0.0),
            }),
            ..WakeConfig::default()
        };
        let mut setups = planar_setups(2, 2, 2.0);
        setups[1].component_id = 1;
        let mut sheet = VortexSheet::new(&setups, false, config).expect("sheet");
        sheet.update_rotor_flags(&[false, true]);
        assert!(!sheet.trails[0].is_rotor());
        assert!(sheet.trails[1].is_rotor());
        assert!(sheet.is_rotor());
        sheet.update_rotor_flags(&[]);
        assert!(!sheet.is_rotor());
    }

    #[test]
    fn operator_is_consistent_across_trails() {
        let mut sheet = VortexSheet::new(&planar_setups(3, 2, 2.0), false, WakeConfig::default())
            .expect("sheet");
        sheet.turn_wake_damping_on();
        sheet.trail_mut(1).expect("in range").set_frozen(true);
        let size = sheet.assign_wake_equations(0);
        let v: Vec<f64> = (0..size).map(|i| (i as f64 * 0.7).cos()).collect();
        let w: Vec<f64> = (0..size).map(|i| (i as f64 * 0.3).sin()).collect();

        let mut jv = vec![0.0; size];
        sheet.wake_matrix_multiply(&v, &mut jv);
        let mut jtw = vec![0.0; size];
        sheet.wake_transpose_multiply(&w, &mut jtw);
        assert_relative_eq!(dot(&jv, &w), dot(&v, &jtw), epsilon = 1e-10);

        let mut x = v.clone();
        sheet.wake_forward_precondition(&mut x);
        let mut jx = vec![0.0; size];
        sheet.wake_matrix_multiply(&x, &mut jx);
        for trail in sheet.trails() {
            for &e in trail.equation_numbers().iter().flatten() {
                assert_relative_eq!(jx[e], v[e], epsilon = 1e-12);
            }
        }
        sheet.turn_wake_damping_off();
        assert!(sheet.trails.iter().all(|t| !t.damping()));
    }

    #[test]
    fn records_restore_every_trail() {
        let mut sheet = planar_sheet(3, 4, 2.0, &[-1.0, 0.2, 0.8]);
        sheet.update_edge_velocities();
        sheet.update_wake_location();
        let mut bytes = Vec::new();
        sheet.write_records(&mut bytes).expect("write");

        let mut fresh = VortexSheet::new(&planar_setups(3, 4, 2.0), false, WakeConfig::default())
            .expect("sheet");
        fresh
            .read_records(&mut std::io::Cursor::new(bytes))
            .expect("read");
        for (a, b) in fresh.trails().iter().zip(sheet.trails()) {
            assert_eq!(a.nodes(), b.nodes());
        }
    }
}
