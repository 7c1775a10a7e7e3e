//! A single trailing vortex filament and its free-wake relaxation.
//!
//! Node `0` sits on the trailing edge, nodes `1..=N` discretize the finite
//! part of the wake and node `N + 1` only orients the semi-infinite tail.
//! `gamma[0]` is the bound circulation at the trailing edge, `gamma[j + 1]`
//! belongs to leaf edge `j` and `gamma[N + 1]` to the tail.

use crate::edge::{EdgeHierarchy, EdgeRef};
use crate::error::{WakeError, WakeResult};
use crate::record::WakeRecord;
use crate::settings::{SolverMode, WakeConfig};
use crate::smoothing::implicit_smooth;
use crate::traits::{InducedVelocityField, WakeLinearOperator};
use log::debug;
use nalgebra::{Unit, UnitQuaternion, Vector3};
use std::f64::consts::PI;

/// Geometry of one trailing vortex as handed over by the surface mesh.
#[derive(Debug, Clone, Copy)]
pub struct TrailSetup {
    /// Number of finest edges; must be a power of two.
    pub num_sub_vortices: usize,
    /// Length of the discretized part of the wake.
    pub far_distance: f64,
    pub te_node: Vector3<f64>,
    /// Point far downstream that fixes the initial wake direction.
    pub far_node: Vector3<f64>,
    pub sigma: f64,
    pub node_id: i32,
    pub span_fraction: f64,
    pub component_id: usize,
}

/// Which part of the wake circulation [`VortexTrail::convect_wake_vorticity`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvectionType {
    /// Only the circulation shed during the current step.
    Implicit,
    /// Only the circulation shed during earlier steps.
    Explicit,
    All,
}

/// Displacement norms from one relaxation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelaxationResidual {
    pub max: f64,
    /// Sum of squared node displacements.
    pub l2: f64,
}

impl RelaxationResidual {
    pub fn combine(self, other: Self) -> Self {
        Self {
            max: self.max.max(other.max),
            l2: self.l2 + other.l2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VortexTrail {
    config: WakeConfig,
    node_id: i32,
    span_fraction: f64,
    component_id: usize,
    sigma: f64,
    te_node: Vector3<f64>,
    nodes: Vec<Vector3<f64>>,
    saved_nodes: Vec<Vector3<f64>>,
    previous_nodes: Vec<Vector3<f64>>,
    arc: Vec<f64>,
    previous_arc: Vec<f64>,
    wake_age: Vec<f64>,
    gamma: Vec<f64>,
    saved_gamma: Vec<f64>,
    edges: EdgeHierarchy,
    residuals: Vec<Vector3<f64>>,
    equations: Vec<[usize; 3]>,
    current_step: usize,
    time: f64,
    stall_factor: f64,
    is_rotor: bool,
    concave: bool,
    frozen: bool,
    damping: bool,
}

impl VortexTrail {
    pub fn new(setup: &TrailSetup, config: WakeConfig) -> WakeResult<Self> {
        let n = setup.num_sub_vortices;
        let edges = EdgeHierarchy::new(n)?;
        let count = n + 2;

        let mut trail = Self {
            config,
            node_id: setup.node_id,
            span_fraction: setup.span_fraction,
            component_id: setup.component_id,
            sigma: setup.sigma,
            te_node: setup.te_node,
            nodes: vec![setup.te_node; count],
            saved_nodes: vec![setup.te_node; count],
            previous_nodes: vec![setup.te_node; count],
            arc: vec![0.0; count],
            previous_arc: vec![0.0; count],
            wake_age: vec![0.0; count],
            gamma: vec![0.0; count],
            saved_gamma: vec![0.0; count],
            edges,
            residuals: vec![Vector3::zeros(); count],
            equations: vec![[0; 3]; count],
            current_step: 0,
            time: 0.0,
            stall_factor: 1.0,
            is_rotor: config.rotor.is_some(),
            concave: false,
            frozen: false,
            damping: false,
        };

        if trail.is_rotor {
            trail.place_helical_nodes();
        } else {
            trail.place_planar_nodes(setup.far_distance, &setup.far_node);
        }
        trail.previous_arc.copy_from_slice(&trail.arc);
        trail.saved_nodes.copy_from_slice(&trail.nodes);
        trail.previous_nodes.copy_from_slice(&trail.nodes);
        trail.rebuild();

        debug!(
            "trail {}: {} sub-vortices on {} levels, sigma {:.4e}, wake length {:.4e}",
            trail.node_id,
            n,
            trail.edges.number_of_levels(),
            trail.sigma,
            trail.arc[n]
        );
        Ok(trail)
    }

    fn place_planar_nodes(&mut self, far_distance: f64, far_node: &Vector3<f64>) {
        let n = self.number_of_sub_vortices();
        let offset = far_node - self.te_node;
        let length = offset.norm();
        let direction = if length > 0.0 {
            offset / length
        } else {
            self.config.freestream.direction()
        };

        match self.config.mode {
            SolverMode::TimeAccurate { time_step } => {
                let ds = self.config.freestream.speed() * time_step;
                for (i, s) in self.arc.iter_mut().enumerate() {
                    *s = i as f64 * ds;
                }
                for (i, age) in self.wake_age.iter_mut().enumerate() {
                    *age = i as f64 * time_step;
                }
            }
            _ => {
                for i in 0..=n {
                    let theta = i as f64 * PI / (2.0 * n as f64);
                    self.arc[i] = far_distance * (1.0 - theta.cos());
                }
                self.arc[n + 1] = if length > far_distance {
                    length
                } else {
                    2.0 * far_distance
                };
            }
        }

        for (node, s) in self.nodes.iter_mut().zip(&self.arc) {
            *node = self.te_node + direction * *s;
        }
    }

    /// Lays the wake out on a helix swept backwards by the blade rotation.
    fn place_helical_nodes(&mut self) {
        let Some(rotor) = self.config.rotor else {
            return;
        };
        let speed = self.config.freestream.speed();
        let dt = self
            .config
            .mode
            .time_step()
            .filter(|_| self.config.mode.is_time_accurate())
            .unwrap_or_else(|| rotor.helix_time_step());
        let ds = dt * speed;
        let axis = Unit::new_normalize(rotor.thrust_direction());
        let wake_direction = rotor.initial_wake_direction(&self.config.freestream);
        let arm = self.te_node - rotor.origin;

        for i in 0..self.nodes.len() {
            let s = i as f64 * ds;
            let rotation = UnitQuaternion::from_axis_angle(&axis, -rotor.omega() * i as f64 * dt);
            self.nodes[i] = rotation * arm + rotor.origin + wake_direction * s;
            self.wake_age[i] = i as f64 * dt;
        }
        self.recompute_arc();
    }

    fn recompute_arc(&mut self) {
        self.arc[0] = 0.0;
        for i in 1..self.nodes.len() {
            self.arc[i] = self.arc[i - 1] + (self.nodes[i] - self.nodes[i - 1]).norm();
        }
    }

    fn rebuild(&mut self) {
        self.edges
            .rebuild(&self.nodes, &self.arc, &self.wake_age, self.sigma);
        self.update_gamma();
    }

    fn clamp_to_ground(&mut self) {
        if self.config.settings.ground_effects {
            for node in &mut self.nodes {
                node.z = node.z.max(0.0);
            }
        }
    }

    pub fn config(&self) -> &WakeConfig {
        &self.config
    }

    pub fn number_of_sub_vortices(&self) -> usize {
        self.edges.number_of_sub_vortices()
    }

    pub fn number_of_levels(&self) -> usize {
        self.edges.number_of_levels()
    }

    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn span_fraction(&self) -> f64 {
        self.span_fraction
    }

    pub fn component_id(&self) -> usize {
        self.component_id
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn te_node(&self) -> &Vector3<f64> {
        &self.te_node
    }

    pub fn nodes(&self) -> &[Vector3<f64>] {
        &self.nodes
    }

    pub fn arc(&self) -> &[f64] {
        &self.arc
    }

    pub fn previous_arc(&self) -> &[f64] {
        &self.previous_arc
    }

    pub fn wake_age(&self) -> &[f64] {
        &self.wake_age
    }

    pub fn gamma(&self) -> &[f64] {
        &self.gamma
    }

    pub fn edges(&self) -> &EdgeHierarchy {
        &self.edges
    }

    pub fn residuals(&self) -> &[Vector3<f64>] {
        &self.residuals
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, step: usize, time: f64) {
        self.current_step = step;
        self.time = time;
    }

    pub fn stall_factor(&self) -> f64 {
        self.stall_factor
    }

    pub fn set_stall_factor(&mut self, stall_factor: f64) {
        self.stall_factor = stall_factor;
    }

    pub fn is_rotor(&self) -> bool {
        self.is_rotor
    }

    /// Rotor kinematics only apply when the flow itself carries rotor settings.
    pub fn set_rotor(&mut self, is_rotor: bool) {
        self.is_rotor = is_rotor && self.config.rotor.is_some();
    }

    pub fn is_concave(&self) -> bool {
        self.concave
    }

    pub fn set_concave(&mut self, concave: bool) {
        self.concave = concave;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    /// Concave or frozen trails keep their shape during relaxation.
    pub fn is_fixed(&self) -> bool {
        self.concave || self.frozen
    }

    pub fn damping(&self) -> bool {
        self.damping
    }

    pub fn set_damping(&mut self, damping: bool) {
        self.damping = damping;
    }

    pub fn set_mach_number(&mut self, mach: f64) {
        self.config.settings.mach = mach;
    }

    /// Compressibility factor applied to Kutta-point velocities.
    pub fn karman_tsien_factor(&self) -> f64 {
        self.config.settings.karman_tsien_factor()
    }

    /// Sets the circulation shed at the trailing edge.
    pub fn set_bound_circulation(&mut self, gamma: f64) {
        self.gamma[0] = gamma;
    }

    /// Pushes the node circulation onto the edges.
    ///
    /// Steady wakes carry `gamma[0]` on every edge; time-accurate wakes load
    /// the leaves and merge upward.
    pub fn update_gamma(&mut self) {
        let n = self.number_of_sub_vortices();
        if self.config.mode.is_time_accurate() {
            self.edges
                .set_leaf_gammas(&self.gamma[1..=n], self.gamma[n + 1]);
        } else {
            self.edges.set_uniform_gamma(self.gamma[0]);
        }
    }

    /// Steady wakes copy the bound circulation downstream, time-accurate
    /// wakes convect it.
    pub fn update_vortex_strength(&mut self, convection: ConvectionType) {
        if self.config.mode.is_time_accurate() {
            self.convect_wake_vorticity(convection);
        } else {
            let bound = self.gamma[0];
            self.gamma.fill(bound);
            self.update_gamma();
        }
    }

    pub fn save_vortex_state(&mut self) {
        let last = (self.current_step + 1).min(self.gamma.len() - 1);
        self.saved_gamma[..=last].copy_from_slice(&self.gamma[..=last]);
    }

    /// Moves the saved circulation one slot downstream and clears every slot
    /// the wake cannot have reached yet.
    pub fn convect_wake_vorticity(&mut self, convection: ConvectionType) {
        let count = self.gamma.len();
        match convection {
            ConvectionType::Implicit => {
                self.gamma[1..].fill(0.0);
                self.gamma[1] = self.gamma[0];
            }
            ConvectionType::Explicit | ConvectionType::All => {
                self.gamma[1..].copy_from_slice(&self.saved_gamma[1..]);
                if convection == ConvectionType::Explicit {
                    self.gamma[0] = 0.0;
                }
                for i in (1..count).rev() {
                    self.gamma[i] = self.gamma[i - 1];
                }
                let reached = (self.current_step + 1).min(count);
                self.gamma[reached..].fill(0.0);
            }
        }
        self.update_wake_age();
        self.update_gamma();
    }

    pub fn update_wake_age(&mut self) {
        if let Some(dt) = self.config.mode.time_step() {
            for (i, age) in self.wake_age.iter_mut().enumerate() {
                *age = i as f64 * dt;
            }
            for level in 0..self.edges.number_of_levels() {
                let stride = 1 << level;
                for (j, edge) in self.edges.level_mut(level).iter_mut().enumerate() {
                    edge.age = 0.5 * (self.wake_age[j * stride] + self.wake_age[(j + 1) * stride]);
                }
            }
            let n = self.number_of_sub_vortices();
            self.edges.tail_mut().age = 0.5 * (self.wake_age[n] + self.wake_age[n + 1]);
        }
    }

    /// Segment stretch relative to the previous time level, or 1 without
    /// vortex stretching.
    pub fn stretching_ratio(&self, segment: usize) -> f64 {
        if !self.config.settings.vortex_stretching || segment + 1 >= self.arc.len() {
            return 1.0;
        }
        let current = self.arc[segment + 1] - self.arc[segment];
        let previous = self.previous_arc[segment + 1] - self.previous_arc[segment];
        if previous > 0.0 {
            current / previous
        } else {
            1.0
        }
    }

    pub fn induced_velocity_with_core(&self, point: &Vector3<f64>, core: f64) -> Vector3<f64> {
        self.edges
            .induced_velocity(point, core, self.config.settings.far_away, true)
    }

    /// Evaluates the filament with `gamma` in place of its own circulation.
    pub fn induced_velocity_with_gamma(
        &self,
        point: &Vector3<f64>,
        core: f64,
        gamma: &[f64],
    ) -> Vector3<f64> {
        let far_away = self.config.settings.far_away;
        if self.config.mode.is_time_accurate() {
            let n = self.number_of_sub_vortices();
            let merged = self.edges.merged_gammas(&gamma[1..=n]);
            self.edges.induced_velocity_with(
                point,
                core,
                far_away,
                Some(gamma[n + 1]),
                &|edge: EdgeRef| merged[edge.level][edge.index],
            )
        } else {
            let bound = gamma[0];
            self.edges
                .induced_velocity_with(point, core, far_away, Some(bound), &|_| bound)
        }
    }

    /// Freestream when `velocity` points upstream, else `velocity` itself.
    pub fn limit_velocity(&self, velocity: Vector3<f64>) -> Vector3<f64> {
        let freestream = self.config.freestream.velocity;
        if velocity.dot(&freestream) < 0.0 {
            freestream
        } else {
            velocity
        }
    }

    /// Velocity sampled on edge `i`; `i == N` is the tail.
    pub fn edge_velocity(&self, i: usize) -> Vector3<f64> {
        if i < self.number_of_sub_vortices() {
            self.edges.level(0)[i].velocity
        } else {
            self.edges.tail().velocity
        }
    }

    pub fn set_edge_velocity(&mut self, i: usize, velocity: Vector3<f64>) {
        if i < self.number_of_sub_vortices() {
            self.edges.level_mut(0)[i].velocity = velocity;
        } else {
            self.edges.tail_mut().velocity = velocity;
        }
    }

    pub fn edge_midpoint(&self, i: usize) -> Vector3<f64> {
        if i < self.number_of_sub_vortices() {
            self.edges.level(0)[i].midpoint
        } else {
            self.edges.tail().midpoint
        }
    }

    pub fn zero_edge_velocities(&mut self) {
        self.edges.zero_velocities();
    }

    pub fn prolongate_edge_velocities(&mut self) {
        self.edges.prolongate_velocities();
    }

    /// One steady relaxation sweep: march down the wake aligning every
    /// segment with the local velocity while keeping its arc length.
    pub fn update_wake_location(&mut self) -> RelaxationResidual {
        let n = self.number_of_sub_vortices();
        let relax = self.config.settings.relaxation();
        let rotor = self.config.rotor.filter(|_| self.is_rotor);
        let velocities: Vec<Vector3<f64>> = (0..=n).map(|i| self.edge_velocity(i)).collect();

        self.nodes[0] = self.te_node;
        self.residuals[0] = Vector3::zeros();
        let mut result = RelaxationResidual::default();

        for i in 0..=n {
            let mut velocity = if i > 0 && i < n {
                0.25 * (velocities[i - 1] + 2.0 * velocities[i] + velocities[i + 1])
            } else {
                velocities[i]
            };
            if let Some(rotor) = &rotor {
                velocity += rotor
                    .angular_velocity()
                    .cross(&(self.nodes[i + 1] - rotor.origin));
            }
            let speed = velocity.norm();
            let direction = if speed > 0.0 {
                velocity / speed
            } else {
                self.config.freestream.direction()
            };

            let mut delta =
                self.nodes[i] + direction * (self.arc[i + 1] - self.arc[i]) - self.nodes[i + 1];
            if let Some(rotor) = &rotor {
                let thrust = rotor.thrust_direction();
                let in_plane = rotor.in_plane_direction(&self.config.freestream);
                delta = thrust * delta.dot(&thrust) + in_plane * delta.dot(&in_plane);
            }

            self.nodes[i + 1] += relax * delta;
            self.residuals[i + 1] = delta;
            if self.config.settings.ground_effects {
                self.nodes[i + 1].z = self.nodes[i + 1].z.max(0.0);
            }

            let size = delta.norm_squared();
            result.max = result.max.max(size);
            result.l2 += size;
        }
        result.max = result.max.sqrt();

        self.rebuild();
        result
    }

    /// Remembers the current shape one slot downstream, as the starting
    /// point of the next unsteady update.
    pub fn store_wake_location(&mut self) {
        self.previous_nodes[0] = self.nodes[0];
        for i in 1..self.nodes.len() {
            self.previous_nodes[i] = self.nodes[i - 1];
        }
    }

    /// Time-accurate update: every reached node is the stored upstream node
    /// convected by the local velocity over one time step.
    pub fn update_unsteady_wake_location(&mut self) -> RelaxationResidual {
        let Some(dt) = self.config.mode.time_step() else {
            return RelaxationResidual::default();
        };
        let relax = self.config.settings.relaxation();
        let freestream = self.config.freestream.velocity;
        let thrust = self
            .config
            .rotor
            .filter(|_| self.is_rotor)
            .map(|rotor| rotor.thrust_direction());
        let reached = self.current_step.min(self.nodes.len() - 1);
        let mut result = RelaxationResidual::default();

        for i in 1..=reached {
            let mut velocity = self.edge_velocity(i - 1);
            if let Some(thrust) = thrust {
                let axial = (velocity - freestream).dot(&thrust).min(0.0);
                velocity = freestream + axial * thrust;
            }
            let delta = self.previous_nodes[i] + velocity * dt - self.nodes[i];
            self.nodes[i] += relax * delta;
            self.residuals[i] = delta;

            result.max = result.max.max(delta.amax());
            result.l2 += delta.norm_squared();
        }

        self.clamp_to_ground();
        self.recompute_arc();
        self.rebuild();
        result
    }

    pub fn update_trailing_edge_location(&mut self, node: Vector3<f64>) {
        self.te_node = node;
        self.nodes[0] = node;
        self.rebuild();
    }

    /// Rigid-body motion of the trailing edge. Outside steady mode this also
    /// sheds the wake one time step downstream.
    pub fn update_geometry_location(
        &mut self,
        translation: &Vector3<f64>,
        origin: &Vector3<f64>,
        rotation: &UnitQuaternion<f64>,
    ) {
        self.te_node = rotation * (self.te_node - origin) + origin + translation;

        let Some(dt) = self.config.mode.time_step() else {
            self.nodes[0] = self.te_node;
            self.rebuild();
            return;
        };

        let n = self.number_of_sub_vortices();
        let count = self.nodes.len();
        let mut shift = vec![Vector3::zeros(); count];
        shift[n + 1] = self.nodes[n + 1] - self.nodes[n];
        for i in 1..=self.current_step.min(n) {
            shift[i] = self.edge_velocity(i - 1) * dt;
        }

        let smoothed = (self.current_step + 1).min(n + 1);
        for k in 0..3 {
            let mut column: Vec<f64> = shift[..smoothed].iter().map(|d| d[k]).collect();
            implicit_smooth(&mut column, |i| Some(1.0 + 0.001 * self.arc[i] / dt));
            for (d, value) in shift.iter_mut().zip(column) {
                d[k] = value;
            }
        }

        self.residuals[0] = self.nodes[0] - self.te_node;
        for i in 1..=n {
            self.residuals[i] = self.nodes[i - 1] + shift[i] - self.nodes[i];
        }
        self.residuals[n + 1] = self.nodes[n] + shift[n + 1] - self.nodes[n + 1];

        for i in (1..=n).rev() {
            self.nodes[i] = self.nodes[i - 1] + shift[i];
        }
        self.nodes[0] = self.te_node;
        self.nodes[n + 1] = self.nodes[n] + shift[n + 1];
        self.clamp_to_ground();

        self.previous_arc.copy_from_slice(&self.arc);
        self.recompute_arc();
        self.rebuild();
    }

    /// Implicit smoothing of the node positions with the trailing edge and
    /// the last reached node held fixed.
    pub fn smooth_wake(&mut self) {
        let n = self.number_of_sub_vortices();
        let count = if self.config.mode.is_time_accurate() {
            (self.current_step + 1).min(n + 1)
        } else {
            n + 1
        };
        for k in 0..3 {
            let mut column: Vec<f64> = self.nodes[..count].iter().map(|p| p[k]).collect();
            implicit_smooth(&mut column, |_| Some(0.25));
            for (node, value) in self.nodes.iter_mut().zip(column) {
                node[k] = value;
            }
        }
        self.clamp_to_ground();
        self.rebuild();
    }

    /// Smooths a per-node scalar velocity profile, leaving nodes inside the
    /// core near the trailing edge untouched.
    pub fn smooth_velocity(&self, values: &mut [f64]) {
        let limit = 0.25 * self.sigma;
        implicit_smooth(values, |i| {
            if self.arc.get(i).is_some_and(|s| *s <= limit) {
                None
            } else {
                Some(0.5)
            }
        });
    }

    pub fn save_wake_shape(&mut self) {
        self.saved_nodes.copy_from_slice(&self.nodes);
    }

    pub fn restore_wake_shape(&mut self) {
        self.nodes.copy_from_slice(&self.saved_nodes);
        self.recompute_arc();
        self.rebuild();
    }

    /// Number of nodes worth writing: the whole wake, or only the part
    /// reached so far in time-accurate runs.
    fn record_length(&self) -> usize {
        if self.config.mode.is_time_accurate() {
            (self.current_step + 1).min(self.nodes.len())
        } else {
            self.nodes.len()
        }
    }

    pub fn to_record(&self) -> WakeRecord {
        WakeRecord {
            node_id: self.node_id,
            span_fraction: self.span_fraction,
            nodes: self.nodes[..self.record_length()].to_vec(),
        }
    }

    pub fn apply_record(&mut self, record: &WakeRecord) -> WakeResult<()> {
        if record.nodes.len() > self.nodes.len() {
            return Err(WakeError::RecordSizeMismatch {
                found: record.nodes.len(),
                capacity: self.nodes.len(),
            });
        }
        self.nodes[..record.nodes.len()].copy_from_slice(&record.nodes);
        self.recompute_arc();
        self.rebuild();
        Ok(())
    }

    pub fn write_record<W: std::io::Write>(&self, writer: &mut W) -> WakeResult<()> {
        self.to_record().write(writer)
    }

    pub fn read_record<R: std::io::Read>(&mut self, reader: &mut R) -> WakeResult<()> {
        let record = WakeRecord::read_bounded(reader, self.nodes.len())?;
        self.apply_record(&record)
    }

    /// Numbers the x/y/z residual equation of every node from `first` on and
    /// returns the next free number.
    pub fn assign_equations(&mut self, first: usize) -> usize {
        let mut next = first;
        for equations in &mut self.equations {
            *equations = [next, next + 1, next + 2];
            next += 3;
        }
        next
    }

    pub fn equation_numbers(&self) -> &[[usize; 3]] {
        &self.equations
    }

    /// Extra diagonal weight added by wake damping.
    fn damping_shift(&self) -> f64 {
        if self.damping {
            (1.0 - self.config.settings.relaxation()).max(0.0)
        } else {
            0.0
        }
    }
}

impl InducedVelocityField for VortexTrail {
    fn induced_velocity(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.induced_velocity_with_core(point, self.sigma)
    }
}

impl WakeLinearOperator for VortexTrail {
    fn calculate_wake_residual(&self, residual: &mut [f64]) {
        let fixed = self.is_fixed();
        for (equations, value) in self.equations.iter().zip(&self.residuals) {
            for k in 0..3 {
                residual[equations[k]] = if fixed { 0.0 } else { value[k] };
            }
        }
    }

    fn wake_matrix_multiply(&self, vector: &[f64], product: &mut [f64]) {
        let diagonal = 1.0 + self.damping_shift();
        let fixed = self.is_fixed();
        for (i, equations) in self.equations.iter().enumerate() {
            for k in 0..3 {
                let row = equations[k];
                product[row] = if fixed || i == 0 {
                    vector[row]
                } else {
                    diagonal * vector[row] - vector[self.equations[i - 1][k]]
                };
            }
        }
    }

    fn wake_forward_precondition(&self, residual: &mut [f64]) {
        if self.is_fixed() || self.config.mode != SolverMode::Steady {
            return;
        }
        let diagonal = 1.0 + self.damping_shift();
        for i in 1..self.equations.len() {
            for k in 0..3 {
                let row = self.equations[i][k];
                residual[row] = (residual[row] + residual[self.equations[i - 1][k]]) / diagonal;
            }
        }
    }

    fn wake_transpose_multiply(&self, vector: &[f64], product: &mut [f64]) {
        let diagonal = 1.0 + self.damping_shift();
        let fixed = self.is_fixed();
        let count = self.equations.len();
        for (i, equations) in self.equations.iter().enumerate() {
            for k in 0..3 {
                let column = equations[k];
                if fixed {
                    product[column] += vector[column];
                    continue;
                }
                let weight = if i == 0 { 1.0 } else { diagonal };
                product[column] += weight * vector[column];
                if i + 1 < count {
                    product[column] -= vector[self.equations[i + 1][k]];
                }
            }
        }
    }
}
