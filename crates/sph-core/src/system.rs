//! One particle system: configuration, particle storage and the step
//! pipeline tying the spatial hash, SPH and collision together.

use glam::Vec3;

use crate::collision::data::ConstraintPair;
use crate::collision::{self, Collision, CollisionInput, TwoWayImpulse};
use crate::config::{
    CollisionParameters, DynamicsParameters, ParticleSystemConfig, SystemFlags,
};
use crate::dynamics::Sph;
use crate::hash::SpatialHash;
use crate::math::Aabb;
use crate::particles::{ParticleCreation, ParticleStore};
use crate::shapes::ShapeStore;

/// Step results for the host: the new particle bounds, impulses to apply
/// to dynamic bodies, and the particles that touched a drain this step.
/// Drained particles stay in the store; removing them is the host's call.
#[derive(Debug)]
pub struct SimulationOutput {
    pub world_bounds: Aabb,
    pub two_way: Vec<TwoWayImpulse>,
    pub drained: Vec<u32>,
}

impl SimulationOutput {
    pub fn empty() -> Self {
        Self {
            world_bounds: Aabb::EMPTY,
            two_way: Vec::new(),
            drained: Vec::new(),
        }
    }
}

impl Default for SimulationOutput {
    fn default() -> Self {
        Self::empty()
    }
}

/// A complete simulated particle system.
pub struct ParticleSystemSim {
    config: ParticleSystemConfig,
    dynamics_params: DynamicsParameters,
    store: ParticleStore,
    hash: SpatialHash,
    sph: Option<Sph>,
    collision: Collision,
    /// Packet-ordered particle index stream, rebuilt every step.
    ordered: Vec<u32>,
    /// SPH accelerations by particle id, consumed by collision integration.
    transient: Vec<Vec3>,
    constraints: Vec<ConstraintPair>,
}

fn particle_mass(config: &ParticleSystemConfig) -> f32 {
    let d = config.rest_particle_distance;
    config.rest_density * d * d * d
}

impl ParticleSystemSim {
    pub fn new(config: ParticleSystemConfig) -> Self {
        let dynamics_params = DynamicsParameters::derive(&config);
        let max = config.max_particles;
        let sph_enabled = config.flags.contains(SystemFlags::SPH);
        let collision_params = CollisionParameters::derive(&config, &dynamics_params, 0.0);
        Self {
            store: ParticleStore::new(
                max,
                config.flags.contains(SystemFlags::PER_PARTICLE_REST_OFFSET),
            ),
            hash: SpatialHash::new(
                dynamics_params.cell_size_inv,
                dynamics_params.packet_mult_log2,
                sph_enabled,
                max,
            ),
            sph: sph_enabled.then(|| Sph::new(dynamics_params)),
            collision: Collision::new(collision_params, particle_mass(&config), max),
            ordered: vec![0; max as usize],
            transient: vec![Vec3::ZERO; max as usize],
            constraints: vec![ConstraintPair::default(); max as usize],
            dynamics_params,
            config,
        }
    }

    pub fn config(&self) -> &ParticleSystemConfig {
        &self.config
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ParticleStore {
        &mut self.store
    }

    /// Normalized densities are on the particles themselves; these per-step
    /// buffers exist only when the matching read flag is set.
    pub fn collision_normals(&self) -> Option<&[Vec3]> {
        self.collision.collision_normals()
    }

    pub fn collision_velocities(&self) -> Option<&[Vec3]> {
        self.collision.collision_velocities()
    }

    pub fn add_particles(&mut self, creation: &ParticleCreation) {
        self.store.add_particles(creation);
    }

    pub fn remove_particles(&mut self, indices: &[u32]) {
        self.store.remove_particles(indices);
    }

    /// Reconfigure in place. The particle capacity is part of the system's
    /// identity and must not change.
    pub fn set_config(&mut self, config: ParticleSystemConfig) {
        debug_assert_eq!(config.max_particles, self.config.max_particles);
        self.dynamics_params = DynamicsParameters::derive(&config);
        let sph_enabled = config.flags.contains(SystemFlags::SPH);
        self.hash = SpatialHash::new(
            self.dynamics_params.cell_size_inv,
            self.dynamics_params.packet_mult_log2,
            sph_enabled,
            config.max_particles,
        );
        self.sph = sph_enabled.then(|| Sph::new(self.dynamics_params));
        self.collision.set_params(
            CollisionParameters::derive(&config, &self.dynamics_params, 0.0),
            particle_mass(&config),
        );
        self.config = config;
    }

    /// A mesh or heightfield shape moved or changed; cached triangle
    /// regions no longer match.
    pub fn invalidate_collision_caches(&mut self) {
        self.collision.invalidate_caches();
    }

    /// A dynamic body was removed; its contact constraints must not be
    /// replayed next step.
    pub fn on_dynamic_shapes_removed(&mut self) {
        collision::remove_dynamic_constraints(self.store.particles_mut());
    }

    pub fn on_origin_shift(&mut self, shift: Vec3) {
        self.store.on_origin_shift(shift);
    }

    /// Advance the system by `time_step` against the given shape snapshot.
    pub fn step(&mut self, shapes: &ShapeStore, time_step: f32) -> SimulationOutput {
        let collision_params =
            CollisionParameters::derive(&self.config, &self.dynamics_params, time_step);
        self.collision.begin_step(collision_params);

        if self.store.valid_count() == 0 {
            *self.store.world_bounds_mut() = Aabb::EMPTY;
            return SimulationOutput::empty();
        }

        let valid_range = self.store.valid_range();
        {
            let (map, _, particles) = self.store.split_for_update();
            self.hash
                .update_packet_hash(&mut self.ordered, particles, map, valid_range);
        }

        if let Some(sph) = &mut self.sph {
            self.hash
                .update_packet_sections(&mut self.ordered, self.store.particles());
            sph.update_sph(
                &self.hash,
                &self.ordered,
                self.store.particles_mut(),
                &mut self.transient,
            );
        } else {
            self.transient.fill(Vec3::ZERO);
        }

        let (_, rest_offsets, particles) = self.store.split_for_update();
        let output = self.collision.update(
            &CollisionInput {
                hash: &self.hash,
                ordered: &self.ordered,
                shapes,
                transient: &self.transient,
                rest_offsets,
            },
            particles,
            &mut self.constraints,
        );

        *self.store.world_bounds_mut() = output.world_bounds;

        SimulationOutput {
            world_bounds: output.world_bounds,
            two_way: output.two_way,
            drained: output.drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::ParticleFlags;

    fn grid_creation(n: usize, spacing: f32) -> (Vec<u32>, Vec<Vec3>) {
        let mut indices = Vec::new();
        let mut positions = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    indices.push(positions.len() as u32);
                    positions.push(Vec3::new(
                        x as f32 * spacing,
                        1.0 + y as f32 * spacing,
                        z as f32 * spacing,
                    ));
                }
            }
        }
        (indices, positions)
    }

    #[test]
    fn ballistic_system_falls_under_gravity() {
        let mut config = ParticleSystemConfig::default();
        config.flags = SystemFlags::NONE;
        let mut sim = ParticleSystemSim::new(config);

        sim.add_particles(&ParticleCreation {
            indices: &[0],
            positions: &[Vec3::new(0.0, 1.0, 0.0)],
            velocities: &[],
            rest_offsets: &[],
        });
        let shapes = ShapeStore::new();
        let out = sim.step(&shapes, 1.0 / 60.0);

        let p = &sim.store().particles()[0];
        assert!(p.velocity.y < 0.0);
        assert!(p.position.y < 1.0);
        assert!(!out.world_bounds.is_empty());
        assert!(out.world_bounds.min.y <= p.position.y);
    }

    #[test]
    fn sph_step_populates_densities() {
        let config = ParticleSystemConfig::default();
        let spacing = config.rest_particle_distance;
        let mut sim = ParticleSystemSim::new(config);

        let (indices, positions) = grid_creation(4, spacing);
        sim.add_particles(&ParticleCreation {
            indices: &indices,
            positions: &positions,
            velocities: &[],
            rest_offsets: &[],
        });
        let shapes = ShapeStore::new();
        sim.step(&shapes, 1.0 / 60.0);

        let max_density = sim
            .store()
            .particles()
            .iter()
            .take(indices.len())
            .map(|p| p.density)
            .fold(0.0f32, f32::max);
        assert!(
            max_density > 0.1,
            "packed grid should report nonzero normalized density, got {max_density}"
        );
    }

    #[test]
    fn empty_system_reports_empty_bounds() {
        let mut config = ParticleSystemConfig::default();
        config.flags = SystemFlags::NONE;
        let mut sim = ParticleSystemSim::new(config);
        let shapes = ShapeStore::new();
        let out = sim.step(&shapes, 1.0 / 60.0);
        assert!(out.world_bounds.is_empty());
        assert!(out.two_way.is_empty());
        assert!(out.drained.is_empty());
    }

    #[test]
    fn drained_particles_stay_until_the_host_removes_them() {
        use crate::shapes::{Shape, ShapeFlags, ShapeGeometry, ShapeHandle};
        use glam::Affine3A;

        let mut config = ParticleSystemConfig::default();
        config.flags = SystemFlags::NONE;
        let mut sim = ParticleSystemSim::new(config);
        sim.add_particles(&ParticleCreation {
            indices: &[0, 1],
            positions: &[Vec3::new(0.0, 0.01, 0.0), Vec3::new(0.0, 2.0, 0.0)],
            velocities: &[Vec3::new(0.0, -1.0, 0.0), Vec3::ZERO],
            rest_offsets: &[],
        });

        let mut shapes = ShapeStore::new();
        shapes.push(Shape {
            handle: ShapeHandle(7),
            geometry: ShapeGeometry::Plane,
            transform: Affine3A::IDENTITY,
            prev_transform: Affine3A::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            flags: ShapeFlags::DRAIN,
            bounds: Aabb::EMPTY,
        });

        let out = sim.step(&shapes, 1.0 / 60.0);
        assert_eq!(out.drained, vec![0]);
        // Drains only flag and report; the store keeps the particle until
        // the host acts on the output.
        assert!(sim.store().is_valid(0));
        assert!(
            sim.store().particles()[0].flags.api & ParticleFlags::COLLISION_WITH_DRAIN != 0
        );
        assert_eq!(sim.store().valid_count(), 2);

        sim.remove_particles(&out.drained);
        assert!(!sim.store().is_valid(0));
        assert!(sim.store().is_valid(1));
        assert_eq!(sim.store().valid_count(), 1);
    }
}
