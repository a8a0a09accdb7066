//! Per-system configuration and the derived per-step parameter snapshots.
//!
//! SPH runs in a normalized "std" unit system where the rest particle
//! spacing is `1 / REST_PARTICLES_PER_UNIT_STD`. All kernel constants are
//! precomputed in std units once per configuration change; positions are
//! scaled in and forces scaled back out around the neighbor passes.

use glam::Vec3;
use std::f32::consts::PI;

use crate::math::Plane;

/// Maximum number of simultaneously live packets per system.
pub const PACKET_LIMIT: usize = 924;

/// Packet hash bucket count. Power of two, strictly larger than
/// [`PACKET_LIMIT`] so linear probing always finds an empty slot.
pub const PACKET_HASH_SIZE: usize = 1024;

/// Fan-out width of the dynamics and collision stages.
pub const MAX_PARALLEL_TASKS: usize = 8;

/// A packet at or below this size skips the local fine-cell hash and
/// tests its pairs brute force.
pub const BRUTE_FORCE_PARTICLE_THRESHOLD: usize = 100;

/// Source-group size at which the batched kernel path takes over from the
/// scalar reference path.
pub const BATCH_THRESHOLD: usize = 8;

/// Capacity of one interaction index stream fed to the batched kernels.
pub const MAX_INDEX_STREAM_SIZE: usize = 128;

/// Rest particle spacing of the normalized SPH unit system.
pub const REST_PARTICLES_PER_UNIT_STD: f32 = 10.0;

/// Extra margin on the collision candidate range beyond max motion plus
/// contact offset.
pub const COLLISION_SLACK: f32 = 1e-4;

/// Minimal const-friendly bitflags. Spelled out here instead of pulling in
/// a flags crate so the flag words stay plain integer Pod fields.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $($(#[$fmeta:meta])* const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            pub const NONE: $name = $name(0);

            #[inline]
            pub const fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            #[inline]
            pub const fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            #[inline]
            pub const fn intersects(self, other: $name) -> bool {
                (self.0 & other.0) != 0
            }

            #[inline]
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }
    };
}
pub(crate) use bitflags_like;

bitflags_like! {
    /// Feature switches of one particle system.
    pub struct SystemFlags: u32 {
        /// Run the SPH density/force passes. Off means plain ballistic
        /// particles with collision only.
        const SPH = 1 << 0;
        /// Test against shapes of dynamic rigid bodies.
        const COLLISION_WITH_DYNAMIC_ACTORS = 1 << 1;
        /// Record impulses back onto dynamic bodies.
        const TWO_WAY_COLLISION = 1 << 2;
        /// Keep a per-particle triangle cache for mesh collision.
        const PER_PARTICLE_COLLISION_CACHE = 1 << 3;
        /// Per-particle rest offsets instead of the global one.
        const PER_PARTICLE_REST_OFFSET = 1 << 4;
        /// Project all particles onto `projection_plane` after collision.
        const PROJECT_TO_PLANE = 1 << 5;
        /// Export per-particle densities after the step.
        const READ_DENSITY = 1 << 6;
        /// Export per-particle collision normals after the step.
        const READ_COLLISION_NORMAL = 1 << 7;
        /// Export per-particle collision velocities after the step.
        const READ_COLLISION_VELOCITY = 1 << 8;
    }
}

/// Flat per-system configuration, immutable during a step.
#[derive(Clone, Debug)]
pub struct ParticleSystemConfig {
    pub max_particles: u32,
    pub rest_particle_distance: f32,
    pub kernel_radius_multiplier: f32,
    pub rest_density: f32,
    pub stiffness: f32,
    pub viscosity: f32,
    pub damping: f32,
    pub restitution: f32,
    pub dynamic_friction: f32,
    pub static_friction: f32,
    pub rest_offset: f32,
    pub contact_offset: f32,
    pub max_motion_distance: f32,
    pub packet_size_multiplier_log2: u32,
    pub external_acceleration: Vec3,
    pub projection_plane: Plane,
    pub flags: SystemFlags,
}

impl Default for ParticleSystemConfig {
    fn default() -> Self {
        Self {
            max_particles: 16384,
            rest_particle_distance: 0.1,
            kernel_radius_multiplier: 2.0,
            rest_density: 1000.0,
            stiffness: 20.0,
            viscosity: 6.0,
            damping: 0.0,
            restitution: 0.5,
            dynamic_friction: 0.05,
            static_friction: 0.0,
            rest_offset: 0.04,
            contact_offset: 0.08,
            max_motion_distance: 0.06,
            packet_size_multiplier_log2: 3,
            external_acceleration: Vec3::new(0.0, -9.81, 0.0),
            projection_plane: Plane::new(Vec3::Y, 0.0),
            flags: SystemFlags::SPH
                .union(SystemFlags::COLLISION_WITH_DYNAMIC_ACTORS)
                .union(SystemFlags::READ_DENSITY),
        }
    }
}

/// Derived SPH constants, recomputed when the configuration changes.
#[derive(Clone, Copy, Debug)]
pub struct DynamicsParameters {
    pub rest_density: f32,
    pub particle_mass_std: f32,
    pub cell_size: f32,
    pub cell_size_inv: f32,
    pub cell_size_sq: f32,
    pub packet_size: f32,
    pub packet_mult_log2: u32,
    pub radius_std: f32,
    pub radius_sq_std: f32,
    pub density_multiplier_std: f32,
    pub stiff_mul_pressure_multiplier_std: f32,
    pub viscosity_multiplier_std: f32,
    pub self_density: f32,
    pub density_normalization_factor: f32,
    pub scale_to_std: f32,
    pub scale_sq_to_std: f32,
    pub scale_to_world: f32,
}

impl DynamicsParameters {
    pub fn derive(config: &ParticleSystemConfig) -> Self {
        let rest_dist = config.rest_particle_distance;
        let rest_dist_std = 1.0 / REST_PARTICLES_PER_UNIT_STD;
        let rest_dist_std3 = rest_dist_std * rest_dist_std * rest_dist_std;

        let particle_mass_std = config.rest_density * rest_dist_std3;
        let cell_size = config.kernel_radius_multiplier * rest_dist;
        let packet_size = cell_size * (1 << config.packet_size_multiplier_log2) as f32;

        let radius_std = config.kernel_radius_multiplier * rest_dist_std;
        let radius2_std = radius_std * radius_std;
        let radius6_std = radius2_std * radius2_std * radius2_std;
        let radius9_std = radius6_std * radius2_std * radius_std;
        let w_poly6_std = 315.0 / (64.0 * PI * radius9_std);
        let w_spiky_gradient_std = 1.5 * 15.0 / (PI * radius6_std);
        let w_viscosity_laplacian_std = 45.0 / (PI * radius6_std);

        let density_multiplier_std = w_poly6_std * particle_mass_std;
        let self_density = density_multiplier_std * radius2_std * radius2_std * radius2_std;
        let density_rest_offset = config.rest_density - self_density;

        let scale_to_std = rest_dist_std / rest_dist;

        Self {
            rest_density: config.rest_density,
            particle_mass_std,
            cell_size,
            cell_size_inv: 1.0 / cell_size,
            cell_size_sq: cell_size * cell_size,
            packet_size,
            packet_mult_log2: config.packet_size_multiplier_log2,
            radius_std,
            radius_sq_std: radius2_std,
            density_multiplier_std,
            stiff_mul_pressure_multiplier_std: w_spiky_gradient_std
                * particle_mass_std
                * config.stiffness,
            viscosity_multiplier_std: w_viscosity_laplacian_std
                * particle_mass_std
                * config.viscosity,
            self_density,
            density_normalization_factor: if density_rest_offset > 0.0 {
                1.0 / density_rest_offset
            } else {
                0.0
            },
            scale_to_std,
            scale_sq_to_std: scale_to_std * scale_to_std,
            scale_to_world: 1.0 / scale_to_std,
        }
    }
}

/// Derived collision constants, recomputed each step (they fold in the
/// time step and external acceleration).
#[derive(Clone, Copy, Debug)]
pub struct CollisionParameters {
    pub cell_size: f32,
    pub cell_size_inv: f32,
    pub packet_size: f32,
    pub packet_mult_log2: u32,
    pub rest_offset: f32,
    pub contact_offset: f32,
    pub max_motion_distance: f32,
    pub collision_range: f32,
    pub damping_dt_comp: f32,
    pub external_acceleration: Vec3,
    pub projection_plane: Plane,
    pub time_step: f32,
    pub inv_time_step: f32,
    pub restitution: f32,
    pub dynamic_friction: f32,
    pub static_friction_sqr: f32,
    pub flags: SystemFlags,
}

// Clamps that keep the collision response stable.
const DYNAMIC_FRICTION_MIN: f32 = 0.001;
const RESTITUTION_HEADROOM: f32 = 0.05;

fn damping_factor(damping: f32, time_step: f32) -> f32 {
    let damping_dt = damping * time_step;
    if damping_dt < 1.0 {
        1.0 - damping_dt
    } else {
        0.0
    }
}

impl CollisionParameters {
    pub fn derive(
        config: &ParticleSystemConfig,
        dynamics: &DynamicsParameters,
        time_step: f32,
    ) -> Self {
        debug_assert!(config.contact_offset >= config.rest_offset);
        Self {
            cell_size: dynamics.cell_size,
            cell_size_inv: dynamics.cell_size_inv,
            packet_size: dynamics.packet_size,
            packet_mult_log2: config.packet_size_multiplier_log2,
            rest_offset: config.rest_offset,
            contact_offset: config.contact_offset,
            max_motion_distance: config.max_motion_distance,
            collision_range: config.max_motion_distance + config.contact_offset + COLLISION_SLACK,
            damping_dt_comp: damping_factor(config.damping, time_step),
            external_acceleration: config.external_acceleration,
            projection_plane: config.projection_plane,
            time_step,
            inv_time_step: if time_step > 0.0 { 1.0 / time_step } else { 0.0 },
            restitution: config.restitution.clamp(0.0, 1.0 - RESTITUTION_HEADROOM),
            dynamic_friction: config.dynamic_friction.clamp(DYNAMIC_FRICTION_MIN, 1.0),
            static_friction_sqr: config.static_friction * config.static_friction,
            flags: config.flags,
        }
    }
}
