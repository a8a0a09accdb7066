//! Particle collision pipeline.
//!
//! Runs after SPH, packet by packet: integrate, re-apply inherited
//! constraints, collide against dynamic shapes, respond, collide against
//! static shapes, respond again, clamp, write back. Workers own disjoint
//! packet ranges and only read the particle buffer; a merge continuation
//! folds the lane results into one collector, and the scatter back into
//! the particle and constraint buffers happens once the graph is done.

pub mod cache;
pub mod data;
pub mod mesh;
pub mod response;
pub mod shapes;

use std::sync::Mutex;

use glam::Vec3;

use crate::config::{CollisionParameters, SystemFlags, PACKET_HASH_SIZE};
use crate::dynamics::split_lanes;
use crate::hash::SpatialHash;
use crate::math::Aabb;
use crate::particles::{Particle, ParticleFlags};
use crate::shapes::{ShapeFlags, ShapeGeometry, ShapeHandle, ShapeStore};
use crate::task::TaskGraph;

use cache::{CacheQuantizer, TriangleCache};
use data::{CollFlags, ConstraintPair, ParticleCollData, ShapeTag};
use response::{
    apply_constraints, clamp_to_max_motion, collision_response, final_position, integrate,
};
use shapes::{collide_shape, ShapeCtx};

/// Impulse a particle applied to a dynamic shape, reported back to the
/// host for two-way coupling.
#[derive(Clone, Copy, Debug)]
pub struct TwoWayImpulse {
    pub shape: ShapeHandle,
    pub position: Vec3,
    pub impulse: Vec3,
}

pub struct CollisionInput<'a> {
    pub hash: &'a SpatialHash,
    pub ordered: &'a [u32],
    pub shapes: &'a ShapeStore,
    /// Fluid accelerations by particle id, world units.
    pub transient: &'a [Vec3],
    pub rest_offsets: Option<&'a [f32]>,
}

pub struct CollisionOutput {
    pub world_bounds: Aabb,
    pub two_way: Vec<TwoWayImpulse>,
    /// Particles that touched a drain shape this step.
    pub drained: Vec<u32>,
}

impl CollisionOutput {
    fn new() -> Self {
        Self {
            world_bounds: Aabb::EMPTY,
            two_way: Vec::new(),
            drained: Vec::new(),
        }
    }
}

struct ParticleUpdate {
    index: u32,
    position: Vec3,
    velocity: Vec3,
    api_flags: u16,
    low_flags: u16,
    constraints: ConstraintPair,
    normal: Vec3,
    surface_velocity: Vec3,
}

struct LaneResult {
    updates: Vec<ParticleUpdate>,
    bounds: Aabb,
    two_way: Vec<TwoWayImpulse>,
    drained: Vec<u32>,
    caches: Vec<(u32, TriangleCache)>,
}

impl LaneResult {
    fn new() -> Self {
        Self {
            updates: Vec::new(),
            bounds: Aabb::EMPTY,
            two_way: Vec::new(),
            drained: Vec::new(),
            caches: Vec::new(),
        }
    }
}

pub struct Collision {
    params: CollisionParameters,
    particle_mass: f32,
    quantizer: CacheQuantizer,
    caches: Option<Vec<TriangleCache>>,
    collision_normals: Option<Vec<Vec3>>,
    collision_velocities: Option<Vec<Vec3>>,
}

impl Collision {
    pub fn new(params: CollisionParameters, particle_mass: f32, max_particles: u32) -> Self {
        let max = max_particles as usize;
        let flags = params.flags;
        Self {
            quantizer: CacheQuantizer::new(&params),
            caches: flags
                .contains(SystemFlags::PER_PARTICLE_COLLISION_CACHE)
                .then(|| vec![TriangleCache::default(); max]),
            collision_normals: flags
                .contains(SystemFlags::READ_COLLISION_NORMAL)
                .then(|| vec![Vec3::ZERO; max]),
            collision_velocities: flags
                .contains(SystemFlags::READ_COLLISION_VELOCITY)
                .then(|| vec![Vec3::ZERO; max]),
            params,
            particle_mass,
        }
    }

    /// Per-step refresh. Only the time-step folds change here; the ranges
    /// the cache quantizer was built from are configuration derived, so
    /// cached regions stay valid.
    pub fn begin_step(&mut self, params: CollisionParameters) {
        self.params = params;
    }

    /// New configuration; the cache quantization scale may shift, so cached
    /// triangle regions cannot be trusted.
    pub fn set_params(&mut self, params: CollisionParameters, particle_mass: f32) {
        self.params = params;
        self.particle_mass = particle_mass;
        self.quantizer = CacheQuantizer::new(&params);
        self.invalidate_caches();
    }

    /// Drop every cached triangle region, e.g. when a mesh shape moved or
    /// was removed.
    pub fn invalidate_caches(&mut self) {
        if let Some(caches) = &mut self.caches {
            for cache in caches.iter_mut() {
                cache.invalidate();
            }
        }
    }

    pub fn collision_normals(&self) -> Option<&[Vec3]> {
        self.collision_normals.as_deref()
    }

    pub fn collision_velocities(&self) -> Option<&[Vec3]> {
        self.collision_velocities.as_deref()
    }

    pub fn update(
        &mut self,
        input: &CollisionInput,
        particles: &mut [Particle],
        constraints: &mut [ConstraintPair],
    ) -> CollisionOutput {
        if let Some(caches) = &mut self.caches {
            for cache in caches.iter_mut() {
                cache.state = cache.state.age();
            }
        }

        let stream_len = input.hash.overflow_packet().first_particle as usize;
        let (static_by_bucket, dynamic_by_bucket) = self.map_shapes_to_packets(input);
        let lanes = split_lanes(input.hash, stream_len as u32);

        let collected = Mutex::new(Vec::new());
        {
            let results: Vec<Mutex<LaneResult>> = lanes
                .iter()
                .map(|_| Mutex::new(LaneResult::new()))
                .collect();
            let results_ref = &results;
            let collected_ref = &collected;

            let params = self.params;
            let quantizer = self.quantizer;
            let particle_mass = self.particle_mass;
            let particles_ref: &[Particle] = particles;
            let constraints_ref: &[ConstraintPair] = constraints;
            let caches_ref = self.caches.as_deref();
            let static_ref = &static_by_bucket;
            let dynamic_ref = &dynamic_by_bucket;

            let mut graph = TaskGraph::new();
            let merge = graph.add_task(move || {
                let mut out = collected_ref.lock().expect("collision merge poisoned");
                for cell in results_ref {
                    let result = std::mem::replace(
                        &mut *cell.lock().expect("collision lane poisoned"),
                        LaneResult::new(),
                    );
                    out.push(result);
                }
            });

            for (lane, cell) in lanes.iter().zip(results.iter()) {
                graph.spawn_with_continuation(
                    move || {
                        let mut result = cell.lock().expect("collision lane poisoned");
                        let mut worker = LaneWorker {
                            params: &params,
                            quantizer: &quantizer,
                            particle_mass,
                            input,
                            particles: particles_ref,
                            constraints: constraints_ref,
                            caches: caches_ref,
                            static_by_bucket: static_ref,
                            dynamic_by_bucket: dynamic_ref,
                            scratch: Vec::new(),
                        };
                        for &bucket in &lane.buckets {
                            let packet = input.hash.packets()[bucket];
                            let first = packet.first_particle;
                            for k in first..first + packet.num_particles {
                                let pi = input.ordered[k as usize];
                                worker.collide_particle(pi, bucket, &mut result);
                            }
                        }
                    },
                    merge,
                );
            }
            graph.execute();
        }

        let mut output = CollisionOutput::new();
        let collected = collected
            .into_inner()
            .expect("collision merge poisoned");
        for result in collected {
            for u in &result.updates {
                let i = u.index as usize;
                particles[i].position = u.position;
                particles[i].velocity = u.velocity;
                particles[i].flags.api = u.api_flags;
                particles[i].flags.low = u.low_flags;
                constraints[i] = u.constraints;
                if let Some(normals) = &mut self.collision_normals {
                    normals[i] = u.normal;
                }
                if let Some(velocities) = &mut self.collision_velocities {
                    velocities[i] = u.surface_velocity;
                }
            }
            if let Some(caches) = &mut self.caches {
                for (i, cache) in result.caches {
                    caches[i as usize] = cache;
                }
            }
            output.world_bounds.include(&result.bounds);
            output.two_way.extend(result.two_way);
            output.drained.extend(result.drained);
        }

        self.advance_overflow(input, particles, &mut output);
        output
    }

    /// Kinematic advance for overflow particles: integration, motion clamp
    /// and projection, but no shape collision.
    fn advance_overflow(
        &self,
        input: &CollisionInput,
        particles: &mut [Particle],
        output: &mut CollisionOutput,
    ) {
        let overflow = input.hash.overflow_packet();
        let first = overflow.first_particle;
        for k in first..first + overflow.num_particles {
            let pi = input.ordered[k as usize] as usize;
            let p = &particles[pi];
            let mut data = ParticleCollData::new(pi as u32, p.position, p.velocity, 0.0);
            integrate(&mut data, &self.params, input.transient[pi]);
            clamp_to_max_motion(&mut data, &self.params);
            let (pos, vel) = final_position(&data, &self.params);
            particles[pi].position = pos;
            particles[pi].velocity = vel;
            particles[pi].flags.api &=
                ParticleFlags::VALID | ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW;
            output.world_bounds.include_point(pos);
        }
    }

    /// Broadphase: attach every snapshot shape to the occupied packets its
    /// bounds overlap, split by mobility.
    fn map_shapes_to_packets(&self, input: &CollisionInput) -> (Vec<Vec<u32>>, Vec<Vec<u32>>) {
        let mut static_by_bucket = vec![Vec::new(); PACKET_HASH_SIZE];
        let mut dynamic_by_bucket = vec![Vec::new(); PACKET_HASH_SIZE];
        let with_dynamics = self
            .params
            .flags
            .contains(SystemFlags::COLLISION_WITH_DYNAMIC_ACTORS);

        for bucket in 0..PACKET_HASH_SIZE {
            let packet = &input.hash.packets()[bucket];
            if !packet.is_occupied() || packet.num_particles == 0 {
                continue;
            }
            let size = self.params.packet_size;
            let min = Vec3::new(
                packet.coord.x as f32,
                packet.coord.y as f32,
                packet.coord.z as f32,
            ) * size;
            let mut bounds = Aabb {
                min,
                max: min + Vec3::splat(size),
            };
            bounds.fatten(self.params.collision_range);

            for (si, shape) in input.shapes.shapes().iter().enumerate() {
                if !shape.bounds.intersects(&bounds) {
                    continue;
                }
                if shape.is_dynamic() {
                    if with_dynamics {
                        dynamic_by_bucket[bucket].push(si as u32);
                    }
                } else {
                    static_by_bucket[bucket].push(si as u32);
                }
            }
        }
        (static_by_bucket, dynamic_by_bucket)
    }
}

struct LaneWorker<'a> {
    params: &'a CollisionParameters,
    quantizer: &'a CacheQuantizer,
    particle_mass: f32,
    input: &'a CollisionInput<'a>,
    particles: &'a [Particle],
    constraints: &'a [ConstraintPair],
    caches: Option<&'a [TriangleCache]>,
    static_by_bucket: &'a [Vec<u32>],
    dynamic_by_bucket: &'a [Vec<u32>],
    scratch: Vec<u32>,
}

impl LaneWorker<'_> {
    fn collide_particle(&mut self, pi: u32, bucket: usize, result: &mut LaneResult) {
        let particle = &self.particles[pi as usize];
        let rest_offset = self
            .input
            .rest_offsets
            .map_or(self.params.rest_offset, |r| r[pi as usize]);
        let mut data = ParticleCollData::new(pi, particle.position, particle.velocity, rest_offset);

        integrate(&mut data, self.params, self.input.transient[pi as usize]);

        let pair = &self.constraints[pi as usize];
        let low = particle.flags.low;
        let c0 = (low & ParticleFlags::CONSTRAINT_0_VALID != 0).then(|| &pair.slots[0]);
        let c1 = (low & ParticleFlags::CONSTRAINT_1_VALID != 0).then(|| &pair.slots[1]);
        apply_constraints(&mut data, c0, c1);

        let mut cache_update: Option<(u32, TriangleCache)> = None;

        let dynamic_shapes = &self.dynamic_by_bucket[bucket];
        if !dynamic_shapes.is_empty() {
            for &si in dynamic_shapes {
                self.run_shape(&mut data, si, true, &mut cache_update);
            }
            let delta_v = collision_response(&mut data, self.params);
            if self.params.flags.contains(SystemFlags::TWO_WAY_COLLISION) {
                if let Some(si) = data.contact_shape {
                    let shape = &self.input.shapes.shapes()[si as usize];
                    result.two_way.push(TwoWayImpulse {
                        shape: shape.handle,
                        position: data.surface_pos,
                        impulse: -delta_v * self.particle_mass,
                    });
                }
            }
            data.reset_for_static_pass();
        }

        for &si in &self.static_by_bucket[bucket] {
            self.run_shape(&mut data, si, false, &mut cache_update);
        }
        collision_response(&mut data, self.params);

        clamp_to_max_motion(&mut data, self.params);
        let (position, velocity) = final_position(&data, self.params);

        let mut api = particle.flags.api
            & (ParticleFlags::VALID | ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW);
        if data.flags.contains(CollFlags::STATIC_TOUCHED) {
            api |= ParticleFlags::COLLISION_WITH_STATIC;
        }
        if data.flags.contains(CollFlags::DYNAMIC_TOUCHED) {
            api |= ParticleFlags::COLLISION_WITH_DYNAMIC;
        }
        if data.flags.contains(CollFlags::DRAIN_TOUCHED) {
            api |= ParticleFlags::COLLISION_WITH_DRAIN;
            result.drained.push(pi);
        }

        let mut pair = ConstraintPair::default();
        for (slot, candidate) in pair.slots.iter_mut().zip(&data.constraints) {
            if candidate.valid {
                *slot = candidate.constraint;
            }
        }

        result.bounds.include_point(position);
        if let Some(update) = cache_update {
            result.caches.push(update);
        }
        result.updates.push(ParticleUpdate {
            index: pi,
            position,
            velocity,
            api_flags: api,
            low_flags: data.constraint_flags(),
            constraints: pair,
            normal: data.surface_normal,
            surface_velocity: data.surface_velocity,
        });
    }

    fn run_shape(
        &mut self,
        data: &mut ParticleCollData,
        si: u32,
        dynamic: bool,
        cache_update: &mut Option<(u32, TriangleCache)>,
    ) {
        let shape = &self.input.shapes.shapes()[si as usize];
        let tag = ShapeTag {
            index: si,
            dynamic,
            drain: shape.flags.contains(ShapeFlags::DRAIN),
        };
        let ctx = ShapeCtx::new(data.rest_offset, self.params, tag);

        // Sweep relative to the shape's own motion: the start position is
        // taken in the shape's previous frame and carried to its new pose,
        // so a moving shape crossing a particle still registers.
        let world_old = data.old_pos;
        if dynamic {
            data.old_pos = shape
                .transform
                .transform_point3(shape.prev_transform.inverse().transform_point3(world_old));
        }
        match &shape.geometry {
            ShapeGeometry::TriangleMesh(tri_mesh) => {
                // The cache serves the first static mesh only; a second
                // mesh would thrash it every step.
                let cache_slot = if !dynamic && cache_update.is_none() {
                    self.caches
                        .map(|caches| caches[data.index as usize].clone())
                } else {
                    None
                };
                match cache_slot {
                    Some(mut cache) => {
                        mesh::collide_with_mesh(
                            data,
                            shape,
                            tri_mesh,
                            Some((&mut cache, self.quantizer)),
                            &ctx,
                            &mut self.scratch,
                        );
                        *cache_update = Some((data.index, cache));
                    }
                    None => {
                        mesh::collide_with_mesh(
                            data,
                            shape,
                            tri_mesh,
                            None,
                            &ctx,
                            &mut self.scratch,
                        );
                    }
                }
            }
            ShapeGeometry::Heightfield(hf) => {
                mesh::collide_with_heightfield(data, shape, hf, &ctx);
            }
            _ => collide_shape(data, shape, &ctx),
        }
        data.old_pos = world_old;
    }
}

/// Drop constraints that reference dynamic shapes, e.g. when a rigid body
/// was removed and its contacts must not be replayed.
pub fn remove_dynamic_constraints(particles: &mut [Particle]) {
    for particle in particles.iter_mut() {
        let low = particle.flags.low;
        let mut keep = 0u16;
        if low & ParticleFlags::CONSTRAINT_0_VALID != 0
            && low & ParticleFlags::CONSTRAINT_0_DYNAMIC == 0
        {
            keep |= ParticleFlags::CONSTRAINT_0_VALID;
        }
        if low & ParticleFlags::CONSTRAINT_1_VALID != 0
            && low & ParticleFlags::CONSTRAINT_1_DYNAMIC == 0
        {
            keep |= ParticleFlags::CONSTRAINT_1_VALID;
        }
        particle.flags.low = keep;
    }
}
