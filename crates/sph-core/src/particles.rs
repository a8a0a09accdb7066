//! Particle state storage.
//!
//! The buffer is index stable: the host addresses particles by the index it
//! created them at, and removal never compacts. A validity bitmap plus
//! `valid_range` bound the live region so per-step passes only touch indices
//! `0..valid_range` that test valid.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::math::Aabb;

/// API-visible and internal flag words of one particle.
///
/// `api` is readable by the host after a step; `low` is simulation
/// bookkeeping (constraint slot validity) cleared by `clear_sim_state`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ParticleFlags {
    pub api: u16,
    pub low: u16,
}

impl ParticleFlags {
    // api bits
    pub const VALID: u16 = 1 << 0;
    pub const COLLISION_WITH_STATIC: u16 = 1 << 1;
    pub const COLLISION_WITH_DYNAMIC: u16 = 1 << 2;
    pub const COLLISION_WITH_DRAIN: u16 = 1 << 3;
    /// Sticky: set when the packet table overflowed with this particle in it.
    pub const SPATIAL_DATA_STRUCTURE_OVERFLOW: u16 = 1 << 4;

    // low bits
    pub const CONSTRAINT_0_VALID: u16 = 1 << 0;
    pub const CONSTRAINT_1_VALID: u16 = 1 << 1;
    pub const CONSTRAINT_0_DYNAMIC: u16 = 1 << 2;
    pub const CONSTRAINT_1_DYNAMIC: u16 = 1 << 3;
    pub const ANY_CONSTRAINT_VALID: u16 = Self::CONSTRAINT_0_VALID | Self::CONSTRAINT_1_VALID;
}

/// One particle. Flat and Pod so hosts can view the buffer as bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct Particle {
    pub position: Vec3,
    pub density: f32,
    pub velocity: Vec3,
    pub flags: ParticleFlags,
}

/// Per-particle mesh triangle cache validity. Stored alongside the
/// particle instead of packed into the flag word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheState {
    #[default]
    Invalid,
    /// Cache contents present but not hit this step yet.
    Valid,
    /// Cache hit (or rebuilt) this step; ages back to `Valid` next step.
    Fresh,
}

impl CacheState {
    /// Step-to-step decay: an unused cache survives one step, then drops.
    pub fn age(self) -> Self {
        match self {
            CacheState::Fresh => CacheState::Valid,
            _ => CacheState::Invalid,
        }
    }
}

/// Word-based validity bitmap.
#[derive(Clone, Debug, Default)]
pub struct BitMap {
    words: Vec<u32>,
}

impl BitMap {
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(32)],
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        self.words[i >> 5] |= 1 << (i & 31);
    }

    #[inline]
    pub fn reset(&mut self, i: usize) {
        self.words[i >> 5] &= !(1 << (i & 31));
    }

    #[inline]
    pub fn test(&self, i: usize) -> bool {
        (self.words[i >> 5] >> (i & 31)) & 1 != 0
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Index of the highest set bit, or `None` when empty.
    pub fn find_last(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate().rev() {
            if *word != 0 {
                return Some((w << 5) + 31 - word.leading_zeros() as usize);
            }
        }
        None
    }

    /// Iterate set bit indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            let mut bits = *word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    None
                } else {
                    let b = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some((w << 5) + b)
                }
            })
        })
    }
}

/// Creation request for a batch of particles at explicit indices.
pub struct ParticleCreation<'a> {
    pub indices: &'a [u32],
    pub positions: &'a [Vec3],
    /// Empty means zero initial velocity.
    pub velocities: &'a [Vec3],
    /// Required iff the store was built with per-particle rest offsets.
    pub rest_offsets: &'a [f32],
}

pub struct ParticleStore {
    particles: Vec<Particle>,
    rest_offsets: Option<Vec<f32>>,
    map: BitMap,
    valid_count: u32,
    valid_range: u32,
    world_bounds: Aabb,
}

impl ParticleStore {
    pub fn new(max_particles: u32, per_particle_rest_offset: bool) -> Self {
        let max = max_particles as usize;
        Self {
            particles: vec![Particle::default(); max],
            rest_offsets: per_particle_rest_offset.then(|| vec![0.0; max]),
            map: BitMap::with_capacity(max),
            valid_count: 0,
            valid_range: 0,
            world_bounds: Aabb::EMPTY,
        }
    }

    #[inline]
    pub fn max_particles(&self) -> u32 {
        self.particles.len() as u32
    }

    #[inline]
    pub fn valid_count(&self) -> u32 {
        self.valid_count
    }

    /// One past the highest valid index; passes iterate `0..valid_range()`.
    #[inline]
    pub fn valid_range(&self) -> u32 {
        self.valid_range
    }

    #[inline]
    pub fn is_valid(&self, index: u32) -> bool {
        self.map.test(index as usize)
    }

    #[inline]
    pub fn map(&self) -> &BitMap {
        &self.map
    }

    #[inline]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    #[inline]
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    #[inline]
    pub fn rest_offsets(&self) -> Option<&[f32]> {
        self.rest_offsets.as_deref()
    }

    /// Split borrow for the step passes, which mutate particles while
    /// reading the validity map and rest offsets.
    #[inline]
    pub fn split_for_update(&mut self) -> (&BitMap, Option<&[f32]>, &mut [Particle]) {
        (&self.map, self.rest_offsets.as_deref(), &mut self.particles)
    }

    #[inline]
    pub fn world_bounds(&self) -> &Aabb {
        &self.world_bounds
    }

    #[inline]
    pub fn world_bounds_mut(&mut self) -> &mut Aabb {
        &mut self.world_bounds
    }

    /// Add particles at the given indices. Indices must be unused and in
    /// range; violations are debug assertions, matching the closed contract
    /// with the host engine.
    pub fn add_particles(&mut self, creation: &ParticleCreation) {
        debug_assert_eq!(creation.indices.len(), creation.positions.len());
        debug_assert_eq!(
            self.rest_offsets.is_some(),
            !creation.rest_offsets.is_empty() || creation.indices.is_empty()
        );

        for (i, &index) in creation.indices.iter().enumerate() {
            let idx = index as usize;
            debug_assert!(idx < self.particles.len());
            debug_assert!(!self.map.test(idx), "particle index already in use");
            self.map.set(idx);

            if index + 1 > self.valid_range {
                self.valid_range = index + 1;
            }

            let particle = &mut self.particles[idx];
            particle.position = creation.positions[i];
            particle.velocity = creation.velocities.get(i).copied().unwrap_or(Vec3::ZERO);
            particle.density = 0.0;
            particle.flags = ParticleFlags {
                api: ParticleFlags::VALID,
                low: 0,
            };
            self.world_bounds.include_point(particle.position);

            if let Some(rest) = &mut self.rest_offsets {
                rest[idx] = creation.rest_offsets[i];
            }
        }

        self.valid_count += creation.indices.len() as u32;
    }

    pub fn remove_particles(&mut self, indices: &[u32]) {
        for &index in indices {
            self.remove_one(index as usize);
        }
        self.valid_count -= indices.len() as u32;
        self.valid_range = if self.valid_count > 0 {
            self.map.find_last().map_or(0, |i| i as u32 + 1)
        } else {
            0
        };
    }

    pub fn remove_all(&mut self) {
        let live: Vec<usize> = self.map.iter().collect();
        for index in live {
            self.remove_one(index);
        }
        self.valid_count = 0;
        self.valid_range = 0;
    }

    fn remove_one(&mut self, index: usize) {
        debug_assert!(self.map.test(index));
        self.particles[index].flags = ParticleFlags::default();
        self.map.reset(index);
    }

    pub fn set_positions(&mut self, indices: &[u32], positions: &[Vec3]) {
        for (&index, &p) in indices.iter().zip(positions) {
            debug_assert!(self.map.test(index as usize));
            self.particles[index as usize].position = p;
            self.world_bounds.include_point(p);
        }
    }

    pub fn set_velocities(&mut self, indices: &[u32], velocities: &[Vec3]) {
        for (&index, &v) in indices.iter().zip(velocities) {
            debug_assert!(self.map.test(index as usize));
            self.particles[index as usize].velocity = v;
        }
    }

    pub fn set_rest_offsets(&mut self, indices: &[u32], rest_offsets: &[f32]) {
        let Some(rest) = &mut self.rest_offsets else {
            debug_assert!(false, "store built without per-particle rest offsets");
            return;
        };
        for (&index, &r) in indices.iter().zip(rest_offsets) {
            rest[index as usize] = r;
        }
    }

    /// Reset internal flags and densities, e.g. when a system is
    /// deactivated and its constraint buffers no longer match.
    pub fn clear_sim_state(&mut self) {
        for index in self.map.iter().collect::<Vec<_>>() {
            let particle = &mut self.particles[index];
            particle.flags.low = 0;
            particle.density = 0.0;
        }
    }

    /// Shift every particle (and the bounds) when the host rebases its
    /// world origin.
    pub fn on_origin_shift(&mut self, shift: Vec3) {
        for index in self.map.iter().collect::<Vec<_>>() {
            self.particles[index].position -= shift;
        }
        if !self.world_bounds.is_empty() {
            self.world_bounds.min -= shift;
            self.world_bounds.max -= shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(indices: &[u32]) -> ParticleStore {
        let mut store = ParticleStore::new(64, false);
        let positions: Vec<Vec3> = indices.iter().map(|&i| Vec3::splat(i as f32)).collect();
        store.add_particles(&ParticleCreation {
            indices,
            positions: &positions,
            velocities: &[],
            rest_offsets: &[],
        });
        store
    }

    #[test]
    fn valid_range_tracks_highest_index() {
        let mut store = store_with(&[0, 5, 17]);
        assert_eq!(store.valid_range(), 18);
        assert_eq!(store.valid_count(), 3);

        store.remove_particles(&[17]);
        assert_eq!(store.valid_range(), 6, "range shrinks to next live index");
        assert_eq!(store.valid_count(), 2);
    }

    #[test]
    fn removed_particles_lose_valid_flag() {
        let mut store = store_with(&[2]);
        assert!(store.particles()[2].flags.api & ParticleFlags::VALID != 0);
        store.remove_particles(&[2]);
        assert_eq!(store.particles()[2].flags.api & ParticleFlags::VALID, 0);
        assert!(!store.is_valid(2));
    }

    #[test]
    fn bitmap_iterates_in_order() {
        let mut map = BitMap::with_capacity(100);
        for i in [3usize, 31, 32, 64, 99] {
            map.set(i);
        }
        let collected: Vec<usize> = map.iter().collect();
        assert_eq!(collected, vec![3, 31, 32, 64, 99]);
        assert_eq!(map.find_last(), Some(99));
    }

    #[test]
    fn cache_state_ages_out_in_two_steps() {
        let s = CacheState::Fresh;
        let s = s.age();
        assert_eq!(s, CacheState::Valid);
        assert_eq!(s.age(), CacheState::Invalid);
    }
}
