//! Transient per-particle collision state.
//!
//! Collision copies each particle into a working record, runs the dynamic
//! and static shape passes over it, and writes the result back in the
//! merge. Constraints are the only state that survives the step: up to two
//! contact planes per particle, re-applied at the start of the next step
//! before any shape is tested.

use glam::Vec3;

use crate::config::bitflags_like;
use crate::math::Plane;
use crate::particles::ParticleFlags;

bitflags_like! {
    /// Contact classification during one shape pass.
    pub struct CollFlags: u32 {
        /// Continuous contact: the motion segment crosses a surface.
        const CC = 1 << 0;
        /// Discrete contact: the end position is inside the contact radius.
        const DC = 1 << 1;
        /// Proximity only: close enough to seed a constraint.
        const PROX = 1 << 2;
        /// Contact came from a dynamic shape.
        const DYNAMIC = 1 << 3;
        /// Contact came from a drain shape.
        const DRAIN = 1 << 4;
        /// The surface normal belongs to the finished dynamic pass and must
        /// not leak into the static response.
        const RESET_SNORMAL = 1 << 5;
        /// Any static contact happened at some point of the pipeline.
        const STATIC_TOUCHED = 1 << 6;
        /// Any dynamic contact happened at some point of the pipeline.
        const DYNAMIC_TOUCHED = 1 << 7;
        /// A drain shape was touched at some point of the pipeline.
        const DRAIN_TOUCHED = 1 << 8;
    }
}

/// One persistent contact constraint: a plane the particle should stay on
/// the positive side of (the rest offset is folded into `d`).
#[derive(Clone, Copy, Debug, Default)]
pub struct Constraint {
    pub plane: Plane,
    /// Surface velocity of the shape that produced the plane; zero for
    /// static shapes.
    pub velocity: Vec3,
}

/// Constraint pair carried by every particle between steps.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstraintPair {
    pub slots: [Constraint; 2],
}

/// Working copy of one particle during the collision pass.
#[derive(Clone, Debug)]
pub struct ParticleCollData {
    pub index: u32,
    pub flags: CollFlags,
    pub old_pos: Vec3,
    pub new_pos: Vec3,
    pub velocity: Vec3,
    pub rest_offset: f32,
    /// Earliest continuous-contact time seen so far, 1.0 when none.
    pub cc_time: f32,
    pub surface_normal: Vec3,
    pub surface_pos: Vec3,
    pub surface_velocity: Vec3,
    /// Discrete contacts accumulate; the response averages by this count.
    pub dc_num: f32,
    /// Constraint candidates with their distance to surface, best two kept.
    pub constraints: [ConstraintCandidate; 2],
    /// Dynamic shape the current contact belongs to, for two-way impulses.
    pub contact_shape: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConstraintCandidate {
    pub constraint: Constraint,
    pub dist_to_surface: f32,
    pub valid: bool,
    pub dynamic: bool,
}

/// Identity of the shape a contact came from, applied to the particle's
/// flags when a contact is accepted.
#[derive(Clone, Copy, Debug)]
pub struct ShapeTag {
    pub index: u32,
    pub dynamic: bool,
    pub drain: bool,
}

impl ShapeTag {
    fn flags(&self) -> CollFlags {
        let mut f = CollFlags::NONE;
        if self.dynamic {
            f.insert(CollFlags::DYNAMIC.union(CollFlags::DYNAMIC_TOUCHED));
        } else {
            f.insert(CollFlags::STATIC_TOUCHED);
        }
        if self.drain {
            f.insert(CollFlags::DRAIN.union(CollFlags::DRAIN_TOUCHED));
        }
        f
    }
}

impl ParticleCollData {
    pub fn new(index: u32, position: Vec3, velocity: Vec3, rest_offset: f32) -> Self {
        Self {
            index,
            flags: CollFlags::NONE,
            old_pos: position,
            new_pos: position,
            velocity,
            rest_offset,
            cc_time: 1.0,
            surface_normal: Vec3::ZERO,
            surface_pos: Vec3::ZERO,
            surface_velocity: Vec3::ZERO,
            dc_num: 0.0,
            constraints: [ConstraintCandidate::default(); 2],
            contact_shape: None,
        }
    }

    /// Record a continuous contact; earliest impact wins and displaces any
    /// discrete contact seen so far.
    pub fn add_cc(&mut self, time: f32, normal: Vec3, pos: Vec3, velocity: Vec3, tag: ShapeTag) {
        if time < self.cc_time {
            self.cc_time = time;
            self.surface_normal = normal;
            self.surface_pos = pos;
            self.surface_velocity = velocity;
            self.flags.insert(CollFlags::CC.union(tag.flags()));
            self.flags.remove(CollFlags::DC);
            self.dc_num = 0.0;
            self.contact_shape = tag.dynamic.then_some(tag.index);
        }
    }

    /// Record a discrete contact. Ignored once a continuous contact
    /// exists; otherwise normals and surface points accumulate and the
    /// response averages them.
    pub fn add_dc(&mut self, normal: Vec3, pos: Vec3, velocity: Vec3, tag: ShapeTag) {
        if self.flags.contains(CollFlags::CC) {
            return;
        }
        if self.flags.contains(CollFlags::DC) {
            self.surface_normal += normal;
            self.surface_pos += pos;
            self.surface_velocity += velocity;
        } else {
            self.flags.insert(CollFlags::DC);
            self.surface_normal = normal;
            self.surface_pos = pos;
            self.surface_velocity = velocity;
        }
        self.flags.insert(tag.flags());
        self.dc_num += 1.0;
        if tag.dynamic {
            self.contact_shape = Some(tag.index);
        }
    }

    /// Offer a constraint candidate. Slots fill in invalid-first order;
    /// with both slots taken the farther one is replaced, and only by a
    /// closer candidate.
    pub fn add_constraint(&mut self, constraint: Constraint, dist_to_surface: f32, dynamic: bool) {
        let candidate = ConstraintCandidate {
            constraint,
            dist_to_surface,
            valid: true,
            dynamic,
        };
        for slot in &mut self.constraints {
            if !slot.valid {
                *slot = candidate;
                return;
            }
        }
        let farther = if self.constraints[0].dist_to_surface >= self.constraints[1].dist_to_surface {
            0
        } else {
            1
        };
        if dist_to_surface < self.constraints[farther].dist_to_surface {
            self.constraints[farther] = candidate;
        }
    }

    /// Flag word for the persistent constraint pair.
    pub fn constraint_flags(&self) -> u16 {
        let mut low = 0u16;
        if self.constraints[0].valid {
            low |= ParticleFlags::CONSTRAINT_0_VALID;
            if self.constraints[0].dynamic {
                low |= ParticleFlags::CONSTRAINT_0_DYNAMIC;
            }
        }
        if self.constraints[1].valid {
            low |= ParticleFlags::CONSTRAINT_1_VALID;
            if self.constraints[1].dynamic {
                low |= ParticleFlags::CONSTRAINT_1_DYNAMIC;
            }
        }
        low
    }

    /// Reset the contact bookkeeping between the dynamic and static shape
    /// passes. The surface velocity is kept so the static response still
    /// sees the carrier motion; the normal is marked stale instead of
    /// cleared.
    pub fn reset_for_static_pass(&mut self) {
        self.flags.remove(
            CollFlags::CC
                .union(CollFlags::DC)
                .union(CollFlags::PROX)
                .union(CollFlags::DYNAMIC)
                .union(CollFlags::DRAIN),
        );
        self.flags.insert(CollFlags::RESET_SNORMAL);
        self.cc_time = 1.0;
        self.dc_num = 0.0;
        self.contact_shape = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ParticleCollData {
        ParticleCollData::new(0, Vec3::ZERO, Vec3::ZERO, 0.04)
    }

    const STATIC_TAG: ShapeTag = ShapeTag {
        index: 0,
        dynamic: false,
        drain: false,
    };

    #[test]
    fn earliest_continuous_contact_wins() {
        let mut data = base();
        data.add_cc(0.6, Vec3::X, Vec3::new(0.6, 0.0, 0.0), Vec3::ZERO, STATIC_TAG);
        data.add_cc(0.3, Vec3::Y, Vec3::new(0.0, 0.3, 0.0), Vec3::ZERO, STATIC_TAG);
        data.add_cc(0.5, Vec3::Z, Vec3::new(0.0, 0.0, 0.5), Vec3::ZERO, STATIC_TAG);
        assert_eq!(data.cc_time, 0.3);
        assert_eq!(data.surface_normal, Vec3::Y);
        assert!(data.flags.contains(CollFlags::STATIC_TOUCHED));
    }

    #[test]
    fn continuous_contact_displaces_discrete() {
        let mut data = base();
        data.add_dc(Vec3::Y, Vec3::ZERO, Vec3::ZERO, STATIC_TAG);
        assert!(data.flags.contains(CollFlags::DC));
        data.add_cc(0.5, Vec3::X, Vec3::ZERO, Vec3::ZERO, STATIC_TAG);
        assert!(data.flags.contains(CollFlags::CC));
        assert!(!data.flags.contains(CollFlags::DC));
        // Later discrete contacts are ignored.
        data.add_dc(Vec3::Y, Vec3::ZERO, Vec3::ZERO, STATIC_TAG);
        assert!(!data.flags.contains(CollFlags::DC));
    }

    #[test]
    fn dynamic_drain_contact_tags_the_particle() {
        let mut data = base();
        data.add_dc(
            Vec3::Y,
            Vec3::ZERO,
            Vec3::ZERO,
            ShapeTag {
                index: 7,
                dynamic: true,
                drain: true,
            },
        );
        assert!(data.flags.contains(CollFlags::DYNAMIC_TOUCHED));
        assert!(data.flags.contains(CollFlags::DRAIN_TOUCHED));
        assert_eq!(data.contact_shape, Some(7));
    }

    #[test]
    fn constraint_slots_keep_the_two_closest() {
        let mut data = base();
        let plane = |n: Vec3| Constraint {
            plane: Plane::new(n, 0.0),
            velocity: Vec3::ZERO,
        };
        data.add_constraint(plane(Vec3::X), 0.5, false);
        data.add_constraint(plane(Vec3::Y), 0.2, false);
        // Farther than both: rejected.
        data.add_constraint(plane(Vec3::Z), 0.9, false);
        assert_eq!(data.constraints[0].dist_to_surface, 0.5);
        assert_eq!(data.constraints[1].dist_to_surface, 0.2);
        // Closer than slot 0: replaces it.
        data.add_constraint(plane(Vec3::NEG_X), 0.1, true);
        assert_eq!(data.constraints[0].dist_to_surface, 0.1);
        assert!(data.constraints[0].dynamic);
    }
}
