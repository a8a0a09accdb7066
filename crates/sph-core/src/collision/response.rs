//! Per-particle integration and contact response.

use glam::Vec3;

use crate::config::{CollisionParameters, SystemFlags};
use crate::math::normalize_or;

use super::data::{CollFlags, Constraint, ParticleCollData};

/// Denominator floor for the coupled two-constraint solve; below this the
/// planes are near parallel and the deeper one wins alone.
const CONSTRAINT_COUPLING_EPS: f32 = 1.0e-4;

/// Advance the particle by one step: damped velocity plus external and
/// fluid acceleration, speed capped so the motion stays inside the
/// collision range.
pub fn integrate(data: &mut ParticleCollData, params: &CollisionParameters, fluid_accel: Vec3) {
    let mut v = data.velocity * params.damping_dt_comp
        + (params.external_acceleration + fluid_accel) * params.time_step;
    let max_speed = params.max_motion_distance * params.inv_time_step;
    let speed_sq = v.length_squared();
    if speed_sq > max_speed * max_speed && speed_sq > 0.0 {
        v *= max_speed / speed_sq.sqrt();
    }
    data.velocity = v;
    data.new_pos = data.old_pos + v * params.time_step;
}

/// Push the integrated position out of the inherited constraint planes and
/// strip the approaching velocity component, before any shape is tested.
pub fn apply_constraints(data: &mut ParticleCollData, c0: Option<&Constraint>, c1: Option<&Constraint>) {
    match (c0, c1) {
        (Some(c0), Some(c1)) => {
            let d0 = c0.plane.distance(data.new_pos);
            let d1 = c1.plane.distance(data.new_pos);
            if d0 < 0.0 && d1 < 0.0 {
                let n0 = c0.plane.normal;
                let n1 = c1.plane.normal;
                let dot = n0.dot(n1);
                let det = 1.0 - dot * dot;
                if det > CONSTRAINT_COUPLING_EPS {
                    let inv = 1.0 / det;
                    let a = (-d0 + d1 * dot) * inv;
                    let b = (-d1 + d0 * dot) * inv;
                    data.new_pos += n0 * a + n1 * b;
                } else if d0 < d1 {
                    data.new_pos -= n0 * d0;
                } else {
                    data.new_pos -= n1 * d1;
                }
                slide_velocity(data, c0);
                slide_velocity(data, c1);
            } else if d0 < 0.0 {
                data.new_pos -= c0.plane.normal * d0;
                slide_velocity(data, c0);
            } else if d1 < 0.0 {
                data.new_pos -= c1.plane.normal * d1;
                slide_velocity(data, c1);
            }
        }
        (Some(c), None) | (None, Some(c)) => {
            let d = c.plane.distance(data.new_pos);
            if d < 0.0 {
                data.new_pos -= c.plane.normal * d;
                slide_velocity(data, c);
            }
        }
        (None, None) => {}
    }
}

/// Remove the velocity component that drives into the constraint plane,
/// relative to the plane's own motion.
#[inline]
fn slide_velocity(data: &mut ParticleCollData, c: &Constraint) {
    let vn = c.plane.normal.dot(data.velocity - c.velocity);
    if vn < 0.0 {
        data.velocity -= c.plane.normal * vn;
    }
}

/// Resolve the recorded contact of one shape pass: reposition the
/// particle and reflect its velocity with restitution and friction.
/// Returns the impulse direction-and-magnitude applied to the particle
/// (for two-way coupling), or zero when nothing happened.
pub fn collision_response(data: &mut ParticleCollData, params: &CollisionParameters) -> Vec3 {
    if !data
        .flags
        .intersects(CollFlags::CC.union(CollFlags::DC))
    {
        return Vec3::ZERO;
    }

    let (normal, surface_pos, surface_vel) = if data.flags.contains(CollFlags::CC) {
        (data.surface_normal, data.surface_pos, data.surface_velocity)
    } else {
        let inv = 1.0 / data.dc_num;
        (
            normalize_or(data.surface_normal, Vec3::Y),
            data.surface_pos * inv,
            data.surface_velocity * inv,
        )
    };

    let old_velocity = data.velocity;
    let rel = data.velocity - surface_vel;
    let vn = normal.dot(rel);
    let mut tangent = rel - normal * vn;

    if vn < 0.0 {
        // Static friction locks slow tangential sliding outright.
        if tangent.length_squared() < params.static_friction_sqr * vn * vn {
            tangent = Vec3::ZERO;
        } else {
            tangent *= 1.0 - params.dynamic_friction;
        }
        data.velocity = tangent - normal * (vn * params.restitution) + surface_vel;
    }

    if data.flags.contains(CollFlags::CC) {
        // Finish the step from the impact point with the corrected
        // velocity.
        let remaining = (1.0 - data.cc_time) * params.time_step;
        data.new_pos = surface_pos + data.velocity * remaining;
    } else {
        data.new_pos = surface_pos;
    }

    data.surface_normal = normal;
    data.surface_pos = surface_pos;
    data.surface_velocity = surface_vel;
    data.velocity - old_velocity
}

/// Cap the total step motion; a response may not fling the particle
/// farther than the integrator would have.
pub fn clamp_to_max_motion(data: &mut ParticleCollData, params: &CollisionParameters) {
    let motion = data.new_pos - data.old_pos;
    let dist_sq = motion.length_squared();
    let max = params.max_motion_distance;
    if dist_sq > max * max && dist_sq > 0.0 {
        data.new_pos = data.old_pos + motion * (max / dist_sq.sqrt());
    }
}

/// Final write position: optionally re-projected onto the global plane for
/// 2D-constrained systems.
pub fn final_position(data: &ParticleCollData, params: &CollisionParameters) -> (Vec3, Vec3) {
    if params.flags.contains(SystemFlags::PROJECT_TO_PLANE) {
        let plane = params.projection_plane;
        let pos = data.new_pos - plane.normal * plane.distance(data.new_pos);
        let vel = data.velocity - plane.normal * plane.normal.dot(data.velocity);
        (pos, vel)
    } else {
        (data.new_pos, data.velocity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::data::ShapeTag;
    use crate::config::{DynamicsParameters, ParticleSystemConfig};
    use crate::math::Plane;

    const STATIC_TAG: ShapeTag = ShapeTag {
        index: 0,
        dynamic: false,
        drain: false,
    };

    fn params() -> CollisionParameters {
        let config = ParticleSystemConfig::default();
        CollisionParameters::derive(&config, &DynamicsParameters::derive(&config), 1.0 / 60.0)
    }

    fn falling(pos: Vec3, vel: Vec3) -> ParticleCollData {
        ParticleCollData::new(0, pos, vel, 0.04)
    }

    #[test]
    fn integrate_applies_gravity_and_cap() {
        let p = params();
        let mut data = falling(Vec3::ZERO, Vec3::ZERO);
        integrate(&mut data, &p, Vec3::ZERO);
        assert!(data.velocity.y < 0.0);

        let mut fast = falling(Vec3::ZERO, Vec3::new(1000.0, 0.0, 0.0));
        integrate(&mut fast, &p, Vec3::ZERO);
        let motion = (fast.new_pos - fast.old_pos).length();
        assert!(
            motion <= p.max_motion_distance * 1.001,
            "motion {motion} exceeds cap"
        );
    }

    #[test]
    fn constraint_pushes_out_and_strips_normal_velocity() {
        let c = Constraint {
            plane: Plane::new(Vec3::Y, 0.0),
            velocity: Vec3::ZERO,
        };
        let mut data = falling(Vec3::new(0.0, 0.1, 0.0), Vec3::new(0.2, -1.0, 0.0));
        data.new_pos = Vec3::new(0.0, -0.02, 0.0);
        apply_constraints(&mut data, Some(&c), None);
        assert!(data.new_pos.y.abs() < 1.0e-6);
        assert_eq!(data.velocity.y, 0.0, "approach component removed");
        assert_eq!(data.velocity.x, 0.2, "tangential component kept");
    }

    #[test]
    fn coupled_constraints_resolve_into_the_wedge() {
        let cx = Constraint {
            plane: Plane::new(Vec3::X, 0.0),
            velocity: Vec3::ZERO,
        };
        let cy = Constraint {
            plane: Plane::new(Vec3::Y, 0.0),
            velocity: Vec3::ZERO,
        };
        let mut data = falling(Vec3::splat(0.1), Vec3::ZERO);
        data.new_pos = Vec3::new(-0.01, -0.02, 0.0);
        apply_constraints(&mut data, Some(&cx), Some(&cy));
        assert!(data.new_pos.x >= -1.0e-6 && data.new_pos.y >= -1.0e-6);
    }

    #[test]
    fn discrete_response_lands_on_surface_with_reflected_velocity() {
        let p = params();
        let mut data = falling(Vec3::new(0.0, 0.1, 0.0), Vec3::new(0.5, -1.0, 0.0));
        data.new_pos = Vec3::new(0.0, 0.02, 0.0);
        data.add_dc(Vec3::Y, Vec3::new(0.0, 0.04, 0.0), Vec3::ZERO, STATIC_TAG);
        collision_response(&mut data, &p);
        assert_eq!(data.new_pos, Vec3::new(0.0, 0.04, 0.0));
        assert!(data.velocity.y >= 0.0, "no residual approach velocity");
        assert!(
            data.velocity.y <= 1.0 * p.restitution + 1.0e-5,
            "restitution bound violated"
        );
        assert!(data.velocity.x < 0.5, "dynamic friction slows sliding");
    }

    #[test]
    fn multiple_discrete_contacts_write_back_the_mean_point() {
        let p = params();
        let mut data = falling(Vec3::new(0.0, 0.1, 0.0), Vec3::new(0.0, -1.0, 0.0));
        data.new_pos = Vec3::new(0.0, 0.02, 0.0);
        data.add_dc(Vec3::Y, Vec3::new(0.0, 0.04, 0.0), Vec3::ZERO, STATIC_TAG);
        data.add_dc(Vec3::Y, Vec3::new(0.2, 0.04, 0.0), Vec3::ZERO, STATIC_TAG);
        collision_response(&mut data, &p);
        // The record must hold the averaged point, not the accumulated sum.
        assert_eq!(data.surface_pos, Vec3::new(0.1, 0.04, 0.0));
        assert_eq!(data.new_pos, data.surface_pos);
    }

    #[test]
    fn moving_surface_drags_particle() {
        let p = params();
        let surface_vel = Vec3::new(2.0, 0.0, 0.0);
        let mut data = falling(Vec3::new(0.0, 0.1, 0.0), Vec3::new(0.0, -1.0, 0.0));
        data.new_pos = Vec3::new(0.0, 0.02, 0.0);
        data.add_dc(Vec3::Y, Vec3::new(0.0, 0.04, 0.0), surface_vel, STATIC_TAG);
        collision_response(&mut data, &p);
        assert!(
            data.velocity.x > 0.0,
            "surface velocity must carry the particle, got {:?}",
            data.velocity
        );
    }
}
