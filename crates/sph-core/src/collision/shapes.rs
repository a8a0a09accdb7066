//! Analytic shape tests: plane, box and convex volumes through one shared
//! plane-set routine, sphere and capsule through the distance function.
//!
//! Every test works on the world-space motion segment `old_pos -> new_pos`
//! and records continuous, discrete or proximity results on the particle.
//! Distances are shifted by the particle's surface offset so the particle
//! rests one offset above the real surface.

use glam::Vec3;

use crate::config::CollisionParameters;
use crate::math::{normalize_or, Plane};
use crate::shapes::{Shape, ShapeGeometry};

use super::data::{Constraint, ParticleCollData, ShapeTag};

/// Radii of one particle-vs-shape test, all measured from the shape
/// surface.
#[derive(Clone, Copy, Debug)]
pub struct ShapeCtx {
    pub tag: ShapeTag,
    /// Target resting distance of the particle center.
    pub surface_offset: f32,
    /// Discrete contacts trigger within this band beyond the offset.
    pub contact_band: f32,
    /// Proximity constraints seed within this band beyond the offset.
    pub prox_band: f32,
}

impl ShapeCtx {
    pub fn new(rest_offset: f32, params: &CollisionParameters, tag: ShapeTag) -> Self {
        Self {
            tag,
            surface_offset: rest_offset,
            contact_band: params.contact_offset - params.rest_offset,
            prox_band: params.collision_range - params.rest_offset,
        }
    }
}

/// Dispatch one non-mesh shape against the particle motion.
pub fn collide_shape(data: &mut ParticleCollData, shape: &Shape, ctx: &ShapeCtx) {
    match &shape.geometry {
        ShapeGeometry::Plane => {
            let normal = shape.transform.transform_vector3(Vec3::Y).normalize();
            let point = Vec3::from(shape.transform.translation);
            let plane = Plane::new(normal, -normal.dot(point));
            collide_with_planes(data, &[plane], shape, ctx);
        }
        ShapeGeometry::Box { half_extents } => {
            let planes = box_planes(shape, *half_extents);
            collide_with_planes(data, &planes, shape, ctx);
        }
        ShapeGeometry::Convex { planes } => {
            let world: Vec<Plane> = planes.iter().map(|p| to_world_plane(shape, *p)).collect();
            collide_with_planes(data, &world, shape, ctx);
        }
        ShapeGeometry::Sphere { radius } => {
            let center = Vec3::from(shape.transform.translation);
            collide_with_sphere(data, center, center, *radius, shape, ctx);
        }
        ShapeGeometry::Capsule {
            radius,
            half_height,
        } => {
            let axis = shape.transform.transform_vector3(Vec3::X * *half_height);
            let center = Vec3::from(shape.transform.translation);
            let (a, b) = (center - axis, center + axis);
            let c_old = closest_on_segment(a, b, data.old_pos);
            let c_new = closest_on_segment(a, b, data.new_pos);
            collide_with_sphere(data, c_old, c_new, *radius, shape, ctx);
        }
        ShapeGeometry::TriangleMesh(_) | ShapeGeometry::Heightfield(_) => {
            debug_assert!(false, "mesh shapes take the mesh path");
        }
    }
}

fn to_world_plane(shape: &Shape, plane: Plane) -> Plane {
    let normal = shape.transform.transform_vector3(plane.normal);
    let d = plane.d - normal.dot(Vec3::from(shape.transform.translation));
    Plane::new(normal, d)
}

fn box_planes(shape: &Shape, half_extents: Vec3) -> [Plane; 6] {
    let mut planes = [Plane::new(Vec3::Y, 0.0); 6];
    let normals = [
        Vec3::X,
        Vec3::NEG_X,
        Vec3::Y,
        Vec3::NEG_Y,
        Vec3::Z,
        Vec3::NEG_Z,
    ];
    for (i, n) in normals.into_iter().enumerate() {
        let extent = half_extents.dot(n.abs());
        planes[i] = to_world_plane(shape, Plane::new(n, -extent));
    }
    planes
}

/// Particle vs a convex plane set. Tracks the segment's entry and exit
/// across the shifted volume for continuous contact, the closest plane of
/// the end position for discrete contact and constraint seeding.
pub fn collide_with_planes(
    data: &mut ParticleCollData,
    planes: &[Plane],
    shape: &Shape,
    ctx: &ShapeCtx,
) {
    if planes.is_empty() {
        return;
    }
    let offs = ctx.surface_offset;

    let mut entry = 0.0f32;
    let mut entry_normal = Vec3::ZERO;
    let mut exit = f32::MAX;
    let mut max_old = f32::MIN;
    let mut max_old_normal = Vec3::ZERO;
    let mut max_new = f32::MIN;
    let mut max_new_plane = Plane::new(Vec3::Y, 0.0);
    let mut out_count = 0u32;

    for plane in planes {
        let d_old = plane.distance(data.old_pos) - offs;
        let d_new = plane.distance(data.new_pos) - offs;
        if d_old > max_old {
            max_old = d_old;
            max_old_normal = plane.normal;
        }
        if d_new > max_new {
            max_new = d_new;
            max_new_plane = *plane;
        }
        if d_new > 0.0 {
            out_count += 1;
        }

        let slope = d_new - d_old;
        if slope < 0.0 {
            let t = d_old / -slope;
            if t > entry {
                entry = t;
                entry_normal = plane.normal;
            }
        } else if slope > 0.0 {
            exit = exit.min(-d_old / slope);
        } else if d_old > 0.0 {
            entry = f32::MAX;
        }
    }

    if max_old <= 0.0 {
        // Started inside the shifted volume: surface the particle through
        // the least-deep plane at time zero.
        let pos = data.old_pos - max_old_normal * max_old;
        let vel = shape.surface_velocity(pos);
        data.add_cc(0.0, max_old_normal, pos, vel, ctx.tag);
        return;
    }

    if entry <= exit && entry <= 1.0 && entry < data.cc_time {
        let impact = data.old_pos + (data.new_pos - data.old_pos) * entry;
        let vel = shape.surface_velocity(impact);
        data.add_cc(entry, entry_normal, impact, vel, ctx.tag);
        return;
    }

    if max_new <= ctx.contact_band && out_count <= 1 {
        let pos = data.new_pos - max_new_plane.normal * max_new;
        let vel = shape.surface_velocity(pos);
        data.add_dc(max_new_plane.normal, pos, vel, ctx.tag);
        seed_plane_constraint(data, max_new_plane, max_new, offs, vel, ctx);
    } else if max_new <= ctx.prox_band && out_count <= 1 {
        let vel = shape.surface_velocity(data.new_pos);
        seed_plane_constraint(data, max_new_plane, max_new, offs, vel, ctx);
    }
}

fn seed_plane_constraint(
    data: &mut ParticleCollData,
    plane: Plane,
    dist: f32,
    offs: f32,
    velocity: Vec3,
    ctx: &ShapeCtx,
) {
    let constraint = Constraint {
        plane: Plane::new(plane.normal, plane.d - offs),
        velocity,
    };
    data.add_constraint(constraint, dist, ctx.tag.dynamic);
}

/// Sphere-like test; the capsule passes its per-endpoint closest segment
/// points so the same code covers both.
fn collide_with_sphere(
    data: &mut ParticleCollData,
    center_old: Vec3,
    center_new: Vec3,
    radius: f32,
    shape: &Shape,
    ctx: &ShapeCtx,
) {
    let r_eff = radius + ctx.surface_offset;
    let to_old = data.old_pos - center_old;
    let to_new = data.new_pos - center_new;
    let d_old = to_old.length() - r_eff;
    let d_new = to_new.length() - r_eff;

    if d_old <= 0.0 {
        let normal = normalize_or(to_old, Vec3::Y);
        let pos = center_old + normal * r_eff;
        let vel = shape.surface_velocity(pos);
        data.add_cc(0.0, normal, pos, vel, ctx.tag);
        return;
    }
    if d_new < 0.0 {
        // Crossing within the step; the distance function is close to
        // linear over one motion segment.
        let t = d_old / (d_old - d_new);
        let impact = data.old_pos + (data.new_pos - data.old_pos) * t;
        let center_t = center_old + (center_new - center_old) * t;
        let normal = normalize_or(impact - center_t, Vec3::Y);
        let pos = center_t + normal * r_eff;
        let vel = shape.surface_velocity(pos);
        data.add_cc(t, normal, pos, vel, ctx.tag);
        return;
    }

    let normal = normalize_or(to_new, Vec3::Y);
    if d_new <= ctx.contact_band {
        let pos = center_new + normal * r_eff;
        let vel = shape.surface_velocity(pos);
        data.add_dc(normal, pos, vel, ctx.tag);
        seed_tangent_constraint(data, normal, center_new, r_eff, d_new, vel, ctx);
    } else if d_new <= ctx.prox_band {
        let vel = shape.surface_velocity(data.new_pos);
        seed_tangent_constraint(data, normal, center_new, r_eff, d_new, vel, ctx);
    }
}

fn seed_tangent_constraint(
    data: &mut ParticleCollData,
    normal: Vec3,
    center: Vec3,
    r_eff: f32,
    dist: f32,
    velocity: Vec3,
    ctx: &ShapeCtx,
) {
    let point = center + normal * r_eff;
    let constraint = Constraint {
        plane: Plane::new(normal, -normal.dot(point)),
        velocity,
    };
    data.add_constraint(constraint, dist, ctx.tag.dynamic);
}

#[inline]
fn closest_on_segment(a: Vec3, b: Vec3, p: Vec3) -> Vec3 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= 0.0 {
        return a;
    }
    let t = (ab.dot(p - a) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}
