//! Triangle mesh and heightfield collision.
//!
//! Meshes are queried in shape-local space, but the triangle test itself
//! runs on world-space vertices so contacts land directly in the particle
//! record. Static meshes go through the per-particle triangle cache when
//! the system enables it; heightfield triangles are generated per cell and
//! never cached.

use glam::Vec3;

use crate::math::Aabb;
use crate::shapes::{Heightfield, Shape, TriangleMesh};

use super::cache::{CacheQuantizer, TriangleCache};
use super::data::{Constraint, ParticleCollData};
use super::shapes::ShapeCtx;
use crate::math::Plane;
use crate::particles::CacheState;

/// Barycentric slack for the continuous impact-point test; impacts this
/// close to an edge still count so adjacent triangles hand over cleanly.
const BARY_EPSILON: f32 = 1.0e-4;
/// Triangles with smaller squared cross products are degenerate.
const DEGENERATE_TRI_EPS: f32 = 1.0e-12;

/// Test the particle motion against one world-space triangle.
pub fn collide_with_mesh_triangle(data: &mut ParticleCollData, v: [Vec3; 3], shape: &Shape, ctx: &ShapeCtx) {
    let e0 = v[1] - v[0];
    let e1 = v[2] - v[0];
    let cross = e0.cross(e1);
    let cross_sq = cross.length_squared();
    if cross_sq < DEGENERATE_TRI_EPS {
        return;
    }
    let n = cross / cross_sq.sqrt();

    let coll_radius = ctx.surface_offset + ctx.contact_band;
    let prox_radius = ctx.surface_offset + ctx.prox_band;

    let closest = closest_point_on_triangle(data.new_pos, v);
    let offset = data.new_pos - closest;
    let dist_sq = offset.length_squared();
    let in_front = offset.dot(n) > 0.0;

    if dist_sq < coll_radius * coll_radius {
        let normal = if dist_sq > DEGENERATE_TRI_EPS {
            offset / dist_sq.sqrt()
        } else if in_front {
            n
        } else {
            -n
        };
        let pos = closest + normal * ctx.surface_offset;
        let vel = shape.surface_velocity(pos);
        data.add_dc(normal, pos, vel, ctx.tag);
        return;
    }

    if in_front && dist_sq < prox_radius * prox_radius {
        let plane = Plane::new(n, -n.dot(v[0]) - ctx.surface_offset);
        let vel = shape.surface_velocity(data.new_pos);
        data.add_constraint(
            Constraint {
                plane,
                velocity: vel,
            },
            dist_sq.sqrt() - ctx.surface_offset,
            ctx.tag.dynamic,
        );
        return;
    }

    // Continuous test: the motion may tunnel through the face.
    let motion = data.new_pos - data.old_pos;
    let height = n.dot(data.old_pos - v[0]);
    let facing = if height >= 0.0 { n } else { -n };
    let p_dist = height.abs() - ctx.surface_offset;
    let approach = -facing.dot(motion);
    if p_dist < 0.0 || approach <= 0.0 || approach < p_dist {
        return;
    }
    let t = p_dist / approach;
    if t >= data.cc_time {
        return;
    }
    let impact = data.old_pos + motion * t;
    let on_surface = impact - facing * ctx.surface_offset;
    if !barycentric_inside(on_surface, v, BARY_EPSILON) {
        return;
    }
    let vel = shape.surface_velocity(impact);
    data.add_cc(t, facing, impact, vel, ctx.tag);
}

/// Mesh collision with the optional per-particle triangle cache. When the
/// cached region still covers this step's query the triangle list is
/// reused; otherwise the mesh is queried over a prediction of the next few
/// steps and the result re-cached.
pub fn collide_with_mesh(
    data: &mut ParticleCollData,
    shape: &Shape,
    mesh: &TriangleMesh,
    mut cache: Option<(&mut TriangleCache, &CacheQuantizer)>,
    ctx: &ShapeCtx,
    scratch: &mut Vec<u32>,
) {
    let inv = shape.transform.inverse();
    let local_old = inv.transform_point3(data.old_pos);
    let local_new = inv.transform_point3(data.new_pos);
    let prox_radius = ctx.surface_offset + ctx.prox_band;

    let mut query = Aabb::EMPTY;
    query.include_point(local_old);
    query.include_point(local_new);
    query.fatten(prox_radius);

    scratch.clear();
    let hit = match &mut cache {
        Some((cache, quantizer)) if cache.covers(&query, quantizer) => {
            cache.gather(scratch);
            cache.state = CacheState::Fresh;
            true
        }
        _ => false,
    };
    if !hit {
        let predicted = predicted_bounds(local_old, local_new, prox_radius);
        mesh.overlap(&predicted, scratch);
        if let Some((cache, quantizer)) = &mut cache {
            cache.pack(scratch, &predicted, mesh.num_triangles(), quantizer);
        }
    }

    for &tri in scratch.iter() {
        let local = mesh.triangle(tri);
        let world = local.map(|p| shape.transform.transform_point3(p));
        collide_with_mesh_triangle(data, world, shape, ctx);
    }
}

/// Cache region: the current motion extrapolated three steps ahead,
/// fattened by half again the proximity radius.
fn predicted_bounds(old_pos: Vec3, new_pos: Vec3, prox_radius: f32) -> Aabb {
    let mut bounds = Aabb::EMPTY;
    bounds.include_point(old_pos);
    bounds.include_point(new_pos);
    bounds.include_point(new_pos + (new_pos - old_pos) * 3.0);
    bounds.fatten(1.5 * prox_radius);
    bounds
}

pub fn collide_with_heightfield(
    data: &mut ParticleCollData,
    shape: &Shape,
    hf: &Heightfield,
    ctx: &ShapeCtx,
) {
    let inv = shape.transform.inverse();
    let local_old = inv.transform_point3(data.old_pos);
    let local_new = inv.transform_point3(data.new_pos);
    let prox_radius = ctx.surface_offset + ctx.prox_band;

    let mut query = Aabb::EMPTY;
    query.include_point(local_old);
    query.include_point(local_new);
    query.fatten(prox_radius);

    hf.overlap(&query, |tri| {
        let world = tri.map(|p| shape.transform.transform_point3(p));
        collide_with_mesh_triangle(data, world, shape, ctx);
    });
}

/// Closest point on a triangle (vertex, edge or face region).
fn closest_point_on_triangle(p: Vec3, v: [Vec3; 3]) -> Vec3 {
    let [a, b, c] = v;
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        return a + ab * t;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        return a + ac * t;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * t;
    }

    let denom = 1.0 / (va + vb + vc);
    a + ab * (vb * denom) + ac * (vc * denom)
}

/// Barycentric inside test with slack, for points already on the triangle
/// plane.
fn barycentric_inside(p: Vec3, v: [Vec3; 3], eps: f32) -> bool {
    let e0 = v[1] - v[0];
    let e1 = v[2] - v[0];
    let d = p - v[0];
    let a = e0.dot(e0);
    let b = e0.dot(e1);
    let c = e1.dot(e1);
    let d0 = d.dot(e0);
    let d1 = d.dot(e1);
    let det = a * c - b * b;
    if det <= 0.0 {
        return false;
    }
    let u = (c * d0 - b * d1) / det;
    let w = (a * d1 - b * d0) / det;
    u >= -eps && w >= -eps && u + w <= 1.0 + eps
}
