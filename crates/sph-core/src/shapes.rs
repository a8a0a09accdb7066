//! Collision shape snapshots.
//!
//! The simulation does not talk to a scene graph. Before a step the caller
//! snapshots every shape that may touch the particle volume into a
//! [`ShapeStore`]: geometry, the transform at the start and end of the
//! step, and rigid-body velocities for dynamic shapes. Collision then runs
//! against this immutable snapshot.

use glam::{Affine3A, Vec3};

use crate::config::bitflags_like;
use crate::math::{Aabb, Plane};

bitflags_like! {
    /// Per-shape behavior bits.
    pub struct ShapeFlags: u32 {
        /// Shape belongs to a moving rigid body; contacts pick up its
        /// surface velocity and may report two-way impulses.
        const DYNAMIC = 1 << 0;
        /// Particles that touch this shape are deleted after the step.
        const DRAIN = 1 << 1;
    }
}

/// Stable identifier the caller uses to correlate two-way impulses and
/// cache invalidation with its own rigid bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeHandle(pub u32);

#[derive(Clone, Debug)]
pub enum ShapeGeometry {
    /// Half space. The plane is `y = 0` in local space, normal `+y`.
    Plane,
    Sphere {
        radius: f32,
    },
    /// Segment along the local x axis, from `-half_height` to `+half_height`.
    Capsule {
        radius: f32,
        half_height: f32,
    },
    Box {
        half_extents: Vec3,
    },
    /// Convex volume given by its bounding planes in local space, normals
    /// pointing outward.
    Convex {
        planes: Vec<Plane>,
    },
    TriangleMesh(TriangleMesh),
    Heightfield(Heightfield),
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub handle: ShapeHandle,
    pub geometry: ShapeGeometry,
    /// Transform at the end of the step; collision resolves against this.
    pub transform: Affine3A,
    /// Transform at the start of the step, for continuous tests against
    /// moving shapes.
    pub prev_transform: Affine3A,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub flags: ShapeFlags,
    /// World bounds of the swept shape, grown by the collision range.
    pub bounds: Aabb,
}

impl Shape {
    pub fn is_dynamic(&self) -> bool {
        self.flags.contains(ShapeFlags::DYNAMIC)
    }

    /// Velocity of the shape surface at a world point.
    pub fn surface_velocity(&self, point: Vec3) -> Vec3 {
        if self.is_dynamic() {
            let center = Vec3::from(self.transform.translation);
            self.linear_velocity + self.angular_velocity.cross(point - center)
        } else {
            Vec3::ZERO
        }
    }
}

#[derive(Default)]
pub struct ShapeStore {
    shapes: Vec<Shape>,
}

impl ShapeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.shapes.clear();
    }

    /// Snapshot a shape for the coming step. `bounds` should cover the
    /// shape over the whole step, inflated by the collision range.
    pub fn push(&mut self, mut shape: Shape) {
        if shape.bounds.is_empty() {
            shape.bounds = shape_world_bounds(&shape);
        }
        self.shapes.push(shape);
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// Conservative world bounds of a shape over the step, both transforms
/// included.
fn shape_world_bounds(shape: &Shape) -> Aabb {
    let local = local_bounds(&shape.geometry);
    let mut bounds = transformed_aabb(&local, &shape.transform);
    if shape.is_dynamic() {
        bounds.include(&transformed_aabb(&local, &shape.prev_transform));
    }
    bounds
}

fn local_bounds(geometry: &ShapeGeometry) -> Aabb {
    match geometry {
        // A half space is unbounded; callers cull planes explicitly.
        ShapeGeometry::Plane => Aabb {
            min: Vec3::splat(f32::MIN / 4.0),
            max: Vec3::splat(f32::MAX / 4.0),
        },
        ShapeGeometry::Sphere { radius } => Aabb {
            min: Vec3::splat(-radius),
            max: Vec3::splat(*radius),
        },
        ShapeGeometry::Capsule {
            radius,
            half_height,
        } => Aabb {
            min: Vec3::new(-half_height - radius, -radius, -radius),
            max: Vec3::new(half_height + radius, *radius, *radius),
        },
        ShapeGeometry::Box { half_extents } => Aabb {
            min: -*half_extents,
            max: *half_extents,
        },
        ShapeGeometry::Convex { planes } => convex_local_bounds(planes),
        ShapeGeometry::TriangleMesh(mesh) => mesh.bounds,
        ShapeGeometry::Heightfield(hf) => hf.local_bounds(),
    }
}

/// Bounds of a plane-bounded convex volume. Planes do not carry vertices,
/// so this walks the plane set and keeps the tightest axis slabs it can
/// prove; axis-aligned plane pairs give exact slabs, anything else falls
/// back to a large box.
fn convex_local_bounds(planes: &[Plane]) -> Aabb {
    let mut bounds = Aabb {
        min: Vec3::splat(f32::MIN / 4.0),
        max: Vec3::splat(f32::MAX / 4.0),
    };
    for plane in planes {
        let n = plane.normal;
        for axis in 0..3 {
            let a = n[axis];
            if (a.abs() - 1.0).abs() < 1.0e-4 {
                // normal ~ +axis bounds max, ~ -axis bounds min
                let limit = -plane.d * a.signum();
                if a > 0.0 {
                    bounds.max[axis] = bounds.max[axis].min(limit);
                } else {
                    bounds.min[axis] = bounds.min[axis].max(limit);
                }
            }
        }
    }
    bounds
}

fn transformed_aabb(local: &Aabb, transform: &Affine3A) -> Aabb {
    let center = local.center();
    let extents = local.extents();
    let new_center = transform.transform_point3(center);
    let m = transform.matrix3;
    let new_extents = Vec3::new(
        m.x_axis.x.abs() * extents.x + m.y_axis.x.abs() * extents.y + m.z_axis.x.abs() * extents.z,
        m.x_axis.y.abs() * extents.x + m.y_axis.y.abs() * extents.y + m.z_axis.y.abs() * extents.z,
        m.x_axis.z.abs() * extents.x + m.y_axis.z.abs() * extents.y + m.z_axis.z.abs() * extents.z,
    );
    Aabb {
        min: new_center - new_extents,
        max: new_center + new_extents,
    }
}

/// Indexed triangle mesh with a flat median-split BVH for local-space
/// box queries.
#[derive(Clone, Debug)]
pub struct TriangleMesh {
    vertices: Vec<Vec3>,
    indices: Vec<[u32; 3]>,
    nodes: Vec<BvhNode>,
    /// Triangle ids, permuted so each leaf covers a contiguous run.
    order: Vec<u32>,
    bounds: Aabb,
}

#[derive(Clone, Debug)]
struct BvhNode {
    bounds: Aabb,
    /// Leaf when count > 0, internal otherwise; `first` is a triangle
    /// offset into `order` for leaves and the left child index for
    /// internal nodes (right child is `first + 1`).
    first: u32,
    count: u32,
}

const BVH_LEAF_SIZE: usize = 4;

impl TriangleMesh {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<[u32; 3]>) -> Self {
        let mut order: Vec<u32> = (0..indices.len() as u32).collect();
        let centroids: Vec<Vec3> = indices
            .iter()
            .map(|tri| {
                (vertices[tri[0] as usize]
                    + vertices[tri[1] as usize]
                    + vertices[tri[2] as usize])
                    / 3.0
            })
            .collect();
        let tri_bounds: Vec<Aabb> = indices
            .iter()
            .map(|tri| {
                let mut b = Aabb::EMPTY;
                b.include_point(vertices[tri[0] as usize]);
                b.include_point(vertices[tri[1] as usize]);
                b.include_point(vertices[tri[2] as usize]);
                b
            })
            .collect();

        let mut nodes = Vec::new();
        if !indices.is_empty() {
            build_bvh(&mut nodes, &mut order, &centroids, &tri_bounds, 0, indices.len());
        }
        let bounds = nodes.first().map(|n| n.bounds).unwrap_or(Aabb::EMPTY);
        Self {
            vertices,
            indices,
            nodes,
            order,
            bounds,
        }
    }

    pub fn num_triangles(&self) -> usize {
        self.indices.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn triangle(&self, id: u32) -> [Vec3; 3] {
        let tri = self.indices[id as usize];
        [
            self.vertices[tri[0] as usize],
            self.vertices[tri[1] as usize],
            self.vertices[tri[2] as usize],
        ]
    }

    /// Collect the ids of all triangles whose bounds overlap `query`.
    pub fn overlap(&self, query: &Aabb, out: &mut Vec<u32>) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![0usize];
        while let Some(node_id) = stack.pop() {
            let node = &self.nodes[node_id];
            if !node.bounds.intersects(query) {
                continue;
            }
            if node.count > 0 {
                let first = node.first as usize;
                for &tri in &self.order[first..first + node.count as usize] {
                    out.push(tri);
                }
            } else {
                stack.push(node.first as usize);
                stack.push(node.first as usize + 1);
            }
        }
    }
}

fn build_bvh(
    nodes: &mut Vec<BvhNode>,
    order: &mut [u32],
    centroids: &[Vec3],
    tri_bounds: &[Aabb],
    first: usize,
    count: usize,
) -> usize {
    let mut bounds = Aabb::EMPTY;
    for &tri in &order[first..first + count] {
        bounds.include(&tri_bounds[tri as usize]);
    }
    let node_id = nodes.len();
    nodes.push(BvhNode {
        bounds,
        first: first as u32,
        count: count as u32,
    });
    if count <= BVH_LEAF_SIZE {
        return node_id;
    }

    let mut centroid_bounds = Aabb::EMPTY;
    for &tri in &order[first..first + count] {
        centroid_bounds.include_point(centroids[tri as usize]);
    }
    let extents = centroid_bounds.extents();
    let axis = if extents.x >= extents.y && extents.x >= extents.z {
        0
    } else if extents.y >= extents.z {
        1
    } else {
        2
    };
    if extents[axis] <= 0.0 {
        return node_id;
    }

    let slice = &mut order[first..first + count];
    slice.sort_unstable_by(|&a, &b| {
        centroids[a as usize][axis].total_cmp(&centroids[b as usize][axis])
    });
    let half = count / 2;

    let left = build_bvh(nodes, order, centroids, tri_bounds, first, half);
    build_bvh(nodes, order, centroids, tri_bounds, first + half, count - half);
    nodes[node_id].first = left as u32;
    nodes[node_id].count = 0;
    node_id
}

/// Uniform-grid heightfield in local space. Sample `(row, col)` sits at
/// `(row * row_scale, samples[row * num_cols + col] * height_scale,
/// col * col_scale)`; every cell splits into two triangles.
#[derive(Clone, Debug)]
pub struct Heightfield {
    pub num_rows: u32,
    pub num_cols: u32,
    pub row_scale: f32,
    pub col_scale: f32,
    pub height_scale: f32,
    pub samples: Vec<f32>,
}

impl Heightfield {
    pub fn local_bounds(&self) -> Aabb {
        let mut min_h = f32::MAX;
        let mut max_h = f32::MIN;
        for &s in &self.samples {
            min_h = min_h.min(s);
            max_h = max_h.max(s);
        }
        if self.samples.is_empty() {
            min_h = 0.0;
            max_h = 0.0;
        }
        Aabb {
            min: Vec3::new(0.0, min_h * self.height_scale, 0.0),
            max: Vec3::new(
                (self.num_rows.max(1) - 1) as f32 * self.row_scale,
                max_h * self.height_scale,
                (self.num_cols.max(1) - 1) as f32 * self.col_scale,
            ),
        }
    }

    fn vertex(&self, row: u32, col: u32) -> Vec3 {
        Vec3::new(
            row as f32 * self.row_scale,
            self.samples[(row * self.num_cols + col) as usize] * self.height_scale,
            col as f32 * self.col_scale,
        )
    }

    /// Visit the triangles of every cell overlapped by `query`.
    pub fn overlap(&self, query: &Aabb, mut visit: impl FnMut([Vec3; 3])) {
        if self.num_rows < 2 || self.num_cols < 2 {
            return;
        }
        let row0 = ((query.min.x / self.row_scale).floor() as i32).clamp(0, self.num_rows as i32 - 2);
        let row1 = ((query.max.x / self.row_scale).ceil() as i32).clamp(0, self.num_rows as i32 - 2);
        let col0 = ((query.min.z / self.col_scale).floor() as i32).clamp(0, self.num_cols as i32 - 2);
        let col1 = ((query.max.z / self.col_scale).ceil() as i32).clamp(0, self.num_cols as i32 - 2);
        for row in row0..=row1 {
            for col in col0..=col1 {
                let (row, col) = (row as u32, col as u32);
                let v00 = self.vertex(row, col);
                let v01 = self.vertex(row, col + 1);
                let v10 = self.vertex(row + 1, col);
                let v11 = self.vertex(row + 1, col + 1);
                visit([v00, v11, v01]);
                visit([v00, v10, v11]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_mesh() -> TriangleMesh {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, 1.0),
        ];
        TriangleMesh::new(vertices, vec![[0, 1, 2], [0, 2, 3]])
    }

    #[test]
    fn mesh_overlap_finds_covering_triangles() {
        let mesh = quad_mesh();
        let mut hits = Vec::new();
        mesh.overlap(
            &Aabb {
                min: Vec3::new(0.7, -0.1, 0.1),
                max: Vec3::new(0.9, 0.1, 0.3),
            },
            &mut hits,
        );
        assert!(hits.contains(&0), "query over the lower triangle must hit it");
    }

    #[test]
    fn mesh_overlap_misses_far_query() {
        let mesh = quad_mesh();
        let mut hits = Vec::new();
        mesh.overlap(
            &Aabb {
                min: Vec3::new(5.0, 5.0, 5.0),
                max: Vec3::new(6.0, 6.0, 6.0),
            },
            &mut hits,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn bvh_covers_every_triangle_exactly_once() {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for it in 0..33u32 {
            let base = vertices.len() as u32;
            let x = it as f32 * 0.3;
            vertices.push(Vec3::new(x, 0.0, 0.0));
            vertices.push(Vec3::new(x + 0.2, 0.0, 0.0));
            vertices.push(Vec3::new(x, 0.2, 0.0));
            indices.push([base, base + 1, base + 2]);
        }
        let mesh = TriangleMesh::new(vertices, indices);
        let mut hits = Vec::new();
        mesh.overlap(&mesh.bounds(), &mut hits);
        hits.sort_unstable();
        let expected: Vec<u32> = (0..33).collect();
        assert_eq!(hits, expected);
    }

    #[test]
    fn dynamic_shape_bounds_cover_both_transforms() {
        let mut store = ShapeStore::new();
        store.push(Shape {
            handle: ShapeHandle(0),
            geometry: ShapeGeometry::Sphere { radius: 1.0 },
            transform: Affine3A::from_translation(Vec3::new(4.0, 0.0, 0.0)),
            prev_transform: Affine3A::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            flags: ShapeFlags::DYNAMIC,
            bounds: Aabb::EMPTY,
        });
        let bounds = store.shapes()[0].bounds;
        assert!(bounds.min.x <= -1.0 && bounds.max.x >= 5.0);
    }

    #[test]
    fn heightfield_triangles_cover_cell() {
        let hf = Heightfield {
            num_rows: 2,
            num_cols: 2,
            row_scale: 1.0,
            col_scale: 1.0,
            height_scale: 1.0,
            samples: vec![0.0, 0.0, 0.0, 0.0],
        };
        let mut tris = 0;
        hf.overlap(
            &Aabb {
                min: Vec3::new(0.2, -1.0, 0.2),
                max: Vec3::new(0.8, 1.0, 0.8),
            },
            |_| tris += 1,
        );
        assert_eq!(tris, 2);
    }
}
