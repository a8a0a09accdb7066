use glam::Vec3;

/// Axis-aligned bounding box with an explicit empty state
/// (min > max per component).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    #[inline]
    pub fn from_points(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    #[inline]
    pub fn center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline]
    pub fn include_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn include(&mut self, other: &Aabb) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    /// Grow by `margin` on all sides. Only meaningful for non-empty boxes.
    #[inline]
    pub fn fatten(&mut self, margin: f32) {
        self.min -= Vec3::splat(margin);
        self.max += Vec3::splat(margin);
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }

    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }
}

/// Plane as unit normal plus signed offset: `x` is on the plane when
/// `n.dot(x) + d == 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    #[inline]
    pub fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    #[inline]
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        Self {
            normal,
            d: -normal.dot(point),
        }
    }

    /// Signed distance, positive on the normal side.
    #[inline]
    pub fn distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }
}

/// Smallest power of two >= `v`, with `next_power_of_two(0) == 1`.
#[inline]
pub fn next_power_of_two(v: u32) -> u32 {
    v.max(1).next_power_of_two()
}

/// Safe normalize: falls back to `fallback` for near-zero input instead of
/// producing NaN.
#[inline]
pub fn normalize_or(v: Vec3, fallback: Vec3) -> Vec3 {
    let len_sq = v.length_squared();
    if len_sq > 1e-12 {
        v / len_sq.sqrt()
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aabb_ignores_intersection() {
        let a = Aabb::EMPTY;
        let b = Aabb::from_points(Vec3::ZERO, Vec3::ONE);
        assert!(a.is_empty());
        assert!(!a.intersects(&b), "empty box must not intersect anything");
    }

    #[test]
    fn include_point_grows_box() {
        let mut a = Aabb::EMPTY;
        a.include_point(Vec3::new(1.0, 2.0, 3.0));
        a.include_point(Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(a.min, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(a.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn default_plane_is_inert() {
        // Unused constraint slots hold a default plane; a zero normal
        // keeps every distance query at zero.
        let p = Plane::default();
        assert_eq!(p.normal, Vec3::ZERO);
        assert_eq!(p.distance(Vec3::splat(7.0)), 0.0);
    }

    #[test]
    fn plane_distance_sign() {
        let p = Plane::new(Vec3::Y, 0.0);
        assert!(p.distance(Vec3::new(0.0, 1.0, 0.0)) > 0.0);
        assert!(p.distance(Vec3::new(0.0, -1.0, 0.0)) < 0.0);
    }

    #[test]
    fn next_pow2_edge_cases() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(512), 512);
    }
}
