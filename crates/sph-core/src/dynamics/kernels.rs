//! SPH pair kernels.
//!
//! Interactions arrive as index-pair streams (positions into the ordered
//! particle stream). Each sink evaluates a stream either pairwise or four
//! pairs at a time; short streams are not worth the gather, so the batched
//! path kicks in at [`BATCH_THRESHOLD`]. Both paths perform the identical
//! arithmetic per pair, in stream order, so their sums match bit for bit.
//!
//! All math runs in standard units: positions and velocities are
//! pre-scaled so the rest spacing is `1 / REST_PARTICLES_PER_UNIT_STD`.

use glam::{Vec3, Vec4};

use crate::config::{DynamicsParameters, BATCH_THRESHOLD};

/// Kernel coefficients folded with particle mass and material constants.
#[derive(Clone, Copy, Debug)]
pub struct SphKernel {
    pub radius_std: f32,
    pub radius_sq_std: f32,
    /// poly6 coefficient times particle mass.
    pub density_mul: f32,
    /// Half the spiky gradient coefficient times mass and stiffness, for
    /// the symmetrized pressure sum.
    pub pressure_mul: f32,
    /// Viscosity laplacian coefficient times mass and viscosity.
    pub viscosity_mul: f32,
    /// Rest density; each particle's pressure clamps at zero below it.
    pub rest_density: f32,
}

impl SphKernel {
    pub fn new(params: &DynamicsParameters) -> Self {
        Self {
            radius_std: params.radius_std,
            radius_sq_std: params.radius_sq_std,
            density_mul: params.density_multiplier_std,
            pressure_mul: params.stiff_mul_pressure_multiplier_std,
            viscosity_mul: params.viscosity_multiplier_std,
            rest_density: params.rest_density,
        }
    }

    /// poly6 contribution of a pair at squared distance `r2 < h^2`.
    #[inline]
    pub fn density_term(&self, r2: f32) -> f32 {
        let d = self.radius_sq_std - r2;
        self.density_mul * d * d * d
    }
}

/// A flushable pair stream consumer. One sink per pass; the packet
/// traversal is shared.
pub trait PairSink {
    /// Evaluate a stream of interacting pairs. `two_way` means both
    /// stream positions belong to this task and both receive the
    /// contribution; one-way streams only write the first position.
    fn flush(&mut self, pairs: &[[u32; 2]], two_way: bool);
}

/// Density pass: accumulates poly6 terms into a lane-local slice indexed
/// relative to `lane_first`.
pub struct DensitySink<'a> {
    pub kernel: SphKernel,
    pub pos: &'a [Vec3],
    pub lane_first: u32,
    pub out: &'a mut [f32],
}

impl PairSink for DensitySink<'_> {
    fn flush(&mut self, pairs: &[[u32; 2]], two_way: bool) {
        if pairs.len() >= BATCH_THRESHOLD {
            self.flush_batched(pairs, two_way);
        } else {
            for &pair in pairs {
                self.pair_scalar(pair, two_way);
            }
        }
    }
}

impl DensitySink<'_> {
    #[inline]
    fn pair_scalar(&mut self, [a, b]: [u32; 2], two_way: bool) {
        let diff = self.pos[a as usize] - self.pos[b as usize];
        let w = self.kernel.density_term(diff.length_squared());
        self.out[(a - self.lane_first) as usize] += w;
        if two_way {
            self.out[(b - self.lane_first) as usize] += w;
        }
    }

    fn flush_batched(&mut self, pairs: &[[u32; 2]], two_way: bool) {
        let mut chunks = pairs.chunks_exact(4);
        for chunk in &mut chunks {
            let mut dx = [0.0f32; 4];
            let mut dy = [0.0f32; 4];
            let mut dz = [0.0f32; 4];
            for (lane, &[a, b]) in chunk.iter().enumerate() {
                let diff = self.pos[a as usize] - self.pos[b as usize];
                dx[lane] = diff.x;
                dy[lane] = diff.y;
                dz[lane] = diff.z;
            }
            let (dx, dy, dz) = (
                Vec4::from_array(dx),
                Vec4::from_array(dy),
                Vec4::from_array(dz),
            );
            let r2 = dx * dx + dy * dy + dz * dz;
            let d = Vec4::splat(self.kernel.radius_sq_std) - r2;
            let w = Vec4::splat(self.kernel.density_mul) * d * d * d;
            let w = w.to_array();
            for (lane, &[a, b]) in chunk.iter().enumerate() {
                self.out[(a - self.lane_first) as usize] += w[lane];
                if two_way {
                    self.out[(b - self.lane_first) as usize] += w[lane];
                }
            }
        }
        for &pair in chunks.remainder() {
            self.pair_scalar(pair, two_way);
        }
    }
}

/// Force pass: pressure plus viscosity into a lane-local acceleration
/// slice. Densities are the raw values of the preceding density pass,
/// indexed by stream position.
pub struct ForceSink<'a> {
    pub kernel: SphKernel,
    pub pos: &'a [Vec3],
    pub vel: &'a [Vec3],
    pub density: &'a [f32],
    pub lane_first: u32,
    pub out: &'a mut [Vec3],
}

/// Squared-distance floor below which a pair has no usable direction.
const MIN_PAIR_DIST_SQ: f32 = 1.0e-12;

impl PairSink for ForceSink<'_> {
    fn flush(&mut self, pairs: &[[u32; 2]], two_way: bool) {
        if pairs.len() >= BATCH_THRESHOLD {
            self.flush_batched(pairs, two_way);
        } else {
            for &pair in pairs {
                let diff = self.pos[pair[0] as usize] - self.pos[pair[1] as usize];
                let r2 = diff.length_squared();
                self.pair_resolve(pair, diff, r2, two_way);
            }
        }
    }
}

impl ForceSink<'_> {
    /// Apply one pair given its separation. `diff` points from b to a.
    #[inline]
    fn pair_resolve(&mut self, [a, b]: [u32; 2], diff: Vec3, r2: f32, two_way: bool) {
        if r2 < MIN_PAIR_DIST_SQ {
            return;
        }
        let r = r2.sqrt();
        let hr = self.kernel.radius_std - r;
        let rho_a = self.density[a as usize];
        let rho_b = self.density[b as usize];

        // Pair pressure never pulls: each side's excess over rest density
        // clamps at zero before the sum.
        let rho0 = self.kernel.rest_density;
        let pressure =
            self.kernel.pressure_mul * hr * hr * ((rho_a - rho0).max(0.0) + (rho_b - rho0).max(0.0));
        let dir = diff * (1.0 / r);
        let visc = self.kernel.viscosity_mul * hr;
        let dv = self.vel[b as usize] - self.vel[a as usize];

        self.out[(a - self.lane_first) as usize] += (dir * pressure + dv * visc) * (1.0 / rho_b);
        if two_way {
            self.out[(b - self.lane_first) as usize] -= (dir * pressure + dv * visc) * (1.0 / rho_a);
        }
    }

    fn flush_batched(&mut self, pairs: &[[u32; 2]], two_way: bool) {
        let mut chunks = pairs.chunks_exact(4);
        for chunk in &mut chunks {
            let mut dx = [0.0f32; 4];
            let mut dy = [0.0f32; 4];
            let mut dz = [0.0f32; 4];
            for (lane, &[a, b]) in chunk.iter().enumerate() {
                let diff = self.pos[a as usize] - self.pos[b as usize];
                dx[lane] = diff.x;
                dy[lane] = diff.y;
                dz[lane] = diff.z;
            }
            let (vx, vy, vz) = (
                Vec4::from_array(dx),
                Vec4::from_array(dy),
                Vec4::from_array(dz),
            );
            let r2 = (vx * vx + vy * vy + vz * vz).to_array();
            for (lane, &pair) in chunk.iter().enumerate() {
                let diff = Vec3::new(dx[lane], dy[lane], dz[lane]);
                self.pair_resolve(pair, diff, r2[lane], two_way);
            }
        }
        for &pair in chunks.remainder() {
            let diff = self.pos[pair[0] as usize] - self.pos[pair[1] as usize];
            let r2 = diff.length_squared();
            self.pair_resolve(pair, diff, r2, two_way);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticleSystemConfig;

    fn test_kernel() -> SphKernel {
        SphKernel::new(&DynamicsParameters::derive(&ParticleSystemConfig::default()))
    }

    fn grid_positions(n: usize, spacing: f32) -> Vec<Vec3> {
        (0..n)
            .map(|i| {
                Vec3::new(
                    (i % 4) as f32 * spacing,
                    ((i / 4) % 4) as f32 * spacing,
                    (i / 16) as f32 * spacing * 1.3,
                )
            })
            .collect()
    }

    fn all_pairs(kernel: &SphKernel, pos: &[Vec3]) -> Vec<[u32; 2]> {
        let mut pairs = Vec::new();
        for a in 0..pos.len() {
            for b in a + 1..pos.len() {
                if (pos[a] - pos[b]).length_squared() < kernel.radius_sq_std {
                    pairs.push([a as u32, b as u32]);
                }
            }
        }
        pairs
    }

    #[test]
    fn batched_density_matches_scalar() {
        let kernel = test_kernel();
        let pos = grid_positions(24, 0.1);
        let pairs = all_pairs(&kernel, &pos);
        assert!(pairs.len() >= BATCH_THRESHOLD, "test wants a batched stream");

        let mut scalar = vec![0.0f32; pos.len()];
        let mut batched = vec![0.0f32; pos.len()];
        let mut sink = DensitySink {
            kernel,
            pos: &pos,
            lane_first: 0,
            out: &mut scalar,
        };
        for &pair in &pairs {
            sink.pair_scalar(pair, true);
        }
        let mut sink = DensitySink {
            kernel,
            pos: &pos,
            lane_first: 0,
            out: &mut batched,
        };
        sink.flush(&pairs, true);

        assert_eq!(scalar, batched, "batched path must reproduce scalar sums");
    }

    #[test]
    fn batched_force_matches_scalar() {
        let kernel = test_kernel();
        let pos = grid_positions(24, 0.1);
        let vel: Vec<Vec3> = pos.iter().map(|p| Vec3::new(p.y, -p.x, 0.1)).collect();
        let density = vec![kernel.rest_density * 1.2; pos.len()];
        let pairs = all_pairs(&kernel, &pos);

        let run = |batched: bool| -> Vec<Vec3> {
            let mut out = vec![Vec3::ZERO; pos.len()];
            let mut sink = ForceSink {
                kernel,
                pos: &pos,
                vel: &vel,
                density: &density,
                lane_first: 0,
                out: &mut out,
            };
            if batched {
                sink.flush(&pairs, true);
            } else {
                for &pair in &pairs {
                    let diff = pos[pair[0] as usize] - pos[pair[1] as usize];
                    sink.pair_resolve(pair, diff, diff.length_squared(), true);
                }
            }
            out
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn compressed_pair_repels() {
        let kernel = test_kernel();
        let pos = vec![Vec3::ZERO, Vec3::new(0.05, 0.0, 0.0)];
        let vel = vec![Vec3::ZERO; 2];
        // Well above rest density, so pair pressure is positive.
        let density = vec![kernel.rest_density * 2.0; 2];
        let mut out = vec![Vec3::ZERO; 2];
        let mut sink = ForceSink {
            kernel,
            pos: &pos,
            vel: &vel,
            density: &density,
            lane_first: 0,
            out: &mut out,
        };
        sink.flush(&[[0, 1]], true);
        assert!(out[0].x < 0.0, "particle a pushed away from b");
        assert!(out[1].x > 0.0, "particle b pushed away from a");
    }

    #[test]
    fn below_rest_density_pair_has_no_pressure_force() {
        let kernel = test_kernel();
        // A resting pair at the rest spacing with both densities under
        // rest must not attract.
        let pos = vec![Vec3::ZERO, Vec3::new(0.1, 0.0, 0.0)];
        let vel = vec![Vec3::ZERO; 2];
        let density = vec![kernel.rest_density * 0.8; 2];
        let mut out = vec![Vec3::ZERO; 2];
        let mut sink = ForceSink {
            kernel,
            pos: &pos,
            vel: &vel,
            density: &density,
            lane_first: 0,
            out: &mut out,
        };
        sink.flush(&[[0, 1]], true);
        assert_eq!(out[0], Vec3::ZERO, "pressure must clamp at rest density");
        assert_eq!(out[1], Vec3::ZERO);
    }
}
