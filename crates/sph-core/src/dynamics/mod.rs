//! SPH density and force passes.
//!
//! Runs over the packet stream produced by the spatial hash. Each pass is
//! a task-graph fan-out over packet groups followed by a merge
//! continuation: workers accumulate into lane-local scratch, the merge
//! scatters into the shared buffers. Pairs inside a packet are two-way;
//! pairs that cross a packet boundary are found through the neighbor halo
//! regions and evaluated one-way from each side, so tasks never write
//! another task's particles.

pub mod kernels;

use std::sync::Mutex;

use glam::Vec3;

use crate::config::{
    DynamicsParameters, BRUTE_FORCE_PARTICLE_THRESHOLD, MAX_INDEX_STREAM_SIZE, MAX_PARALLEL_TASKS,
    PACKET_HASH_SIZE,
};
use crate::hash::tables::{NUM_BOUNDARY_SECTIONS, NUM_HALO_REGIONS};
use crate::hash::{HaloRegion, LocalCellHash, SpatialHash};
use crate::particles::Particle;
use crate::task::TaskGraph;
use kernels::{DensitySink, ForceSink, PairSink, SphKernel};

/// Fine-cell neighbor offsets on the forward half space; iterating cells
/// with these visits every unordered cell pair exactly once.
const FORWARD_CELL_OFFSETS: [[i32; 3]; 13] = [
    [1, 0, 0],
    [-1, 1, 0],
    [0, 1, 0],
    [1, 1, 0],
    [-1, -1, 1],
    [0, -1, 1],
    [1, -1, 1],
    [-1, 0, 1],
    [0, 0, 1],
    [1, 0, 1],
    [-1, 1, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// One task's slice of the packet stream: a run of consecutive occupied
/// buckets and the stream range they cover.
pub(crate) struct Lane {
    pub(crate) buckets: Vec<usize>,
    pub(crate) first: u32,
    pub(crate) end: u32,
}

pub struct Sph {
    params: DynamicsParameters,
    kernel: SphKernel,
    /// Stream-ordered scratch, rebuilt every step.
    pos_std: Vec<Vec3>,
    vel_std: Vec<Vec3>,
    densities: Vec<f32>,
    forces_std: Vec<Vec3>,
}

impl Sph {
    pub fn new(params: DynamicsParameters) -> Self {
        Self {
            params,
            kernel: SphKernel::new(&params),
            pos_std: Vec::new(),
            vel_std: Vec::new(),
            densities: Vec::new(),
            forces_std: Vec::new(),
        }
    }

    pub fn set_params(&mut self, params: DynamicsParameters) {
        self.params = params;
        self.kernel = SphKernel::new(&params);
    }

    /// Run both SPH passes. `ordered` is the reordered index stream of the
    /// hash (overflow range excluded from SPH), `transient` receives the
    /// world-unit particle accelerations and is indexed by particle id.
    /// Particle densities are left normalized: 0 isolated, about 1 at rest
    /// density.
    pub fn update_sph(
        &mut self,
        hash: &SpatialHash,
        ordered: &[u32],
        particles: &mut [Particle],
        transient: &mut [Vec3],
    ) {
        let stream_len = hash.overflow_packet().first_particle as usize;
        transient.fill(Vec3::ZERO);
        if stream_len == 0 {
            return;
        }

        self.pos_std.clear();
        self.vel_std.clear();
        for &pi in &ordered[..stream_len] {
            let p = &particles[pi as usize];
            self.pos_std.push(p.position * self.params.scale_to_std);
            self.vel_std.push(p.velocity * self.params.scale_to_std);
        }
        self.densities.clear();
        self.densities.resize(stream_len, 0.0);
        self.forces_std.clear();
        self.forces_std.resize(stream_len, Vec3::ZERO);

        let lanes = split_lanes(hash, stream_len as u32);
        let kernel = self.kernel;
        let pos = &self.pos_std;
        let vel = &self.vel_std;

        // Density pass.
        {
            let scratch: Vec<Mutex<Vec<f32>>> = lanes
                .iter()
                .map(|lane| Mutex::new(vec![0.0f32; (lane.end - lane.first) as usize]))
                .collect();
            let merged = Mutex::new(&mut self.densities);
            let self_density = self.params.self_density;

            let mut graph = TaskGraph::new();
            let scratch_ref = &scratch;
            let lanes_ref = &lanes;
            let merge = graph.add_task(move || {
                let mut densities = merged.lock().expect("density merge poisoned");
                for (lane, cell) in lanes_ref.iter().zip(scratch_ref.iter()) {
                    let local = cell.lock().expect("density lane poisoned");
                    let first = lane.first as usize;
                    for (k, &d) in local.iter().enumerate() {
                        densities[first + k] = self_density + d;
                    }
                }
            });
            for (lane, cell) in lanes.iter().zip(scratch.iter()) {
                graph.spawn_with_continuation(
                    move || {
                        let mut out = cell.lock().expect("density lane poisoned");
                        let mut sink = DensitySink {
                            kernel,
                            pos,
                            lane_first: lane.first,
                            out: &mut out,
                        };
                        for &bucket in &lane.buckets {
                            packet_pairs(hash, bucket, pos, &kernel, &mut sink);
                        }
                    },
                    merge,
                );
            }
            graph.execute();
        }

        // Force pass, over the merged raw densities.
        {
            let density = &self.densities;
            let scratch: Vec<Mutex<Vec<Vec3>>> = lanes
                .iter()
                .map(|lane| Mutex::new(vec![Vec3::ZERO; (lane.end - lane.first) as usize]))
                .collect();
            let merged = Mutex::new(&mut self.forces_std);

            let mut graph = TaskGraph::new();
            let scratch_ref = &scratch;
            let lanes_ref = &lanes;
            let merge = graph.add_task(move || {
                let mut forces = merged.lock().expect("force merge poisoned");
                for (lane, cell) in lanes_ref.iter().zip(scratch_ref.iter()) {
                    let local = cell.lock().expect("force lane poisoned");
                    let first = lane.first as usize;
                    forces[first..first + local.len()].copy_from_slice(&local);
                }
            });
            for (lane, cell) in lanes.iter().zip(scratch.iter()) {
                graph.spawn_with_continuation(
                    move || {
                        let mut out = cell.lock().expect("force lane poisoned");
                        let mut sink = ForceSink {
                            kernel,
                            pos,
                            vel,
                            density,
                            lane_first: lane.first,
                            out: &mut out,
                        };
                        for &bucket in &lane.buckets {
                            packet_pairs(hash, bucket, pos, &kernel, &mut sink);
                        }
                    },
                    merge,
                );
            }
            graph.execute();
        }

        // Scatter: accelerations back to world units by particle id,
        // divided by the particle's own raw density; densities normalized
        // for readback.
        let norm = self.params.density_normalization_factor;
        let self_density = self.params.self_density;
        for (k, &pi) in ordered[..stream_len].iter().enumerate() {
            transient[pi as usize] =
                self.forces_std[k] * (self.params.scale_to_world / self.densities[k]);
            particles[pi as usize].density = (self.densities[k] - self_density) * norm;
        }
    }
}

/// Partition the occupied buckets into at most [`MAX_PARALLEL_TASKS`]
/// contiguous groups of roughly equal particle count. Bucket order equals
/// stream order, so each group covers one contiguous stream range.
pub(crate) fn split_lanes(hash: &SpatialHash, stream_len: u32) -> Vec<Lane> {
    let target = (stream_len / MAX_PARALLEL_TASKS as u32).max(1);
    let mut lanes: Vec<Lane> = Vec::new();
    let mut current = Lane {
        buckets: Vec::new(),
        first: 0,
        end: 0,
    };
    for bucket in 0..PACKET_HASH_SIZE {
        let packet = &hash.packets()[bucket];
        if !packet.is_occupied() || packet.num_particles == 0 {
            continue;
        }
        if current.buckets.is_empty() {
            current.first = packet.first_particle;
            current.end = packet.first_particle;
        }
        current.buckets.push(bucket);
        current.end = packet.first_particle + packet.num_particles;
        if current.end - current.first >= target && lanes.len() + 1 < MAX_PARALLEL_TASKS {
            lanes.push(std::mem::replace(
                &mut current,
                Lane {
                    buckets: Vec::new(),
                    first: 0,
                    end: 0,
                },
            ));
        }
    }
    if !current.buckets.is_empty() {
        lanes.push(current);
    }
    lanes
}

/// Feed every interacting pair of one packet to the sink: two-way streams
/// for pairs inside the packet, one-way streams against the halo regions
/// of the 26 neighbor packets.
fn packet_pairs(
    hash: &SpatialHash,
    bucket: usize,
    pos: &[Vec3],
    kernel: &SphKernel,
    sink: &mut impl PairSink,
) {
    let packet = hash.packets()[bucket];
    let first = packet.first_particle;
    let count = packet.num_particles;
    let radius_sq = kernel.radius_sq_std;
    let mut stream: Vec<[u32; 2]> = Vec::with_capacity(MAX_INDEX_STREAM_SIZE);

    // Pairs inside the packet.
    if count as usize <= BRUTE_FORCE_PARTICLE_THRESHOLD {
        for a in first..first + count {
            for b in a + 1..first + count {
                push_pair(&mut stream, [a, b], pos, radius_sq, true, sink);
            }
        }
    } else {
        let mut local = LocalCellHash::new();
        let members: Vec<u32> = (first..first + count).collect();
        let cell_size_inv = 1.0 / kernel.radius_std;
        local.build(&members, cell_size_inv, |k| pos[k as usize]);

        for cell in local.cells() {
            if !cell.is_occupied() {
                continue;
            }
            let own = &local.indices()
                [cell.first_particle as usize..(cell.first_particle + cell.num_particles) as usize];
            for (i, &a) in own.iter().enumerate() {
                for &b in &own[i + 1..] {
                    push_pair(&mut stream, [a, b], pos, radius_sq, true, sink);
                }
            }
            for offset in FORWARD_CELL_OFFSETS {
                let coord = [
                    cell.coord[0] + offset[0],
                    cell.coord[1] + offset[1],
                    cell.coord[2] + offset[2],
                ];
                let Some(other) = local.find_cell(coord) else {
                    continue;
                };
                let others = &local.indices()[other.first_particle as usize
                    ..(other.first_particle + other.num_particles) as usize];
                for &a in own {
                    for &b in others {
                        push_pair(&mut stream, [a, b], pos, radius_sq, true, sink);
                    }
                }
            }
        }
    }
    if !stream.is_empty() {
        sink.flush(&stream, true);
        stream.clear();
    }

    // One-way pairs against neighbor halo regions. Each boundary section
    // only visits the regions close enough to touch it.
    let sections = hash.sections(bucket);
    let tables = hash.tables();
    let mut halo = [HaloRegion::default(); NUM_HALO_REGIONS];
    hash.halo_regions(packet.coord, &mut halo);

    for s in 0..NUM_BOUNDARY_SECTIONS {
        if sections.count[s] == 0 {
            continue;
        }
        let own_first = sections.first[s];
        let own_end = own_first + sections.count[s];
        for &region in &tables.section_to_halo[s] {
            let region = halo[region as usize];
            if region.count == 0 {
                continue;
            }
            for a in own_first..own_end {
                for b in region.first..region.first + region.count {
                    push_pair(&mut stream, [a, b], pos, radius_sq, false, sink);
                }
            }
        }
    }
    if !stream.is_empty() {
        sink.flush(&stream, false);
    }
}

#[inline]
fn push_pair(
    stream: &mut Vec<[u32; 2]>,
    pair: [u32; 2],
    pos: &[Vec3],
    radius_sq: f32,
    two_way: bool,
    sink: &mut impl PairSink,
) {
    let diff = pos[pair[0] as usize] - pos[pair[1] as usize];
    if diff.length_squared() < radius_sq {
        stream.push(pair);
        if stream.len() == MAX_INDEX_STREAM_SIZE {
            sink.flush(stream, two_way);
            stream.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticleSystemConfig;
    use crate::particles::{BitMap, ParticleFlags};

    fn make_particles(positions: &[Vec3]) -> (Vec<Particle>, BitMap, Vec<u32>) {
        let particles: Vec<Particle> = positions
            .iter()
            .map(|&position| Particle {
                position,
                density: 0.0,
                velocity: Vec3::ZERO,
                flags: ParticleFlags {
                    api: ParticleFlags::VALID,
                    low: 0,
                },
            })
            .collect();
        let mut map = BitMap::with_capacity(positions.len());
        for i in 0..positions.len() {
            map.set(i);
        }
        let indices = vec![0u32; positions.len()];
        (particles, map, indices)
    }

    fn run_sph(positions: &[Vec3]) -> (Vec<Particle>, Vec<Vec3>) {
        let config = ParticleSystemConfig::default();
        let params = DynamicsParameters::derive(&config);
        let (mut particles, map, mut indices) = make_particles(positions);
        let mut hash = SpatialHash::new(
            params.cell_size_inv,
            params.packet_mult_log2,
            true,
            positions.len() as u32,
        );
        let n = hash.update_packet_hash(&mut indices, &mut particles, &map, positions.len() as u32);
        assert_eq!(n as usize, positions.len());
        hash.update_packet_sections(&mut indices, &particles);

        let mut sph = Sph::new(params);
        let mut transient = vec![Vec3::ZERO; positions.len()];
        sph.update_sph(&hash, &indices, &mut particles, &mut transient);
        (particles, transient)
    }

    #[test]
    fn isolated_particle_has_zero_density() {
        let (particles, transient) = run_sph(&[Vec3::new(0.3, 0.3, 0.3)]);
        assert_eq!(particles[0].density, 0.0);
        assert_eq!(transient[0], Vec3::ZERO);
    }

    #[test]
    fn dense_block_density_near_rest() {
        // 5^3 block at rest spacing; the center particle has a full
        // neighborhood, so its normalized density should approach 1.
        let mut positions = Vec::new();
        for x in 0..5 {
            for y in 0..5 {
                for z in 0..5 {
                    positions.push(Vec3::new(x as f32, y as f32, z as f32) * 0.1);
                }
            }
        }
        let (particles, _) = run_sph(&positions);
        let center = positions
            .iter()
            .position(|&p| (p - Vec3::splat(0.2)).length() < 1.0e-4)
            .unwrap();
        let d = particles[center].density;
        assert!(d > 0.5 && d < 1.5, "center density {d} far from rest");

        // A corner particle sees an eighth of the neighborhood.
        assert!(particles[0].density < d);
    }

    #[test]
    fn cross_packet_pair_is_symmetric() {
        // Two particles a quarter cell apart, straddling a packet border
        // (packet size is 1.6 for the default config). Halo interactions
        // are one-way per side and must produce mirrored results.
        let (particles, transient) = run_sph(&[
            Vec3::new(1.58, 0.3, 0.3),
            Vec3::new(1.63, 0.3, 0.3),
        ]);
        assert!(
            (particles[0].density - particles[1].density).abs() < 1.0e-6,
            "densities differ across packet border: {} vs {}",
            particles[0].density,
            particles[1].density
        );
        assert!(
            (transient[0] + transient[1]).length() < 1.0e-3 * transient[0].length().max(1.0),
            "halo forces must cancel: {:?} vs {:?}",
            transient[0],
            transient[1]
        );
    }

    #[test]
    fn compressed_cluster_gets_outward_acceleration() {
        // Particles packed at half the rest spacing push apart.
        let mut positions = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    positions.push(Vec3::new(x as f32, y as f32, z as f32) * 0.05);
                }
            }
        }
        let (_, transient) = run_sph(&positions);
        let center = Vec3::splat(0.05);
        // Corner particle accelerates away from the cluster center.
        let outward = positions[0] - center;
        assert!(
            transient[0].dot(outward) > 0.0,
            "corner particle must be pushed outward, got {:?}",
            transient[0]
        );
    }
}
