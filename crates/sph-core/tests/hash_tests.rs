//! Packet hash partitioning, sections and overflow behavior.

use glam::Vec3;

use sph_core::config::{PACKET_HASH_SIZE, PACKET_LIMIT};
use sph_core::hash::tables::NUM_SECTIONS;
use sph_core::hash::{HaloRegion, SpatialHash};
use sph_core::particles::{BitMap, Particle, ParticleFlags};

const CELL_SIZE: f32 = 0.2;
const MULT_LOG2: u32 = 3;

fn particle(position: Vec3) -> Particle {
    Particle {
        position,
        density: 0.0,
        velocity: Vec3::ZERO,
        flags: ParticleFlags {
            api: ParticleFlags::VALID,
            low: 0,
        },
    }
}

fn build(
    positions: &[Vec3],
    sections: bool,
) -> (SpatialHash, Vec<u32>, Vec<Particle>, u32) {
    let mut particles: Vec<Particle> = positions.iter().map(|&p| particle(p)).collect();
    let mut map = BitMap::with_capacity(particles.len());
    for i in 0..particles.len() {
        map.set(i);
    }
    let mut hash = SpatialHash::new(
        1.0 / CELL_SIZE,
        MULT_LOG2,
        sections,
        particles.len() as u32,
    );
    let mut ordered = vec![0u32; particles.len()];
    let total = hash.update_packet_hash(&mut ordered, &mut particles, &map, positions.len() as u32);
    (hash, ordered, particles, total)
}

/// Pseudo-random but reproducible positions across a handful of packets.
fn scattered_positions(count: usize) -> Vec<Vec3> {
    let mut state = 0x2545f491u32;
    (0..count)
        .map(|_| {
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 12.0 - 6.0
            };
            Vec3::new(next(), next(), next())
        })
        .collect()
}

#[test]
fn packet_ranges_partition_the_valid_set() {
    let positions = scattered_positions(500);
    let (hash, ordered, _, total) = build(&positions, false);
    assert_eq!(total as usize, positions.len());

    let mut seen = vec![false; positions.len()];
    let mut count = 0usize;
    let mut visit = |first: u32, num: u32| {
        for k in first..first + num {
            let pi = ordered[k as usize] as usize;
            assert!(!seen[pi], "particle {pi} appears in two packet ranges");
            seen[pi] = true;
            count += 1;
        }
    };
    for packet in hash.packets() {
        if packet.is_occupied() {
            visit(packet.first_particle, packet.num_particles);
        }
    }
    let overflow = hash.overflow_packet();
    visit(overflow.first_particle, overflow.num_particles);

    assert_eq!(count, positions.len(), "every valid particle is covered");
}

#[test]
fn packet_range_coordinates_match_particle_positions() {
    let positions = scattered_positions(300);
    let (hash, ordered, particles, _) = build(&positions, false);
    for packet in hash.packets() {
        if !packet.is_occupied() {
            continue;
        }
        for k in packet.first_particle..packet.first_particle + packet.num_particles {
            let pi = ordered[k as usize] as usize;
            let coord = hash.packet_coord(particles[pi].position);
            assert_eq!(coord, packet.coord, "particle binned into wrong packet");
        }
    }
}

#[test]
fn sections_partition_each_packet() {
    let positions = scattered_positions(800);
    let (mut hash, mut ordered, particles, _) = build(&positions, true);
    hash.update_packet_sections(&mut ordered, &particles);

    for bucket in 0..PACKET_HASH_SIZE {
        let packet = hash.packets()[bucket];
        if !packet.is_occupied() || packet.num_particles == 0 {
            continue;
        }
        let sections = hash.sections(bucket);
        let mut cursor = packet.first_particle;
        for s in 0..NUM_SECTIONS {
            assert_eq!(
                sections.first[s], cursor,
                "sections must tile the packet range contiguously"
            );
            cursor += sections.count[s];
        }
        assert_eq!(cursor, packet.first_particle + packet.num_particles);
    }
}

#[test]
fn interior_particles_stay_out_of_halo_regions() {
    let positions = scattered_positions(800);
    let (mut hash, mut ordered, particles, _) = build(&positions, true);
    hash.update_packet_sections(&mut ordered, &particles);

    let interior = NUM_SECTIONS - 1;
    for bucket in 0..PACKET_HASH_SIZE {
        let packet = hash.packets()[bucket];
        if !packet.is_occupied() || packet.num_particles == 0 {
            continue;
        }
        let mut halos = [HaloRegion::default(); sph_core::hash::tables::NUM_HALO_REGIONS];
        hash.halo_regions(packet.coord, &mut halos);

        // A halo region of this packet lives in a neighbor packet and must
        // never cover any neighbor's interior section.
        for region in halos.iter().filter(|r| r.count > 0) {
            for neighbor in 0..PACKET_HASH_SIZE {
                let np = hash.packets()[neighbor];
                if !np.is_occupied() {
                    continue;
                }
                let ns = hash.sections(neighbor);
                let int_first = ns.first[interior];
                let int_end = int_first + ns.count[interior];
                let r_end = region.first + region.count;
                assert!(
                    r_end <= int_first || region.first >= int_end,
                    "halo region [{}, {}) overlaps an interior section [{}, {})",
                    region.first,
                    r_end,
                    int_first,
                    int_end
                );
            }
        }
    }
}

#[test]
fn packet_limit_overflow_flags_and_excludes_particles() {
    // One particle per distinct packet coordinate, more than the limit.
    let packet_size = CELL_SIZE * (1 << MULT_LOG2) as f32;
    let count = PACKET_LIMIT + 150;
    let side = 40usize;
    let positions: Vec<Vec3> = (0..count)
        .map(|i| {
            let x = (i % side) as f32;
            let y = ((i / side) % side) as f32;
            let z = (i / (side * side)) as f32;
            Vec3::new(x, y, z) * packet_size + Vec3::splat(0.5 * packet_size)
        })
        .collect();
    let (hash, ordered, particles, total) = build(&positions, false);
    assert_eq!(total as usize, count);

    let overflow = hash.overflow_packet();
    assert_eq!(overflow.num_particles as usize, count - PACKET_LIMIT);

    let overflow_range =
        overflow.first_particle..overflow.first_particle + overflow.num_particles;
    for k in overflow_range.clone() {
        let pi = ordered[k as usize] as usize;
        assert!(
            particles[pi].flags.api & ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW != 0,
            "overflow particle {pi} must carry the overflow flag"
        );
    }
    // No regular packet may contain an overflow-flagged particle.
    for packet in hash.packets() {
        if !packet.is_occupied() {
            continue;
        }
        for k in packet.first_particle..packet.first_particle + packet.num_particles {
            let pi = ordered[k as usize] as usize;
            assert_eq!(
                particles[pi].flags.api & ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW,
                0
            );
        }
    }
}

#[test]
fn overflow_flag_is_sticky_across_rebuilds() {
    let packet_size = CELL_SIZE * (1 << MULT_LOG2) as f32;
    let count = PACKET_LIMIT + 10;
    let positions: Vec<Vec3> = (0..count)
        .map(|i| Vec3::new(i as f32 * packet_size * 2.0, 0.0, 0.0))
        .collect();
    let (_, _, mut particles, _) = build(&positions, false);

    let flagged = particles
        .iter()
        .filter(|p| p.flags.api & ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW != 0)
        .count();
    assert_eq!(flagged, 10);

    // Pull everything into one packet and rebuild; the flag stays.
    for p in particles.iter_mut() {
        p.position = Vec3::ZERO;
    }
    let mut map = BitMap::with_capacity(particles.len());
    for i in 0..particles.len() {
        map.set(i);
    }
    let mut hash = SpatialHash::new(1.0 / CELL_SIZE, MULT_LOG2, false, count as u32);
    let mut ordered = vec![0u32; count];
    hash.update_packet_hash(&mut ordered, &mut particles, &map, count as u32);

    assert_eq!(hash.overflow_packet().num_particles, 0);
    let still_flagged = particles
        .iter()
        .filter(|p| p.flags.api & ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW != 0)
        .count();
    assert_eq!(still_flagged, 10, "overflow flag is sticky");
}
