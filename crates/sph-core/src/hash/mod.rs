//! Packet-level spatial hashing.
//!
//! Particles are binned into packets (cubes of `2^packet_mult_log2` fine
//! cells) through an open-addressing table with linear probing. The table
//! has [`PACKET_HASH_SIZE`] buckets but admits at most [`PACKET_LIMIT`]
//! live packets, so probing always terminates at an empty slot. Particles
//! that would create a packet beyond the limit land in one dedicated
//! overflow packet and carry a sticky overflow flag; that is a capacity
//! condition, not an error.

mod local;
pub mod tables;

pub use local::{LocalCell, LocalCellHash};

use glam::Vec3;

use crate::config::{PACKET_HASH_SIZE, PACKET_LIMIT};
use crate::particles::{BitMap, Particle, ParticleFlags};
use tables::{SectionTables, NUM_HALO_REGIONS, NUM_SECTIONS};

pub const INVALID_PARTICLE_COUNT: u32 = u32::MAX;
const KEY_OVERFLOW: u16 = u16::MAX;

/// Packet coordinate: fine-cell coordinate shifted down by the packet
/// multiplier. 16 bits per axis like the original grid key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketCoord {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl PacketCoord {
    #[inline]
    pub fn offset(self, d: [i32; 3]) -> Self {
        Self {
            x: (self.x as i32 + d[0]) as i16,
            y: (self.y as i32 + d[1]) as i16,
            z: (self.z as i32 + d[2]) as i16,
        }
    }
}

/// One packet record: coordinate plus a range into the reordered particle
/// index array. `num_particles == INVALID_PARTICLE_COUNT` marks an empty
/// bucket.
#[derive(Clone, Copy, Debug)]
pub struct Packet {
    pub coord: PacketCoord,
    pub first_particle: u32,
    pub num_particles: u32,
}

impl Packet {
    const EMPTY: Packet = Packet {
        coord: PacketCoord { x: 0, y: 0, z: 0 },
        first_particle: 0,
        num_particles: INVALID_PARTICLE_COUNT,
    };

    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.num_particles != INVALID_PARTICLE_COUNT
    }
}

/// Per-packet section ranges. Absolute offsets into the packet index
/// array; the interior section is last.
#[derive(Clone, Copy, Debug)]
pub struct PacketSections {
    pub first: [u32; NUM_SECTIONS],
    pub count: [u32; NUM_SECTIONS],
}

impl PacketSections {
    const EMPTY: PacketSections = PacketSections {
        first: [0; NUM_SECTIONS],
        count: [0; NUM_SECTIONS],
    };
}

/// One halo region: a (possibly empty) particle range of a neighbor
/// packet's boundary section.
#[derive(Clone, Copy, Debug, Default)]
pub struct HaloRegion {
    pub first: u32,
    pub count: u32,
}

pub struct SpatialHash {
    cell_size_inv: f32,
    packet_mult_log2: u32,
    packets: Vec<Packet>,
    overflow: Packet,
    num_packets: u32,
    overflow_warned: bool,
    sections_enabled: bool,
    sections: Vec<PacketSections>,
    tables: SectionTables,
    /// Per-particle bucket key scratch, written in pass 1 and consumed in
    /// pass 3 of the hash build.
    keys: Vec<u16>,
    cursors: Vec<u32>,
    reorder_scratch: Vec<u32>,
}

impl SpatialHash {
    pub fn new(
        cell_size_inv: f32,
        packet_mult_log2: u32,
        build_sections: bool,
        max_particles: u32,
    ) -> Self {
        debug_assert!(PACKET_HASH_SIZE.is_power_of_two());
        debug_assert!(PACKET_LIMIT < PACKET_HASH_SIZE);
        Self {
            cell_size_inv,
            packet_mult_log2,
            packets: vec![Packet::EMPTY; PACKET_HASH_SIZE],
            overflow: Packet::EMPTY,
            num_packets: 0,
            overflow_warned: false,
            sections_enabled: build_sections,
            sections: vec![PacketSections::EMPTY; if build_sections { PACKET_HASH_SIZE } else { 0 }],
            tables: SectionTables::new(packet_mult_log2),
            keys: vec![0; max_particles as usize],
            cursors: vec![0; PACKET_HASH_SIZE + 1],
            reorder_scratch: Vec::new(),
        }
    }

    #[inline]
    fn hash_coord(coord: PacketCoord) -> usize {
        let h = (coord.x as i32)
            .wrapping_add((coord.y as i32).wrapping_mul(101))
            .wrapping_add((coord.z as i32).wrapping_mul(7919));
        (h as usize) & (PACKET_HASH_SIZE - 1)
    }

    #[inline]
    pub fn cell_coord(&self, p: Vec3) -> [i32; 3] {
        [
            (p.x * self.cell_size_inv).floor() as i32,
            (p.y * self.cell_size_inv).floor() as i32,
            (p.z * self.cell_size_inv).floor() as i32,
        ]
    }

    /// Packet coordinate of a position. An arithmetic shift of the fine
    /// cell coordinate, so local cell offsets stay in `0..mult` for
    /// negative coordinates too.
    #[inline]
    pub fn packet_coord(&self, p: Vec3) -> PacketCoord {
        let c = self.cell_coord(p);
        PacketCoord {
            x: (c[0] >> self.packet_mult_log2) as i16,
            y: (c[1] >> self.packet_mult_log2) as i16,
            z: (c[2] >> self.packet_mult_log2) as i16,
        }
    }

    #[inline]
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    #[inline]
    pub fn overflow_packet(&self) -> &Packet {
        &self.overflow
    }

    #[inline]
    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    #[inline]
    pub fn tables(&self) -> &SectionTables {
        &self.tables
    }

    #[inline]
    pub fn sections(&self, bucket: usize) -> &PacketSections {
        &self.sections[bucket]
    }

    /// Look up the bucket of a packet coordinate.
    pub fn find_packet(&self, coord: PacketCoord) -> Option<usize> {
        let mut h = Self::hash_coord(coord);
        loop {
            let packet = &self.packets[h];
            if !packet.is_occupied() {
                return None;
            }
            if packet.coord == coord {
                return Some(h);
            }
            h = (h + 1) & (PACKET_HASH_SIZE - 1);
        }
    }

    /// Find or claim the bucket for `coord`. `None` when the live-packet
    /// limit would be exceeded.
    fn find_or_insert(&mut self, coord: PacketCoord) -> Option<u16> {
        let mut h = Self::hash_coord(coord);
        loop {
            let packet = &mut self.packets[h];
            if !packet.is_occupied() {
                if self.num_packets as usize >= PACKET_LIMIT {
                    return None;
                }
                self.num_packets += 1;
                *packet = Packet {
                    coord,
                    first_particle: 0,
                    num_particles: 0,
                };
                return Some(h as u16);
            }
            if packet.coord == coord {
                return Some(h as u16);
            }
            h = (h + 1) & (PACKET_HASH_SIZE - 1);
        }
    }

    /// Rebuild the packet table and write the reordered particle index
    /// array. Three passes: count into buckets, prefix-sum the first
    /// offsets (overflow packet last), scatter indices. Returns the number
    /// of indices written (all valid particles, overflow included).
    pub fn update_packet_hash(
        &mut self,
        indices: &mut [u32],
        particles: &mut [Particle],
        map: &BitMap,
        valid_range: u32,
    ) -> u32 {
        self.packets.fill(Packet::EMPTY);
        self.overflow = Packet {
            coord: PacketCoord { x: 0, y: 0, z: 0 },
            first_particle: 0,
            num_particles: 0,
        };
        self.num_packets = 0;

        // Pass 1: assign bucket keys and count.
        let mut hit_overflow = false;
        for i in 0..valid_range as usize {
            if !map.test(i) {
                continue;
            }
            let coord = self.packet_coord(particles[i].position);
            let key = match self.find_or_insert(coord) {
                Some(bucket) => {
                    self.packets[bucket as usize].num_particles += 1;
                    bucket
                }
                None => {
                    particles[i].flags.api |= ParticleFlags::SPATIAL_DATA_STRUCTURE_OVERFLOW;
                    self.overflow.num_particles += 1;
                    hit_overflow = true;
                    KEY_OVERFLOW
                }
            };
            self.keys[i] = key;
        }

        if hit_overflow && !self.overflow_warned {
            self.overflow_warned = true;
            log::warn!(
                "particle packet table overflowed ({PACKET_LIMIT} packets); \
                 excess particles are advanced without scene collision"
            );
        }

        // Pass 2: prefix-sum first-particle offsets.
        let mut offset = 0u32;
        for (bucket, packet) in self.packets.iter_mut().enumerate() {
            self.cursors[bucket] = offset;
            if packet.is_occupied() {
                packet.first_particle = offset;
                offset += packet.num_particles;
            }
        }
        self.overflow.first_particle = offset;
        self.cursors[PACKET_HASH_SIZE] = offset;
        offset += self.overflow.num_particles;
        let total = offset;

        // Pass 3: scatter particle indices to their packet ranges.
        for i in 0..valid_range as usize {
            if !map.test(i) {
                continue;
            }
            let bucket = if self.keys[i] == KEY_OVERFLOW {
                PACKET_HASH_SIZE
            } else {
                self.keys[i] as usize
            };
            indices[self.cursors[bucket] as usize] = i as u32;
            self.cursors[bucket] += 1;
        }

        total
    }

    /// Fine-cell coordinate of `p` local to its packet, clamped against
    /// float edge cases at packet borders.
    #[inline]
    fn local_cell(&self, p: Vec3, packet: PacketCoord) -> [u32; 3] {
        let mult = 1i32 << self.packet_mult_log2;
        let c = self.cell_coord(p);
        let base = [
            (packet.x as i32) << self.packet_mult_log2,
            (packet.y as i32) << self.packet_mult_log2,
            (packet.z as i32) << self.packet_mult_log2,
        ];
        [
            (c[0] - base[0]).clamp(0, mult - 1) as u32,
            (c[1] - base[1]).clamp(0, mult - 1) as u32,
            (c[2] - base[2]).clamp(0, mult - 1) as u32,
        ]
    }

    /// Split every packet into 27 sections and reorder its slice of the
    /// index array so each section is contiguous, interior last.
    pub fn update_packet_sections(&mut self, indices: &mut [u32], particles: &[Particle]) {
        debug_assert!(self.sections_enabled);
        let mult = self.tables.mult();

        for bucket in 0..PACKET_HASH_SIZE {
            let packet = self.packets[bucket];
            if !packet.is_occupied() || packet.num_particles == 0 {
                self.sections[bucket] = PacketSections::EMPTY;
                continue;
            }
            let first = packet.first_particle as usize;
            let count = packet.num_particles as usize;
            let range = &mut indices[first..first + count];

            let mut bins = [0u32; NUM_SECTIONS];
            for &pi in range.iter() {
                let l = self.local_cell_of(particles[pi as usize].position, packet.coord, mult);
                bins[l] += 1;
            }

            let mut sections = PacketSections::EMPTY;
            let mut offset = first as u32;
            for s in 0..NUM_SECTIONS {
                sections.first[s] = offset;
                sections.count[s] = bins[s];
                offset += bins[s];
            }

            self.reorder_scratch.clear();
            self.reorder_scratch.extend_from_slice(range);
            let mut cursor = [0u32; NUM_SECTIONS];
            for &pi in &self.reorder_scratch {
                let s = self.local_cell_of(particles[pi as usize].position, packet.coord, mult);
                let dst = (sections.first[s] + cursor[s]) as usize - first;
                range[dst] = pi;
                cursor[s] += 1;
            }

            self.sections[bucket] = sections;
        }
    }

    #[inline]
    fn local_cell_of(&self, p: Vec3, packet: PacketCoord, mult: u32) -> usize {
        let l = self.local_cell(p, packet);
        tables::section_of_local_cell(l[0], l[1], l[2], mult)
    }

    /// Gather the 98 halo regions around a packet: for each of the 26
    /// neighbor packets, the ranges of the sections facing us. Slots of
    /// missing neighbors stay empty so halo indices remain stable.
    pub fn halo_regions(&self, coord: PacketCoord, out: &mut [HaloRegion; NUM_HALO_REGIONS]) {
        out.fill(HaloRegion::default());
        for (n, &dir) in tables::NEIGHBOR_DIRS.iter().enumerate() {
            let Some(bucket) = self.find_packet(coord.offset(dir)) else {
                continue;
            };
            let sections = &self.sections[bucket];
            let base = self.tables.halo_region_offset[n];
            for (s, &sec) in self.tables.neighbor_sections[n].iter().enumerate() {
                out[base + s] = HaloRegion {
                    first: sections.first[sec],
                    count: sections.count[sec],
                };
            }
        }
    }
}
