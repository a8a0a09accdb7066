//! Section and halo lookup tables, derived from packet geometry.
//!
//! A packet is a cube of `mult = 1 << packet_mult_log2` fine cells per
//! edge. Per axis a cell is classified Low / Mid / High against the packet
//! bounds; the combination picks one of 27 sections. The 26 boundary
//! sections come first, the pure interior is section 26, so later passes
//! can stop before it when only cross-packet work matters.
//!
//! The neighbor-export and section-to-halo tables below are computed from
//! that geometry at construction instead of being hard-coded: two cell
//! boxes interact exactly when they are within one fine cell of each other
//! on every axis (the SPH support radius equals the cell size).

pub const NUM_SECTIONS: usize = 27;
pub const NUM_BOUNDARY_SECTIONS: usize = 26;
pub const INTERIOR_SECTION: usize = 26;
pub const NUM_NEIGHBORS: usize = 26;
pub const NUM_HALO_REGIONS: usize = 98;

/// Fixed enumeration order of the 26 neighbor directions.
pub const NEIGHBOR_DIRS: [[i32; 3]; NUM_NEIGHBORS] = neighbor_dirs();

const fn neighbor_dirs() -> [[i32; 3]; NUM_NEIGHBORS] {
    let mut dirs = [[0i32; 3]; NUM_NEIGHBORS];
    let mut n = 0;
    let mut dz = -1;
    while dz <= 1 {
        let mut dy = -1;
        while dy <= 1 {
            let mut dx = -1;
            while dx <= 1 {
                if dx != 0 || dy != 0 || dz != 0 {
                    dirs[n] = [dx, dy, dz];
                    n += 1;
                }
                dx += 1;
            }
            dy += 1;
        }
        dz += 1;
    }
    dirs
}

/// Per-axis position of a fine cell inside its packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AxisClass {
    Low = 0,
    Mid = 1,
    High = 2,
}

const AXIS_CLASSES: [AxisClass; 3] = [AxisClass::Low, AxisClass::Mid, AxisClass::High];

#[inline]
fn classify_axis(local: u32, mult: u32) -> AxisClass {
    if local == 0 {
        AxisClass::Low
    } else if local == mult - 1 {
        AxisClass::High
    } else {
        AxisClass::Mid
    }
}

/// Section index for a fine cell at packet-local coordinates.
/// Boundary sections are 0..26 in (x fastest) class order with the
/// interior combination pulled out to the last slot.
#[inline]
pub fn section_of_local_cell(lx: u32, ly: u32, lz: u32, mult: u32) -> usize {
    let raw = classify_axis(lx, mult) as usize
        + 3 * classify_axis(ly, mult) as usize
        + 9 * classify_axis(lz, mult) as usize;
    remap_raw_section(raw)
}

#[inline]
fn remap_raw_section(raw: usize) -> usize {
    // raw 13 is (Mid, Mid, Mid), the interior.
    match raw.cmp(&13) {
        std::cmp::Ordering::Less => raw,
        std::cmp::Ordering::Equal => INTERIOR_SECTION,
        std::cmp::Ordering::Greater => raw - 1,
    }
}

/// Cell-coordinate box of one section in packet-local units, axes
/// independent: Low -> cell 0, High -> cell mult-1, Mid -> the span in
/// between (empty when mult < 3, which the box encodes as min > max).
#[derive(Clone, Copy, Debug)]
struct CellBox {
    min: [i64; 3],
    max: [i64; 3],
}

impl CellBox {
    fn is_empty(&self) -> bool {
        (0..3).any(|a| self.min[a] > self.max[a])
    }

    /// Chebyshev adjacency: within one cell on every axis.
    fn within_one_cell(&self, other: &CellBox) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (0..3).all(|a| self.min[a] - 1 <= other.max[a] && other.min[a] - 1 <= self.max[a])
    }
}

fn axis_span(class: AxisClass, mult: i64) -> (i64, i64) {
    match class {
        AxisClass::Low => (0, 0),
        AxisClass::High => (mult - 1, mult - 1),
        AxisClass::Mid => (1, mult - 2),
    }
}

/// Box of a section of the packet at packet-grid offset `dir` (in units of
/// fine cells, i.e. the neighbor's cells live at `dir * mult + local`).
fn section_box(classes: [AxisClass; 3], dir: [i32; 3], mult: i64) -> CellBox {
    let mut min = [0i64; 3];
    let mut max = [0i64; 3];
    for a in 0..3 {
        let (lo, hi) = axis_span(classes[a], mult);
        min[a] = dir[a] as i64 * mult + lo;
        max[a] = dir[a] as i64 * mult + hi;
    }
    CellBox { min, max }
}

fn section_classes(section: usize) -> [AxisClass; 3] {
    let raw = if section == INTERIOR_SECTION {
        13
    } else if section < 13 {
        section
    } else {
        section + 1
    };
    [
        AXIS_CLASSES[raw % 3],
        AXIS_CLASSES[(raw / 3) % 3],
        AXIS_CLASSES[raw / 9],
    ]
}

/// Which of a neighbor's sections face us, given the neighbor direction.
/// Face neighbors export 9 sections, edge neighbors 3, corners 1.
fn exported_sections(dir: [i32; 3]) -> Vec<usize> {
    let mut out = Vec::new();
    for section in 0..NUM_BOUNDARY_SECTIONS {
        let classes = section_classes(section);
        let facing = (0..3).all(|a| match dir[a] {
            // Neighbor sits at +dir from us; its side facing us is the
            // opposite one.
            1 => classes[a] == AxisClass::Low,
            -1 => classes[a] == AxisClass::High,
            _ => true,
        });
        if facing {
            out.push(section);
        }
    }
    out
}

/// All halo/section lookup tables for one packet edge length.
pub struct SectionTables {
    mult: u32,
    /// Sections each neighbor exports toward us, in `NEIGHBOR_DIRS` order.
    pub neighbor_sections: Vec<Vec<usize>>,
    /// Flattened halo-region index of the first region of each neighbor.
    pub halo_region_offset: [usize; NUM_NEIGHBORS],
    /// For each of our boundary sections, the halo-region indices within
    /// one cell of it.
    pub section_to_halo: Vec<Vec<u16>>,
}

impl SectionTables {
    pub fn new(packet_mult_log2: u32) -> Self {
        let mult = 1u32 << packet_mult_log2;
        let m = mult as i64;

        let neighbor_sections: Vec<Vec<usize>> =
            NEIGHBOR_DIRS.iter().map(|&dir| exported_sections(dir)).collect();

        let mut halo_region_offset = [0usize; NUM_NEIGHBORS];
        let mut total = 0usize;
        for (n, sections) in neighbor_sections.iter().enumerate() {
            halo_region_offset[n] = total;
            total += sections.len();
        }
        debug_assert_eq!(total, NUM_HALO_REGIONS);

        let mut section_to_halo = vec![Vec::new(); NUM_BOUNDARY_SECTIONS];
        for (our_section, halo_list) in section_to_halo.iter_mut().enumerate() {
            let our_box = section_box(section_classes(our_section), [0, 0, 0], m);
            for (n, &dir) in NEIGHBOR_DIRS.iter().enumerate() {
                for (s, &their_section) in neighbor_sections[n].iter().enumerate() {
                    let their_box = section_box(section_classes(their_section), dir, m);
                    if our_box.within_one_cell(&their_box) {
                        halo_list.push((halo_region_offset[n] + s) as u16);
                    }
                }
            }
        }

        Self {
            mult,
            neighbor_sections,
            halo_region_offset,
            section_to_halo,
        }
    }

    #[inline]
    pub fn mult(&self) -> u32 {
        self.mult
    }
}
