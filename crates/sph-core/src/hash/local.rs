//! Fine-cell hash over one packet.
//!
//! Rebuilt from scratch by the SPH passes for every packet that is too
//! large for brute force. Bucket count is the next power of two above the
//! particle count, so at least one bucket stays empty and probing
//! terminates.

use glam::Vec3;

use crate::math::next_power_of_two;

const INVALID: u32 = u32::MAX;

/// One fine cell: coordinate plus a range into the hash's reordered local
/// index list.
#[derive(Clone, Copy, Debug)]
pub struct LocalCell {
    pub coord: [i32; 3],
    pub first_particle: u32,
    pub num_particles: u32,
}

impl LocalCell {
    const EMPTY: LocalCell = LocalCell {
        coord: [0; 3],
        first_particle: 0,
        num_particles: INVALID,
    };

    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.num_particles != INVALID
    }
}

#[derive(Default)]
pub struct LocalCellHash {
    cells: Vec<LocalCell>,
    indices: Vec<u32>,
    keys: Vec<u32>,
    mask: usize,
}

impl LocalCellHash {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn hash_coord(coord: [i32; 3], mask: usize) -> usize {
        let h = coord[0]
            .wrapping_add(coord[1].wrapping_mul(101))
            .wrapping_add(coord[2].wrapping_mul(7919));
        (h as usize) & mask
    }

    #[inline]
    pub fn cells(&self) -> &[LocalCell] {
        &self.cells
    }

    /// Reordered copy of the indices passed to `build`, grouped by cell.
    #[inline]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn find_cell(&self, coord: [i32; 3]) -> Option<&LocalCell> {
        if self.cells.is_empty() {
            return None;
        }
        let mut h = Self::hash_coord(coord, self.mask);
        loop {
            let cell = &self.cells[h];
            if !cell.is_occupied() {
                return None;
            }
            if cell.coord == coord {
                return Some(cell);
            }
            h = (h + 1) & self.mask;
        }
    }

    /// Build over a slice of particle indices. `position_of` resolves an
    /// index to its position; `cell_size_inv` quantizes to fine cells.
    pub fn build<F>(&mut self, particle_indices: &[u32], cell_size_inv: f32, position_of: F)
    where
        F: Fn(u32) -> Vec3,
    {
        let n = particle_indices.len();
        let buckets = next_power_of_two(n as u32 + 1) as usize;
        self.mask = buckets - 1;
        self.cells.clear();
        self.cells.resize(buckets, LocalCell::EMPTY);
        self.keys.clear();
        self.keys.resize(n, 0);
        self.indices.clear();
        self.indices.resize(n, 0);

        // Count pass.
        for (i, &pi) in particle_indices.iter().enumerate() {
            let coord = cell_coord(position_of(pi), cell_size_inv);
            let mut h = Self::hash_coord(coord, self.mask);
            loop {
                let cell = &mut self.cells[h];
                if !cell.is_occupied() {
                    *cell = LocalCell {
                        coord,
                        first_particle: 0,
                        num_particles: 1,
                    };
                    break;
                }
                if cell.coord == coord {
                    cell.num_particles += 1;
                    break;
                }
                h = (h + 1) & self.mask;
            }
            self.keys[i] = h as u32;
        }

        // Prefix offsets, then scatter via per-cell cursors kept in
        // first_particle.
        let mut offset = 0u32;
        for cell in self.cells.iter_mut() {
            if cell.is_occupied() {
                cell.first_particle = offset;
                offset += cell.num_particles;
                cell.num_particles = 0;
            }
        }
        for (i, &pi) in particle_indices.iter().enumerate() {
            let cell = &mut self.cells[self.keys[i] as usize];
            self.indices[(cell.first_particle + cell.num_particles) as usize] = pi;
            cell.num_particles += 1;
        }
    }
}

#[inline]
pub fn cell_coord(p: Vec3, cell_size_inv: f32) -> [i32; 3] {
    [
        (p.x * cell_size_inv).floor() as i32,
        (p.y * cell_size_inv).floor() as i32,
        (p.z * cell_size_inv).floor() as i32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_partitions_indices_by_cell() {
        let positions = [
            Vec3::new(0.05, 0.05, 0.05),
            Vec3::new(0.15, 0.05, 0.05),
            Vec3::new(0.05, 0.05, 0.08),
            Vec3::new(0.95, 0.95, 0.95),
        ];
        let indices: Vec<u32> = (0..positions.len() as u32).collect();
        let mut hash = LocalCellHash::new();
        hash.build(&indices, 10.0, |i| positions[i as usize]);

        let total: u32 = hash
            .cells()
            .iter()
            .filter(|c| c.is_occupied())
            .map(|c| c.num_particles)
            .sum();
        assert_eq!(total, 4, "every index must land in exactly one cell");

        let cell = hash.find_cell([0, 0, 0]).expect("cell (0,0,0) exists");
        let range = cell.first_particle as usize..(cell.first_particle + cell.num_particles) as usize;
        let mut in_cell: Vec<u32> = hash.indices()[range].to_vec();
        in_cell.sort_unstable();
        assert_eq!(in_cell, vec![0, 2], "particles 0 and 2 share cell (0,0,0)");

        assert!(hash.find_cell([5, 5, 5]).is_none());
    }
}
