//! Per-particle mesh triangle cache.
//!
//! A particle close to a triangle mesh tends to query the same handful of
//! triangles for many steps. The cache keeps up to nine triangle ids and
//! the bounds they were collected under, in one of four storage layouts
//! picked by mesh size and triangle count. Bounds are quantized to a byte
//! per axis; extents round down and the coverage test rounds up, so a
//! cache hit never claims triangles outside the region actually queried.

use glam::Vec3;

use crate::config::CollisionParameters;
use crate::math::Aabb;
use crate::particles::CacheState;

pub const CACHE_MAX_TRIANGLES: usize = 9;
const FEW_MAX: usize = 6;
const WIDE_MAX: usize = 3;
/// 10-bit triangle id deltas in the packed layout.
const PACKED_DELTA_LIMIT: u32 = 1 << 10;
const QUANT_STEPS: f32 = 254.0;

/// Shared quantization scale, derived from the collision range so every
/// realistic cache region fits the byte encoding.
#[derive(Clone, Copy, Debug)]
pub struct CacheQuantizer {
    mult: f32,
    inv_mult: f32,
}

impl CacheQuantizer {
    pub fn new(params: &CollisionParameters) -> Self {
        let prox_radius = params.collision_range;
        let max_extents = 4.0 * params.collision_range + prox_radius;
        let mult = QUANT_STEPS / max_extents.max(1.0e-6);
        Self {
            mult,
            inv_mult: 1.0 / mult,
        }
    }

    /// Byte extents, rounded down. `None` when the region does not fit.
    fn quantize(&self, extents: Vec3) -> Option<[u8; 3]> {
        let q = extents * self.mult;
        if q.max_element() > 255.0 {
            return None;
        }
        Some([q.x as u8, q.y as u8, q.z as u8])
    }

    fn dequantize(&self, ext: [u8; 3]) -> Vec3 {
        Vec3::new(ext[0] as f32, ext[1] as f32, ext[2] as f32) * self.inv_mult
    }
}

#[derive(Clone, Debug, Default)]
enum Layout {
    #[default]
    None,
    /// Small mesh, at most one triangle; bounds kept exact.
    Exact { tri: Option<u16>, bounds: Aabb },
    /// Small mesh, up to six ids verbatim.
    Few {
        len: u8,
        tris: [u16; FEW_MAX],
        center: Vec3,
        ext: [u8; 3],
    },
    /// Small mesh, up to nine ids as base plus 10-bit deltas.
    Packed {
        len: u8,
        base: u16,
        deltas: [u32; 3],
        center: Vec3,
        ext: [u8; 3],
    },
    /// Large mesh, up to three full-width ids.
    Wide {
        len: u8,
        tris: [u32; WIDE_MAX],
        center: Vec3,
        ext: [u8; 3],
    },
}

#[derive(Clone, Debug, Default)]
pub struct TriangleCache {
    pub state: CacheState,
    layout: Layout,
}

impl TriangleCache {
    pub fn invalidate(&mut self) {
        self.state = CacheState::Invalid;
        self.layout = Layout::None;
    }

    /// Store a query result. Falls to `Invalid` when the ids do not fit
    /// any layout; the caller still uses its freshly queried list.
    pub fn pack(&mut self, tris: &[u32], bounds: &Aabb, mesh_triangles: usize, q: &CacheQuantizer) {
        let small_mesh = mesh_triangles <= u16::MAX as usize;
        self.layout = Layout::None;
        self.state = CacheState::Invalid;

        if small_mesh && tris.len() <= 1 {
            self.layout = Layout::Exact {
                tri: tris.first().map(|&t| t as u16),
                bounds: *bounds,
            };
            self.state = CacheState::Fresh;
            return;
        }

        let center = bounds.center();
        let Some(ext) = q.quantize(bounds.extents()) else {
            return;
        };

        if small_mesh {
            if tris.len() <= FEW_MAX {
                let mut ids = [0u16; FEW_MAX];
                for (slot, &t) in ids.iter_mut().zip(tris) {
                    *slot = t as u16;
                }
                self.layout = Layout::Few {
                    len: tris.len() as u8,
                    tris: ids,
                    center,
                    ext,
                };
                self.state = CacheState::Fresh;
            } else if tris.len() <= CACHE_MAX_TRIANGLES {
                let base = tris.iter().copied().min().unwrap_or(0);
                let spread = tris.iter().copied().max().unwrap_or(0) - base;
                if spread >= PACKED_DELTA_LIMIT {
                    return;
                }
                let mut deltas = [0u32; 3];
                for (i, &t) in tris.iter().enumerate() {
                    pack_10bit(&mut deltas, i, t - base);
                }
                self.layout = Layout::Packed {
                    len: tris.len() as u8,
                    base: base as u16,
                    deltas,
                    center,
                    ext,
                };
                self.state = CacheState::Fresh;
            }
        } else if tris.len() <= WIDE_MAX {
            let mut ids = [0u32; WIDE_MAX];
            ids[..tris.len()].copy_from_slice(tris);
            self.layout = Layout::Wide {
                len: tris.len() as u8,
                tris: ids,
                center,
                ext,
            };
            self.state = CacheState::Fresh;
        }
    }

    /// Whether the cached region covers the query box.
    pub fn covers(&self, query: &Aabb, q: &CacheQuantizer) -> bool {
        if self.state == CacheState::Invalid {
            return false;
        }
        let (center, ext) = match &self.layout {
            Layout::None => return false,
            Layout::Exact { bounds, .. } => {
                return bounds.min.cmple(query.min).all() && bounds.max.cmpge(query.max).all();
            }
            Layout::Few { center, ext, .. } => (*center, *ext),
            Layout::Packed { center, ext, .. } => (*center, *ext),
            Layout::Wide { center, ext, .. } => (*center, *ext),
        };
        let half = q.dequantize(ext);
        (center - half).cmple(query.min).all() && (center + half).cmpge(query.max).all()
    }

    /// Append the cached triangle ids.
    pub fn gather(&self, out: &mut Vec<u32>) {
        match &self.layout {
            Layout::None => {}
            Layout::Exact { tri, .. } => {
                if let Some(t) = tri {
                    out.push(*t as u32);
                }
            }
            Layout::Few { len, tris, .. } => {
                for &t in &tris[..*len as usize] {
                    out.push(t as u32);
                }
            }
            Layout::Packed {
                len, base, deltas, ..
            } => {
                for i in 0..*len as usize {
                    out.push(*base as u32 + unpack_10bit(deltas, i));
                }
            }
            Layout::Wide { len, tris, .. } => {
                out.extend_from_slice(&tris[..*len as usize]);
            }
        }
    }
}

fn pack_10bit(words: &mut [u32; 3], slot: usize, value: u32) {
    debug_assert!(value < PACKED_DELTA_LIMIT);
    let bit = slot * 10;
    let word = bit / 32;
    let shift = bit % 32;
    words[word] |= value << shift;
    if shift > 22 {
        words[word + 1] |= value >> (32 - shift);
    }
}

fn unpack_10bit(words: &[u32; 3], slot: usize) -> u32 {
    let bit = slot * 10;
    let word = bit / 32;
    let shift = bit % 32;
    let mut v = words[word] >> shift;
    if shift > 22 {
        v |= words[word + 1] << (32 - shift);
    }
    v & (PACKED_DELTA_LIMIT - 1)
}
