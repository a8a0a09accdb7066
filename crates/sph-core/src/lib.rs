//! CPU particle fluid simulation.
//!
//! Particles live in a packet-level spatial hash, interact through SPH
//! density and pressure/viscosity forces, and collide against a snapshot
//! of scene shapes with continuous, discrete and proximity contacts.
//! Per-step work fans out over a small explicit task graph; with the
//! `parallel` feature the graph runs on rayon, otherwise sequentially
//! with identical results.
//!
//! Entry points: [`Context`] for a scene of systems, or
//! [`ParticleSystemSim`] directly for a single one.

pub mod collision;
pub mod config;
pub mod context;
pub mod dynamics;
pub mod hash;
pub mod math;
pub mod particles;
pub mod shapes;
pub mod system;
pub mod task;

pub use collision::{CollisionOutput, TwoWayImpulse};
pub use config::{ParticleSystemConfig, SystemFlags};
pub use context::{Backend, Context, CpuBackend, SystemHandle};
pub use math::{Aabb, Plane};
pub use particles::{Particle, ParticleCreation, ParticleFlags};
pub use shapes::{
    Heightfield, Shape, ShapeFlags, ShapeGeometry, ShapeHandle, ShapeStore, TriangleMesh,
};
pub use system::{ParticleSystemSim, SimulationOutput};
