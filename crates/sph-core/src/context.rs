//! Scene-level container: a pool of particle systems stepped together
//! against one shared shape snapshot.
//!
//! Systems are independent, so the batch runs them as one task-graph
//! fan-out. The `Backend` trait is the seam a different execution target
//! would plug into; only the CPU backend exists here.

use std::sync::Mutex;

use crate::config::ParticleSystemConfig;
use crate::shapes::ShapeStore;
use crate::system::{ParticleSystemSim, SimulationOutput};
use crate::task::TaskGraph;

/// Stable identifier of one system inside a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SystemHandle(u32);

/// One batch entry: a system and the snapshot it steps against.
pub struct SystemStep<'a> {
    pub system: &'a mut ParticleSystemSim,
    pub shapes: &'a ShapeStore,
}

/// Execution strategy for a batch of independent system steps.
pub trait Backend {
    fn step_batch(&mut self, steps: &mut [SystemStep], time_step: f32) -> Vec<SimulationOutput>;
}

/// Task-graph fan-out over the batch; parallel when the `parallel`
/// feature is on, plain sequential otherwise.
#[derive(Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn step_batch(&mut self, steps: &mut [SystemStep], time_step: f32) -> Vec<SimulationOutput> {
        let outputs: Vec<Mutex<SimulationOutput>> = steps
            .iter()
            .map(|_| Mutex::new(SimulationOutput::empty()))
            .collect();
        {
            let mut graph = TaskGraph::new();
            let done = graph.add_task(|| {});
            for (step, out) in steps.iter_mut().zip(outputs.iter()) {
                graph.spawn_with_continuation(
                    move || {
                        let result = step.system.step(step.shapes, time_step);
                        *out.lock().expect("system step poisoned") = result;
                    },
                    done,
                );
            }
            graph.execute();
        }
        outputs
            .into_iter()
            .map(|cell| cell.into_inner().expect("system step poisoned"))
            .collect()
    }
}

pub struct Context {
    backend: Box<dyn Backend>,
    systems: Vec<Option<ParticleSystemSim>>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_backend(Box::new(CpuBackend))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            systems: Vec::new(),
        }
    }

    pub fn create_system(&mut self, config: ParticleSystemConfig) -> SystemHandle {
        let sim = ParticleSystemSim::new(config);
        for (i, slot) in self.systems.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(sim);
                return SystemHandle(i as u32);
            }
        }
        self.systems.push(Some(sim));
        SystemHandle(self.systems.len() as u32 - 1)
    }

    pub fn release_system(&mut self, handle: SystemHandle) {
        if let Some(slot) = self.systems.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    pub fn system(&self, handle: SystemHandle) -> Option<&ParticleSystemSim> {
        self.systems.get(handle.0 as usize)?.as_ref()
    }

    pub fn system_mut(&mut self, handle: SystemHandle) -> Option<&mut ParticleSystemSim> {
        self.systems.get_mut(handle.0 as usize)?.as_mut()
    }

    pub fn num_systems(&self) -> usize {
        self.systems.iter().filter(|s| s.is_some()).count()
    }

    /// Step every live system against one shape snapshot. The snapshot is
    /// taken by value and released when the batch is done. Output order
    /// matches handle order.
    pub fn step(&mut self, shapes: ShapeStore, time_step: f32) -> Vec<(SystemHandle, SimulationOutput)> {
        let mut handles = Vec::new();
        let mut steps: Vec<SystemStep> = Vec::new();
        for (i, slot) in self.systems.iter_mut().enumerate() {
            if let Some(system) = slot {
                handles.push(SystemHandle(i as u32));
                steps.push(SystemStep {
                    system,
                    shapes: &shapes,
                });
            }
        }
        let outputs = self.backend.step_batch(&mut steps, time_step);
        handles.into_iter().zip(outputs).collect()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemFlags;
    use crate::particles::ParticleCreation;
    use glam::Vec3;

    fn ballistic_config() -> ParticleSystemConfig {
        let mut config = ParticleSystemConfig::default();
        config.flags = SystemFlags::NONE;
        config
    }

    #[test]
    fn handles_are_reused_after_release() {
        let mut ctx = Context::new();
        let a = ctx.create_system(ballistic_config());
        let b = ctx.create_system(ballistic_config());
        assert_ne!(a, b);
        ctx.release_system(a);
        assert_eq!(ctx.num_systems(), 1);
        let c = ctx.create_system(ballistic_config());
        assert_eq!(a, c, "released slot should be reused");
    }

    #[test]
    fn batch_steps_every_live_system() {
        let mut ctx = Context::new();
        let a = ctx.create_system(ballistic_config());
        let b = ctx.create_system(ballistic_config());
        for handle in [a, b] {
            let sim = ctx.system_mut(handle).unwrap();
            sim.add_particles(&ParticleCreation {
                indices: &[0],
                positions: &[Vec3::new(0.0, 1.0, 0.0)],
                velocities: &[],
                rest_offsets: &[],
            });
        }

        let results = ctx.step(ShapeStore::new(), 1.0 / 60.0);
        assert_eq!(results.len(), 2);
        for (handle, output) in &results {
            assert!(!output.world_bounds.is_empty());
            let sim = ctx.system(*handle).unwrap();
            assert!(sim.store().particles()[0].velocity.y < 0.0);
        }
    }
}
