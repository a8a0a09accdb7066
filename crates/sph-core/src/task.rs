//! Explicit fan-out/fan-in task graph.
//!
//! Every stage of the particle pipeline is a set of worker tasks plus one
//! continuation that runs when the last worker finishes. Nodes hold an
//! atomic pending count and a dependent list; completing a node decrements
//! its dependents and releases the ones that reach zero. Nothing ever
//! blocks inside a task.
//!
//! With the `parallel` feature the ready set is executed on the rayon
//! pool; otherwise execution is sequential in dependency order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId(usize);

struct Node<'a> {
    run: Mutex<Option<Box<dyn FnOnce() + Send + 'a>>>,
    pending: AtomicU32,
    dependents: Vec<usize>,
}

#[derive(Default)]
pub struct TaskGraph<'a> {
    nodes: Vec<Node<'a>>,
}

impl<'a> TaskGraph<'a> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add_task<F>(&mut self, f: F) -> TaskId
    where
        F: FnOnce() + Send + 'a,
    {
        self.nodes.push(Node {
            run: Mutex::new(Some(Box::new(f))),
            pending: AtomicU32::new(0),
            dependents: Vec::new(),
        });
        TaskId(self.nodes.len() - 1)
    }

    /// `after` becomes runnable only once `before` has completed.
    pub fn add_dependency(&mut self, before: TaskId, after: TaskId) {
        debug_assert!(before != after);
        self.nodes[before.0].dependents.push(after.0);
        self.nodes[after.0].pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a worker that holds back `continuation` until it completes.
    pub fn spawn_with_continuation<F>(&mut self, f: F, continuation: TaskId) -> TaskId
    where
        F: FnOnce() + Send + 'a,
    {
        let id = self.add_task(f);
        self.add_dependency(id, continuation);
        id
    }

    /// Run the whole graph to completion. Consumes the graph; every task
    /// runs exactly once.
    pub fn execute(self) {
        let nodes = self.nodes;

        #[cfg(feature = "parallel")]
        {
            rayon::scope(|scope| {
                for id in 0..nodes.len() {
                    if nodes[id].pending.load(Ordering::Relaxed) == 0 {
                        let nodes = &nodes;
                        scope.spawn(move |scope| run_node(nodes, id, scope));
                    }
                }
            });
        }

        #[cfg(not(feature = "parallel"))]
        {
            let mut ready: Vec<usize> = (0..nodes.len())
                .filter(|&id| nodes[id].pending.load(Ordering::Relaxed) == 0)
                .collect();
            let mut completed = 0usize;
            while let Some(id) = ready.pop() {
                let task = nodes[id]
                    .run
                    .lock()
                    .expect("task graph poisoned")
                    .take()
                    .expect("task ran twice");
                task();
                completed += 1;
                for &dep in &nodes[id].dependents {
                    if nodes[dep].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        ready.push(dep);
                    }
                }
            }
            debug_assert_eq!(completed, nodes.len(), "task graph has a cycle");
        }
    }
}

#[cfg(feature = "parallel")]
fn run_node<'s, 'a>(nodes: &'s [Node<'a>], id: usize, scope: &rayon::Scope<'s>) {
    let task = nodes[id]
        .run
        .lock()
        .expect("task graph poisoned")
        .take()
        .expect("task ran twice");
    task();
    for &dep in &nodes[id].dependents {
        if nodes[dep].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            scope.spawn(move |scope| run_node(nodes, dep, scope));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn continuation_runs_after_all_workers() {
        let started = AtomicUsize::new(0);
        let workers_done_at_merge = AtomicUsize::new(usize::MAX);

        let mut graph = TaskGraph::new();
        let merge = graph.add_task(|| {
            workers_done_at_merge.store(started.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        for _ in 0..8 {
            graph.spawn_with_continuation(
                || {
                    started.fetch_add(1, Ordering::SeqCst);
                },
                merge,
            );
        }
        graph.execute();

        assert_eq!(
            workers_done_at_merge.load(Ordering::SeqCst),
            8,
            "merge must observe all eight workers complete"
        );
    }

    #[test]
    fn chained_dependencies_run_in_order() {
        let log = Mutex::new(Vec::new());
        let mut graph = TaskGraph::new();
        let a = graph.add_task(|| log.lock().unwrap().push('a'));
        let b = graph.add_task(|| log.lock().unwrap().push('b'));
        let c = graph.add_task(|| log.lock().unwrap().push('c'));
        graph.add_dependency(a, b);
        graph.add_dependency(b, c);
        graph.execute();
        assert_eq!(*log.lock().unwrap(), vec!['a', 'b', 'c']);
    }
}
