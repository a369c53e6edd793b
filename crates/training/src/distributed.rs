use std::sync::{Arc, Barrier};

use candle_core::{Device, Shape, Tensor, Var};
use model::{BatchInputs, ModelConfig, ModelOutput, StateDict, TrainableModel};
use parking_lot::Mutex;

use crate::TrainingError;

/// Collective operations shared by every rank of a training job.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Returns once every rank has called `barrier`.
    fn barrier(&self) -> Result<(), TrainingError>;

    /// Every rank contributes `local` and receives all contributions in rank order.
    fn all_gather(&self, local: StateDict) -> Result<Vec<StateDict>, TrainingError>;

    /// Like [`ProcessGroup::all_gather`] but only the coordinator keeps the result.
    fn gather_to_coordinator(
        &self,
        local: StateDict,
    ) -> Result<Option<Vec<StateDict>>, TrainingError> {
        let gathered = self.all_gather(local)?;
        Ok(self.is_coordinator().then_some(gathered))
    }
}

/// World of one process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessGroup;

impl ProcessGroup for SingleProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn all_gather(&self, local: StateDict) -> Result<Vec<StateDict>, TrainingError> {
        Ok(vec![local])
    }
}

struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<StateDict>>>,
}

/// In-process group where each rank runs on its own thread.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadGroup {
    /// One handle per rank; hand each to a different thread.
    pub fn create(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Rendezvous {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_gather(&self, local: StateDict) -> Result<Vec<StateDict>, TrainingError> {
        self.shared.slots.lock()[self.rank] = Some(local);
        self.shared.barrier.wait();
        let gathered: Vec<StateDict> = self.shared.slots.lock().iter().flatten().cloned().collect();
        // slots are rewritten only after every rank has read them
        self.shared.barrier.wait();

        if gathered.len() != self.world_size {
            return Err(TrainingError::runtime(format!(
                "all_gather received {} contributions for a world of {}",
                gathered.len(),
                self.world_size
            )));
        }
        Ok(gathered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullStateDictPolicy {
    pub offload_to_cpu: bool,
    pub coordinator_only: bool,
}

impl Default for FullStateDictPolicy {
    fn default() -> Self {
        Self {
            offload_to_cpu: true,
            coordinator_only: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateDictType {
    Sharded,
    Full(FullStateDictPolicy),
}

/// Fully-sharded container: each rank owns a contiguous slice of every
/// flattened parameter, and `state_dict` returns that slice unless a
/// [`FullStateDictScope`] is active.
pub struct ShardedModel {
    module: Box<dyn TrainableModel>,
    group: Arc<dyn ProcessGroup>,
    shapes: Vec<(String, Shape)>,
    state_dict_type: Mutex<StateDictType>,
}

impl ShardedModel {
    pub fn new(
        module: Box<dyn TrainableModel>,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self, TrainingError> {
        let shapes = module
            .state_dict()?
            .iter()
            .map(|(name, tensor)| (name.to_string(), tensor.shape().clone()))
            .collect();
        Ok(Self {
            module,
            group,
            shapes,
            state_dict_type: Mutex::new(StateDictType::Sharded),
        })
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn state_dict_type(&self) -> StateDictType {
        *self.state_dict_type.lock()
    }

    /// Enters the collective full-state-dict context on this rank.
    ///
    /// Every rank must enter and leave the scope; entry and exit are both
    /// barriers, and the exit runs when the scope is dropped.
    pub fn full_state_dict_scope(
        &self,
        policy: FullStateDictPolicy,
    ) -> Result<FullStateDictScope<'_>, TrainingError> {
        self.group.barrier()?;
        let previous =
            std::mem::replace(&mut *self.state_dict_type.lock(), StateDictType::Full(policy));
        tracing::debug!(rank = self.group.rank(), "entered full state dict scope");
        Ok(FullStateDictScope {
            model: self,
            previous,
        })
    }

    /// This rank's slice of every parameter.
    pub fn local_shards(&self) -> Result<StateDict, TrainingError> {
        let rank = self.group.rank();
        let world_size = self.group.world_size();
        let mut shards = StateDict::with_capacity(self.shapes.len());
        for (name, tensor) in self.module.state_dict()? {
            let flat = tensor.flatten_all()?;
            let (start, len) = shard_range(flat.elem_count(), rank, world_size);
            let shard = if len == 0 {
                Tensor::zeros((0,), flat.dtype(), flat.device())?
            } else {
                flat.narrow(0, start, len)?
            };
            shards.insert(name, shard);
        }
        Ok(shards)
    }

    fn collect_state_dict(&self) -> Result<StateDict, TrainingError> {
        match self.state_dict_type() {
            StateDictType::Sharded => self.local_shards(),
            StateDictType::Full(policy) => self.gather_full(policy),
        }
    }

    fn gather_full(&self, policy: FullStateDictPolicy) -> Result<StateDict, TrainingError> {
        let local = self.local_shards()?;
        let gathered = if policy.coordinator_only {
            self.group.gather_to_coordinator(local)?
        } else {
            Some(self.group.all_gather(local)?)
        };
        let Some(per_rank) = gathered else {
            return Ok(StateDict::new());
        };

        let mut full = StateDict::with_capacity(self.shapes.len());
        for (name, shape) in &self.shapes {
            let mut parts = Vec::with_capacity(per_rank.len());
            for shards in &per_rank {
                let part = shards.get(name).ok_or_else(|| {
                    TrainingError::runtime(format!("a rank did not contribute shard {name}"))
                })?;
                if part.elem_count() > 0 {
                    parts.push(part.clone());
                }
            }
            let tensor = Tensor::cat(&parts, 0)?.reshape(shape.clone())?;
            let tensor = if policy.offload_to_cpu {
                tensor.to_device(&Device::Cpu)?
            } else {
                tensor
            };
            full.insert(name.clone(), tensor);
        }
        Ok(full)
    }
}

impl TrainableModel for ShardedModel {
    fn config(&self) -> &ModelConfig {
        self.module.config()
    }

    fn inner(&self) -> Option<&dyn TrainableModel> {
        Some(self.module.as_ref())
    }

    fn state_dict(&self) -> candle_core::Result<StateDict> {
        self.collect_state_dict().map_err(candle_core::Error::wrap)
    }

    fn forward(&self, inputs: &BatchInputs) -> candle_core::Result<ModelOutput> {
        self.module.forward(inputs)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.module.parameters()
    }
}

/// Active full-state-dict context; dropping it restores the previous
/// state-dict type and waits on the exit barrier.
pub struct FullStateDictScope<'a> {
    model: &'a ShardedModel,
    previous: StateDictType,
}

impl FullStateDictScope<'_> {
    /// Complete state on the coordinator, empty elsewhere (per the policy).
    pub fn collect(&self) -> Result<StateDict, TrainingError> {
        self.model.collect_state_dict()
    }
}

impl Drop for FullStateDictScope<'_> {
    fn drop(&mut self) {
        *self.model.state_dict_type.lock() = self.previous;
        if let Err(err) = self.model.group.barrier() {
            tracing::error!(
                rank = self.model.group.rank(),
                "exit barrier of full state dict scope failed: {err}"
            );
        }
        tracing::debug!(rank = self.model.group.rank(), "left full state dict scope");
    }
}

fn shard_range(numel: usize, rank: usize, world_size: usize) -> (usize, usize) {
    let chunk = numel.div_ceil(world_size.max(1));
    let start = (rank * chunk).min(numel);
    let len = chunk.min(numel - start);
    (start, len)
}
