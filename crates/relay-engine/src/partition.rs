//! Partitions — concurrent execution lanes and the priority lane.
//!
//! The manager splits the iteration space into contiguous,
//! non-overlapping lanes, each with its own pool, cursor sub-range, and
//! cloned variable scopes. One priority partition always exists outside
//! the lane list; it hosts control instructions, and an async mutex gate
//! guarantees it fully drains before any regular lane makes further
//! progress.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use relay_types::{CursorSnapshot, VariableScope};
use tokio::sync::Mutex as AsyncMutex;

use crate::cursor::Cursor;
use crate::error::{EngineError, EngineResult};
use crate::instruction::{Command, Instruction, WaterfallStep};
use crate::run::{Lane, Run, RunCompletion};

/// A lane's slice of the iteration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneLayout {
    /// Lane ordinal.
    pub index: usize,
    /// First global iteration this lane runs.
    pub offset: usize,
    /// How many iterations this lane runs.
    pub size: usize,
}

/// Split `iteration_count` iterations across at most `max_concurrency`
/// lanes, as evenly as possible: the first `remainder` lanes get one
/// extra iteration. Never creates more lanes than iterations.
pub fn lane_layouts(iteration_count: usize, max_concurrency: usize) -> Vec<LaneLayout> {
    let concurrency = max_concurrency.min(iteration_count);
    if concurrency == 0 {
        return Vec::new();
    }
    let base = iteration_count / concurrency;
    let remainder = iteration_count % concurrency;
    let mut layouts = Vec::with_capacity(concurrency);
    let mut offset = 0;
    for index in 0..concurrency {
        let size = base + usize::from(index < remainder);
        if size == 0 {
            continue;
        }
        layouts.push(LaneLayout {
            index,
            offset,
            size,
        });
        offset += size;
    }
    layouts
}

/// An independent execution lane: one pool, one cursor sub-range, one
/// cloned set of variable scopes.
pub struct Partition {
    pub(crate) layout: LaneLayout,
    pub(crate) lane: Lane,
}

impl Partition {
    fn new(run: &Run, layout: LaneLayout) -> Self {
        let length = run.shared.items.len();
        let cursor = Cursor::for_partition(
            length,
            layout.offset + layout.size,
            layout.offset,
            layout.index,
            layout.size,
        );
        // the lane owns an independent clone; nothing merges back without
        // an explicit update_partition_variables call
        let scopes = run
            .shared
            .default_lane
            .scopes
            .lock()
            .expect("run scopes poisoned")
            .clone();
        Self {
            layout,
            lane: Lane::new(cursor, scopes),
        }
    }

    pub fn layout(&self) -> LaneLayout {
        self.layout
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.lane.snapshot()
    }
}

/// Fans one logical run out across lanes and serializes priority work.
pub struct PartitionManager {
    layouts: Vec<LaneLayout>,
    lanes: Mutex<BTreeMap<usize, Arc<Partition>>>,
    priority: Arc<Partition>,
    gate: AsyncMutex<()>,
    external: bool,
    iteration_count: usize,
}

impl PartitionManager {
    pub(crate) fn new(run: &Run) -> EngineResult<Self> {
        let options = &run.shared.options;
        let external = options.externally_driven;
        // externally-driven lanes map one lane per iteration, created on
        // demand; otherwise the layout is fixed up front
        let layouts = if external {
            Vec::new()
        } else {
            lane_layouts(options.iteration_count, options.max_concurrency)
        };
        let priority = Arc::new(Partition::new(
            run,
            LaneLayout {
                index: 0,
                offset: 0,
                size: 1,
            },
        ));
        let manager = Self {
            layouts,
            lanes: Mutex::new(BTreeMap::new()),
            priority,
            gate: AsyncMutex::new(()),
            external,
            iteration_count: options.iteration_count,
        };
        {
            let mut lanes = manager.lanes.lock().expect("lanes poisoned");
            for layout in &manager.layouts {
                lanes.insert(layout.index, Arc::new(Partition::new(run, *layout)));
            }
        }
        Ok(manager)
    }

    /// The regular lanes, in ordinal order. Never contains the priority
    /// partition.
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.lanes
            .lock()
            .expect("lanes poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// The always-present priority partition.
    pub fn priority(&self) -> &Arc<Partition> {
        &self.priority
    }

    pub(crate) fn gate(&self) -> &AsyncMutex<()> {
        &self.gate
    }

    pub(crate) fn external(&self) -> bool {
        self.external
    }

    /// Clear every pool this manager reaches (abort/timeout path).
    pub(crate) fn clear_pools(&self) {
        self.priority.lane.pool.clear();
        for partition in self.partitions() {
            partition.lane.pool.clear();
        }
    }

    /// Schedule a command: `immediate` targets the priority partition,
    /// anything else routes to the lane its coordinate names.
    pub fn schedule(&self, command: Command, immediate: bool) -> EngineResult<()> {
        if immediate {
            self.priority.lane.pool.push(Instruction::new(command));
            return Ok(());
        }
        let index = command
            .coords()
            .and_then(|coords| coords.partition_index)
            .ok_or_else(|| {
                EngineError::InvalidOptions("command carries no partition coordinate".into())
            })?;
        let partition = self.get(index)?;
        partition.lane.pool.push(Instruction::new(command));
        Ok(())
    }

    pub(crate) fn get(&self, index: usize) -> EngineResult<Arc<Partition>> {
        self.lanes
            .lock()
            .expect("lanes poisoned")
            .get(&index)
            .cloned()
            .ok_or(EngineError::UnknownPartition(index))
    }

    /// Fetch a lane, lazily creating it in externally-driven mode.
    pub(crate) fn get_or_create(&self, run: &Run, index: usize) -> EngineResult<Arc<Partition>> {
        if let Some(partition) = self.lanes.lock().expect("lanes poisoned").get(&index) {
            return Ok(partition.clone());
        }
        if !self.external || index >= self.iteration_count {
            return Err(EngineError::UnknownPartition(index));
        }
        let partition = Arc::new(Partition::new(
            run,
            LaneLayout {
                index,
                offset: index,
                size: 1,
            },
        ));
        self.lanes
            .lock()
            .expect("lanes poisoned")
            .insert(index, partition.clone());
        Ok(partition)
    }
}

impl Run {
    /// The partition manager, built on first use. Errors when the run's
    /// options keep it single-lane.
    pub fn partition_manager(&self) -> EngineResult<Arc<PartitionManager>> {
        if let Some(manager) = self.shared.manager.get() {
            return Ok(manager.clone());
        }
        if !self.shared.options.partitioned() {
            return Err(EngineError::InvalidOptions("run is not partitioned".into()));
        }
        let manager = Arc::new(PartitionManager::new(self)?);
        let _ = self.shared.manager.set(manager);
        Ok(self
            .shared
            .manager
            .get()
            .expect("partition manager set")
            .clone())
    }

    /// Partitioned processing: drain pending priority work, then kick
    /// every lane off concurrently (unless externally driven).
    pub(crate) async fn process_partitioned(&self) -> RunCompletion {
        let manager = match self.partition_manager() {
            Ok(manager) => manager,
            Err(error) => {
                return RunCompletion {
                    error: Some(error),
                    cursor: self.snapshot(),
                }
            }
        };
        let work = self.manager_process(manager);
        self.with_timeout(work).await
    }

    async fn manager_process(
        &self,
        manager: Arc<PartitionManager>,
    ) -> EngineResult<CursorSnapshot> {
        if self.aborted() {
            return Ok(self.snapshot());
        }
        // priority work always runs to exhaustion first
        {
            let _gate = manager.gate().lock().await;
            if !manager.priority().lane.pool.is_empty() {
                self.drain(&manager.priority().lane).await?;
            }
        }
        if manager.external() {
            // lanes start only when the caller drives them
            return Ok(self.snapshot());
        }
        let mut tasks = Vec::new();
        for partition in manager.partitions() {
            let coords = partition.lane.snapshot();
            partition.lane.pool.push(Instruction::new(Command::Waterfall(
                WaterfallStep {
                    static_coords: Some(coords),
                    bootstrap: true,
                },
            )));
            let run = self.clone();
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                run.drain_partition(&manager, &partition).await
            }));
        }
        // one lane's error does not stop its siblings, but the first
        // error marks the completion unclean
        let mut first_error = None;
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::LaneFailed(join.to_string()));
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(self.snapshot()),
        }
    }

    /// Drain one lane, servicing the priority partition between steps.
    /// Awaiting the gate is the deferral: while another lane holds it,
    /// this lane makes no progress.
    pub(crate) async fn drain_partition(
        &self,
        manager: &PartitionManager,
        partition: &Partition,
    ) -> EngineResult<()> {
        loop {
            if self.aborted() {
                return Ok(());
            }
            {
                let _gate = manager.gate().lock().await;
                if !manager.priority().lane.pool.is_empty() {
                    self.drain(&manager.priority().lane).await?;
                }
            }
            let Some(instruction) = partition.lane.pool.shift() else {
                return Ok(());
            };
            match self.execute(&partition.lane, instruction).await {
                Ok(_) => {}
                Err(_) if self.aborted() => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Drive one lane's slice on demand: seek it to its start, seed its
    /// local scope, schedule its bootstrap, and drain it. This is the
    /// externally-driven mode; the manager never kicks these lanes off
    /// itself.
    #[tracing::instrument(level = "debug", skip(self, seed))]
    pub async fn run_single_partition(
        &self,
        index: usize,
        seed: Option<VariableScope>,
    ) -> RunCompletion {
        match self.drive_single_partition(index, seed).await {
            Ok(cursor) => RunCompletion {
                error: None,
                cursor,
            },
            Err(error) => RunCompletion {
                error: Some(error),
                cursor: self.snapshot(),
            },
        }
    }

    async fn drive_single_partition(
        &self,
        index: usize,
        seed: Option<VariableScope>,
    ) -> EngineResult<CursorSnapshot> {
        let manager = self.partition_manager()?;
        let partition = manager.get_or_create(self, index)?;
        if !self.shared.items.is_empty() {
            let mut cursor = partition.lane.cursor.lock().expect("lane cursor poisoned");
            cursor.seek(0, partition.layout.offset)?;
        }
        if let Some(seed) = seed {
            partition
                .lane
                .scopes
                .lock()
                .expect("lane scopes poisoned")
                .locals
                .merge(&seed);
        }
        partition.lane.started.store(false, Ordering::SeqCst);
        let coords = partition.lane.snapshot();
        let bootstrap = Instruction::new(Command::Waterfall(WaterfallStep {
            static_coords: Some(coords),
            bootstrap: true,
        }));
        let lane_index = partition.layout.index;
        bootstrap.on_done(Box::new(move |outcome| {
            tracing::debug!(
                lane = lane_index,
                position = outcome.coords.position,
                "single-partition bootstrap step done"
            );
        }));
        partition.lane.pool.push(bootstrap);
        self.drain_partition(&manager, &partition).await?;
        Ok(partition.lane.snapshot())
    }

    /// Clear a lane's pending work.
    pub fn stop_single_partition(&self, index: usize) -> EngineResult<()> {
        let manager = self.partition_manager()?;
        let partition = manager.get(index)?;
        partition.lane.pool.clear();
        Ok(())
    }

    /// Merge a lane's scopes back into the run's scopes, key by key.
    /// This is the only way lane-local mutations become visible outside
    /// the lane.
    pub fn update_partition_variables(&self, index: usize) -> EngineResult<()> {
        let manager = self.partition_manager()?;
        let partition = manager.get(index)?;
        let lane_scopes = partition
            .lane
            .scopes
            .lock()
            .expect("lane scopes poisoned")
            .clone();
        self.shared
            .default_lane
            .scopes
            .lock()
            .expect("run scopes poisoned")
            .merge_from(&lane_scopes);
        Ok(())
    }

    /// Clone of the run-level scopes.
    pub fn scopes(&self) -> relay_types::ScopeSet {
        self.shared
            .default_lane
            .scopes
            .lock()
            .expect("run scopes poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_types::{Item, RequestSpec};

    use crate::collab::testing::{ScriptedRunner, ScriptedTransport};
    use crate::run::{RunOptions, RunPlan};

    fn sizes(layouts: &[LaneLayout]) -> Vec<usize> {
        layouts.iter().map(|l| l.size).collect()
    }

    fn offsets(layouts: &[LaneLayout]) -> Vec<usize> {
        layouts.iter().map(|l| l.offset).collect()
    }

    #[rstest::rstest]
    #[case(11, 3, vec![4, 4, 3], vec![0, 4, 8])]
    #[case(2, 5, vec![1, 1], vec![0, 1])]
    #[case(8, 4, vec![2, 2, 2, 2], vec![0, 2, 4, 6])]
    #[case(1, 8, vec![1], vec![0])]
    fn layouts_split_evenly(
        #[case] iterations: usize,
        #[case] concurrency: usize,
        #[case] expected_sizes: Vec<usize>,
        #[case] expected_offsets: Vec<usize>,
    ) {
        let layouts = lane_layouts(iterations, concurrency);
        assert_eq!(sizes(&layouts), expected_sizes);
        assert_eq!(offsets(&layouts), expected_offsets);
    }

    #[test]
    fn no_iterations_no_lanes() {
        assert!(lane_layouts(0, 4).is_empty());
    }

    fn partitioned_run(iterations: usize, concurrency: usize) -> Run {
        let items = vec![
            Item::new("a", "alpha", RequestSpec::new("GET", "http://x/a")),
            Item::new("b", "bravo", RequestSpec::new("GET", "http://x/b")),
        ];
        let plan = RunPlan {
            items,
            options: RunOptions {
                iteration_count: iterations,
                max_concurrency: concurrency,
                ..Default::default()
            },
            ..Default::default()
        };
        Run::new(
            plan,
            Arc::new(ScriptedRunner::new()),
            Arc::new(ScriptedTransport::new()),
        )
    }

    #[test]
    fn lane_cursors_start_at_their_offset() {
        let run = partitioned_run(5, 2);
        let manager = run.partition_manager().expect("manager");
        let partitions = manager.partitions();
        assert_eq!(partitions.len(), 2);
        let first = partitions[0].snapshot();
        let second = partitions[1].snapshot();
        assert_eq!(first.iteration, 0);
        assert_eq!(first.partition_cycles, Some(3));
        assert_eq!(second.iteration, 3);
        assert_eq!(second.partition_index, Some(1));
        assert_eq!(second.partition_cycles, Some(2));
    }

    #[test]
    fn schedule_routes_on_partition_index() {
        let run = partitioned_run(4, 2);
        let manager = run.partition_manager().expect("manager");
        let target = manager.partitions()[1].clone();

        let coords = target.snapshot();
        manager
            .schedule(
                Command::Waterfall(WaterfallStep {
                    static_coords: Some(coords),
                    bootstrap: false,
                }),
                false,
            )
            .expect("schedule");
        assert_eq!(target.lane.pool.len(), 1);
        assert!(manager.priority().lane.pool.is_empty());

        manager.schedule(Command::Pause, true).expect("schedule");
        assert_eq!(manager.priority().lane.pool.len(), 1);
    }

    #[test]
    fn schedule_without_coordinate_is_rejected() {
        let run = partitioned_run(4, 2);
        let manager = run.partition_manager().expect("manager");
        assert!(manager.schedule(Command::Pause, false).is_err());
    }

    #[test]
    fn single_lane_run_has_no_manager() {
        let run = partitioned_run(4, 1);
        assert!(run.partition_manager().is_err());
    }
}
