//! The waterfall state machine — linear item sequencing over the cursor.
//!
//! Each waterfall step resolves its coordinate (pre-resolved, or derived
//! from the lane cursor with `whatnext`), emits the iteration boundary
//! notifications, and schedules the item chain as three queued
//! instructions: prerequest → request → test. The test stage closes the
//! item, resolves any jump directive the scripts left, and re-queues the
//! waterfall. States are fully described by the cursor; this module is
//! the transition function.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_types::{
    CursorSnapshot, EventKind, Item, NextDirective, ScriptContext, ScriptJob, ScriptPolicies,
    ScriptResult, TransportJob,
};

use crate::cursor::Cursor;
use crate::error::{EngineError, EngineResult};
use crate::instruction::{Command, Instruction, ItemStage, StepOutcome, WaterfallStep};
use crate::observer::Observer;
use crate::run::{Lane, Run};

/// Jump lookup over the original item list: by id, then by name, then by
/// positional literal. Built lazily on the first directive.
pub(crate) struct ItemLookup {
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl ItemLookup {
    pub(crate) fn build(items: &[Arc<Item>]) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (index, item) in items.iter().enumerate() {
            // duplicates resolve to the first occurrence
            by_id.entry(item.id.clone()).or_insert(index);
            by_name.entry(item.name.clone()).or_insert(index);
        }
        Self { by_id, by_name }
    }

    pub(crate) fn resolve(&self, directive: &str, length: usize) -> Option<usize> {
        if let Some(&index) = self.by_id.get(directive) {
            return Some(index);
        }
        if let Some(&index) = self.by_name.get(directive) {
            return Some(index);
        }
        directive.parse::<usize>().ok().filter(|&index| index < length)
    }
}

/// First script-level error message across hook results.
fn first_script_error(results: &[ScriptResult]) -> Option<String> {
    results.iter().find_map(|result| result.error.clone())
}

impl Run {
    /// Processor for [`Command::Waterfall`].
    pub(crate) async fn waterfall(
        &self,
        lane: &Lane,
        step: WaterfallStep,
    ) -> EngineResult<StepOutcome> {
        let observer = self.observer();
        if let Some(coords) = step.static_coords {
            // pre-resolved coordinate: execute exactly here
            if coords.empty {
                return Ok(StepOutcome { coords });
            }
            if step.bootstrap
                && !lane
                    .started
                    .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                observer.before_iteration(None, &coords);
            }
            return self.begin_item(lane, &observer, coords);
        }

        let previous = lane.snapshot();
        let advance = Cursor::whatnext(&previous);
        if advance.coords.empty {
            return Ok(StepOutcome {
                coords: advance.coords,
            });
        }
        if advance.eof {
            // last iteration finished; schedule nothing further
            observer.iteration(None, &previous);
            return Ok(StepOutcome { coords: previous });
        }
        if advance.cr {
            observer.iteration(None, &previous);
            observer.before_iteration(None, &advance.coords);
        }
        {
            let mut cursor = lane.cursor.lock().expect("lane cursor poisoned");
            cursor.seek(advance.coords.position, advance.coords.iteration)?;
        }
        self.begin_item(lane, &observer, advance.coords)
    }

    /// Open an item: notify and queue the first chain stage.
    fn begin_item(
        &self,
        lane: &Lane,
        observer: &Arc<dyn Observer>,
        coords: CursorSnapshot,
    ) -> EngineResult<StepOutcome> {
        let item = self.item_at(coords.position)?;
        observer.before_item(None, &coords, &item);
        lane.pool.push(Instruction::new(Command::Prerequest(ItemStage::new(
            coords.clone(),
        ))));
        Ok(StepOutcome { coords })
    }

    /// Processor for [`Command::Prerequest`]: run the pre-work hooks,
    /// then queue the request stage.
    pub(crate) async fn prerequest(
        &self,
        lane: &Lane,
        mut stage: ItemStage,
    ) -> EngineResult<StepOutcome> {
        let item = self.item_at(stage.coords.position)?;
        let observer = self.observer();
        observer.before_prerequest(None, &stage.coords, &item);
        let job = self.script_job(lane, EventKind::Prerequest, &item, &stage);
        let results = match self.shared.scripts.run(job).await {
            Err(error) => {
                observer.prerequest(Some(&error), &stage.coords, &item, &[]);
                return Err(error);
            }
            Ok(results) => results,
        };
        self.apply_tracked(lane, &results);
        if let Some(request) = results
            .iter()
            .rev()
            .find_map(|result| result.context.request.clone())
        {
            stage.request = Some(request);
        }
        observer.prerequest(None, &stage.coords, &item, &results);
        if let Some(message) = first_script_error(&results) {
            if self.shared.options.abort_on_failure {
                self.abort();
                return Ok(StepOutcome {
                    coords: stage.coords,
                });
            }
            if self.shared.options.stop_on_error {
                return Err(EngineError::Script {
                    event: EventKind::Prerequest,
                    message,
                });
            }
            stage.failed = true;
        }
        let coords = stage.coords.clone();
        lane.pool.push(Instruction::new(Command::Request(stage)));
        Ok(StepOutcome { coords })
    }

    /// Processor for [`Command::Request`]: perform the exchange, then
    /// queue the test stage.
    pub(crate) async fn request(
        &self,
        lane: &Lane,
        mut stage: ItemStage,
    ) -> EngineResult<StepOutcome> {
        let item = self.item_at(stage.coords.position)?;
        let item = match stage.request.take() {
            // a prerequest hook rewrote the request; send the rewritten one
            Some(request) => Arc::new(Item {
                request,
                ..(*item).clone()
            }),
            None => item,
        };
        let job = {
            let scopes = lane.scopes.lock().expect("lane scopes poisoned").clone();
            TransportJob {
                item: item.clone(),
                environment: scopes.environment,
                globals: scopes.globals,
                data: self
                    .shared
                    .data
                    .row(stage.coords.iteration)
                    .cloned()
                    .unwrap_or_default(),
                coords: stage.coords.clone(),
            }
        };
        match self.shared.transport.send(job).await {
            Ok(exchange) => {
                stage.exchange = Some(exchange);
            }
            Err(error) => {
                tracing::debug!(%error, "request stage failed");
                if self.shared.options.abort_on_failure {
                    self.abort();
                    return Ok(StepOutcome {
                        coords: stage.coords,
                    });
                }
                if self.shared.options.stop_on_error {
                    return Err(error);
                }
                // the test stage still runs, with no response in context
                stage.failed = true;
            }
        }
        let coords = stage.coords.clone();
        lane.pool.push(Instruction::new(Command::Test(stage)));
        Ok(StepOutcome { coords })
    }

    /// Processor for [`Command::Test`]: run the post-work hooks, close
    /// the item, resolve routing, and re-queue the waterfall.
    pub(crate) async fn test(&self, lane: &Lane, stage: ItemStage) -> EngineResult<StepOutcome> {
        let item = self.item_at(stage.coords.position)?;
        let observer = self.observer();
        observer.before_test(None, &stage.coords, &item);
        let job = self.script_job(lane, EventKind::Test, &item, &stage);
        let results = match self.shared.scripts.run(job).await {
            Err(error) => {
                observer.test(Some(&error), &stage.coords, &item, &[]);
                return Err(error);
            }
            Ok(results) => results,
        };
        self.apply_tracked(lane, &results);
        observer.test(None, &stage.coords, &item, &results);

        let script_error = first_script_error(&results);
        let failed_assertion = results
            .iter()
            .flat_map(|result| result.context.assertions.iter())
            .find(|assertion| !assertion.passed);
        let error = match (&script_error, failed_assertion) {
            (Some(message), _) if self.shared.options.stop_on_error => {
                Some(EngineError::Script {
                    event: EventKind::Test,
                    message: message.clone(),
                })
            }
            (None, Some(assertion)) if self.shared.options.stop_on_failure => {
                Some(EngineError::AssertionFailed(assertion.name.clone()))
            }
            _ => None,
        };
        observer.item(error.as_ref(), &stage.coords, &item);

        if (script_error.is_some() || failed_assertion.is_some())
            && self.shared.options.abort_on_failure
        {
            self.abort();
            return Ok(StepOutcome {
                coords: stage.coords,
            });
        }
        if let Some(error) = error {
            return Err(error);
        }

        // routing: honor a jump directive unless disabled, last one wins
        let directive = results.iter().fold(NextDirective::Unset, |acc, result| {
            if result.context.next_request.is_set() {
                result.context.next_request.clone()
            } else {
                acc
            }
        });
        self.route_next(lane, &stage.coords, directive)?;
        Ok(StepOutcome {
            coords: stage.coords,
        })
    }

    /// Seek the cursor per the jump directive and re-queue the waterfall,
    /// routing through the delay command when inter-step delays are set.
    fn route_next(
        &self,
        lane: &Lane,
        coords: &CursorSnapshot,
        directive: NextDirective,
    ) -> EngineResult<()> {
        let mut static_next: Option<CursorSnapshot> = None;
        if !self.shared.options.disable_set_next {
            if let NextDirective::Target(target) = &directive {
                match self.lookup().resolve(target, self.shared.items.len()) {
                    Some(position) => {
                        // land the next step exactly on the target: seek one
                        // short and let whatnext advance into it
                        let outcome = lane
                            .cursor
                            .lock()
                            .expect("lane cursor poisoned")
                            .seek_signed(position as i64 - 1, coords.iteration as i64)?;
                        if outcome.to_start {
                            // the target is the very first item: execute
                            // position 0 of this iteration directly instead of
                            // deriving it from a rolled-over coordinate
                            static_next = Some(lane.snapshot());
                        }
                        tracing::debug!(directive = %target, position, "jump directive resolved");
                    }
                    None => {
                        // unknown target ends this iteration
                        tracing::debug!(directive = %target, "jump directive did not resolve; ending iteration");
                        lane.cursor
                            .lock()
                            .expect("lane cursor poisoned")
                            .seek(self.shared.items.len() - 1, coords.iteration)?;
                    }
                }
            }
        }
        let wait = if static_next.is_some() {
            self.shared.options.delay.item
        } else {
            let advance = Cursor::whatnext(&lane.snapshot());
            if advance.eof {
                Duration::ZERO
            } else if advance.cr {
                self.shared.options.delay.iteration
            } else {
                self.shared.options.delay.item
            }
        };
        self.schedule_after(
            lane,
            wait,
            Command::Waterfall(WaterfallStep {
                static_coords: static_next,
                bootstrap: false,
            }),
        );
        Ok(())
    }

    /// Build the script job for one stage from the lane's current state.
    fn script_job(
        &self,
        lane: &Lane,
        kind: EventKind,
        item: &Arc<Item>,
        stage: &ItemStage,
    ) -> ScriptJob {
        let scopes = lane.scopes.lock().expect("lane scopes poisoned").clone();
        let data = self
            .shared
            .data
            .row(stage.coords.iteration)
            .cloned()
            .unwrap_or_default();
        let request = stage
            .exchange
            .as_ref()
            .map(|exchange| exchange.request.clone())
            .or_else(|| stage.request.clone())
            .unwrap_or_else(|| item.request.clone());
        ScriptJob {
            name: kind,
            item: item.clone(),
            context: ScriptContext {
                environment: scopes.environment,
                globals: scopes.globals,
                collection: scopes.collection,
                locals: scopes.locals,
                data,
                request: Some(request),
                response: stage
                    .exchange
                    .as_ref()
                    .map(|exchange| exchange.response.clone()),
            },
            coords: stage.coords.clone(),
            policies: ScriptPolicies {
                stop_on_script_error: self.shared.options.stop_on_error,
                stop_on_failure: self.shared.options.stop_on_failure,
                abort_on_failure: self.shared.options.abort_on_failure,
            },
        }
    }

    /// Fold the tracked context of each hook result into the lane's
    /// scopes. `Some` replaces the lane's copy of that scope.
    fn apply_tracked(&self, lane: &Lane, results: &[ScriptResult]) {
        let mut scopes = lane.scopes.lock().expect("lane scopes poisoned");
        for result in results {
            let tracked = &result.context;
            if let Some(environment) = &tracked.environment {
                scopes.environment = environment.clone();
            }
            if let Some(globals) = &tracked.globals {
                scopes.globals = globals.clone();
            }
            if let Some(collection) = &tracked.collection {
                scopes.collection = collection.clone();
            }
            if let Some(locals) = &tracked.locals {
                scopes.locals = locals.clone();
            }
        }
    }
}
