use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lintune_core::{
    EngineConfig, EngineError, OperatorInput, StepEvent, StepEventKind, StepId, StepOutcome,
    StepRecord, SystemStatus,
};
use tracing::{debug, error, info, warn};

use crate::backup::BackupVault;
use crate::host::HostServices;
use crate::journal::{JournalState, RunJournal};
use crate::probe::StateProbe;
use crate::steps::{MutationStep, StepContext};
use crate::HostLayout;

/// Receives every step transition and every streamed output line.
pub trait ProgressSink {
    fn event(&mut self, event: &StepEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&StepEvent),
{
    fn event(&mut self, event: &StepEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn event(&mut self, _event: &StepEvent) {}
}

/// Shared cancellation request, honored only between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcomes of one ordered run, in step order.
#[derive(Debug, Default)]
pub struct InstallationRun {
    pub run_id: Option<String>,
    pub records: Vec<StepRecord>,
    pub last_attempted: Option<StepId>,
    pub cancelled: bool,
}

impl InstallationRun {
    pub fn failure(&self) -> Option<&StepRecord> {
        self.records.iter().find(|record| record.outcome.is_failed())
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failure().is_none()
    }

    pub fn outcome(&self, id: StepId) -> Option<&StepOutcome> {
        self.records
            .iter()
            .find(|record| record.id == id)
            .map(|record| &record.outcome)
    }
}

pub struct StepExecutor<'a> {
    layout: &'a HostLayout,
    config: &'a EngineConfig,
    host: &'a HostServices,
    cancel: CancelFlag,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        layout: &'a HostLayout,
        config: &'a EngineConfig,
        host: &'a HostServices,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            layout,
            config,
            host,
            cancel,
        }
    }

    fn probe(&self) -> SystemStatus {
        StateProbe::new(self.layout, self.config, self.host).probe()
    }

    /// Runs `steps` in the given order, halting at the first failure of a
    /// required step. Steps after a halt or a cancellation are reported as
    /// not attempted.
    pub fn run_all(
        &self,
        steps: &[MutationStep],
        input: &OperatorInput,
        sink: &mut dyn ProgressSink,
    ) -> InstallationRun {
        let mut journal = self.open_journal();
        let mut run = InstallationRun {
            run_id: journal.as_ref().map(|journal| journal.run_id().to_string()),
            ..InstallationRun::default()
        };

        let mut halted = false;
        for step in steps {
            if !halted && self.cancel.is_cancelled() {
                info!(step = %step.id, "cancellation requested; stopping before step");
                run.cancelled = true;
                halted = true;
            }
            if halted {
                debug!(step = %step.id, "not attempted");
                sink.event(&StepEvent::new(
                    step.id,
                    StepEventKind::NotAttempted,
                    "not attempted",
                ));
                run.records.push(StepRecord {
                    id: step.id,
                    outcome: StepOutcome::NotAttempted,
                });
                continue;
            }

            run.last_attempted = Some(step.id);
            let outcome = self.execute(step, input, sink, journal.as_mut());
            if outcome.is_failed() && step.required {
                warn!(step = %step.id, "required step failed; halting run");
                halted = true;
            }
            run.records.push(StepRecord {
                id: step.id,
                outcome,
            });
        }

        if let Some(journal) = journal {
            if let Err(err) = journal.finish() {
                warn!(error = %format!("{err:#}"), "failed to close run journal");
            }
        }
        run
    }

    /// Runs a single step with the same semantics, without ordering checks
    /// beyond the step's own prerequisites.
    pub fn run_one(
        &self,
        step: &MutationStep,
        input: &OperatorInput,
        sink: &mut dyn ProgressSink,
    ) -> StepRecord {
        let mut journal = self.open_journal();
        let outcome = self.execute(step, input, sink, journal.as_mut());
        if let Some(journal) = journal {
            if let Err(err) = journal.finish() {
                warn!(error = %format!("{err:#}"), "failed to close run journal");
            }
        }
        StepRecord {
            id: step.id,
            outcome,
        }
    }

    fn open_journal(&self) -> Option<RunJournal<'a>> {
        RunJournal::begin(self.layout)
            .map_err(|err| {
                warn!(error = %format!("{err:#}"), "continuing without a run journal");
            })
            .ok()
    }

    fn execute(
        &self,
        step: &MutationStep,
        input: &OperatorInput,
        sink: &mut dyn ProgressSink,
        mut journal: Option<&mut RunJournal<'a>>,
    ) -> StepOutcome {
        let mut status = self.probe();
        // The probe reads this run's own journal; carry over what the
        // replaced marker recorded.
        if status.interrupted_step.is_none() {
            status.interrupted_step = journal.as_ref().and_then(|journal| journal.interrupted());
        }
        let (satisfied, missing) = {
            let ctx = self.context(step.id, input, &status, sink);
            let satisfied = (step.precondition)(&ctx);
            let missing = if satisfied {
                None
            } else {
                step.missing_dependency(&ctx)
            };
            (satisfied, missing)
        };

        if satisfied {
            info!(step = %step.id, "already satisfied");
            sink.event(&StepEvent::new(step.id, StepEventKind::Skipped, "already satisfied"));
            record(&mut journal, step.id, JournalState::Skipped);
            return StepOutcome::Skipped;
        }
        if let Some(requires) = missing {
            return self.fail(
                step,
                sink,
                &mut journal,
                EngineError::DependencyMissing {
                    step: step.id,
                    requires,
                },
            );
        }

        info!(step = %step.id, "applying: {}", step.description);
        sink.event(&StepEvent::new(step.id, StepEventKind::Started, step.description));
        record(&mut journal, step.id, JournalState::Started);

        let vault = BackupVault::new(self.layout);
        for path in (step.protected_paths)(self.layout) {
            if let Err(err) = vault.ensure_backed(&path) {
                return self.fail(step, sink, &mut journal, err);
            }
        }

        let (applied, warnings) = {
            let mut ctx = self.context(step.id, input, &status, sink);
            let applied = (step.apply)(&mut ctx);
            (applied, ctx.into_warnings())
        };
        if let Err(err) = applied {
            return self.fail(step, sink, &mut journal, err);
        }

        let after = self.probe();
        let converged = {
            let ctx = self.context(step.id, input, &after, sink);
            (step.precondition)(&ctx)
        };
        if !converged {
            return self.fail(step, sink, &mut journal, EngineError::NotConverged(step.id));
        }

        info!(step = %step.id, "succeeded");
        sink.event(&StepEvent::new(step.id, StepEventKind::Succeeded, "done"));
        record(&mut journal, step.id, JournalState::Succeeded);
        StepOutcome::Succeeded { warnings }
    }

    fn context<'s>(
        &'s self,
        step: StepId,
        input: &'s OperatorInput,
        status: &'s SystemStatus,
        sink: &'s mut dyn ProgressSink,
    ) -> StepContext<'s> {
        StepContext::new(step, self.layout, self.config, self.host, input, status, sink)
    }

    fn fail(
        &self,
        step: &MutationStep,
        sink: &mut dyn ProgressSink,
        journal: &mut Option<&mut RunJournal<'a>>,
        err: EngineError,
    ) -> StepOutcome {
        error!(step = %step.id, error = %err, "step failed");
        sink.event(&StepEvent::new(step.id, StepEventKind::Failed, err.to_string()));
        record(journal, step.id, JournalState::Failed);
        StepOutcome::Failed(err)
    }
}

fn record(journal: &mut Option<&mut RunJournal<'_>>, step: StepId, state: JournalState) {
    if let Some(journal) = journal.as_mut() {
        if let Err(err) = journal.record(step, state) {
            warn!(step = %step, error = %format!("{err:#}"), "failed to append run journal");
        }
    }
}
