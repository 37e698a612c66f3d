//! Offload Protocol - Suspending an Interaction Across the Job Runner
//!
//! A heavy phase function runs as a job instead of on the request
//! thread. The engine parks the tree (`busy` + placeholder persisted
//! first), the job snapshots its inputs under a short lock, does the
//! slow work off-lock, then writes the result back and runs the
//! remaining phases. Delivery is at-least-once, so every writeback
//! checks whether an earlier attempt already completed.

use crate::lifecycle::Engine;
use crate::store::SessionHandle;
use anyhow::Context;
use async_trait::async_trait;
use trellis_core::phase::{GrowthFn, GrowthInput, PhaseFn};
use trellis_core::{Direction, PhaseKind, Step, StepId};
use trellis_job::Job;
use uuid::Uuid;

/// Continuation token: where the suspended interaction picks up once
/// the heavy function has produced its result.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Resume {
    /// Re-enter the phase list at `index` (the heavy function itself).
    Phase {
        kind: PhaseKind,
        index: usize,
        direction: Direction,
    },
    /// Grow `step`'s nested branch, then finish navigating.
    Growth { step: StepId, direction: Direction },
}

/// What the job extracted under the lock before computing off-lock.
enum Work {
    Growth {
        growth: GrowthFn,
        input: GrowthInput,
        step: StepId,
        direction: Direction,
    },
    /// Branch already attached by a previous attempt; only the
    /// navigation tail is outstanding.
    GrowthAttached { direction: Direction },
    Phase {
        f: PhaseFn,
        scratch: Step,
        kind: PhaseKind,
        index: usize,
        direction: Direction,
    },
    /// An earlier attempt finished everything.
    Done,
}

pub(crate) struct OffloadJob {
    pub engine: Engine,
    pub session: Uuid,
    pub entry: String,
    pub resume: Resume,
}

#[async_trait]
impl Job for OffloadJob {
    fn describe(&self) -> String {
        format!("offload:{}:{}", self.session, self.entry)
    }

    async fn run(&self) -> anyhow::Result<()> {
        let handle = self
            .engine
            .store()
            .get(self.session)
            .with_context(|| format!("session {} gone", self.session))?;

        let work = self.snapshot(&handle)?;

        match work {
            Work::Done => Ok(()),
            Work::GrowthAttached { direction } => {
                let mut guard = handle.lock();
                let _ = self.engine.run_post_phases(
                    &mut guard,
                    &self.entry,
                    direction,
                    PhaseKind::Navigate,
                    usize::MAX,
                );
                Ok(())
            }
            Work::Growth {
                growth,
                input,
                step,
                direction,
            } => {
                let result = tokio::task::spawn_blocking(move || growth.call(&input))
                    .await
                    .context("growth worker panicked")?;

                let mut guard = handle.lock();
                if !guard.tree(&self.entry).is_some_and(|t| t.busy) {
                    return Ok(());
                }
                match result {
                    Ok(spec) => {
                        // Idempotent: a re-delivered result reuses the
                        // branch a previous attempt attached.
                        guard
                            .tree_mut(&self.entry)
                            .expect("tree checked")
                            .attach_children(step, spec);
                        let _ = self.engine.run_post_phases(
                            &mut guard,
                            &self.entry,
                            direction,
                            PhaseKind::Navigate,
                            usize::MAX,
                        );
                    }
                    Err(err) => {
                        let _ = self.engine.fail(&mut guard, &self.entry, "growth", err);
                    }
                }
                Ok(())
            }
            Work::Phase {
                f,
                mut scratch,
                kind,
                index,
                direction,
            } => {
                let name = f.name.clone();
                let result = tokio::task::spawn_blocking(move || {
                    f.call(&mut scratch).map(|_| scratch)
                })
                .await
                .context("phase worker panicked")?;

                let mut guard = handle.lock();
                if !guard.tree(&self.entry).is_some_and(|t| t.busy) {
                    return Ok(());
                }
                match result {
                    Ok(scratch) => {
                        // Phase functions only mutate their own step;
                        // write those mutations back.
                        let tree = guard.tree_mut(&self.entry).expect("tree checked");
                        let cursor = tree.cursor();
                        let step = tree.step_mut(cursor);
                        step.elements = scratch.elements;
                        step.feedback = scratch.feedback;

                        let _ = match kind {
                            PhaseKind::Compile => {
                                self.engine.run_compile(&mut guard, &self.entry, index + 1)
                            }
                            _ => self.engine.run_post_phases(
                                &mut guard,
                                &self.entry,
                                direction,
                                kind,
                                index + 1,
                            ),
                        };
                    }
                    Err(err) => {
                        let _ = self.engine.fail(&mut guard, &self.entry, &name, err);
                    }
                }
                Ok(())
            }
        }
    }
}

impl OffloadJob {
    /// Clone the heavy function and its inputs under a short lock.
    fn snapshot(&self, handle: &SessionHandle) -> anyhow::Result<Work> {
        let guard = handle.lock();
        let Some(tree) = guard.tree(&self.entry) else {
            return Ok(Work::Done);
        };
        if !tree.busy {
            // A previous attempt ran to completion.
            return Ok(Work::Done);
        }
        match self.resume {
            Resume::Growth { step, direction } => {
                let s = tree.step(step);
                if s.children.is_some() {
                    return Ok(Work::GrowthAttached { direction });
                }
                let growth = s
                    .growth
                    .clone()
                    .context("offloaded step has no growth function")?;
                Ok(Work::Growth {
                    growth,
                    input: tree.growth_input(step),
                    step,
                    direction,
                })
            }
            Resume::Phase {
                kind,
                index,
                direction,
            } => {
                let cursor = tree.cursor();
                let step = tree.step(cursor);
                let list = match kind {
                    PhaseKind::Compile => &step.phases.compile,
                    PhaseKind::Submit => &step.phases.submit,
                    PhaseKind::Navigate => &step.phases.navigate,
                    PhaseKind::Validate => {
                        anyhow::bail!("validate functions are never offloaded")
                    }
                };
                let f = list
                    .get(index)
                    .cloned()
                    .with_context(|| format!("{kind} phase index {index} out of range"))?;
                Ok(Work::Phase {
                    f,
                    scratch: step.clone(),
                    kind,
                    index,
                    direction,
                })
            }
        }
    }
}
