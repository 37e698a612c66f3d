//! Lifecycle Engine - One HTTP Interaction as a Phase Sequence
//!
//! GET: compile -> render (cached, idempotent on refresh).
//! POST: record -> validate -> submit -> navigate -> redirect.
//!
//! Any phase function may be tagged heavy; the engine then suspends the
//! interaction across the job runner instead of blocking the request
//! thread (see `offload`). The tree's `busy` flag is the sole
//! concurrency-control primitive: while set, every interaction takes
//! the read-only placeholder path.

use crate::config::EngineConfig;
use crate::offload::{OffloadJob, Resume};
use crate::render::Renderer;
use crate::store::{SessionHandle, SessionStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use trellis_core::arena::EmptyRoot;
use trellis_core::{
    BranchSpec, CachedView, Direction, PhaseKind, Session, StepId, Table, Tree, Verb, advance,
    retreat,
};
use trellis_job::JobRunner;

/// What the transport layer should send back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// Rendered markup for the current step.
    Page(String),
    /// Transient placeholder; an offloaded phase is still running.
    Working(String),
    /// Re-fetch the entry point with GET (post/redirect/get).
    Redirect,
    /// Fixed error view; the session is marked failed.
    Failure(String),
}

/// Decoded POST body.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    pub direction: Direction,
    /// Identity of the step the client believes it is submitting;
    /// a mismatch with the cursor marks the request stale.
    pub step_token: Option<String>,
    /// One raw value per visible element, keyed by variable name.
    pub values: HashMap<String, String>,
}

/// One HTTP interaction, stripped of transport detail.
#[derive(Debug, Clone)]
pub enum Interaction {
    Get,
    Post(FormData),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no tree for entry point '{0}'")]
    UnknownEntry(String),

    #[error(transparent)]
    EmptyRoot(#[from] EmptyRoot),
}

struct EngineInner {
    store: Arc<dyn SessionStore>,
    renderer: Arc<dyn Renderer>,
    jobs: JobRunner,
    config: EngineConfig,
}

/// The lifecycle engine. Cheap to clone; clones share store, renderer
/// and job queue.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        renderer: Arc<dyn Renderer>,
        jobs: JobRunner,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                renderer,
                jobs,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub fn jobs(&self) -> &JobRunner {
        &self.inner.jobs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Create the entry point's tree on first visit. Later calls are
    /// no-ops; the factory is not invoked again.
    pub fn ensure_tree<F>(
        &self,
        handle: &SessionHandle,
        entry: &str,
        root: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce() -> BranchSpec,
    {
        let mut session = handle.lock();
        if session.trees.contains_key(entry) {
            return Ok(());
        }
        let tree = Tree::new(root())?;
        tracing::info!(session = %session.id, entry, tree = %tree.id, "planted flow tree");
        session.trees.insert(entry.to_string(), tree);
        self.persist(&session);
        Ok(())
    }

    /// Drive one interaction through its phases.
    pub fn process(
        &self,
        handle: &SessionHandle,
        entry: &str,
        interaction: Interaction,
    ) -> Result<View, EngineError> {
        let mut session = handle.lock();
        if session.tree(entry).is_none() {
            return Err(EngineError::UnknownEntry(entry.to_string()));
        }
        session.touch();

        let verb = match &interaction {
            Interaction::Get => "GET",
            Interaction::Post(_) => "POST",
        };
        let span =
            tracing::info_span!("Interaction", session = %session.id, entry, verb);
        let _guard = span.enter();

        let view = match interaction {
            Interaction::Get => self.handle_get(&mut session, entry),
            Interaction::Post(form) => self.handle_post(&mut session, entry, form),
        };
        Ok(view)
    }

    /// Aggregate the entry point's tree. Reads through the same handle
    /// the engine uses, so it is safe at any time, including mid-flow.
    pub fn collect(&self, handle: &SessionHandle, entry: &str) -> Result<Table, EngineError> {
        let session = handle.lock();
        let tree = session
            .tree(entry)
            .ok_or_else(|| EngineError::UnknownEntry(entry.to_string()))?;
        Ok(Table::collect(tree))
    }

    // ---- GET ----

    fn handle_get(&self, session: &mut Session, entry: &str) -> View {
        if session.failed {
            return View::Failure(self.inner.renderer.failure());
        }
        {
            let tree = session.tree(entry).expect("checked by process");
            if tree.busy {
                let markup = self.cached_or_working(tree);
                return View::Working(markup);
            }
            // Refresh: a GET right after a GET for the same step is
            // answered from the cache, verbatim.
            if tree.last_verb == Some(Verb::Get) {
                if let Some(cached) = &tree.cached {
                    if cached.step == tree.cursor() {
                        return View::Page(cached.markup.clone());
                    }
                }
            }
        }
        session.tree_mut(entry).expect("checked").busy = true;
        self.run_compile(session, entry, 0)
    }

    /// Compile-phase functions from `start` onward, then render and
    /// cache. Also the re-entry point after an offloaded compile
    /// function completes.
    pub(crate) fn run_compile(&self, session: &mut Session, entry: &str, start: usize) -> View {
        let (cursor, fns) = {
            let tree = session.tree(entry).expect("checked");
            let cursor = tree.cursor();
            (cursor, tree.step(cursor).phases.compile.clone())
        };
        for (index, f) in fns.iter().enumerate().skip(start) {
            if f.heavy {
                return self.offload(
                    session,
                    entry,
                    Resume::Phase {
                        kind: PhaseKind::Compile,
                        index,
                        direction: Direction::Forward,
                    },
                );
            }
            let result = f.call(session.tree_mut(entry).expect("checked").step_mut(cursor));
            if let Err(err) = result {
                return self.fail(session, entry, &f.name, err);
            }
        }

        let now = Utc::now();
        let tree = session.tree_mut(entry).expect("checked");
        for el in &mut tree.step_mut(cursor).elements {
            el.start_timer(now);
        }
        let position = tree.position(cursor);
        let markup = self.inner.renderer.render(tree.step(cursor), &position);
        tree.cached = Some(CachedView {
            step: cursor,
            markup: markup.clone(),
        });
        tree.last_verb = Some(Verb::Get);
        tree.busy = false;
        self.persist(session);
        View::Page(markup)
    }

    // ---- POST ----

    fn handle_post(&self, session: &mut Session, entry: &str, form: FormData) -> View {
        if session.failed {
            return View::Failure(self.inner.renderer.failure());
        }
        {
            let tree = session.tree(entry).expect("checked");
            if tree.busy {
                return View::Working(self.cached_or_working(tree));
            }
            let cursor = tree.cursor();
            let token_mismatch = form
                .step_token
                .as_deref()
                .is_some_and(|t| StepId::parse(t) != Some(cursor));
            // A POST right after a POST is a duplicate submit, except
            // when the previous one bounced with validation feedback.
            let duplicate =
                tree.last_verb == Some(Verb::Post) && tree.step(cursor).feedback.is_none();
            if token_mismatch || duplicate {
                tracing::debug!(position = %tree.position(cursor), "stale submission, replaying cached view");
                return View::Page(self.cached_or_working(tree));
            }
        }

        let tree = session.tree_mut(entry).expect("checked");
        tree.busy = true;
        tree.last_verb = Some(Verb::Post);
        let cursor = tree.cursor();

        // Record submitted values.
        let step = tree.step_mut(cursor);
        let mut failure = None;
        for el in &mut step.elements {
            let Some(name) = el.name.clone() else { continue };
            if !el.takes_input() {
                continue;
            }
            if let Some(raw) = form.values.get(&name) {
                if let Err(f) = el.record(raw) {
                    failure = Some(f);
                    break;
                }
            }
        }

        // Validate, stopping at the first failure.
        if failure.is_none() {
            for v in step.phases.validate.clone() {
                if let Err(f) = v.call(step) {
                    failure = Some(f);
                    break;
                }
            }
        }

        if let Some(f) = failure {
            tracing::debug!(element = ?f.element, message = %f.message, "validation failed");
            step.feedback = Some(f);
            let position = tree.position(cursor);
            let markup = self.inner.renderer.render(tree.step(cursor), &position);
            tree.cached = Some(CachedView {
                step: cursor,
                markup: markup.clone(),
            });
            tree.busy = false;
            self.persist(session);
            return View::Page(markup);
        }
        step.feedback = None;

        self.run_post_phases(session, entry, form.direction, PhaseKind::Submit, 0)
    }

    /// Submit- and navigate-phase functions, then the cursor move.
    /// Also the re-entry point after an offloaded submit/navigate
    /// function (or growth function) completes.
    pub(crate) fn run_post_phases(
        &self,
        session: &mut Session,
        entry: &str,
        direction: Direction,
        phase: PhaseKind,
        start: usize,
    ) -> View {
        let mut phase = phase;
        let mut start = start;

        for kind in [PhaseKind::Submit, PhaseKind::Navigate] {
            if phase != kind {
                continue;
            }
            let (cursor, fns) = {
                let tree = session.tree(entry).expect("checked");
                let cursor = tree.cursor();
                let step = tree.step(cursor);
                let fns = match kind {
                    PhaseKind::Submit => step.phases.submit.clone(),
                    _ => step.phases.navigate.clone(),
                };
                (cursor, fns)
            };
            for (index, f) in fns.iter().enumerate().skip(start) {
                if f.heavy {
                    return self.offload(session, entry, Resume::Phase { kind, index, direction });
                }
                let result = f.call(session.tree_mut(entry).expect("checked").step_mut(cursor));
                if let Err(err) = result {
                    return self.fail(session, entry, &f.name, err);
                }
            }
            phase = PhaseKind::Navigate;
            start = if kind == PhaseKind::Submit { 0 } else { usize::MAX };
        }

        self.finish_navigation(session, entry, direction)
    }

    fn finish_navigation(&self, session: &mut Session, entry: &str, direction: Direction) -> View {
        enum Action {
            Finish,
            OffloadGrowth(StepId),
            Advance,
            Retreat,
        }

        let action = {
            let tree = session.tree(entry).expect("checked");
            let step = tree.step(tree.cursor());
            match direction {
                Direction::Back => Action::Retreat,
                Direction::Forward if step.terminal => Action::Finish,
                Direction::Forward
                    if step.next_override.is_none()
                        && step.children.is_none()
                        && step.growth.as_ref().is_some_and(|g| g.heavy) =>
                {
                    Action::OffloadGrowth(step.id)
                }
                Direction::Forward => Action::Advance,
            }
        };

        match action {
            Action::Finish => {
                session.finished = true;
                tracing::info!(session = %session.id, entry, "flow finished");
            }
            Action::OffloadGrowth(step) => {
                return self.offload(session, entry, Resume::Growth { step, direction });
            }
            Action::Advance => {
                if let Err(err) = advance(session.tree_mut(entry).expect("checked")) {
                    return self.fail(session, entry, "navigation", err);
                }
            }
            Action::Retreat => {
                if let Err(err) = retreat(session.tree_mut(entry).expect("checked")) {
                    return self.fail(session, entry, "navigation", err);
                }
            }
        }

        let tree = session.tree_mut(entry).expect("checked");
        let cursor = tree.cursor();
        tree.step_mut(cursor).entered_from = Some(direction);
        tree.busy = false;
        self.persist(session);
        View::Redirect
    }

    // ---- shared ----

    fn cached_or_working(&self, tree: &Tree) -> String {
        tree.cached
            .as_ref()
            .map(|c| c.markup.clone())
            .unwrap_or_else(|| self.inner.renderer.working())
    }

    /// Hand a heavy phase to the job runner: busy + placeholder are
    /// persisted before the job exists, so a competing interaction can
    /// only ever observe the parked state.
    fn offload(&self, session: &mut Session, entry: &str, resume: Resume) -> View {
        let placeholder = self.inner.renderer.working();
        let session_id = session.id;
        {
            let tree = session.tree_mut(entry).expect("checked");
            tree.busy = true;
            tree.cached = Some(CachedView {
                step: tree.cursor(),
                markup: placeholder.clone(),
            });
        }
        self.persist(session);

        let job = OffloadJob {
            engine: self.clone(),
            session: session_id,
            entry: entry.to_string(),
            resume,
        };
        let handle = self.inner.jobs.enqueue(Arc::new(job));
        tracing::info!(job = ?handle.id, "offloaded heavy phase");
        View::Working(placeholder)
    }

    /// Author code failed: mark the session, clear busy, keep the
    /// cursor where it was so a fixed flow can be retried.
    pub(crate) fn fail(
        &self,
        session: &mut Session,
        entry: &str,
        context: &str,
        err: impl std::fmt::Display,
    ) -> View {
        tracing::error!(session = %session.id, entry, context, error = %err, "session failed");
        session.failed = true;
        if let Some(tree) = session.tree_mut(entry) {
            tree.busy = false;
        }
        self.persist(session);
        View::Failure(self.inner.renderer.failure())
    }

    fn persist(&self, session: &Session) {
        if let Err(err) = self.inner.store.persist(session) {
            tracing::error!(session = %session.id, error = %err, "persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::BasicRenderer;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use trellis_core::{
        Element, GrowthFn, PhaseError, PhaseFn, StepSpec, ValidateFn, ValidationFailure,
    };
    use trellis_job::{JobConfig, JobRunner};

    fn engine() -> Engine {
        Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BasicRenderer),
            JobRunner::start(JobConfig {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
            }),
            EngineConfig::default(),
        )
    }

    fn forward(values: &[(&str, &str)]) -> Interaction {
        Interaction::Post(FormData {
            direction: Direction::Forward,
            step_token: None,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn back() -> Interaction {
        Interaction::Post(FormData {
            direction: Direction::Back,
            ..FormData::default()
        })
    }

    fn linear_flow() -> BranchSpec {
        BranchSpec::new()
            .step(StepSpec::new("a").element(Element::text("answer")))
            .step(StepSpec::new("b"))
            .step(StepSpec::new("c").terminal())
    }

    fn page(view: View) -> String {
        match view {
            View::Page(markup) => markup,
            other => panic!("expected Page, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_is_idempotent_and_compiles_once() {
        let compiles = Arc::new(AtomicUsize::new(0));
        let counter = compiles.clone();
        let spec = BranchSpec::new().step(StepSpec::new("a").compile(PhaseFn::new(
            "count",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )));

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();

        let first = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        let second = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        assert_eq!(first, second);
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_post_records_navigates_and_redirects() {
        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", linear_flow).unwrap();

        engine.process(&handle, "main", Interaction::Get).unwrap();
        let view = engine
            .process(&handle, "main", forward(&[("answer", "hello")]))
            .unwrap();
        assert_eq!(view, View::Redirect);

        let markup = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        assert!(markup.contains("<h1>b</h1>"));

        let session = handle.lock();
        let values = session.tree("main").unwrap().values();
        assert_eq!(values["answer"], serde_json::Value::from("hello"));
    }

    #[tokio::test]
    async fn invalid_post_rerenders_with_feedback_then_accepts_retry() {
        let spec = BranchSpec::new()
            .step(
                StepSpec::new("a")
                    .element(Element::text("name"))
                    .validate(ValidateFn::new("required", |step| {
                        let el = step.element("name").unwrap();
                        if el.value.as_str().is_none_or(str::is_empty) {
                            Err(ValidationFailure::for_element("name", "name is required"))
                        } else {
                            Ok(())
                        }
                    })),
            )
            .step(StepSpec::new("b").terminal());

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();

        let bounced = page(
            engine
                .process(&handle, "main", forward(&[("name", "")]))
                .unwrap(),
        );
        assert!(bounced.contains("name is required"));
        // Cursor stayed put.
        assert_eq!(handle.lock().tree("main").unwrap().current().label, "a");

        // A re-POST after feedback is legitimate, not a duplicate.
        let view = engine
            .process(&handle, "main", forward(&[("name", "ada")]))
            .unwrap();
        assert_eq!(view, View::Redirect);
    }

    #[tokio::test]
    async fn duplicate_post_replays_without_reprocessing() {
        let submits = Arc::new(AtomicUsize::new(0));
        let counter = submits.clone();
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").submit(PhaseFn::new("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .step(StepSpec::new("b").terminal());

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();

        engine.process(&handle, "main", Interaction::Get).unwrap();
        assert_eq!(
            engine.process(&handle, "main", forward(&[])).unwrap(),
            View::Redirect
        );
        // Browser refresh re-sends the POST without an intervening GET.
        let replayed = engine.process(&handle, "main", forward(&[])).unwrap();
        assert!(matches!(replayed, View::Page(_)));
        assert_eq!(submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_step_token_is_replayed() {
        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", linear_flow).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();

        let view = engine
            .process(
                &handle,
                "main",
                Interaction::Post(FormData {
                    direction: Direction::Forward,
                    step_token: Some("s999".to_string()),
                    values: HashMap::new(),
                }),
            )
            .unwrap();
        assert!(matches!(view, View::Page(_)));
        assert_eq!(handle.lock().tree("main").unwrap().current().label, "a");
    }

    #[tokio::test]
    async fn phase_error_fails_session_and_preserves_cursor() {
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").submit(PhaseFn::new("boom", |_| {
                Err(PhaseError::internal("author bug"))
            })))
            .step(StepSpec::new("b").terminal());

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();

        let view = engine.process(&handle, "main", forward(&[])).unwrap();
        assert!(matches!(view, View::Failure(_)));
        {
            let session = handle.lock();
            assert!(session.failed);
            let tree = session.tree("main").unwrap();
            assert!(!tree.busy);
            assert_eq!(tree.current().label, "a");
        }
        // Every later interaction serves the fixed error view.
        let again = engine.process(&handle, "main", Interaction::Get).unwrap();
        assert!(matches!(again, View::Failure(_)));
    }

    #[tokio::test]
    async fn submitting_terminal_step_finishes_session() {
        let spec = BranchSpec::new().step(StepSpec::new("end").terminal());
        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();

        engine.process(&handle, "main", Interaction::Get).unwrap();
        assert_eq!(
            engine.process(&handle, "main", forward(&[])).unwrap(),
            View::Redirect
        );
        let session = handle.lock();
        assert!(session.finished);
        assert_eq!(session.tree("main").unwrap().current().label, "end");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heavy_submit_parks_tree_then_resumes() {
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").submit(PhaseFn::heavy("slow", |_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })))
            .step(StepSpec::new("b").terminal());

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();

        let parked = engine.process(&handle, "main", forward(&[])).unwrap();
        let View::Working(placeholder) = parked else {
            panic!("expected Working, got {parked:?}");
        };
        assert!(handle.lock().tree("main").unwrap().busy);

        // Polling GET while busy returns the identical placeholder.
        let poll = engine.process(&handle, "main", Interaction::Get).unwrap();
        assert_eq!(poll, View::Working(placeholder));

        engine.jobs().drain().await;
        assert!(!handle.lock().tree("main").unwrap().busy);

        // The next GET proceeds as if the submit had been synchronous.
        let markup = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        assert!(markup.contains("<h1>b</h1>"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heavy_growth_grows_once_and_is_reused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").grow(GrowthFn::heavy(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(BranchSpec::new()
                    .step(StepSpec::new("x"))
                    .step(StepSpec::new("y")))
            })))
            .step(StepSpec::new("b").terminal());

        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", || spec).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();

        let parked = engine.process(&handle, "main", forward(&[])).unwrap();
        assert!(matches!(parked, View::Working(_)));
        engine.jobs().drain().await;

        let markup = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        assert!(markup.contains("<h1>x</h1>"));

        // Back to the origin, then forward again: the grown branch is
        // reused without another growth invocation or job.
        assert_eq!(engine.process(&handle, "main", back()).unwrap(), View::Redirect);
        engine.process(&handle, "main", Interaction::Get).unwrap();
        assert_eq!(
            engine.process(&handle, "main", forward(&[])).unwrap(),
            View::Redirect
        );
        let markup = page(engine.process(&handle, "main", Interaction::Get).unwrap());
        assert!(markup.contains("<h1>x</h1>"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_entry_is_an_error() {
        let engine = engine();
        let handle = engine.store().create();
        let err = engine
            .process(&handle, "nope", Interaction::Get)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntry(_)));
    }

    #[tokio::test]
    async fn collect_reads_mid_flow() {
        let engine = engine();
        let handle = engine.store().create();
        engine.ensure_tree(&handle, "main", linear_flow).unwrap();
        engine.process(&handle, "main", Interaction::Get).unwrap();
        engine
            .process(&handle, "main", forward(&[("answer", "42")]))
            .unwrap();

        let table = engine.collect(&handle, "main").unwrap();
        assert_eq!(
            table.column("answer").unwrap(),
            &[serde_json::Value::from("42")]
        );
    }
}
