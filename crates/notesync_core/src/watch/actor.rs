//! Per-path watch actor.
//!
//! # Responsibility
//! - Own one watched document: its engine, arm state and pending timers.
//! - Coalesce change bursts into a single reconciliation pass.
//!
//! # Invariants
//! - `Armed`: a change (re)starts the debounce; a pending deadline is
//!   replaced, never stacked.
//! - `Disarmed { until }`: changes are swallowed until `until`.
//! - After a pass the actor stays disarmed for the settle window. At rearm,
//!   a document that no longer matches the last render schedules a debounce.
//! - A removal is only acted on if the file is still missing one debounce
//!   window later; the primary document is never deregistered.
//! - A primary pass is skipped while the document still matches the last
//!   render. A watched document always gets its pass, since presence alone
//!   promotes its units.
//! - A pass that found the store busy is retried after another debounce.

use crate::clock::Clock;
use crate::config::NotesyncConfig;
use crate::model::unit::fingerprint;
use crate::repo::unit_repo::UnitStore;
use crate::service::reconcile_service::{
    EngineError, EngineResult, ReconcileReport, ReconcileService,
};
use crate::watch::WatchResult;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Which reconciliation a path gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// Primary document: checkpoint protection, no promotion.
    Checkpoint,
    /// Watched document: promote everything present, delete what left.
    Membership,
}

impl ReconcilePolicy {
    fn run<S: UnitStore, C: Clock>(
        self,
        engine: &ReconcileService<S, C>,
        path: &Path,
    ) -> EngineResult<ReconcileReport> {
        match self {
            Self::Checkpoint => engine.reconcile(),
            Self::Membership => engine.reconcile_document(path),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Membership => "membership",
        }
    }
}

/// Input of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorMessage {
    Changed,
    Removed,
    /// Run a pass now, regardless of arm state.
    Reconcile,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Reconciled(ReconcileReport),
    /// The primary document still matched the last render.
    Skipped,
    Failed(String),
    /// The document was deleted and its registration dropped.
    Removed,
}

/// Observation emitted after each actor decision that touches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub path: PathBuf,
    pub outcome: PassOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorTimings {
    pub debounce: Duration,
    pub settle_window: Duration,
}

impl From<&NotesyncConfig> for ActorTimings {
    fn from(config: &NotesyncConfig) -> Self {
        Self {
            debounce: config.debounce,
            settle_window: config.settle_window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArmState {
    Armed,
    Disarmed { until: Instant },
}

enum Flow {
    Continue,
    Stop,
}

pub struct PathActor<S: UnitStore, C: Clock> {
    path: PathBuf,
    policy: ReconcilePolicy,
    engine: Option<ReconcileService<S, C>>,
    timings: ActorTimings,
    state: ArmState,
    pending: Option<Instant>,
    removal_check: Option<Instant>,
    last_written: Option<String>,
    observer: Option<UnboundedSender<PassReport>>,
}

impl<S, C> PathActor<S, C>
where
    S: UnitStore + Send + 'static,
    C: Clock + Send + 'static,
{
    pub fn new(
        path: impl Into<PathBuf>,
        policy: ReconcilePolicy,
        engine: ReconcileService<S, C>,
        timings: ActorTimings,
    ) -> Self {
        Self {
            path: path.into(),
            policy,
            engine: Some(engine),
            timings,
            state: ArmState::Armed,
            pending: None,
            removal_check: None,
            last_written: None,
            observer: None,
        }
    }

    /// Sends a [`PassReport`] to `observer` after every pass.
    pub fn with_observer(mut self, observer: UnboundedSender<PassReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs the actor on the current tokio runtime.
    pub fn spawn(self) -> ActorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let join = tokio::spawn(self.run(rx));
        ActorHandle { path, tx, join }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<ActorMessage>) {
        info!(
            "event=actor_start module=watch status=ok path={} policy={}",
            self.path.display(),
            self.policy.as_str()
        );

        loop {
            let wake = self.next_wake();
            let flow = tokio::select! {
                message = rx.recv() => match message {
                    Some(ActorMessage::Changed) => {
                        self.on_changed(Instant::now());
                        Flow::Continue
                    }
                    Some(ActorMessage::Removed) => {
                        self.on_removed(Instant::now());
                        Flow::Continue
                    }
                    Some(ActorMessage::Reconcile) => self.run_pass().await,
                    Some(ActorMessage::Shutdown) | None => Flow::Stop,
                },
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.on_timer(Instant::now()).await
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        info!(
            "event=actor_stop module=watch status=ok path={}",
            self.path.display()
        );
    }

    fn next_wake(&self) -> Option<Instant> {
        let rearm = match self.state {
            ArmState::Armed => None,
            ArmState::Disarmed { until } => Some(until),
        };
        [self.pending, self.removal_check, rearm]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_changed(&mut self, now: Instant) {
        match self.state {
            ArmState::Disarmed { until } if now < until => {
                debug!(
                    "event=change_swallowed module=watch path={}",
                    self.path.display()
                );
            }
            _ => {
                self.state = ArmState::Armed;
                self.pending = Some(now + self.timings.debounce);
            }
        }
    }

    fn on_removed(&mut self, now: Instant) {
        if self.policy == ReconcilePolicy::Checkpoint {
            debug!(
                "event=remove_ignored module=watch path={}",
                self.path.display()
            );
            return;
        }
        self.removal_check = Some(now + self.timings.debounce);
    }

    async fn on_timer(&mut self, now: Instant) -> Flow {
        if self.removal_check.is_some_and(|at| at <= now) {
            self.removal_check = None;
            if !self.path.exists() {
                return self.retire().await;
            }
        }

        if let ArmState::Disarmed { until } = self.state {
            if until <= now {
                self.rearm(now);
            }
        }

        if self.state == ArmState::Armed && self.pending.is_some_and(|at| at <= now) {
            return self.run_pass().await;
        }
        Flow::Continue
    }

    fn rearm(&mut self, now: Instant) {
        self.state = ArmState::Armed;
        if disk_fingerprint(&self.path) != self.last_written {
            debug!(
                "event=actor_rearm module=watch status=ok path={} external_edit=true",
                self.path.display()
            );
            self.pending = Some(now + self.timings.debounce);
        }
    }

    async fn run_pass(&mut self) -> Flow {
        self.pending = None;

        let on_disk = disk_fingerprint(&self.path);
        if on_disk.is_none() {
            if self.policy == ReconcilePolicy::Membership {
                self.removal_check = Some(Instant::now() + self.timings.debounce);
            }
            return Flow::Continue;
        }
        if self.policy == ReconcilePolicy::Checkpoint && on_disk == self.last_written {
            debug!(
                "event=actor_pass module=watch status=skip path={} reason=unchanged",
                self.path.display()
            );
            self.observe(PassOutcome::Skipped);
            return Flow::Continue;
        }

        let path = self.path.clone();
        let policy = self.policy;
        let Some(result) = self.with_engine(move |engine| policy.run(engine, &path)).await else {
            return Flow::Stop;
        };

        match result {
            Ok(report) => {
                self.last_written = Some(report.render.document_fingerprint.clone());
                self.state = ArmState::Disarmed {
                    until: Instant::now() + self.timings.settle_window,
                };
                self.observe(PassOutcome::Reconciled(report));
                Flow::Continue
            }
            Err(err @ EngineError::NotWatched(_)) => {
                info!(
                    "event=actor_pass module=watch status=skip path={} reason=not_watched",
                    self.path.display()
                );
                self.observe(PassOutcome::Failed(err.to_string()));
                Flow::Stop
            }
            Err(err) => {
                let retry = err.is_busy();
                warn!(
                    "event=actor_pass module=watch status=error path={} retry={retry} error={err}",
                    self.path.display()
                );
                if retry {
                    self.pending = Some(Instant::now() + self.timings.debounce);
                }
                self.observe(PassOutcome::Failed(err.to_string()));
                Flow::Continue
            }
        }
    }

    async fn retire(&mut self) -> Flow {
        let path = self.path.clone();
        match self
            .with_engine(move |engine| engine.unwatch_document(&path))
            .await
        {
            Some(Ok(removed)) => info!(
                "event=watch_removed module=watch status=ok path={} removed={removed}",
                self.path.display()
            ),
            Some(Err(err)) => warn!(
                "event=watch_removed module=watch status=error path={} error={err}",
                self.path.display()
            ),
            None => {}
        }
        self.observe(PassOutcome::Removed);
        Flow::Stop
    }

    /// Runs `work` on the blocking pool, lending it the engine.
    ///
    /// Returns `None` when the blocking task died; the engine is gone then.
    async fn with_engine<T, F>(&mut self, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReconcileService<S, C>) -> T + Send + 'static,
    {
        let engine = self.engine.take()?;
        let task = tokio::task::spawn_blocking(move || {
            let value = work(&engine);
            (engine, value)
        });
        match task.await {
            Ok((engine, value)) => {
                self.engine = Some(engine);
                Some(value)
            }
            Err(err) => {
                error!(
                    "event=actor_pass module=watch status=error path={} error={err}",
                    self.path.display()
                );
                None
            }
        }
    }

    fn observe(&self, outcome: PassOutcome) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(PassReport {
                path: self.path.clone(),
                outcome,
            });
        }
    }
}

/// Channel end and task of a running actor.
pub struct ActorHandle {
    path: PathBuf,
    tx: UnboundedSender<ActorMessage>,
    join: JoinHandle<()>,
}

impl ActorHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `false` when the actor already stopped.
    pub fn send(&self, message: ActorMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Asks the actor to stop and waits for it. An in-flight pass completes.
    pub async fn shutdown(self) -> WatchResult<()> {
        let _ = self.tx.send(ActorMessage::Shutdown);
        self.join.await?;
        Ok(())
    }
}

fn disk_fingerprint(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|text| fingerprint(&text))
}

#[cfg(test)]
mod tests {
    use super::{
        ActorHandle, ActorMessage, ActorTimings, PassOutcome, PassReport, PathActor,
        ReconcilePolicy,
    };
    use crate::config::NotesyncConfig;
    use crate::service::reconcile_service::ReconcileReport;
    use crate::workspace::Workspace;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::time::timeout;

    const TIMINGS: ActorTimings = ActorTimings {
        debounce: Duration::from_millis(40),
        settle_window: Duration::from_millis(150),
    };

    struct Fixture {
        _dir: TempDir,
        workspace: Workspace,
        doc: PathBuf,
    }

    fn fixture(content: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(NotesyncConfig::new(dir.path()));
        workspace.init().unwrap();
        let doc = dir.path().join("topic.md");
        fs::write(&doc, content).unwrap();
        let doc = workspace.engine().unwrap().watch_document(&doc).unwrap().path;
        Fixture {
            _dir: dir,
            workspace,
            doc,
        }
    }

    fn spawn_actor(fixture: &Fixture) -> (ActorHandle, UnboundedReceiver<PassReport>) {
        spawn_on(fixture, fixture.doc.clone(), ReconcilePolicy::Membership)
    }

    fn spawn_on(
        fixture: &Fixture,
        path: PathBuf,
        policy: ReconcilePolicy,
    ) -> (ActorHandle, UnboundedReceiver<PassReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = PathActor::new(path, policy, fixture.workspace.engine().unwrap(), TIMINGS)
            .with_observer(tx);
        (actor.spawn(), rx)
    }

    async fn reconciled(rx: &mut UnboundedReceiver<PassReport>) -> ReconcileReport {
        match next_outcome(rx).await {
            PassOutcome::Reconciled(report) => report,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    async fn next_outcome(rx: &mut UnboundedReceiver<PassReport>) -> PassOutcome {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .outcome
    }

    async fn assert_quiet(rx: &mut UnboundedReceiver<PassReport>) {
        let window = TIMINGS.debounce + TIMINGS.settle_window * 2;
        assert!(timeout(window, rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn burst_of_changes_runs_one_pass() {
        let fixture = fixture("alpha\n\nbeta");
        let (handle, mut rx) = spawn_actor(&fixture);

        for _ in 0..3 {
            assert!(handle.send(ActorMessage::Changed));
        }

        match next_outcome(&mut rx).await {
            PassOutcome::Reconciled(report) => {
                assert_eq!(report.created, 2);
                assert!(!report.render.written);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_quiet(&mut rx).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn own_rewrite_events_are_swallowed() {
        let fixture = fixture("beta\n\n\n\nalpha   ");
        let (handle, mut rx) = spawn_actor(&fixture);

        handle.send(ActorMessage::Changed);
        match next_outcome(&mut rx).await {
            PassOutcome::Reconciled(report) => assert!(report.render.written),
            other => panic!("unexpected outcome {other:?}"),
        }

        // Echo of the engine's own write.
        handle.send(ActorMessage::Changed);
        assert_quiet(&mut rx).await;
        assert_eq!(fs::read_to_string(&fixture.doc).unwrap(), "beta\n\nalpha");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn edit_inside_settle_window_is_picked_up_at_rearm() {
        let fixture = fixture("alpha\n\nbeta");
        let (handle, mut rx) = spawn_actor(&fixture);

        handle.send(ActorMessage::Changed);
        assert!(matches!(
            next_outcome(&mut rx).await,
            PassOutcome::Reconciled(_)
        ));

        fs::write(&fixture.doc, "gamma").unwrap();
        handle.send(ActorMessage::Changed);

        match next_outcome(&mut rx).await {
            PassOutcome::Reconciled(report) => {
                assert_eq!(report.created, 1);
                assert_eq!(report.deleted, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_removal_unregisters_and_stops() {
        let fixture = fixture("alpha");
        let (handle, mut rx) = spawn_actor(&fixture);

        fs::remove_file(&fixture.doc).unwrap();
        handle.send(ActorMessage::Removed);

        assert_eq!(next_outcome(&mut rx).await, PassOutcome::Removed);
        timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
        let watches = fixture.workspace.engine().unwrap().list_watches().unwrap();
        assert!(watches.is_empty());
    }

    #[tokio::test]
    async fn replaced_file_is_not_treated_as_removed() {
        let fixture = fixture("alpha");
        let (handle, mut rx) = spawn_actor(&fixture);

        fs::remove_file(&fixture.doc).unwrap();
        handle.send(ActorMessage::Removed);
        fs::write(&fixture.doc, "alpha\n\ndelta").unwrap();
        handle.send(ActorMessage::Changed);

        match next_outcome(&mut rx).await {
            PassOutcome::Reconciled(report) => assert_eq!(report.created, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!handle.is_finished());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_pass_skips_unchanged_primary_document() {
        let fixture = fixture("alpha");
        let primary = fs::canonicalize(fixture.workspace.document_path()).unwrap();
        fs::write(&primary, "first").unwrap();
        let (handle, mut rx) = spawn_on(&fixture, primary, ReconcilePolicy::Checkpoint);

        handle.send(ActorMessage::Reconcile);
        assert_eq!(reconciled(&mut rx).await.created, 1);
        handle.send(ActorMessage::Reconcile);
        assert_eq!(next_outcome(&mut rx).await, PassOutcome::Skipped);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_pass_promotes_unchanged_watched_document() {
        let fixture = fixture("alpha");
        let (handle, mut rx) = spawn_actor(&fixture);

        handle.send(ActorMessage::Reconcile);
        assert_eq!(reconciled(&mut rx).await.created, 1);
        handle.send(ActorMessage::Reconcile);
        assert_eq!(reconciled(&mut rx).await.promoted, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn identical_resave_after_rearm_promotes() {
        let fixture = fixture("alpha");
        let engine = fixture.workspace.engine().unwrap();
        let (handle, mut rx) = spawn_actor(&fixture);

        handle.send(ActorMessage::Changed);
        assert_eq!(reconciled(&mut rx).await.created, 1);
        let before = engine.list_units().unwrap()[0].updated_at;

        tokio::time::sleep(TIMINGS.settle_window + TIMINGS.debounce).await;
        fs::write(&fixture.doc, "alpha").unwrap();
        handle.send(ActorMessage::Changed);

        let report = reconciled(&mut rx).await;
        assert_eq!(report.promoted, 1);
        assert!(!report.render.written);
        assert!(engine.list_units().unwrap()[0].updated_at > before);
        handle.shutdown().await.unwrap();
    }
}
