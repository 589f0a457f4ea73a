//! Watch daemon.
//!
//! # Responsibility
//! - Own the OS watch handle and route its events to path actors.
//! - Start and stop actors as watch registrations change.
//!
//! # Invariants
//! - Parent directories are watched non-recursively, once per directory no
//!   matter how many documents live in it.
//! - Events are routed by exact path; anything else in a watched directory
//!   is dropped.
//! - The primary document's actor lives for the whole run.
//! - A path whose directory cannot be watched is logged and left out; the
//!   other paths keep running and the next sync tries it again.

use crate::clock::{Clock, SystemClock};
use crate::document::resolve_path;
use crate::watch::actor::{
    ActorHandle, ActorMessage, ActorTimings, PassReport, PathActor, ReconcilePolicy,
};
use crate::watch::event::{ChangeKind, PathEvent};
use crate::watch::WatchResult;
use crate::workspace::Workspace;
use log::{debug, info, warn};
use notify::{RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Actor set changes computed by a registration sync.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub start: Vec<PathBuf>,
    pub stop: Vec<PathBuf>,
}

/// Diffs running actors against persisted registrations.
///
/// The primary document is neither started nor stopped by a sync.
pub fn plan_sync<'a>(
    running: impl IntoIterator<Item = &'a Path>,
    primary: Option<&Path>,
    registered: &[PathBuf],
) -> SyncPlan {
    let running: HashSet<&Path> = running.into_iter().collect();
    let wanted: HashSet<&Path> = registered.iter().map(PathBuf::as_path).collect();

    let mut plan = SyncPlan {
        start: registered
            .iter()
            .filter(|path| !running.contains(path.as_path()) && Some(path.as_path()) != primary)
            .cloned()
            .collect(),
        stop: running
            .iter()
            .filter(|path| !wanted.contains(*path) && Some(**path) != primary)
            .map(|path| path.to_path_buf())
            .collect(),
    };
    plan.start.sort();
    plan.stop.sort();
    plan
}

/// Reference counts of watched directories.
#[derive(Debug, Default)]
pub struct DirRefs {
    counts: HashMap<PathBuf, usize>,
}

impl DirRefs {
    /// Returns `true` when `dir` was not watched yet.
    pub fn retain(&mut self, dir: &Path) -> bool {
        let count = self.counts.entry(dir.to_path_buf()).or_default();
        *count += 1;
        *count == 1
    }

    /// Returns `true` when the last user of `dir` is gone.
    pub fn release(&mut self, dir: &Path) -> bool {
        match self.counts.get_mut(dir) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(dir);
                true
            }
            None => false,
        }
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.counts.contains_key(dir)
    }
}

/// Directory whose events cover `path`.
pub fn watch_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(path)
}

/// Running actors and watched directories of one daemon run.
#[derive(Default)]
struct DaemonState {
    actors: HashMap<PathBuf, ActorHandle>,
    primary: Option<PathBuf>,
    dirs: DirRefs,
}

impl DaemonState {
    fn dispatch(&self, event: PathEvent) {
        let message = match event.kind {
            ChangeKind::Changed => ActorMessage::Changed,
            ChangeKind::Removed => ActorMessage::Removed,
            ChangeKind::Ignored => return,
        };
        if let Some(actor) = self.actors.get(&event.path) {
            if !actor.send(message) {
                debug!(
                    "event=fs_event module=watch status=skip path={} reason=actor_stopped",
                    event.path.display()
                );
            }
        }
    }

    fn plan(&self, registered: &[PathBuf]) -> SyncPlan {
        plan_sync(
            self.actors.keys().map(PathBuf::as_path),
            self.primary.as_deref(),
            registered,
        )
    }

    fn finished(&self) -> Vec<PathBuf> {
        self.actors
            .iter()
            .filter(|(_, actor)| actor.is_finished())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Subscribes to the directory of `path` unless a sibling already did.
    fn watch_parent(
        &mut self,
        path: &Path,
        watcher: &mut (dyn Watcher + Send),
    ) -> WatchResult<()> {
        let dir = watch_dir(path);
        if !self.dirs.is_watched(dir) {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        self.dirs.retain(dir);
        Ok(())
    }

    async fn stop(&mut self, path: &Path, watcher: &mut (dyn Watcher + Send)) {
        let Some(handle) = self.actors.remove(path) else {
            return;
        };
        if self.primary.as_deref() == Some(path) {
            self.primary = None;
        }
        if let Err(err) = handle.shutdown().await {
            warn!(
                "event=actor_stop module=watch status=error path={} error={err}",
                path.display()
            );
        }
        let dir = watch_dir(path);
        if self.dirs.release(dir) {
            if let Err(err) = watcher.unwatch(dir) {
                debug!(
                    "event=dir_unwatch module=watch status=error dir={} error={err}",
                    dir.display()
                );
            }
        }
    }

    async fn shutdown(&mut self, watcher: &mut (dyn Watcher + Send)) {
        let paths: Vec<PathBuf> = self.actors.keys().cloned().collect();
        for path in paths {
            self.stop(&path, watcher).await;
        }
    }
}

/// Filesystem watcher over one workspace.
pub struct WatchDaemon<C = SystemClock> {
    workspace: Workspace,
    clock: C,
    observer: Option<UnboundedSender<PassReport>>,
}

impl WatchDaemon<SystemClock> {
    pub fn new(workspace: Workspace) -> Self {
        Self::with_clock(workspace, SystemClock)
    }
}

impl<C> WatchDaemon<C>
where
    C: Clock + Clone + Send + 'static,
{
    pub fn with_clock(workspace: Workspace, clock: C) -> Self {
        Self {
            workspace,
            clock,
            observer: None,
        }
    }

    /// Forwards every actor's [`PassReport`] to `observer`.
    pub fn with_observer(mut self, observer: UnboundedSender<PassReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs until `shutdown` resolves.
    ///
    /// # Errors
    /// Only failures of the watch backend or of loading registrations are
    /// returned; a single path that cannot be watched is logged and skipped.
    pub async fn run<F>(self, shutdown: F) -> WatchResult<()>
    where
        F: Future<Output = ()>,
    {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = event_tx.send(res);
        })?;

        let mut state = DaemonState::default();
        self.start(&mut state, &mut watcher).await?;
        info!(
            "event=daemon_start module=watch status=ok base_dir={} actors={}",
            self.workspace.base_dir().display(),
            state.actors.len()
        );

        let period = self.workspace.config().sync_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = event_rx.recv() => match received {
                    Some(Ok(event)) => {
                        for path_event in PathEvent::from_notify(event) {
                            state.dispatch(path_event);
                        }
                    }
                    Some(Err(err)) => {
                        warn!("event=fs_event module=watch status=error error={err}");
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.sync(&mut state, &mut watcher).await {
                        warn!("event=watch_sync module=watch status=error error={err}");
                    }
                }
            }
        }

        state.shutdown(&mut watcher).await;
        drop(watcher);
        info!("event=daemon_stop module=watch status=ok");
        Ok(())
    }

    async fn start(
        &self,
        state: &mut DaemonState,
        watcher: &mut (dyn Watcher + Send),
    ) -> WatchResult<()> {
        let registered = self.registrations().await?;

        if self.workspace.config().track_primary {
            let document = self.workspace.document_path();
            match resolve_path(&document) {
                Ok(primary) => {
                    match self.spawn_actor(state, watcher, &primary, ReconcilePolicy::Checkpoint) {
                        Ok(()) => state.primary = Some(primary),
                        Err(err) => warn!(
                            "event=actor_start module=watch status=error path={} policy=checkpoint error={err}",
                            primary.display()
                        ),
                    }
                }
                Err(err) => warn!(
                    "event=actor_start module=watch status=error path={} policy=checkpoint error={err}",
                    document.display()
                ),
            }
        }

        for path in registered {
            if !path.is_file() {
                self.deregister(&path).await;
                continue;
            }
            if let Err(err) = self.spawn_actor(state, watcher, &path, ReconcilePolicy::Membership) {
                warn!(
                    "event=actor_start module=watch status=error path={} policy=membership error={err}",
                    path.display()
                );
            }
        }
        Ok(())
    }

    async fn sync(
        &self,
        state: &mut DaemonState,
        watcher: &mut (dyn Watcher + Send),
    ) -> WatchResult<()> {
        for path in state.finished() {
            debug!(
                "event=actor_reap module=watch status=ok path={}",
                path.display()
            );
            state.stop(&path, watcher).await;
        }

        let registered = self.registrations().await?;
        let plan = state.plan(&registered);

        for path in &plan.stop {
            info!(
                "event=watch_sync module=watch status=ok action=stop path={}",
                path.display()
            );
            state.stop(path, watcher).await;
        }

        for path in &plan.start {
            if !path.is_file() {
                self.deregister(path).await;
                continue;
            }
            info!(
                "event=watch_sync module=watch status=ok action=start path={}",
                path.display()
            );
            match self.spawn_actor(state, watcher, path, ReconcilePolicy::Membership) {
                Ok(()) => {
                    if let Some(actor) = state.actors.get(path) {
                        actor.send(ActorMessage::Reconcile);
                    }
                }
                Err(err) => warn!(
                    "event=watch_sync module=watch status=error action=start path={} error={err}",
                    path.display()
                ),
            }
        }
        Ok(())
    }

    fn spawn_actor(
        &self,
        state: &mut DaemonState,
        watcher: &mut (dyn Watcher + Send),
        path: &Path,
        policy: ReconcilePolicy,
    ) -> WatchResult<()> {
        let engine = self.workspace.engine_with_clock(self.clock.clone())?;
        state.watch_parent(path, watcher)?;

        let timings = ActorTimings::from(self.workspace.config());
        let mut actor = PathActor::new(path, policy, engine, timings);
        if let Some(observer) = &self.observer {
            actor = actor.with_observer(observer.clone());
        }
        state.actors.insert(path.to_path_buf(), actor.spawn());
        Ok(())
    }

    async fn registrations(&self) -> WatchResult<Vec<PathBuf>> {
        let workspace = self.workspace.clone();
        let watches =
            tokio::task::spawn_blocking(move || workspace.engine()?.list_watches()).await??;
        Ok(watches
            .into_iter()
            .map(|watch| PathBuf::from(watch.path))
            .collect())
    }

    async fn deregister(&self, path: &Path) {
        let workspace = self.workspace.clone();
        let target = path.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || workspace.engine()?.unwatch_document(&target))
                .await;
        match result {
            Ok(Ok(_)) => info!(
                "event=watch_removed module=watch status=ok path={} reason=missing",
                path.display()
            ),
            Ok(Err(err)) => warn!(
                "event=watch_removed module=watch status=error path={} error={err}",
                path.display()
            ),
            Err(err) => warn!(
                "event=watch_removed module=watch status=error path={} error={err}",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{plan_sync, watch_dir, DaemonState, DirRefs, SyncPlan, WatchDaemon};
    use crate::config::NotesyncConfig;
    use crate::workspace::Workspace;
    use notify::{EventHandler, RecursiveMode, Watcher, WatcherKind};
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Accepts every directory except `refused`.
    struct RefusingWatcher {
        refused: PathBuf,
        watched: Vec<PathBuf>,
    }

    impl Watcher for RefusingWatcher {
        fn new<F: EventHandler>(_handler: F, _config: notify::Config) -> notify::Result<Self> {
            Ok(Self {
                refused: PathBuf::new(),
                watched: Vec::new(),
            })
        }

        fn watch(&mut self, path: &Path, _mode: RecursiveMode) -> notify::Result<()> {
            if path == self.refused {
                return Err(notify::Error::generic("permission denied").add_path(path.to_path_buf()));
            }
            self.watched.push(path.to_path_buf());
            Ok(())
        }

        fn unwatch(&mut self, path: &Path) -> notify::Result<()> {
            self.watched.retain(|watched| watched != path);
            Ok(())
        }

        fn kind() -> WatcherKind {
            WatcherKind::NullWatcher
        }
    }

    #[test]
    fn plan_starts_new_and_stops_dropped_registrations() {
        let running = [Path::new("/w/a.md"), Path::new("/w/b.md")];
        let registered = vec![PathBuf::from("/w/b.md"), PathBuf::from("/w/c.md")];

        let plan = plan_sync(running, None, &registered);
        assert_eq!(
            plan,
            SyncPlan {
                start: vec![PathBuf::from("/w/c.md")],
                stop: vec![PathBuf::from("/w/a.md")],
            }
        );
    }

    #[test]
    fn plan_never_touches_primary_document() {
        let primary = Path::new("/w/notes.md");
        let running = [primary];
        let registered = vec![PathBuf::from("/w/notes.md")];

        assert_eq!(plan_sync(running, Some(primary), &[]), SyncPlan::default());
        assert_eq!(
            plan_sync(Vec::<&Path>::new(), Some(primary), &registered),
            SyncPlan::default()
        );
    }

    #[test]
    fn directories_are_reference_counted() {
        let mut dirs = DirRefs::default();
        let dir = Path::new("/w");

        assert!(dirs.retain(dir));
        assert!(!dirs.retain(dir));
        assert!(!dirs.release(dir));
        assert!(dirs.is_watched(dir));
        assert!(dirs.release(dir));
        assert!(!dirs.is_watched(dir));
        assert!(!dirs.release(dir));
    }

    #[test]
    fn watch_dir_is_the_parent() {
        assert_eq!(watch_dir(Path::new("/w/a.md")), Path::new("/w"));
        assert_eq!(watch_dir(Path::new("a.md")), Path::new("a.md"));
    }

    #[tokio::test]
    async fn unwatchable_directory_does_not_stop_the_other_paths() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(NotesyncConfig::new(dir.path()).without_primary());
        workspace.init().unwrap();
        let engine = workspace.engine().unwrap();

        let mut registered = Vec::new();
        for name in ["open", "locked"] {
            fs::create_dir(dir.path().join(name)).unwrap();
            let path = dir.path().join(name).join("doc.md");
            fs::write(&path, name).unwrap();
            registered.push(engine.watch_document(&path).unwrap().path);
        }
        let (open, locked) = (&registered[0], &registered[1]);

        let mut watcher = RefusingWatcher {
            refused: watch_dir(locked).to_path_buf(),
            watched: Vec::new(),
        };
        let mut state = DaemonState::default();
        let daemon = WatchDaemon::new(workspace.clone());

        daemon.start(&mut state, &mut watcher).await.unwrap();

        assert!(state.actors.contains_key(open));
        assert!(!state.actors.contains_key(locked));
        assert_eq!(watcher.watched, vec![watch_dir(open).to_path_buf()]);
        // Still registered, so a later sync can try again.
        assert_eq!(engine.list_watches().unwrap().len(), 2);

        state.shutdown(&mut watcher).await;
        assert!(watcher.watched.is_empty());
    }
}
