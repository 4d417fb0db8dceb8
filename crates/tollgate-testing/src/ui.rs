use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tollgate::{ActivityMonitor, UiContext, UiHost};
use tracing::debug;

/// Name of the thread [`ThreadUiHost`] runs its jobs on.
pub const UI_THREAD_NAME: &str = "tollgate-ui";

/// A UI surface with switches.
#[derive(Debug)]
pub struct TestSurface {
    alive: AtomicBool,
    foreground: AtomicBool,
    finished: AtomicBool,
}

impl TestSurface {
    /// A live surface in the foreground.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            foreground: AtomicBool::new(true),
            finished: AtomicBool::new(false),
        })
    }

    pub fn context(self: &Arc<Self>) -> Arc<dyn UiContext> {
        Arc::clone(self) as Arc<dyn UiContext>
    }

    pub fn destroy(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn send_to_background(&self) {
        self.foreground.store(false, Ordering::SeqCst);
    }

    pub fn bring_to_front(&self) {
        self.foreground.store(true, Ordering::SeqCst);
    }

    /// True once [`UiContext::finish`] was called.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl UiContext for TestSurface {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_finished()
    }

    fn is_foreground(&self) -> bool {
        self.is_alive() && self.foreground.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A UI thread of its own, plus a transient surface factory.
///
/// Jobs run in submission order on a thread named [`UI_THREAD_NAME`].
pub struct ThreadUiHost {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    provide_surfaces: AtomicBool,
    surfaces: Arc<Mutex<Vec<Arc<TestSurface>>>>,
    monitor: Arc<Mutex<Option<ActivityMonitor>>>,
    jobs_run: Arc<AtomicUsize>,
}

impl ThreadUiHost {
    pub fn new() -> Arc<Self> {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let jobs_run = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&jobs_run);
        let thread = std::thread::Builder::new()
            .name(UI_THREAD_NAME.into())
            .spawn(move || {
                while let Ok(job) = inbox.recv() {
                    job();
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .ok();

        Arc::new(Self {
            jobs: Mutex::new(Some(jobs)),
            thread: Mutex::new(thread),
            provide_surfaces: AtomicBool::new(true),
            surfaces: Arc::new(Mutex::new(Vec::new())),
            monitor: Arc::new(Mutex::new(None)),
            jobs_run,
        })
    }

    /// When off, transient surfaces are never reported ready.
    pub fn provide_surfaces(&self, enabled: bool) {
        self.provide_surfaces.store(enabled, Ordering::SeqCst);
    }

    /// Every transient surface started so far.
    pub fn surfaces(&self) -> Vec<Arc<TestSurface>> {
        lock(&self.surfaces).clone()
    }

    pub fn jobs_run(&self) -> usize {
        self.jobs_run.load(Ordering::SeqCst)
    }

    /// Brings the latest transient surface back to the foreground.
    pub fn resume_transient_surface(&self) {
        let monitor = lock(&self.monitor).clone();
        if let Some(monitor) = monitor {
            self.run_on_ui(Box::new(move || monitor.surface_resumed()));
        }
    }

    /// Stops the UI thread after the jobs already submitted.
    pub fn stop(&self) {
        lock(&self.jobs).take();
        if let Some(thread) = lock(&self.thread).take() {
            let _ = thread.join();
        }
    }
}

impl UiHost for ThreadUiHost {
    fn run_on_ui(&self, job: Box<dyn FnOnce() + Send>) {
        let sent = lock(&self.jobs).as_ref().map(|jobs| jobs.send(job));
        if !matches!(sent, Some(Ok(()))) {
            debug!("ui thread is gone; job dropped");
        }
    }

    fn start_transient_surface(&self, monitor: ActivityMonitor) {
        *lock(&self.monitor) = Some(monitor.clone());
        if !self.provide_surfaces.load(Ordering::SeqCst) {
            debug!("withholding transient surface");
            return;
        }
        let surfaces = Arc::clone(&self.surfaces);
        self.run_on_ui(Box::new(move || {
            let surface = TestSurface::new();
            lock(&surfaces).push(Arc::clone(&surface));
            monitor.surface_ready(surface);
        }));
    }
}

impl Drop for ThreadUiHost {
    fn drop(&mut self) {
        lock(&self.jobs).take();
    }
}

impl std::fmt::Debug for ThreadUiHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadUiHost")
            .field("surfaces", &lock(&self.surfaces).len())
            .field("jobs_run", &self.jobs_run())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
