use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Local};
use common::{
    api::{CaptureResult, RunEvent, RunOutcome, RunSummary, Target},
    grbl::MachineStatus,
};
use tokio::{
    runtime::Builder,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    capture::{Camera, CaptureSink},
    cnc::{connection::LinkObserver, grbl::controller::MotionController},
    config::{CameraTuning, FailurePolicy, NamingScheme, RigConfig},
    error::{RigError, RigResult},
    plan::{expand_visits, Visit},
};

/// Everything a run needs to know besides the hardware itself.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Serial device the run drives; at most one run per device at a time.
    pub device: String,
    pub targets: Vec<Target>,
    pub repetitions: u32,
    pub feed_rate: f64,
    pub move_timeout: Duration,
    pub home_timeout: Duration,
    pub home_on_start: bool,
    pub failure_policy: FailurePolicy,
    pub session_dir: PathBuf,
    pub tuning: CameraTuning,
    pub naming: NamingScheme,
}

impl RunPlan {
    pub fn from_config(config: &RigConfig, session_dir: PathBuf) -> Self {
        RunPlan {
            device: config.serial_port.clone(),
            targets: config.resolved_targets(),
            repetitions: config.repetitions,
            feed_rate: config.feed_rate,
            move_timeout: config.move_timeout(),
            home_timeout: config.home_timeout(),
            home_on_start: config.home_on_start,
            failure_policy: config.failure_policy,
            session_dir,
            tuning: config.camera_tuning.clone(),
            naming: config.naming,
        }
    }
}

/// The devices a run takes exclusive ownership of.
pub struct Hardware {
    pub controller: MotionController,
    pub camera: Box<dyn Camera>,
}

impl Hardware {
    /// Pairs an opened camera with a controller. The camera is released again when the
    /// controller cannot be reached.
    pub async fn acquire<C>(mut camera: Box<dyn Camera>, controller: C) -> RigResult<Self>
    where
        C: Future<Output = RigResult<MotionController>>,
    {
        match controller.await {
            Ok(controller) => Ok(Hardware { controller, camera }),
            Err(e) => {
                warn!("releasing {}: {}", camera.describe(), e);
                camera.release();
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Takes effect before the next target; a move already under way is finished.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sending half of a run's event stream. Events are dropped once nobody listens.
#[derive(Debug, Clone)]
pub struct EventSink(UnboundedSender<RunEvent>);

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = unbounded_channel();
        (EventSink(sender), receiver)
    }
    pub fn emit(&self, event: RunEvent) {
        drop(self.0.send(event));
    }
    fn info(&self, message: String) {
        info!("{}", message);
        self.emit(RunEvent::info(message));
    }
    fn warning(&self, message: String) {
        warn!("{}", message);
        self.emit(RunEvent::warning(message));
    }
    fn error(&self, message: String) {
        error!("{}", message);
        self.emit(RunEvent::error(message));
    }
    fn status(&self, status: MachineStatus, raw: impl Into<String>) {
        self.emit(RunEvent::Status { status, raw: raw.into() });
    }
}

/// Mirrors controller traffic into the event stream. Status polls become `Status` events
/// rather than raw lines.
struct EventObserver(EventSink);

impl LinkObserver for EventObserver {
    fn after_send(&self, bytes: &[u8]) {
        if bytes != b"?" {
            self.0.emit(RunEvent::debug(format!("> {}", String::from_utf8_lossy(bytes).trim_end())));
        }
    }
    fn after_receive(&self, line: &str) {
        if !line.starts_with('<') {
            self.0.emit(RunEvent::debug(format!("< {}", line)));
        }
    }
    fn warn(&self, message: &str) {
        self.0.warning(message.to_string());
    }
    fn after_status(&self, status: MachineStatus, raw: &str) {
        self.0.status(status, raw);
    }
}

/// One capture run. Owns the results; observers only see them through events.
pub struct RunSession {
    pub session_dir: PathBuf,
    pub targets: Vec<Target>,
    pub feed_rate: f64,
    pub move_timeout: Duration,
    pub started_at: DateTime<Local>,
    results: Vec<CaptureResult>,
    events: EventSink,
}

impl RunSession {
    fn new(plan: &RunPlan, events: EventSink) -> Self {
        RunSession {
            session_dir: plan.session_dir.clone(),
            targets: plan.targets.clone(),
            feed_rate: plan.feed_rate,
            move_timeout: plan.move_timeout,
            started_at: Local::now(),
            results: Vec::new(),
            events,
        }
    }
    fn record(&mut self, result: CaptureResult) {
        match (&result.file_path, &result.error) {
            (Some(path), _) => self.events.emit(RunEvent::Image {
                target_id: result.target_id.clone(),
                path: path.clone(),
            }),
            (None, Some(error)) => self.events.error(format!("{}: {}", result.target_id, error)),
            (None, None) => (),
        }
        self.events.emit(RunEvent::Result(result.clone()));
        self.results.push(result);
    }
    fn summary(&self, outcome: RunOutcome) -> RunSummary {
        let succeeded = self.results.iter().filter(|r| r.succeeded).count();
        RunSummary {
            session_dir: self.session_dir.clone(),
            attempted: self.results.len(),
            succeeded,
            failed: self.results.len() - succeeded,
            outcome,
            started_at: self.started_at,
            finished_at: Local::now(),
        }
    }
}

async fn initialize(controller: &mut MotionController, plan: &RunPlan, events: &EventSink) -> RigResult<()> {
    events.status(MachineStatus::Unlocking, "$X");
    controller.unlock().await?;
    controller.await_idle(plan.move_timeout).await?;
    if plan.home_on_start {
        events.status(MachineStatus::Homing, "$H");
        events.info("Homing...".into());
        controller.home().await?;
        controller.await_idle(plan.home_timeout).await?;
    }
    match controller.settings().await {
        Ok(dump) => events.info(format!("Controller settings:\n{}", dump.join("\n"))),
        Err(e) => events.warning(format!("Could not read controller settings: {}", e)),
    }
    if let Err(e) = controller.query_status().await {
        events.warning(format!("Status snapshot failed: {}", e));
    }
    controller.set_feed_rate(plan.feed_rate).await?;
    events.info(format!("Feed rate set to {}", plan.feed_rate));
    Ok(())
}

async fn move_and_settle(controller: &mut MotionController, target: &Target, limit: Duration) -> RigResult<()> {
    controller.move_to(target.x, target.y).await?;
    controller.await_idle(limit).await?;
    Ok(())
}

/// Visits every target in order. Returns the outcome of the target loop.
async fn visit_all(
    session: &mut RunSession,
    controller: &mut MotionController,
    sink: &mut CaptureSink,
    visits: &[Visit],
    plan: &RunPlan,
    cancel: &CancelHandle,
) -> RunOutcome {
    let total = visits.len();
    session.events.emit(RunEvent::Progress { completed: 0, total });
    for (completed, visit) in visits.iter().enumerate() {
        let target = &visit.target;
        if cancel.is_cancelled() {
            session.events.warning(format!("Run cancelled before {}", target.id));
            return RunOutcome::Cancelled;
        }
        session.events.info(format!("Moving to {} (X={}, Y={})", target.id, target.x, target.y));
        match move_and_settle(controller, target, plan.move_timeout).await {
            Ok(()) => {
                let report = sink.capture(visit).await;
                if let Some(e) = report.metadata_error {
                    session.events.warning(format!("{}: {}", target.id, e));
                }
                session.record(report.result);
            }
            Err(e) => {
                session.record(CaptureResult::failure(&target.id, e.to_string()));
                let stop = if e.is_fatal() {
                    Some(RunOutcome::Failed(e.to_string()))
                } else if plan.failure_policy == FailurePolicy::Abort {
                    session.events.warning(format!("Aborting run after failure at {}", target.id));
                    Some(RunOutcome::Aborted(e.to_string()))
                } else {
                    None
                };
                if let Some(outcome) = stop {
                    session.events.emit(RunEvent::Progress { completed: completed + 1, total });
                    return outcome;
                }
            }
        }
        session.events.emit(RunEvent::Progress { completed: completed + 1, total });
    }
    RunOutcome::Completed
}

async fn return_to_origin(controller: &mut MotionController, limit: Duration, events: &EventSink) {
    events.info("Returning to origin".into());
    let returned = match controller.return_to_origin().await {
        Ok(()) => controller.await_idle(limit).await.map(drop),
        Err(e) => Err(e),
    };
    match returned {
        Ok(()) => events.info("Returned to origin".into()),
        Err(e) => events.warning(format!("Return to origin failed: {}", e)),
    }
}

/// Runs one capture session to completion on the current runtime.
/// Hardware is acquired through `open`, and released before `Finished` is emitted.
async fn run_session<F, Fut>(plan: RunPlan, open: F, events: EventSink, cancel: CancelHandle) -> RunSummary
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = RigResult<Hardware>>,
{
    let visits = expand_visits(&plan.targets, plan.repetitions);
    let mut session = RunSession::new(&plan, events.clone());
    events.info(format!(
        "Starting run: {} targets, {} visits, session {}",
        plan.targets.len(),
        visits.len(),
        plan.session_dir.display()
    ));
    let outcome = match tokio::fs::create_dir_all(&plan.session_dir).await {
        Err(e) => {
            let e = RigError::from(e);
            events.error(format!("Cannot create {}: {}", plan.session_dir.display(), e));
            RunOutcome::Failed(e.to_string())
        }
        Ok(()) => match open().await {
            Err(e) => {
                events.error(format!("Cannot start run: {}", e));
                RunOutcome::Failed(e.to_string())
            }
            Ok(Hardware { mut controller, camera }) => {
                controller.set_observer(Arc::new(EventObserver(events.clone())));
                let mut sink = CaptureSink::new(
                    camera,
                    plan.session_dir.clone(),
                    plan.tuning.clone(),
                    plan.naming,
                    plan.repetitions,
                );
                events.info(format!("Using {}", sink.describe_camera()));
                let outcome = match initialize(&mut controller, &plan, &events).await {
                    Err(e) => {
                        // Position is unknown, so there is nowhere safe to return to.
                        events.error(format!("Controller initialization failed: {}", e));
                        RunOutcome::Failed(e.to_string())
                    }
                    Ok(()) => {
                        let outcome = visit_all(&mut session, &mut controller, &mut sink, &visits, &plan, &cancel).await;
                        return_to_origin(&mut controller, plan.move_timeout, &events).await;
                        outcome
                    }
                };
                sink.release();
                controller.close().await;
                events.info("Camera released and serial link closed".into());
                outcome
            }
        },
    };
    let summary = session.summary(outcome);
    debug!("run summary: {:?}", summary);
    events.emit(RunEvent::Finished(summary.clone()));
    summary
}

/// Devices with a run in progress, across every sequencer in the process.
static CLAIMED_DEVICES: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn claimed_devices() -> MutexGuard<'static, Vec<String>> {
    CLAIMED_DEVICES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive use of a serial device until dropped.
#[derive(Debug)]
pub struct DeviceClaim(String);

impl DeviceClaim {
    pub fn acquire(device: &str) -> RigResult<Self> {
        let mut claimed = claimed_devices();
        if claimed.iter().any(|d| d == device) {
            return Err(RigError::Busy);
        }
        claimed.push(device.to_string());
        Ok(DeviceClaim(device.to_string()))
    }
    pub fn is_claimed(device: &str) -> bool {
        claimed_devices().iter().any(|d| d == device)
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claimed_devices().retain(|d| *d != self.0);
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Starts runs on a dedicated worker thread, at most one at a time per sequencer and per device.
#[derive(Debug, Clone, Default)]
pub struct CaptureSequencer {
    busy: Arc<AtomicBool>,
}

impl CaptureSequencer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
    /// Rejected with [`RigError::Busy`] while another run still holds this sequencer or the device.
    /// `open` runs on the worker so device handles belong to the worker's runtime.
    pub fn start<F, Fut>(&self, plan: RunPlan, open: F) -> RigResult<RunHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RigResult<Hardware>> + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RigError::Busy);
        }
        let guard = BusyGuard(self.busy.clone());
        let claim = DeviceClaim::acquire(&plan.device)?;
        let (events, receiver) = EventSink::channel();
        let cancel = CancelHandle::default();
        let worker_cancel = cancel.clone();
        let worker = thread::Builder::new()
            .name("capture-worker".into())
            .spawn(move || {
                let _guard = guard;
                let _claim = claim;
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        events.error(format!("Cannot start worker runtime: {}", e));
                        return None;
                    }
                };
                Some(runtime.block_on(run_session(plan, open, events, worker_cancel)))
            })?;
        Ok(RunHandle { events: receiver, cancel, worker })
    }
}

pub struct RunHandle {
    events: UnboundedReceiver<RunEvent>,
    cancel: CancelHandle,
    worker: thread::JoinHandle<Option<RunSummary>>,
}

/// The worker side of a [`RunHandle`] once its events have been taken as a stream.
pub struct RunWorker {
    cancel: CancelHandle,
    worker: thread::JoinHandle<Option<RunSummary>>,
}

fn join_worker(worker: thread::JoinHandle<Option<RunSummary>>) -> RigResult<RunSummary> {
    match worker.join() {
        Ok(Some(summary)) => Ok(summary),
        Ok(None) => Err(RigError::Transport("capture worker could not start".into())),
        Err(_) => Err(RigError::Transport("capture worker panicked".into())),
    }
}

impl RunHandle {
    pub fn blocking_next_event(&mut self) -> Option<RunEvent> {
        self.events.blocking_recv()
    }
    pub fn into_stream(self) -> (UnboundedReceiverStream<RunEvent>, RunWorker) {
        (
            UnboundedReceiverStream::new(self.events),
            RunWorker { cancel: self.cancel, worker: self.worker },
        )
    }
    /// Blocks until the worker has released the hardware.
    pub fn join(self) -> RigResult<RunSummary> {
        join_worker(self.worker)
    }
}

impl RunWorker {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
    pub fn join(self) -> RigResult<RunSummary> {
        join_worker(self.worker)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use image::DynamicImage;
    use machine_mock::{GrblSimulator, Journal, SimulatorSettings};
    use tokio::io::split;

    use super::*;
    use crate::{
        capture::SyntheticCamera,
        cnc::{connection::SerialLink, grbl::controller::ControllerTimeouts},
    };

    fn abc() -> Vec<Target> {
        vec![Target::new("A", 0.0, 0.0), Target::new("B", 10.0, 0.0), Target::new("C", 10.0, 10.0)]
    }

    fn plan(targets: Vec<Target>, session_dir: PathBuf) -> RunPlan {
        RunPlan {
            device: format!("sim:{}", session_dir.display()),
            targets,
            repetitions: 1,
            feed_rate: 14000.0,
            move_timeout: Duration::from_secs(2),
            home_timeout: Duration::from_secs(2),
            home_on_start: true,
            failure_policy: FailurePolicy::Continue,
            session_dir,
            tuning: CameraTuning { stabilization_ms: 1, ..Default::default() },
            naming: NamingScheme::TargetId,
        }
    }

    async fn simulated_hardware(settings: SimulatorSettings, camera: Box<dyn Camera>) -> RigResult<Hardware> {
        let (host, _journal, _task) = GrblSimulator::new(settings).spawn();
        let (reader, writer) = split(host);
        let timeouts = ControllerTimeouts {
            ack: Duration::from_secs(2),
            home: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
        };
        let mut controller = MotionController::new(SerialLink::new(reader, writer), timeouts);
        controller.handshake(Duration::from_millis(10)).await?;
        Ok(Hardware { controller, camera })
    }

    /// Builds an opener around a simulator whose journal the test keeps.
    fn opener(
        settings: SimulatorSettings,
        camera: Box<dyn Camera>,
    ) -> (impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = RigResult<Hardware>>>> + Send, Journal) {
        let simulator = GrblSimulator::new(settings);
        let journal = simulator.journal();
        let open = move || -> std::pin::Pin<Box<dyn Future<Output = RigResult<Hardware>>>> {
            Box::pin(async move {
                let (host, _, _task) = simulator.spawn();
                let (reader, writer) = split(host);
                let timeouts = ControllerTimeouts {
                    ack: Duration::from_secs(2),
                    home: Duration::from_secs(2),
                    poll_interval: Duration::from_millis(20),
                };
                let mut controller = MotionController::new(SerialLink::new(reader, writer), timeouts);
                controller.handshake(Duration::from_millis(10)).await?;
                Ok(Hardware { controller, camera })
            })
        };
        (open, journal)
    }

    fn small_camera() -> Box<dyn Camera> {
        Box::new(SyntheticCamera::new(32, 18))
    }

    fn drain(mut receiver: UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn results(events: &[RunEvent]) -> Vec<CaptureResult> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Result(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn log_lines(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Log { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Cancels the run from inside the camera after a given number of reads.
    struct CancellingCamera {
        inner: SyntheticCamera,
        reads: usize,
        cancel_after: usize,
        cancel: CancelHandle,
    }
    #[async_trait]
    impl Camera for CancellingCamera {
        async fn read_frame(&mut self) -> Option<DynamicImage> {
            self.reads += 1;
            let frame = self.inner.read_frame().await;
            if self.reads == self.cancel_after {
                self.cancel.cancel();
            }
            frame
        }
        fn release(&mut self) {
            self.inner.release();
        }
        fn describe(&self) -> String {
            "cancelling camera".into()
        }
    }

    #[tokio::test]
    async fn moves_are_issued_in_target_order() {
        let dir = tempfile::tempdir().unwrap();
        let (open, journal) = opener(SimulatorSettings::default(), small_camera());
        let (events, receiver) = EventSink::channel();
        let summary = run_session(plan(abc(), dir.path().join("session")), open, events, CancelHandle::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!((summary.attempted, summary.succeeded), (3, 3));
        assert_eq!(journal.moves(), ["G1 X0 Y0", "G1 X10 Y0", "G1 X10 Y10", "G0 X0 Y0"]);
        // Every move after the first waits for an idle report on the previous one.
        let commands = journal.commands();
        let positions: Vec<usize> = ["G1 X0 Y0", "G1 X10 Y0", "G1 X10 Y10"]
            .iter()
            .map(|m| commands.iter().position(|c| c == m).unwrap())
            .collect();
        for pair in positions.windows(2) {
            assert!(commands[pair[0]..pair[1]].iter().any(|c| c == "?"));
        }
        let events = drain(receiver);
        let ids: Vec<_> = results(&events).into_iter().map(|r| r.target_id).collect();
        assert_eq!(ids, ["A", "B", "C"]);
        assert!(dir.path().join("session").join("C.jpg").exists());
        assert!(matches!(events.last(), Some(RunEvent::Finished(_))));
        assert!(events.contains(&RunEvent::Progress { completed: 3, total: 3 }));
    }

    #[tokio::test]
    async fn cancelling_after_b_skips_c_and_returns_home() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelHandle::default();
        // Two reads per capture: A takes reads 1-2, B takes 3-4.
        let camera = CancellingCamera {
            inner: SyntheticCamera::new(16, 9),
            reads: 0,
            cancel_after: 4,
            cancel: cancel.clone(),
        };
        let (open, journal) = opener(SimulatorSettings::default(), Box::new(camera));
        let (events, receiver) = EventSink::channel();
        let summary = run_session(plan(abc(), dir.path().to_path_buf()), open, events, cancel).await;
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        let events = drain(receiver);
        let ids: Vec<_> = results(&events).into_iter().map(|r| r.target_id).collect();
        assert_eq!(ids, ["A", "B"]);
        assert!(log_lines(&events).iter().any(|line| line == "Returned to origin"));
        assert_eq!(journal.moves(), ["G1 X0 Y0", "G1 X10 Y0", "G0 X0 Y0"]);
    }

    #[tokio::test]
    async fn rejected_move_is_recorded_and_the_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SimulatorSettings::default();
        settings.rejected.insert("G1 X10 Y0".into(), 33);
        let (open, _journal) = opener(settings, small_camera());
        let (events, receiver) = EventSink::channel();
        let summary = run_session(plan(abc(), dir.path().to_path_buf()), open, events, CancelHandle::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!((summary.attempted, summary.succeeded, summary.failed), (3, 2, 1));
        let failed = results(&drain(receiver)).into_iter().find(|r| !r.succeeded).unwrap();
        assert_eq!(failed.target_id, "B");
        assert!(failed.error.unwrap().contains("error:33"));
    }

    #[tokio::test]
    async fn abort_policy_stops_at_the_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SimulatorSettings::default();
        settings.rejected.insert("G1 X10 Y0".into(), 33);
        let (open, journal) = opener(settings, small_camera());
        let (events, receiver) = EventSink::channel();
        let mut plan = plan(abc(), dir.path().to_path_buf());
        plan.failure_policy = FailurePolicy::Abort;
        let summary = run_session(plan, open, events, CancelHandle::default()).await;
        assert!(matches!(summary.outcome, RunOutcome::Aborted(_)));
        assert_eq!((summary.attempted, summary.failed), (2, 1));
        assert_eq!(journal.moves().last().map(String::as_str), Some("G0 X0 Y0"));
        let progress: Vec<_> = drain(receiver)
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::Progress { completed, total } => Some((completed, total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, [(0, 3), (1, 3), (2, 3)]);
    }

    #[tokio::test]
    async fn slow_moves_time_out_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SimulatorSettings { move_duration: Duration::from_millis(400), ..Default::default() };
        let (open, _journal) = opener(settings, small_camera());
        let (events, receiver) = EventSink::channel();
        let mut plan = plan(abc(), dir.path().to_path_buf());
        plan.home_on_start = false;
        plan.move_timeout = Duration::from_millis(100);
        let summary = run_session(plan, open, events, CancelHandle::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!((summary.attempted, summary.failed), (3, 3));
        let events = drain(receiver);
        assert!(results(&events).iter().all(|r| r.error.as_deref().is_some_and(|e| e.contains("not idle"))));
        assert!(log_lines(&events).iter().any(|line| line.starts_with("Return to origin failed")));
    }

    #[tokio::test]
    async fn lost_link_fails_the_run_after_recording_the_target() {
        let dir = tempfile::tempdir().unwrap();
        // Lines: $X, $, G1 F14000, A, B.
        let settings = SimulatorSettings { hang_up_at: Some(4), ..Default::default() };
        let (open, _journal) = opener(settings, small_camera());
        let (events, receiver) = EventSink::channel();
        let mut plan = plan(abc(), dir.path().to_path_buf());
        plan.home_on_start = false;
        let summary = run_session(plan, open, events, CancelHandle::default()).await;
        assert!(matches!(summary.outcome, RunOutcome::Failed(_)));
        let events = drain(receiver);
        let recorded: Vec<_> = results(&events).into_iter().map(|r| (r.target_id, r.succeeded)).collect();
        assert_eq!(recorded, [("A".to_string(), true), ("B".to_string(), false)]);
        assert!(log_lines(&events).iter().any(|line| line.starts_with("Return to origin failed")));
    }

    #[tokio::test]
    async fn homing_alarm_is_fatal_before_any_move() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SimulatorSettings::default();
        settings.alarms.insert("$H".into(), 9);
        let (open, journal) = opener(settings, small_camera());
        let (events, _receiver) = EventSink::channel();
        let summary = run_session(plan(abc(), dir.path().to_path_buf()), open, events, CancelHandle::default()).await;
        assert!(matches!(summary.outcome, RunOutcome::Failed(_)));
        assert_eq!(summary.attempted, 0);
        assert!(journal.moves().is_empty());
    }

    #[tokio::test]
    async fn unavailable_device_ends_the_run_without_results() {
        let dir = tempfile::tempdir().unwrap();
        let (events, receiver) = EventSink::channel();
        let open = || async { Err::<Hardware, _>(RigError::connection("/dev/ttyUSB9", "No such file or directory")) };
        let summary = run_session(plan(abc(), dir.path().to_path_buf()), open, events, CancelHandle::default()).await;
        assert!(matches!(summary.outcome, RunOutcome::Failed(_)));
        assert_eq!(summary.attempted, 0);
        assert!(results(&drain(receiver)).is_empty());
    }

    /// Remembers whether `release` was called.
    struct WatchedCamera(Arc<AtomicBool>);
    #[async_trait]
    impl Camera for WatchedCamera {
        async fn read_frame(&mut self) -> Option<DynamicImage> {
            None
        }
        fn release(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
        fn describe(&self) -> String {
            "watched camera".into()
        }
    }

    #[tokio::test]
    async fn camera_is_released_when_the_controller_is_unreachable() {
        let released = Arc::new(AtomicBool::new(false));
        let camera = Box::new(WatchedCamera(released.clone()));
        let unreachable = async { Err(RigError::connection("/dev/ttyUSB9", "No such file or directory")) };
        let acquired = Hardware::acquire(camera, unreachable).await;
        assert!(matches!(acquired, Err(RigError::Connection { .. })));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acquired_hardware_keeps_the_camera_open() {
        let released = Arc::new(AtomicBool::new(false));
        let camera = Box::new(WatchedCamera(released.clone()));
        let (host, _journal, _task) = GrblSimulator::new(SimulatorSettings::default()).spawn();
        let (reader, writer) = split(host);
        let controller = async { Ok(MotionController::new(SerialLink::new(reader, writer), ControllerTimeouts::default())) };
        let hardware = Hardware::acquire(camera, controller).await.unwrap();
        assert_eq!(hardware.camera.describe(), "watched camera");
        assert!(!released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repetitions_visit_every_target_each_pass() {
        let dir = tempfile::tempdir().unwrap();
        let targets = vec![Target::new("A", 1.0, 1.0), Target::new("B", 2.0, 2.0)];
        let (events, receiver) = EventSink::channel();
        let mut plan = plan(targets, dir.path().to_path_buf());
        plan.repetitions = 2;
        plan.home_on_start = false;
        let open = || simulated_hardware(SimulatorSettings::default(), small_camera());
        let summary = run_session(plan, open, events, CancelHandle::default()).await;
        assert_eq!(summary.succeeded, 4);
        assert!(drain(receiver).contains(&RunEvent::Progress { completed: 4, total: 4 }));
        assert!(dir.path().join("B_r2.jpg").exists());
    }

    #[test]
    fn second_run_is_rejected_while_the_first_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let sequencer = CaptureSequencer::new();
        let slow = SimulatorSettings { move_duration: Duration::from_millis(150), ..Default::default() };
        let (open, journal) = opener(slow, small_camera());
        let mut first = sequencer.start(plan(abc(), dir.path().join("first")), open).unwrap();
        assert!(sequencer.is_busy());

        let (other_open, other_journal) = opener(SimulatorSettings::default(), small_camera());
        assert!(matches!(
            sequencer.start(plan(abc(), dir.path().join("second")), other_open),
            Err(RigError::Busy)
        ));

        while let Some(event) = first.blocking_next_event() {
            if matches!(event, RunEvent::Finished(_)) {
                break;
            }
        }
        let summary = first.join().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(journal.moves().len(), 4);
        assert!(other_journal.commands().is_empty());
        assert!(!sequencer.is_busy());

        let (open, _journal) = opener(SimulatorSettings::default(), small_camera());
        let again = sequencer.start(plan(abc(), dir.path().join("third")), open).unwrap();
        assert_eq!(again.join().unwrap().outcome, RunOutcome::Completed);
    }

    #[test]
    fn a_device_takes_one_run_across_sequencers() {
        let dir = tempfile::tempdir().unwrap();
        let device = format!("sim:{}", dir.path().display());
        let on_device = |name: &str| RunPlan { device: device.clone(), ..plan(abc(), dir.path().join(name)) };

        let slow = SimulatorSettings { move_duration: Duration::from_millis(150), ..Default::default() };
        let (open, _journal) = opener(slow, small_camera());
        let mut first = CaptureSequencer::new().start(on_device("first"), open).unwrap();
        assert!(DeviceClaim::is_claimed(&device));

        let other = CaptureSequencer::new();
        let (other_open, other_journal) = opener(SimulatorSettings::default(), small_camera());
        assert!(matches!(other.start(on_device("second"), other_open), Err(RigError::Busy)));
        assert!(!other.is_busy());
        assert!(other_journal.commands().is_empty());

        while let Some(event) = first.blocking_next_event() {
            if matches!(event, RunEvent::Finished(_)) {
                break;
            }
        }
        assert_eq!(first.join().unwrap().outcome, RunOutcome::Completed);
        assert!(!DeviceClaim::is_claimed(&device));

        let (open, _journal) = opener(SimulatorSettings::default(), small_camera());
        let again = other.start(on_device("third"), open).unwrap();
        assert_eq!(again.join().unwrap().outcome, RunOutcome::Completed);
    }
}
