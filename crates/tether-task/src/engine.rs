//! The task engine: fetch, dispatch, periodic schedules.
//!
//! All process-wide state the engine needs (the fetching gate, the
//! single-flight fetch lock, the factory, the schedule table) lives on the
//! engine struct and is injected where needed, so tests can instantiate
//! isolated engines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use tether_process::{ProcessRunner, RunStatus};
use tether_types::task::{
    FetchReason, RepeatMode, RunTaskInfo, SendFileTaskInfo, SessionTaskInfo,
};
use tether_types::AgentError;

use crate::factory::TaskFactory;
use crate::report::{StatusReporter, TaskReportStatus};
use crate::task::Task;
use crate::timer::{TimerCallback, TimerId, TimerManager};
use crate::TaskFetcher;

/// Sentinel returned by [`TaskEngine::fetch`] when another fetch is already
/// in progress. Negative so it can never collide with a dispatched count.
pub const ERR_UPDATING_PROCEDURE_RUNNING: i32 = -2;

/// Callback receiving file-push descriptors.
pub type SendFileHandler = Arc<dyn Fn(SendFileTaskInfo) + Send + Sync>;

/// Callback receiving session descriptors.
pub type SessionHandler = Arc<dyn Fn(SessionTaskInfo) + Send + Sync>;

/// One cron entry: the timer driving it plus the reusable invocation.
struct PeriodicSchedule {
    timer_id: TimerId,
    /// Re-registered in the factory and re-run on every firing.
    invocation: Arc<Task>,
}

/// The scheduler at the centre of the agent.
pub struct TaskEngine {
    fetch_enabled: AtomicBool,
    /// Zero-wait lock guaranteeing at most one concurrent fetch.
    fetch_lock: tokio::sync::Mutex<()>,
    factory: Arc<TaskFactory>,
    schedules: Mutex<HashMap<String, PeriodicSchedule>>,
    timers: Mutex<Option<Arc<TimerManager>>>,
    fetcher: Arc<dyn TaskFetcher>,
    runner: Arc<dyn ProcessRunner>,
    reporter: Option<Arc<dyn StatusReporter>>,
    send_file_handler: Mutex<Option<SendFileHandler>>,
    session_handler: Mutex<Option<SessionHandler>>,
}

impl TaskEngine {
    pub fn new(fetcher: Arc<dyn TaskFetcher>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            fetch_enabled: AtomicBool::new(false),
            fetch_lock: tokio::sync::Mutex::new(()),
            factory: Arc::new(TaskFactory::new()),
            schedules: Mutex::new(HashMap::new()),
            timers: Mutex::new(None),
            fetcher,
            runner,
            reporter: None,
            send_file_handler: Mutex::new(None),
            session_handler: Mutex::new(None),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn factory(&self) -> &Arc<TaskFactory> {
        &self.factory
    }

    /// Initialise the timer manager; idempotent.
    pub fn init_timer_manager(&self) -> Arc<TimerManager> {
        let mut timers = self.timers.lock().expect("timer slot lock poisoned");
        timers
            .get_or_insert_with(|| Arc::new(TimerManager::new()))
            .clone()
    }

    pub fn timer_manager(&self) -> Option<Arc<TimerManager>> {
        self.timers.lock().expect("timer slot lock poisoned").clone()
    }

    /// Open the process-wide fetching gate; set once at agent steady state.
    pub fn enable_fetching_task(&self) {
        self.fetch_enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_fetching_enabled(&self) -> bool {
        self.fetch_enabled.load(Ordering::SeqCst)
    }

    /// Route file-push descriptors to their subsystem.
    pub fn set_send_file_handler(&self, handler: SendFileHandler) {
        *self
            .send_file_handler
            .lock()
            .expect("handler lock poisoned") = Some(handler);
    }

    /// Route session descriptors to their subsystem.
    pub fn set_session_handler(&self, handler: SessionHandler) {
        *self.session_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Fetch a task batch and dispatch every item.
    ///
    /// Returns `0` when fetching is disabled or the round-trip failed,
    /// [`ERR_UPDATING_PROCEDURE_RUNNING`] when a fetch is already running,
    /// otherwise the number of dispatched items. Dispatcher errors are
    /// logged and counted; they never abort the batch.
    pub async fn fetch(
        &self,
        from_kick: bool,
        task_id: &str,
        task_type: i32,
        coldstart: bool,
    ) -> i32 {
        if !self.is_fetching_enabled() {
            return 0;
        }

        let Ok(_guard) = self.fetch_lock.try_lock() else {
            warn!("fetch already in progress, caller backs off");
            return ERR_UPDATING_PROCEDURE_RUNNING;
        };

        let reason = if from_kick {
            FetchReason::Kick
        } else {
            FetchReason::Routine
        };
        let batch = match self
            .fetcher
            .fetch_tasks(reason, task_id, task_type, coldstart)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, %reason, "task fetch failed");
                return 0;
            }
        };

        let dispatched = batch.len() as i32;
        info!(count = dispatched, %reason, coldstart, "dispatching task batch");

        for info in batch.run {
            if let Err(e) = self.dispatch_run_task(info).await {
                warn!(error = %e, "run dispatch failed");
            }
        }
        for info in batch.stop {
            if let Err(e) = self.dispatch_stop_task(info).await {
                warn!(error = %e, "stop dispatch failed");
            }
        }
        for info in batch.test {
            if let Err(e) = self.dispatch_test_task(info).await {
                warn!(error = %e, "test dispatch failed");
            }
        }
        for info in batch.send_file {
            let handler = self
                .send_file_handler
                .lock()
                .expect("handler lock poisoned")
                .clone();
            match handler {
                Some(handler) => handler(info),
                None => debug!(task_id = %info.task_id, "no send-file handler installed"),
            }
        }
        for info in batch.session {
            let handler = self
                .session_handler
                .lock()
                .expect("handler lock poisoned")
                .clone();
            match handler {
                Some(handler) => handler(info),
                None => debug!(session_id = %info.session_id, "no session handler installed"),
            }
        }

        dispatched
    }

    /// Dispatch one run descriptor.
    pub async fn dispatch_run_task(&self, info: RunTaskInfo) -> Result<(), AgentError> {
        let task_id = info.task_id.clone();
        if self.factory.contains(&task_id) {
            info!(%task_id, "task already dispatched, ignoring duplicate");
            return Ok(());
        }

        match info.repeat {
            RepeatMode::Unknown => {
                self.report_detached(&task_id, TaskReportStatus::Invalid, None);
                Err(AgentError::Task(format!(
                    "task {task_id}: unknown repeat mode"
                )))
            }
            RepeatMode::Cron => self.schedule_periodic_task(&info),
            RepeatMode::Once => {
                let task = Arc::new(Task::new(info));
                if let Err(AgentError::TaskExists(_)) = self.factory.add_task(task.clone()) {
                    info!(%task_id, "task raced into the factory, ignoring duplicate");
                    return Ok(());
                }
                let factory = self.factory.clone();
                let runner = self.runner.clone();
                let reporter = self.reporter.clone();
                tokio::spawn(async move {
                    run_and_report(factory, runner, reporter, task).await;
                });
                Ok(())
            }
        }
    }

    /// Dispatch one stop descriptor.
    pub async fn dispatch_stop_task(&self, info: RunTaskInfo) -> Result<(), AgentError> {
        let task_id = &info.task_id;
        let task = self.factory.get_task(task_id);
        let scheduled = self
            .schedules
            .lock()
            .expect("schedule table lock poisoned")
            .contains_key(task_id);

        if task.is_none() && !scheduled {
            warn!(%task_id, "stop for unknown task, dropped");
            return Ok(());
        }

        if let Some(task) = task {
            task.cancel();
            self.report_detached(task_id, TaskReportStatus::Canceled, None);
        }
        if scheduled {
            self.cancel_periodic_task(&info)?;
        }
        Ok(())
    }

    /// Dispatch one test descriptor: precheck only, never the command body.
    pub async fn dispatch_test_task(&self, info: RunTaskInfo) -> Result<(), AgentError> {
        let task_id = info.task_id.clone();
        if self.factory.contains(&task_id) {
            info!(%task_id, "task already dispatched, ignoring duplicate test");
            return Ok(());
        }

        let task = Task::new(info);
        match task.pre_check() {
            Ok(()) => {
                self.report_detached(&task_id, TaskReportStatus::Finished, Some(0));
                Ok(())
            }
            Err(e) => {
                self.report_detached(&task_id, TaskReportStatus::Invalid, None);
                Err(e)
            }
        }
    }

    /// Create a cron entry for the descriptor. Requires the timer manager;
    /// idempotent for an id that is already scheduled.
    pub fn schedule_periodic_task(&self, info: &RunTaskInfo) -> Result<(), AgentError> {
        let timers = self
            .timers
            .lock()
            .expect("timer slot lock poisoned")
            .clone()
            .ok_or(AgentError::TimerUninitialized)?;

        let mut schedules = self.schedules.lock().expect("schedule table lock poisoned");
        if schedules.contains_key(&info.task_id) {
            debug!(task_id = %info.task_id, "periodic task already scheduled");
            return Ok(());
        }
        if info.cron_expr.is_empty() {
            return Err(AgentError::Task(format!(
                "task {}: cron repeat without expression",
                info.task_id
            )));
        }

        let invocation = Arc::new(Task::new(info.clone()));
        let callback: TimerCallback = {
            let factory = self.factory.clone();
            let runner = self.runner.clone();
            let reporter = self.reporter.clone();
            let task = invocation.clone();
            Arc::new(move || {
                let factory = factory.clone();
                let runner = runner.clone();
                let reporter = reporter.clone();
                let task = task.clone();
                Box::pin(async move {
                    start_exclusive_invocation(factory, runner, reporter, task).await;
                })
            })
        };

        let timer_id = timers.create_cron_timer(&info.cron_expr, callback)?;
        schedules.insert(
            info.task_id.clone(),
            PeriodicSchedule {
                timer_id,
                invocation,
            },
        );
        info!(task_id = %info.task_id, cron = %info.cron_expr, "periodic task scheduled");
        Ok(())
    }

    /// Remove a cron entry: stop its timer and cancel any in-flight run.
    pub fn cancel_periodic_task(&self, info: &RunTaskInfo) -> Result<(), AgentError> {
        let timers = self
            .timers
            .lock()
            .expect("timer slot lock poisoned")
            .clone()
            .ok_or(AgentError::TimerUninitialized)?;

        let schedule = self
            .schedules
            .lock()
            .expect("schedule table lock poisoned")
            .remove(&info.task_id)
            .ok_or_else(|| AgentError::TaskNotFound(info.task_id.clone()))?;

        timers.stop_timer(schedule.timer_id);
        schedule.invocation.cancel();
        if let Some(in_flight) = self.factory.get_task(&info.task_id) {
            in_flight.cancel();
        }
        info!(task_id = %info.task_id, "periodic task cancelled");
        Ok(())
    }

    /// Best-effort status report that never blocks the dispatcher.
    fn report_detached(&self, task_id: &str, status: TaskReportStatus, exit_code: Option<i32>) {
        if let Some(reporter) = self.reporter.clone() {
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = reporter.report(&task_id, status, exit_code).await {
                    warn!(%task_id, error = %e, "status report dropped");
                }
            });
        }
    }
}

/// Run a once-task to completion, report, and free its factory slot.
async fn run_and_report(
    factory: Arc<TaskFactory>,
    runner: Arc<dyn ProcessRunner>,
    reporter: Option<Arc<dyn StatusReporter>>,
    task: Arc<Task>,
) {
    let task_id = task.info().task_id.clone();
    report_if(&reporter, &task_id, TaskReportStatus::Running, None).await;

    let (status, exit_code) = match task.run(runner.as_ref()).await {
        Ok(outcome) => {
            let status = match outcome.status {
                RunStatus::Success => TaskReportStatus::Finished,
                RunStatus::Fail => TaskReportStatus::Failed,
                RunStatus::Timeout => TaskReportStatus::Timeout,
            };
            (status, Some(outcome.exit_code))
        }
        Err(e) => {
            warn!(%task_id, error = %e, "task run failed");
            let status = if task.is_cancelled() {
                TaskReportStatus::Canceled
            } else {
                TaskReportStatus::Failed
            };
            (status, None)
        }
    };

    report_if(&reporter, &task_id, status, exit_code).await;
    factory.remove_task(&task_id);
}

/// Fire one periodic tick, guaranteeing single execution per task id.
///
/// If the previous invocation is still registered the tick is skipped, not
/// queued.
async fn start_exclusive_invocation(
    factory: Arc<TaskFactory>,
    runner: Arc<dyn ProcessRunner>,
    reporter: Option<Arc<dyn StatusReporter>>,
    task: Arc<Task>,
) {
    let task_id = task.info().task_id.clone();
    if factory.add_task(task.clone()).is_err() {
        debug!(%task_id, "previous invocation still running, tick skipped");
        return;
    }

    match task.run(runner.as_ref()).await {
        Ok(outcome) => {
            let status = match outcome.status {
                RunStatus::Success => TaskReportStatus::Finished,
                RunStatus::Fail => TaskReportStatus::Failed,
                RunStatus::Timeout => TaskReportStatus::Timeout,
            };
            report_if(&reporter, &task_id, status, Some(outcome.exit_code)).await;
        }
        Err(e) => {
            warn!(%task_id, error = %e, "periodic invocation failed");
            report_if(&reporter, &task_id, TaskReportStatus::Failed, None).await;
        }
    }
    factory.remove_task(&task_id);
}

async fn report_if(
    reporter: &Option<Arc<dyn StatusReporter>>,
    task_id: &str,
    status: TaskReportStatus,
    exit_code: Option<i32>,
) {
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.report(task_id, status, exit_code).await {
            warn!(%task_id, error = %e, "status report dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tether_process::{CommandSpec, RunOutcome};
    use tether_types::task::TaskBatch;
    use tokio::sync::Notify;

    /// Fetcher returning a canned batch, optionally blocking until notified.
    struct StubFetcher {
        batch: Mutex<TaskBatch>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl StubFetcher {
        fn returning(batch: TaskBatch) -> Arc<Self> {
            Arc::new(Self {
                batch: Mutex::new(batch),
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn blocking(batch: TaskBatch, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                batch: Mutex::new(batch),
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskFetcher for StubFetcher {
        async fn fetch_tasks(
            &self,
            _reason: FetchReason,
            _task_id: &str,
            _task_type: i32,
            _coldstart: bool,
        ) -> Result<TaskBatch, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.batch.lock().unwrap().clone())
        }
    }

    /// Runner that counts invocations and succeeds instantly.
    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ProcessRunner for CountingRunner {
        async fn run(&self, _spec: CommandSpec) -> Result<RunOutcome, AgentError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome {
                exit_code: 0,
                status: RunStatus::Success,
            })
        }
    }

    /// Runner whose runs never finish; keeps tasks registered.
    struct PendingRunner;

    #[async_trait]
    impl ProcessRunner for PendingRunner {
        async fn run(&self, _spec: CommandSpec) -> Result<RunOutcome, AgentError> {
            futures_util::future::pending().await
        }
    }

    fn once_task(id: &str) -> RunTaskInfo {
        RunTaskInfo {
            task_id: id.into(),
            command: "echo hi".into(),
            command_type: "RunShellScript".into(),
            repeat: RepeatMode::Once,
            timeout_secs: 10,
            ..Default::default()
        }
    }

    fn cron_task(id: &str) -> RunTaskInfo {
        RunTaskInfo {
            task_id: id.into(),
            command: "echo tick".into(),
            command_type: "RunShellScript".into(),
            repeat: RepeatMode::Cron,
            cron_expr: "0 0 0 1 1 *".into(),
            timeout_secs: 10,
            ..Default::default()
        }
    }

    fn engine_with(
        fetcher: Arc<dyn TaskFetcher>,
        runner: Arc<dyn ProcessRunner>,
    ) -> TaskEngine {
        TaskEngine::new(fetcher, runner)
    }

    #[tokio::test]
    async fn fetch_disabled_returns_zero_without_calling_server() {
        let fetcher = StubFetcher::returning(TaskBatch::default());
        let engine = engine_with(fetcher.clone(), Arc::new(CountingRunner::default()));

        assert_eq!(engine.fetch(false, "", 0, false).await, 0);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn empty_batch_dispatches_nothing() {
        let fetcher = StubFetcher::returning(TaskBatch::default());
        let engine = engine_with(fetcher.clone(), Arc::new(CountingRunner::default()));
        engine.enable_fetching_task();

        assert_eq!(engine.fetch(false, "", 0, false).await, 0);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn full_batch_counts_every_category() {
        let batch = TaskBatch {
            run: vec![once_task("t-run")],
            stop: vec![once_task("t-stop")],
            test: vec![once_task("t-test")],
            send_file: vec![SendFileTaskInfo {
                task_id: "t-file".into(),
                ..Default::default()
            }],
            session: vec![SessionTaskInfo {
                session_id: "s-1".into(),
                ..Default::default()
            }],
        };
        let fetcher = StubFetcher::returning(batch);
        let engine = engine_with(fetcher, Arc::new(CountingRunner::default()));
        engine.enable_fetching_task();

        let sessions = Arc::new(AtomicUsize::new(0));
        let files = Arc::new(AtomicUsize::new(0));
        {
            let sessions = sessions.clone();
            engine.set_session_handler(Arc::new(move |_| {
                sessions.fetch_add(1, Ordering::SeqCst);
            }));
            let files = files.clone();
            engine.set_send_file_handler(Arc::new(move |_| {
                files.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(engine.fetch(true, "", 0, false).await, 5);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
        assert_eq!(files.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_fetch_gets_the_sentinel() {
        let gate = Arc::new(Notify::new());
        let fetcher = StubFetcher::blocking(TaskBatch::default(), gate.clone());
        let engine = Arc::new(engine_with(
            fetcher.clone(),
            Arc::new(CountingRunner::default()),
        ));
        engine.enable_fetching_task();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch(false, "", 0, false).await })
        };
        // Let the first fetch take the lock and park on the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            engine.fetch(true, "", 0, false).await,
            ERR_UPDATING_PROCEDURE_RUNNING
        );

        gate.notify_one();
        assert_eq!(first.await.unwrap(), 0);
        // The lock was released: a later fetch succeeds again.
        gate.notify_one();
        assert_eq!(engine.fetch(false, "", 0, false).await, 0);
    }

    #[tokio::test]
    async fn duplicate_run_dispatch_is_a_noop() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(PendingRunner),
        );

        engine.dispatch_run_task(once_task("abc")).await.unwrap();
        engine.dispatch_run_task(once_task("abc")).await.unwrap();
        assert_eq!(engine.factory().len(), 1);
    }

    #[tokio::test]
    async fn unknown_repeat_mode_is_rejected() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(CountingRunner::default()),
        );
        let mut info = once_task("t-weird");
        info.repeat = RepeatMode::Unknown;

        let err = engine.dispatch_run_task(info).await.unwrap_err();
        assert!(err.to_string().contains("unknown repeat mode"));
        assert!(engine.factory().is_empty());
    }

    #[tokio::test]
    async fn schedule_requires_timer_manager_and_is_idempotent() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(CountingRunner::default()),
        );
        let info = cron_task("abc");

        let err = engine.schedule_periodic_task(&info).unwrap_err();
        assert!(matches!(err, AgentError::TimerUninitialized));

        engine.init_timer_manager();
        engine.schedule_periodic_task(&info).unwrap();
        let timers = engine.timer_manager().unwrap();
        assert_eq!(timers.len(), 1);

        // Second call: success, no new timer.
        engine.schedule_periodic_task(&info).unwrap();
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test]
    async fn cancel_periodic_task_stops_timer_and_in_flight_run() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(CountingRunner::default()),
        );
        engine.init_timer_manager();
        let info = cron_task("abc");

        let err = engine.cancel_periodic_task(&info).unwrap_err();
        assert!(matches!(err, AgentError::TaskNotFound(_)));

        engine.schedule_periodic_task(&info).unwrap();
        engine.cancel_periodic_task(&info).unwrap();
        assert_eq!(engine.timer_manager().unwrap().len(), 0);

        // Cancelled entries can be rescheduled from scratch.
        engine.schedule_periodic_task(&info).unwrap();
        engine.cancel_periodic_task(&info).unwrap();
    }

    #[tokio::test]
    async fn exclusive_invocation_skips_while_previous_run_is_live() {
        let factory = Arc::new(TaskFactory::new());
        let runner = Arc::new(CountingRunner::default());
        let task = Arc::new(Task::new(once_task("abc")));

        // Simulate a still-running previous invocation.
        factory
            .add_task(Arc::new(Task::new(once_task("abc"))))
            .unwrap();
        start_exclusive_invocation(factory.clone(), runner.clone(), None, task.clone()).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        // Once the slot frees up, the next tick runs and cleans up after
        // itself.
        factory.remove_task("abc");
        start_exclusive_invocation(factory.clone(), runner.clone(), None, task).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(factory.is_empty());
    }

    #[tokio::test]
    async fn stop_for_unknown_task_is_dropped() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(CountingRunner::default()),
        );
        engine.dispatch_stop_task(once_task("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_running_task_and_cron_entry() {
        let engine = engine_with(
            StubFetcher::returning(TaskBatch::default()),
            Arc::new(PendingRunner),
        );
        engine.init_timer_manager();

        // A running once-task gets cancelled.
        engine.dispatch_run_task(once_task("t-once")).await.unwrap();
        let task = engine.factory().get_task("t-once").unwrap();
        engine.dispatch_stop_task(once_task("t-once")).await.unwrap();
        assert!(task.is_cancelled());

        // A cron entry is removed along with its timer.
        let info = cron_task("t-cron");
        engine.schedule_periodic_task(&info).unwrap();
        engine.dispatch_stop_task(info).await.unwrap();
        assert_eq!(engine.timer_manager().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_prechecks_without_running() {
        let runner = Arc::new(CountingRunner::default());
        let engine = engine_with(StubFetcher::returning(TaskBatch::default()), runner.clone());

        engine.dispatch_test_task(once_task("t-test")).await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        let mut bad = once_task("t-bad");
        bad.command_type = "RunJavaScript".into();
        assert!(engine.dispatch_test_task(bad).await.is_err());
    }

    #[tokio::test]
    async fn fetch_error_returns_zero_and_keeps_gate_open() {
        struct FailingFetcher;

        #[async_trait]
        impl TaskFetcher for FailingFetcher {
            async fn fetch_tasks(
                &self,
                _reason: FetchReason,
                _task_id: &str,
                _task_type: i32,
                _coldstart: bool,
            ) -> Result<TaskBatch, AgentError> {
                Err(AgentError::Http("connection refused".into()))
            }
        }

        let engine = engine_with(Arc::new(FailingFetcher), Arc::new(CountingRunner::default()));
        engine.enable_fetching_task();

        assert_eq!(engine.fetch(false, "", 0, false).await, 0);
        assert!(engine.is_fetching_enabled());
    }
}
