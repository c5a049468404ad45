//! The MAPE engine: one agent's monitor → analyze → plan → execute loop.
//!
//! A [`Controller`] owns at most one platform, at most one algorithm and an
//! ordered list of accents. [`Controller::run_cycle`] drives a single pass
//! under an exclusive hold on the knowledge store; [`Controller::run`]
//! repeats it on a fixed period while throttling broadcasts separately.

/// Builder for [`Controller`].
pub mod maker;
/// Run timing and epoch arithmetic.
pub mod scheduler;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use maker::ControllerBuilder;
use parking_lot::{Mutex, RwLock};
use scheduler::{advance_epoch, RunTiming};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::time::{sleep_until, Instant};

use crate::{
    behaviors::{
        builtin,
        factory::{AlgorithmFactory, AlgorithmRegistry, PlatformFactory, PlatformRegistry},
        Algorithm, AlgorithmBindings, Platform, PlatformBindings, PlatformHandle, SharedPlatform,
        Status,
    },
    error::ControllerError,
    knowledge::{KnowledgeBase, KnowledgeValue},
    telemetry::ControllerTelemetry,
    variables::{Devices, SelfRecord, SensorRegistry, SwarmRecord},
};

/// Counters describing what the controller has done so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerMetrics {
    /// Completed MAPE cycles.
    pub cycles: u64,
    /// Broadcast steps taken.
    pub broadcasts: u64,
    /// Keys sent across all broadcasts.
    pub keys_sent: u64,
    /// Aggregate status of the last cycle.
    pub last_status: Status,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self {
            cycles: 0,
            broadcasts: 0,
            keys_sent: 0,
            last_status: Status::OK,
            updated_at: Utc::now(),
        }
    }
}

/// Single-agent MAPE controller.
pub struct Controller {
    knowledge: KnowledgeBase,
    telemetry: ControllerTelemetry,
    self_record: SelfRecord,
    swarm: SwarmRecord,
    devices: Devices,
    sensors: SensorRegistry,
    algorithms: AlgorithmRegistry,
    platforms: PlatformRegistry,
    platform: Option<SharedPlatform>,
    algorithm: Option<Box<dyn Algorithm>>,
    accents: Vec<Box<dyn Algorithm>>,
    metrics: Arc<RwLock<ControllerMetrics>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("agent", &self.self_record.id)
            .field("platform", &self.platform_name())
            .field("algorithm", &self.algorithm_name())
            .field("accents", &self.accent_names())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller for agent 0 of a one-agent swarm with the
    /// built-in behaviors registered and telemetry disabled.
    #[must_use]
    pub fn new(knowledge: KnowledgeBase) -> Self {
        Self::builder(knowledge).build()
    }

    /// Returns a builder for the controller.
    #[must_use]
    pub fn builder(knowledge: KnowledgeBase) -> ControllerBuilder {
        ControllerBuilder::new(knowledge)
    }

    pub(crate) fn assemble(
        knowledge: KnowledgeBase,
        telemetry: ControllerTelemetry,
        sensors: SensorRegistry,
        builtins: bool,
    ) -> Self {
        let mut algorithms = AlgorithmRegistry::new("algorithm");
        let mut platforms = PlatformRegistry::new("platform");
        if builtins {
            builtin::register_algorithms(&mut algorithms);
            builtin::register_platforms(&mut platforms);
        }
        Self {
            self_record: SelfRecord::init(&knowledge, 0),
            swarm: SwarmRecord::init(&knowledge, 1),
            devices: Devices::init(&knowledge, 1),
            knowledge,
            telemetry,
            sensors,
            algorithms,
            platforms,
            platform: None,
            algorithm: None,
            accents: Vec::new(),
            metrics: Arc::new(RwLock::new(ControllerMetrics::default())),
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        let _ = self.telemetry.log(level, message, metadata);
    }

    /// Knowledge store driven by this controller.
    #[must_use]
    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Telemetry handle.
    #[must_use]
    pub fn telemetry(&self) -> &ControllerTelemetry {
        &self.telemetry
    }

    /// The agent's own record.
    #[must_use]
    pub fn self_record(&self) -> &SelfRecord {
        &self.self_record
    }

    /// The swarm-wide record.
    #[must_use]
    pub fn swarm(&self) -> &SwarmRecord {
        &self.swarm
    }

    /// Records of every agent.
    #[must_use]
    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Sensors shared with bound behaviors.
    #[must_use]
    pub fn sensors(&self) -> &SensorRegistry {
        &self.sensors
    }

    /// Known algorithm constructors (also used for accents).
    #[must_use]
    pub fn algorithm_registry(&self) -> &AlgorithmRegistry {
        &self.algorithms
    }

    /// Known platform constructors.
    #[must_use]
    pub fn platform_registry(&self) -> &PlatformRegistry {
        &self.platforms
    }

    /// Active algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Option<&dyn Algorithm> {
        self.algorithm.as_deref()
    }

    /// Name of the active algorithm.
    #[must_use]
    pub fn algorithm_name(&self) -> Option<String> {
        self.algorithm.as_ref().map(|algorithm| algorithm.name().to_owned())
    }

    /// Handle to the active platform.
    #[must_use]
    pub fn platform(&self) -> Option<PlatformHandle> {
        self.platform.as_ref().map(PlatformHandle::new)
    }

    /// Name of the active platform.
    #[must_use]
    pub fn platform_name(&self) -> Option<String> {
        self.platform
            .as_ref()
            .map(|platform| platform.lock().name().to_owned())
    }

    /// Accent names in execution order.
    #[must_use]
    pub fn accent_names(&self) -> Vec<String> {
        self.accents
            .iter()
            .map(|accent| accent.name().to_owned())
            .collect()
    }

    /// Returns the latest metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ControllerMetrics {
        self.metrics.read().clone()
    }

    /// Registers an algorithm constructor under every alias.
    pub fn add_algorithm_factory<I, S>(&mut self, aliases: I, factory: Arc<dyn AlgorithmFactory>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.algorithms.add(aliases, factory);
    }

    /// Registers a platform constructor under every alias.
    pub fn add_platform_factory<I, S>(&mut self, aliases: I, factory: Arc<dyn PlatformFactory>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms.add(aliases, factory);
    }

    fn platform_bindings(&self) -> PlatformBindings {
        PlatformBindings {
            knowledge: self.knowledge.clone(),
            self_record: self.self_record.clone(),
            sensors: self.sensors.clone(),
        }
    }

    fn algorithm_bindings(&self) -> AlgorithmBindings {
        AlgorithmBindings {
            knowledge: self.knowledge.clone(),
            self_record: self.self_record.clone(),
            sensors: self.sensors.clone(),
            devices: self.devices.clone(),
            platform: self.platform(),
        }
    }

    /// Rebuilds the Self, Swarm and device records and rebinds every
    /// active behavior to them.
    pub fn init_vars(&mut self, id: u64, processes: u64) {
        self.log(
            LogLevel::Major,
            "controller.vars.init",
            json!({ "id": id, "processes": processes }),
        );
        self.self_record = SelfRecord::init(&self.knowledge, id);
        self.swarm = SwarmRecord::init(&self.knowledge, processes);
        self.devices = Devices::init(&self.knowledge, processes);

        if let Some(platform) = &self.platform {
            platform.lock().bind(self.platform_bindings());
        }
        let bindings = self.algorithm_bindings();
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.bind(bindings.clone());
        }
        for accent in &mut self.accents {
            accent.bind(bindings.clone());
        }
    }

    /// Replaces the algorithm with a newly constructed `name`.
    ///
    /// An empty name only logs the supported algorithms. Otherwise the
    /// current algorithm is destroyed before construction, so a failed
    /// construction leaves the slot empty.
    pub fn init_algorithm(
        &mut self,
        name: &str,
        args: &[KnowledgeValue],
    ) -> Result<(), ControllerError> {
        if name.is_empty() {
            self.log(
                LogLevel::Major,
                "controller.algorithm.help",
                json!({ "help": self.algorithms.help() }),
            );
            return Ok(());
        }
        self.destroy_algorithm();
        self.log(
            LogLevel::Major,
            "controller.algorithm.create",
            json!({ "name": name, "args": args }),
        );
        match self.algorithms.create(name, args, &self.algorithm_bindings()) {
            Ok(algorithm) => {
                self.install_algorithm(algorithm);
                Ok(())
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "controller.algorithm.failed",
                    json!({ "name": name, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Replaces the algorithm with `algorithm`; `None` empties the slot.
    pub fn init_algorithm_instance(&mut self, algorithm: Option<Box<dyn Algorithm>>) {
        self.destroy_algorithm();
        if let Some(algorithm) = algorithm {
            self.install_algorithm(algorithm);
        }
    }

    fn install_algorithm(&mut self, mut algorithm: Box<dyn Algorithm>) {
        algorithm.bind(self.algorithm_bindings());
        self.log(
            LogLevel::Major,
            "controller.algorithm.ready",
            json!({ "name": algorithm.name() }),
        );
        self.algorithm = Some(algorithm);
    }

    fn destroy_algorithm(&mut self) {
        if let Some(algorithm) = self.algorithm.take() {
            self.log(
                LogLevel::Minor,
                "controller.algorithm.destroy",
                json!({ "name": algorithm.name() }),
            );
        }
    }

    /// Replaces the platform with a newly constructed `name`.
    ///
    /// An empty name only logs the supported platforms. Otherwise the
    /// current platform is detached from the algorithm and accents and
    /// destroyed before construction; on success they are pointed at the new
    /// platform.
    pub fn init_platform(
        &mut self,
        name: &str,
        args: &[KnowledgeValue],
    ) -> Result<(), ControllerError> {
        if name.is_empty() {
            self.log(
                LogLevel::Major,
                "controller.platform.help",
                json!({ "help": self.platforms.help() }),
            );
            return Ok(());
        }
        self.destroy_platform();
        self.log(
            LogLevel::Major,
            "controller.platform.create",
            json!({ "name": name, "args": args }),
        );
        match self.platforms.create(name, args, &self.platform_bindings()) {
            Ok(platform) => {
                self.install_platform(platform);
                Ok(())
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "controller.platform.failed",
                    json!({ "name": name, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Replaces the platform with `platform`; `None` empties the slot.
    pub fn init_platform_instance(&mut self, platform: Option<Box<dyn Platform>>) {
        self.destroy_platform();
        if let Some(platform) = platform {
            self.install_platform(platform);
        }
    }

    fn install_platform(&mut self, mut platform: Box<dyn Platform>) {
        platform.bind(self.platform_bindings());
        self.log(
            LogLevel::Major,
            "controller.platform.ready",
            json!({ "name": platform.name() }),
        );
        let shared: SharedPlatform = Arc::new(Mutex::new(platform));
        let handle = PlatformHandle::new(&shared);
        self.platform = Some(shared);
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.set_platform(Some(handle.clone()));
        }
        for accent in &mut self.accents {
            accent.set_platform(Some(handle.clone()));
        }
    }

    fn destroy_platform(&mut self) {
        let Some(platform) = self.platform.take() else {
            return;
        };
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.set_platform(None);
        }
        for accent in &mut self.accents {
            accent.set_platform(None);
        }
        let name = platform.lock().name().to_owned();
        drop(platform);
        self.log(
            LogLevel::Minor,
            "controller.platform.destroy",
            json!({ "name": name }),
        );
    }

    /// Constructs `name` through the algorithm registry and appends it as an
    /// accent.
    pub fn init_accent(
        &mut self,
        name: &str,
        args: &[KnowledgeValue],
    ) -> Result<(), ControllerError> {
        if name.is_empty() {
            let err = ControllerError::EmptyName("accent");
            self.log(
                LogLevel::Error,
                "controller.accent.failed",
                json!({ "error": err.to_string() }),
            );
            return Err(err);
        }
        self.log(
            LogLevel::Major,
            "controller.accent.create",
            json!({ "name": name, "args": args }),
        );
        let bindings = self.algorithm_bindings();
        match self.algorithms.create(name, args, &bindings) {
            Ok(mut accent) => {
                accent.bind(bindings);
                self.accents.push(accent);
                Ok(())
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "controller.accent.failed",
                    json!({ "name": name, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Destroys every accent.
    pub fn clear_accents(&mut self) {
        self.log(
            LogLevel::Major,
            "controller.accent.clear",
            json!({ "count": self.accents.len() }),
        );
        self.accents.clear();
    }

    /// Lets the platform sense. A missing platform is logged and reports OK.
    pub fn monitor(&mut self) -> Status {
        if let Some(platform) = &self.platform {
            platform.lock().sense()
        } else {
            self.log(
                LogLevel::Warn,
                "controller.monitor.platform_missing",
                json!({}),
            );
            Status::OK
        }
    }

    /// Services a pending behavior request.
    ///
    /// The Self command wins over the Swarm command; the serviced command
    /// and its arguments are cleared even when construction fails.
    pub fn system_analyze(&mut self) -> Status {
        let device = self.self_record.device.clone();
        let swarm = self.swarm.clone();

        let command = device.command();
        if !command.is_empty() {
            let args = device.command_args();
            self.log(
                LogLevel::Major,
                "controller.command.self",
                json!({ "name": command, "args": args }),
            );
            let _ = self.init_algorithm(&command, &args);
            device.clear_command();
            return Status::OK;
        }

        let command = swarm.command();
        if !command.is_empty() {
            let args = swarm.command_args();
            self.log(
                LogLevel::Major,
                "controller.command.swarm",
                json!({ "name": command, "args": args }),
            );
            let _ = self.init_algorithm(&command, &args);
            swarm.clear_command();
        }
        Status::OK
    }

    /// Platform analysis, command servicing, then algorithm and accents.
    pub fn analyze(&mut self) -> Status {
        let mut status = Status::OK;
        if let Some(platform) = &self.platform {
            status |= platform.lock().analyze();
        } else {
            self.log(
                LogLevel::Warn,
                "controller.analyze.platform_missing",
                json!({}),
            );
        }

        status |= self.system_analyze();

        if let Some(algorithm) = self.algorithm.as_mut() {
            status |= algorithm.analyze();
        } else {
            self.log(
                LogLevel::Warn,
                "controller.analyze.algorithm_missing",
                json!({}),
            );
        }
        for accent in &mut self.accents {
            status |= accent.analyze();
        }
        status
    }

    /// Algorithm plan, then accents.
    pub fn plan(&mut self) -> Status {
        let mut status = Status::OK;
        if let Some(algorithm) = self.algorithm.as_mut() {
            status |= algorithm.plan();
        } else {
            self.log(
                LogLevel::Warn,
                "controller.plan.algorithm_missing",
                json!({}),
            );
        }
        for accent in &mut self.accents {
            status |= accent.plan();
        }
        status
    }

    /// Algorithm execute, then accents.
    pub fn execute(&mut self) -> Status {
        let mut status = Status::OK;
        if let Some(algorithm) = self.algorithm.as_mut() {
            status |= algorithm.execute();
        } else {
            self.log(
                LogLevel::Warn,
                "controller.execute.algorithm_missing",
                json!({}),
            );
        }
        for accent in &mut self.accents {
            status |= accent.execute();
        }
        status
    }

    fn log_modifieds(&self, phase: &str) {
        self.log(
            LogLevel::Major,
            "controller.cycle.modifieds",
            json!({ "phase": phase, "count": self.knowledge.modified_count() }),
        );
        if self.telemetry.enabled(LogLevel::Detailed) {
            self.log(
                LogLevel::Detailed,
                "controller.cycle.modifieds.dump",
                json!({ "phase": phase, "keys": self.knowledge.debug_modifieds() }),
            );
        }
    }

    /// Runs one MAPE pass while holding the knowledge store exclusively.
    ///
    /// Does not broadcast; see [`Self::run_once`].
    pub fn run_cycle(&mut self) -> Status {
        let knowledge = self.knowledge.clone();
        let _hold = knowledge.lock();

        let mut status = self.monitor();
        self.log_modifieds("monitor");
        status |= self.analyze();
        self.log_modifieds("analyze");
        status |= self.plan();
        self.log_modifieds("plan");
        status |= self.execute();
        self.log_modifieds("execute");

        let mut metrics = self.metrics.write();
        metrics.cycles += 1;
        metrics.last_status = status;
        metrics.updated_at = Utc::now();
        status
    }

    /// Sends every pending modification. Failures are logged, not returned.
    pub async fn broadcast(&mut self) -> usize {
        let knowledge = self.knowledge.clone();
        let sent = match knowledge.send_modifieds().await {
            Ok(sent) => sent,
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "controller.broadcast.failed",
                    json!({ "error": format!("{err:#}") }),
                );
                0
            }
        };
        {
            let mut metrics = self.metrics.write();
            metrics.broadcasts += 1;
            metrics.keys_sent += u64::try_from(sent).unwrap_or(u64::MAX);
            metrics.updated_at = Utc::now();
        }
        self.log(
            LogLevel::Minor,
            "controller.broadcast",
            json!({ "keys": sent }),
        );
        sent
    }

    /// One cycle followed by one broadcast.
    pub async fn run_once(&mut self) -> Status {
        let status = self.run_cycle();
        self.broadcast().await;
        status
    }

    /// Runs cycles every `loop_period` seconds for up to `max_runtime`
    /// seconds, broadcasting at most every `send_period` seconds.
    ///
    /// See [`RunTiming`] for the meaning of negative and zero values. The
    /// algorithm is destroyed when the loop ends.
    pub async fn run(&mut self, loop_period: f64, max_runtime: f64, send_period: f64) -> Status {
        self.run_with(RunTiming::new(loop_period, max_runtime, send_period))
            .await
    }

    /// [`Self::run`] with bundled timing.
    pub async fn run_with(&mut self, timing: RunTiming) -> Status {
        let mut status = Status::OK;
        self.log(
            LogLevel::Major,
            "controller.run.start",
            json!({
                "loop_period": timing.loop_period,
                "max_runtime": timing.max_runtime,
                "send_period": timing.send_period,
            }),
        );

        match timing.validate() {
            Err(err) => self.log(
                LogLevel::Error,
                "controller.run.invalid_timing",
                json!({ "error": err.to_string() }),
            ),
            Ok(()) if timing.loops() => status = self.run_loop(timing).await,
            Ok(()) => {}
        }

        self.destroy_algorithm();
        let metrics = self.metrics();
        self.log(
            LogLevel::Major,
            "controller.run.finished",
            json!({ "status": status.bits(), "cycles": metrics.cycles }),
        );
        let _ = self.telemetry.event(
            "controller.run.finished",
            json!({
                "status": status.bits(),
                "cycles": metrics.cycles,
                "broadcasts": metrics.broadcasts,
            }),
        );
        status
    }

    async fn run_loop(&mut self, timing: RunTiming) -> Status {
        let loop_interval = timing.loop_interval();
        let send_interval = timing.send_interval();
        let start = Instant::now();
        let deadline = timing.deadline(start);

        let mut status = Status::OK;
        let mut current = start;
        let mut next_epoch = later(start, loop_interval);
        let mut send_epoch = start;
        let mut first = true;

        while first || deadline.map_or(true, |deadline| current < deadline) {
            status = self.run_cycle();
            current = Instant::now();

            if first || current > send_epoch {
                self.broadcast().await;
                send_epoch = advance_epoch(send_epoch, send_interval, current);
            }

            if !loop_interval.is_zero() && current < next_epoch {
                sleep_until(next_epoch).await;
            } else {
                // back-to-back cycles still yield to the runtime
                tokio::task::yield_now().await;
            }
            next_epoch = later(next_epoch, loop_interval);
            first = false;
        }
        status
    }
}

/// Stand-in epoch offset when `instant + period` overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn later(instant: Instant, period: Duration) -> Instant {
    instant
        .checked_add(period)
        .unwrap_or_else(|| instant + FAR_FUTURE)
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.destroy_platform();
        self.destroy_algorithm();
        self.accents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_event_bus::{EventPublisher, EventRecord, MemoryEventBus};
    use shared_logging::MemoryLogger;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingAlgorithm {
        label: String,
        journal: Journal,
    }

    impl RecordingAlgorithm {
        fn new(label: &str, journal: &Journal) -> Self {
            journal.lock().push(format!("{label}.new"));
            Self {
                label: label.to_owned(),
                journal: Arc::clone(journal),
            }
        }

        fn note(&self, what: &str) -> Status {
            self.journal.lock().push(format!("{}.{what}", self.label));
            Status::OK
        }
    }

    impl Algorithm for RecordingAlgorithm {
        fn name(&self) -> &str {
            &self.label
        }

        fn bind(&mut self, _bindings: AlgorithmBindings) {
            self.note("bind");
        }

        fn set_platform(&mut self, platform: Option<PlatformHandle>) {
            match platform {
                Some(handle) if handle.is_attached() => self.note("set_platform"),
                _ => self.note("unset_platform"),
            };
        }

        fn analyze(&mut self) -> Status {
            self.note("analyze")
        }

        fn plan(&mut self) -> Status {
            self.note("plan")
        }

        fn execute(&mut self) -> Status {
            self.note("execute")
        }
    }

    impl Drop for RecordingAlgorithm {
        fn drop(&mut self) {
            self.note("drop");
        }
    }

    struct RecordingPlatform {
        label: String,
        journal: Journal,
        sense_status: Status,
    }

    impl RecordingPlatform {
        fn new(label: &str, journal: &Journal) -> Self {
            journal.lock().push(format!("{label}.new"));
            Self {
                label: label.to_owned(),
                journal: Arc::clone(journal),
                sense_status: Status::OK,
            }
        }

        fn note(&self, what: &str) {
            self.journal.lock().push(format!("{}.{what}", self.label));
        }
    }

    impl Platform for RecordingPlatform {
        fn name(&self) -> &str {
            &self.label
        }

        fn bind(&mut self, _bindings: PlatformBindings) {
            self.note("bind");
        }

        fn sense(&mut self) -> Status {
            self.note("sense");
            self.sense_status
        }

        fn analyze(&mut self) -> Status {
            self.note("analyze");
            Status::OK
        }
    }

    impl Drop for RecordingPlatform {
        fn drop(&mut self) {
            self.note("drop");
        }
    }

    fn recording_algorithm(label: &'static str, journal: &Journal) -> Arc<dyn AlgorithmFactory> {
        let journal = Arc::clone(journal);
        Arc::new(
            move |_: &[KnowledgeValue],
                  _: &AlgorithmBindings|
                  -> Result<Box<dyn Algorithm>, ControllerError> {
                Ok(Box::new(RecordingAlgorithm::new(label, &journal)))
            },
        )
    }

    fn recording_platform(label: &'static str, journal: &Journal) -> Arc<dyn PlatformFactory> {
        let journal = Arc::clone(journal);
        Arc::new(
            move |_: &[KnowledgeValue],
                  _: &PlatformBindings|
                  -> Result<Box<dyn Platform>, ControllerError> {
                Ok(Box::new(RecordingPlatform::new(label, &journal)))
            },
        )
    }

    fn broken_algorithm() -> Arc<dyn AlgorithmFactory> {
        Arc::new(
            |_: &[KnowledgeValue],
             _: &AlgorithmBindings|
             -> Result<Box<dyn Algorithm>, ControllerError> {
                Err(ControllerError::construction("algorithm", "broken", "no route"))
            },
        )
    }

    fn controller(journal: &Journal) -> Controller {
        let mut controller = Controller::builder(KnowledgeBase::new("agent.0"))
            .agent(0, 2)
            .build();
        for label in ["a", "b", "x", "y"] {
            controller.add_algorithm_factory([label], recording_algorithm(label, journal));
        }
        for label in ["p1", "p2"] {
            controller.add_platform_factory([label], recording_platform(label, journal));
        }
        controller.add_algorithm_factory(["broken"], broken_algorithm());
        controller
    }

    fn take(journal: &Journal) -> Vec<String> {
        std::mem::take(&mut *journal.lock())
            .into_iter()
            .filter(|entry| !entry.ends_with(".bind"))
            .collect()
    }

    #[test]
    fn phases_run_in_order_with_accents_last() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_platform("p1", &[]).unwrap();
        controller.init_algorithm("a", &[]).unwrap();
        controller.init_accent("x", &[]).unwrap();
        controller.init_accent("y", &[]).unwrap();
        take(&journal);

        assert!(controller.run_cycle().is_ok());
        assert_eq!(
            take(&journal),
            vec![
                "p1.sense",
                "p1.analyze",
                "a.analyze",
                "x.analyze",
                "y.analyze",
                "a.plan",
                "x.plan",
                "y.plan",
                "a.execute",
                "x.execute",
                "y.execute",
            ]
        );
        assert_eq!(controller.metrics().cycles, 1);
    }

    #[test]
    fn abnormal_status_is_or_combined() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        let mut platform = RecordingPlatform::new("p1", &journal);
        platform.sense_status = Status::IN_PROGRESS;
        controller.init_platform_instance(Some(Box::new(platform)));
        controller.init_algorithm("a", &[]).unwrap();

        let status = controller.run_cycle();
        assert!(status.contains(Status::IN_PROGRESS));
        assert_eq!(controller.metrics().last_status, status);
    }

    #[test]
    fn self_command_wins_over_swarm_command() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller
            .self_record()
            .device
            .set_command("a", &[KnowledgeValue::from(1.5)]);
        controller.swarm().set_command("b", &[]);

        controller.run_cycle();
        assert_eq!(controller.algorithm_name().as_deref(), Some("a"));
        assert!(controller.self_record().device.command().is_empty());
        assert!(controller.self_record().device.command_args().is_empty());
        assert_eq!(controller.swarm().command(), "b");

        controller.run_cycle();
        assert_eq!(controller.algorithm_name().as_deref(), Some("b"));
        assert!(controller.swarm().command().is_empty());
        assert!(take(&journal).contains(&"a.drop".to_owned()));
    }

    #[test]
    fn failed_command_is_consumed_and_leaves_slot_empty() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();
        take(&journal);

        controller.swarm().set_command("broken", &[]);
        controller.run_cycle();
        assert!(controller.algorithm().is_none());
        assert!(controller.swarm().command().is_empty());
        assert_eq!(take(&journal), vec!["a.drop"]);

        controller.run_cycle();
        assert!(controller.algorithm().is_none());
    }

    #[test]
    fn algorithm_is_dropped_before_replacement_is_built() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();
        take(&journal);

        controller.init_algorithm("b", &[]).unwrap();
        assert_eq!(take(&journal), vec!["a.drop", "b.new"]);

        let err = controller.init_algorithm("missing", &[]).unwrap_err();
        assert!(matches!(err, ControllerError::UnknownBehavior { .. }));
        assert!(controller.algorithm().is_none());
    }

    #[test]
    fn adopted_instance_replaces_algorithm_after_drop() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();
        journal.lock().clear();

        let replacement = RecordingAlgorithm::new("b", &journal);
        controller.init_algorithm_instance(Some(Box::new(replacement)));
        assert_eq!(
            std::mem::take(&mut *journal.lock()),
            vec!["b.new", "a.drop", "b.bind"]
        );
        assert_eq!(controller.algorithm_name().as_deref(), Some("b"));

        controller.init_algorithm_instance(None);
        assert_eq!(take(&journal), vec!["b.drop"]);
        assert!(controller.algorithm().is_none());
        assert!(controller.run_cycle().is_ok());
    }

    #[test]
    fn oversized_remote_args_do_not_stall_the_cycle() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        let update = EventRecord::new(
            "agent.1",
            "knowledge.update",
            json!({
                "entries": {
                    "device.0.command": "a",
                    "device.0.command.args.size": 20_000_000,
                }
            }),
        );
        assert_eq!(controller.knowledge().apply_remote(&update).unwrap(), 2);

        let started = std::time::Instant::now();
        controller.run_cycle();
        assert!(started.elapsed() < Duration::from_secs(1));

        let device = &controller.self_record().device;
        assert_eq!(controller.algorithm_name().as_deref(), Some("a"));
        assert!(device.command().is_empty());
        assert!(device.command_args().is_empty());
        assert_eq!(controller.knowledge().integer("device.0.command.args.size"), 0);
    }

    #[test]
    fn empty_algorithm_name_keeps_current_algorithm() {
        let journal = Journal::default();
        let memory = Arc::new(MemoryLogger::new());
        let telemetry = ControllerTelemetry::builder("controller")
            .sink(memory.clone())
            .build()
            .unwrap();
        let mut controller = Controller::builder(KnowledgeBase::new("agent.0"))
            .telemetry(telemetry)
            .build();
        controller.add_algorithm_factory(["a"], recording_algorithm("a", &journal));
        controller.init_algorithm("a", &[]).unwrap();

        controller.init_algorithm("", &[]).unwrap();
        controller.init_platform("", &[]).unwrap();
        assert_eq!(controller.algorithm_name().as_deref(), Some("a"));
        let help = memory
            .records()
            .into_iter()
            .find(|record| record.message == "controller.algorithm.help")
            .unwrap();
        assert!(help.metadata["help"].as_str().unwrap().contains("null"));
        assert!(memory.contains("controller.platform.help"));
    }

    #[test]
    fn platform_swap_keeps_algorithm_and_rebinds_it() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();
        controller.init_accent("x", &[]).unwrap();
        controller.init_platform("p1", &[]).unwrap();
        take(&journal);

        controller.init_platform("p2", &[]).unwrap();
        assert_eq!(
            take(&journal),
            vec![
                "a.unset_platform",
                "x.unset_platform",
                "p1.drop",
                "p2.new",
                "a.set_platform",
                "x.set_platform",
            ]
        );
        assert_eq!(controller.algorithm_name().as_deref(), Some("a"));
        assert_eq!(controller.platform_name().as_deref(), Some("p2"));

        let handle = controller.platform().unwrap();
        controller.init_platform_instance(None);
        assert!(!handle.is_attached());
        assert!(controller.platform().is_none());
    }

    #[test]
    fn missing_behaviors_are_not_fatal() {
        let memory = Arc::new(MemoryLogger::new());
        let telemetry = ControllerTelemetry::builder("controller")
            .sink(memory.clone())
            .build()
            .unwrap();
        let mut controller = Controller::builder(KnowledgeBase::new("agent.0"))
            .telemetry(telemetry)
            .build();

        assert_eq!(controller.run_cycle(), Status::OK);
        assert!(memory.contains("controller.monitor.platform_missing"));
        assert!(memory.contains("controller.plan.algorithm_missing"));
    }

    #[test]
    fn accent_requests_are_validated() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        assert_eq!(
            controller.init_accent("", &[]),
            Err(ControllerError::EmptyName("accent"))
        );
        assert!(controller.init_accent("broken", &[]).is_err());
        assert!(controller.init_accent("nope", &[]).is_err());
        assert!(controller.accent_names().is_empty());
    }

    #[test]
    fn cleared_accents_are_destroyed_and_skipped() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_accent("x", &[]).unwrap();
        controller.init_accent("y", &[]).unwrap();
        take(&journal);

        controller.clear_accents();
        assert_eq!(take(&journal), vec!["x.drop", "y.drop"]);
        controller.run_cycle();
        assert!(take(&journal).is_empty());
    }

    #[test]
    fn init_vars_rebinds_active_behaviors() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_platform("p1", &[]).unwrap();
        controller.init_algorithm("a", &[]).unwrap();
        journal.lock().clear();

        controller.init_vars(3, 5);
        assert_eq!(*journal.lock(), vec!["p1.bind", "a.bind"]);
        assert_eq!(controller.self_record().id, 3);
        assert_eq!(controller.devices().len(), 5);
        assert_eq!(controller.swarm().size(), 5);
    }

    #[test]
    fn teardown_order_is_platform_algorithm_accents() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_accent("x", &[]).unwrap();
        controller.init_algorithm("a", &[]).unwrap();
        controller.init_platform("p1", &[]).unwrap();
        take(&journal);

        drop(controller);
        let drops: Vec<String> = take(&journal)
            .into_iter()
            .filter(|entry| entry.ends_with(".drop"))
            .collect();
        assert_eq!(drops, vec!["p1.drop", "a.drop", "x.drop"]);
    }

    #[tokio::test]
    async fn run_once_broadcasts_cycle_writes() {
        let bus = Arc::new(MemoryEventBus::new(8));
        let knowledge = KnowledgeBase::new("agent.0");
        knowledge.attach_transport(bus.clone());
        let mut controller = Controller::new(knowledge);
        controller.init_platform("debug", &[]).unwrap();
        controller.init_algorithm("debug", &[]).unwrap();

        assert!(controller.run_once().await.is_ok());
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["entries"]["device.0.debug.executions"], 1);
        assert_eq!(controller.metrics().broadcasts, 1);
    }

    #[derive(Default)]
    struct BusyLedger {
        calls: u64,
        busy: Duration,
    }

    struct OverrunPlatform {
        busy: Duration,
        ledger: Arc<Mutex<BusyLedger>>,
    }

    impl Platform for OverrunPlatform {
        fn name(&self) -> &str {
            "overrun"
        }

        fn bind(&mut self, _bindings: PlatformBindings) {}

        fn sense(&mut self) -> Status {
            let started = std::time::Instant::now();
            std::thread::sleep(self.busy);
            let mut ledger = self.ledger.lock();
            ledger.calls += 1;
            ledger.busy += started.elapsed();
            Status::OK
        }

        fn analyze(&mut self) -> Status {
            Status::OK
        }
    }

    #[test]
    fn overflowing_epoch_lands_far_in_the_future() {
        let now = Instant::now();
        assert_eq!(later(now, Duration::MAX), now + FAR_FUTURE);
        assert_eq!(
            later(now, Duration::from_millis(5)),
            now + Duration::from_millis(5)
        );
    }

    #[tokio::test]
    async fn zero_loop_period_runs_back_to_back_but_throttles_sends() {
        let mut controller = Controller::new(KnowledgeBase::new("agent.0"));
        controller.init_algorithm("debug", &[]).unwrap();

        assert!(controller.run(0.0, 0.05, 0.01).await.is_ok());
        let metrics = controller.metrics();
        assert!(metrics.broadcasts >= 1);
        assert!(
            metrics.broadcasts < metrics.cycles,
            "{} broadcasts for {} cycles",
            metrics.broadcasts,
            metrics.cycles
        );
    }

    #[tokio::test]
    async fn overrunning_cycles_reenter_without_sleeping() {
        let ledger = Arc::new(Mutex::new(BusyLedger::default()));
        let mut controller = Controller::new(KnowledgeBase::new("agent.0"));
        controller.init_platform_instance(Some(Box::new(OverrunPlatform {
            busy: Duration::from_millis(30),
            ledger: Arc::clone(&ledger),
        })));

        let started = std::time::Instant::now();
        controller.run(0.01, 0.08, -1.0).await;
        let elapsed = started.elapsed();

        let ledger = ledger.lock();
        assert_eq!(ledger.calls, controller.metrics().cycles);
        assert!(ledger.calls >= 2);
        // only scheduling overhead between cycles, never a 10ms period sleep
        assert!(
            elapsed.saturating_sub(ledger.busy) < Duration::from_millis(10),
            "idle {:?} across {} cycles",
            elapsed.saturating_sub(ledger.busy),
            ledger.calls
        );
    }

    struct OfflinePublisher;

    #[async_trait::async_trait]
    impl EventPublisher for OfflinePublisher {
        async fn publish(&self, _event: EventRecord) -> anyhow::Result<()> {
            anyhow::bail!("link down")
        }
    }

    #[tokio::test]
    async fn broadcast_failure_is_logged_not_fatal() {
        let memory = Arc::new(MemoryLogger::new());
        let telemetry = ControllerTelemetry::builder("controller")
            .sink(memory.clone())
            .build()
            .unwrap();
        let knowledge = KnowledgeBase::new("agent.0");
        knowledge.attach_transport(Arc::new(OfflinePublisher));
        let mut controller = Controller::builder(knowledge)
            .telemetry(telemetry)
            .build();
        controller.init_algorithm("debug", &[]).unwrap();

        assert!(controller.run_once().await.is_ok());
        assert!(memory.contains("controller.broadcast.failed"));
        let metrics = controller.metrics();
        assert_eq!((metrics.broadcasts, metrics.keys_sent), (1, 0));
        assert_eq!(controller.knowledge().modified_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_run_cycles_and_broadcasts() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();

        let status = controller.run(0.1, 0.35, 0.1).await;
        assert!(status.is_ok());
        let metrics = controller.metrics();
        assert!((3..=5).contains(&metrics.cycles), "cycles = {}", metrics.cycles);
        assert!(metrics.broadcasts >= 1);
        assert!(controller.algorithm().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_runtime_still_runs_one_cycle() {
        let mut controller = Controller::new(KnowledgeBase::new("agent.0"));
        controller.run(0.1, 0.0, 0.1).await;
        let metrics = controller.metrics();
        assert_eq!(metrics.cycles, 1);
        assert_eq!(metrics.broadcasts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_loop_period_skips_the_loop() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();

        let status = controller.run(-1.0, 10.0, 1.0).await;
        assert_eq!(status, Status::OK);
        assert_eq!(controller.metrics().cycles, 0);
        assert!(controller.algorithm().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_send_period_follows_loop_period() {
        let mut broadcasts = Vec::new();
        for send_period in [0.1, 0.0, -1.0] {
            let mut controller = Controller::new(KnowledgeBase::new("agent.0"));
            controller.run(0.1, 0.35, send_period).await;
            broadcasts.push(controller.metrics().broadcasts);
        }
        assert_eq!(broadcasts[0], broadcasts[1]);
        assert_eq!(broadcasts[0], broadcasts[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn slower_send_period_throttles_broadcasts() {
        let mut controller = Controller::new(KnowledgeBase::new("agent.0"));
        controller.run(0.1, 0.35, 0.2).await;
        let metrics = controller.metrics();
        assert!(metrics.broadcasts < metrics.cycles);
        assert!(metrics.broadcasts >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_timing_runs_nothing() {
        let journal = Journal::default();
        let mut controller = controller(&journal);
        controller.init_algorithm("a", &[]).unwrap();
        controller.run(f64::NAN, 1.0, 1.0).await;
        assert_eq!(controller.metrics().cycles, 0);
        assert!(controller.algorithm().is_none());
    }
}
