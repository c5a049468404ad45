//! Runtime entrypoints: configuration → wired controller → loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use shared_event_bus::{EventPublisher, EventSubscriber, MemoryEventBus};
use shared_logging::LogLevel;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    behaviors::Status,
    config::{AgentSection, BehaviorSpec, ControllerConfig},
    controller::{scheduler::RunTiming, Controller},
    knowledge::KnowledgeBase,
    telemetry::ControllerTelemetry,
};

/// Fully wired controller plus the timing it runs with.
#[derive(Debug)]
pub struct ControllerRuntime {
    run_id: Uuid,
    controller: Controller,
    timing: RunTiming,
    listener: Option<JoinHandle<()>>,
}

impl ControllerRuntime {
    /// Builds telemetry, knowledge store and controller from `config`, then
    /// starts the configured platform, algorithm and accents.
    ///
    /// `events` receives telemetry events such as `controller.run.finished`.
    pub fn from_config(
        config: &ControllerConfig,
        events: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        config.validate()?;
        let AgentSection { id, processes } = config.agent;
        let origin = format!("agent.{id}");

        let mut telemetry = ControllerTelemetry::builder(format!("controller.{origin}"))
            .threshold(config.logging.level);
        if let Some(path) = &config.logging.path {
            telemetry = telemetry.log_path(path);
        }
        if let Some(publisher) = events {
            telemetry = telemetry.event_publisher(publisher);
        }
        let telemetry = telemetry.build().context("building controller telemetry")?;

        let mut controller = Controller::builder(KnowledgeBase::new(origin))
            .agent(id, processes)
            .telemetry(telemetry)
            .build();
        if let Some(BehaviorSpec { name, args }) = &config.platform {
            controller
                .init_platform(name, args)
                .with_context(|| format!("starting platform `{name}`"))?;
        }
        if let Some(BehaviorSpec { name, args }) = &config.algorithm {
            controller
                .init_algorithm(name, args)
                .with_context(|| format!("starting algorithm `{name}`"))?;
        }
        for BehaviorSpec { name, args } in &config.accents {
            controller
                .init_accent(name, args)
                .with_context(|| format!("starting accent `{name}`"))?;
        }

        Ok(Self {
            run_id: Uuid::new_v4(),
            controller,
            timing: config.timing,
            listener: None,
        })
    }

    /// Broadcasts through `bus` and folds peer broadcasts from it back in.
    pub async fn connect<B>(&mut self, bus: Arc<B>) -> Result<()>
    where
        B: EventPublisher + EventSubscriber + 'static,
    {
        let knowledge = self.controller.knowledge().clone();
        knowledge.attach_transport(bus.clone());
        let listener = knowledge
            .spawn_listener(bus.as_ref())
            .await
            .context("subscribing to knowledge updates")?;
        if let Some(previous) = self.listener.replace(listener) {
            previous.abort();
        }
        Ok(())
    }

    /// Identifier of this runtime instance.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The wired controller.
    #[must_use]
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Mutable access, e.g. to register extra factories before running.
    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Timing used by [`Self::run`].
    #[must_use]
    pub fn timing(&self) -> RunTiming {
        self.timing
    }

    /// Overrides the configured timing.
    pub fn set_timing(&mut self, timing: RunTiming) {
        self.timing = timing;
    }

    /// Runs the controller loop with the configured timing.
    pub async fn run(&mut self) -> Status {
        let _ = self.controller.telemetry().log(
            LogLevel::Major,
            "controller.runtime.start",
            json!({
                "run_id": self.run_id.to_string(),
                "agent": self.controller.self_record().id,
                "platform": self.controller.platform_name(),
                "algorithm": self.controller.algorithm_name(),
                "accents": self.controller.accent_names(),
            }),
        );
        self.controller.run_with(self.timing).await
    }

    /// Stops the listener and tears the controller down.
    pub fn shutdown(self) {
        let _ = self.controller.telemetry().log(
            LogLevel::Major,
            "controller.runtime.shutdown",
            json!({ "run_id": self.run_id.to_string() }),
        );
    }
}

impl Drop for ControllerRuntime {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Runs `agents` debug agents sharing one in-memory bus for `max_runtime`
/// seconds and returns their runtimes once every loop has finished.
pub async fn demo_swarm(agents: u64, max_runtime: f64) -> Result<Vec<ControllerRuntime>> {
    let bus = Arc::new(MemoryEventBus::new(1024));
    let mut tasks = Vec::new();
    for id in 0..agents {
        let config = ControllerConfig {
            agent: AgentSection {
                id,
                processes: agents,
            },
            timing: RunTiming::new(0.1, max_runtime, 0.1),
            platform: Some(BehaviorSpec::named("debug")),
            algorithm: Some(BehaviorSpec::named("debug")),
            ..ControllerConfig::default()
        };
        let mut runtime = ControllerRuntime::from_config(&config, None)?;
        runtime.connect(Arc::clone(&bus)).await?;
        tasks.push(tokio::spawn(async move {
            runtime.run().await;
            runtime
        }));
    }

    let mut runtimes = Vec::with_capacity(tasks.len());
    for task in tasks {
        runtimes.push(task.await.context("agent task failed")?);
    }
    Ok(runtimes)
}
