use crate::{
    knowledge::KnowledgeBase,
    telemetry::ControllerTelemetry,
    variables::{SensorRegistry, SensorSpec},
};

use super::Controller;

/// Builder used to configure a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerBuilder {
    knowledge: KnowledgeBase,
    id: u64,
    processes: u64,
    telemetry: Option<ControllerTelemetry>,
    sensors: SensorRegistry,
    builtins: bool,
}

impl ControllerBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(knowledge: KnowledgeBase) -> Self {
        Self {
            knowledge,
            id: 0,
            processes: 1,
            telemetry: None,
            sensors: SensorRegistry::default(),
            builtins: true,
        }
    }

    /// Sets the agent id and swarm size; the size is raised to cover `id`.
    #[must_use]
    pub fn agent(mut self, id: u64, processes: u64) -> Self {
        self.id = id;
        self.processes = processes.max(id.saturating_add(1));
        self
    }

    /// Attaches telemetry used by the controller.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ControllerTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers a sensor shared with every behavior.
    #[must_use]
    pub fn sensor(self, sensor: SensorSpec) -> Self {
        self.sensors.insert(sensor);
        self
    }

    /// Skips registering the `null` and `debug` behaviors.
    #[must_use]
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    /// Finalizes the configuration.
    #[must_use]
    pub fn build(self) -> Controller {
        let mut controller = Controller::assemble(
            self.knowledge,
            self.telemetry.unwrap_or_default(),
            self.sensors,
            self.builtins,
        );
        if (self.id, self.processes) != (0, 1) {
            controller.init_vars(self.id, self.processes);
        }
        controller
    }
}
