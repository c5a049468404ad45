use std::sync::Arc;

use super::{
    factory::{AlgorithmRegistry, PlatformRegistry},
    Algorithm, AlgorithmBindings, Platform, PlatformBindings, PlatformHandle, Status,
};
use crate::{
    error::ControllerError,
    knowledge::{KnowledgeBase, KnowledgeValue},
    variables::{PlatformFlag, PlatformStatus, Position},
};

/// Platform that senses nothing and accepts every command.
#[derive(Debug, Default)]
pub struct NullPlatform {
    bindings: Option<PlatformBindings>,
}

impl Platform for NullPlatform {
    fn name(&self) -> &str {
        "null"
    }

    fn bind(&mut self, bindings: PlatformBindings) {
        self.bindings = Some(bindings);
    }

    fn sense(&mut self) -> Status {
        Status::OK
    }

    fn analyze(&mut self) -> Status {
        Status::OK
    }
}

/// Platform that records how often it is driven and teleports on `move_to`.
#[derive(Debug)]
pub struct DebugPlatform {
    knowledge: KnowledgeBase,
    bindings: PlatformBindings,
    status: PlatformStatus,
}

impl DebugPlatform {
    /// Creates the platform and marks it ready.
    #[must_use]
    pub fn new(bindings: &PlatformBindings) -> Self {
        let status = PlatformStatus::new(&bindings.knowledge, "debug");
        status.set(PlatformFlag::Ok, true);
        Self {
            knowledge: bindings.knowledge.clone(),
            bindings: bindings.clone(),
            status,
        }
    }

    fn bump(&self, counter: &str) {
        let key = format!(".platform.debug.{counter}");
        self.knowledge.set(&key, self.knowledge.integer(&key) + 1);
    }
}

impl Platform for DebugPlatform {
    fn name(&self) -> &str {
        "debug"
    }

    fn bind(&mut self, bindings: PlatformBindings) {
        self.knowledge = bindings.knowledge.clone();
        self.status = PlatformStatus::new(&bindings.knowledge, "debug");
        self.bindings = bindings;
    }

    fn sense(&mut self) -> Status {
        self.bump("sense_calls");
        Status::OK
    }

    fn analyze(&mut self) -> Status {
        self.bump("analyze_calls");
        let device = &self.bindings.self_record.device;
        self.status
            .set(PlatformFlag::Moving, device.location() != device.dest());
        Status::OK
    }

    fn move_to(&mut self, target: Position) -> Status {
        let device = &self.bindings.self_record.device;
        device.set_dest(target);
        device.set_location(target);
        Status::OK
    }

    fn takeoff(&mut self) -> Status {
        Status::OK
    }

    fn land(&mut self) -> Status {
        Status::OK
    }
}

/// Algorithm that does nothing.
#[derive(Debug, Default)]
pub struct NullAlgorithm {
    bindings: Option<AlgorithmBindings>,
}

impl Algorithm for NullAlgorithm {
    fn name(&self) -> &str {
        "null"
    }

    fn bind(&mut self, bindings: AlgorithmBindings) {
        self.bindings = Some(bindings);
    }

    fn set_platform(&mut self, platform: Option<PlatformHandle>) {
        if let Some(bindings) = self.bindings.as_mut() {
            bindings.platform = platform;
        }
    }

    fn analyze(&mut self) -> Status {
        Status::OK
    }

    fn plan(&mut self) -> Status {
        Status::OK
    }

    fn execute(&mut self) -> Status {
        Status::OK
    }
}

/// Algorithm that counts its phases and publishes its execution count.
///
/// An optional first argument is a destination (`[x, y, z]`) handed to the
/// platform on every execute.
#[derive(Debug)]
pub struct DebugAlgorithm {
    bindings: AlgorithmBindings,
    target: Option<Position>,
    executions: i64,
}

impl DebugAlgorithm {
    /// Creates the algorithm from its factory arguments.
    #[must_use]
    pub fn new(args: &[KnowledgeValue], bindings: &AlgorithmBindings) -> Self {
        let target = args
            .first()
            .filter(|arg| matches!(arg, KnowledgeValue::Doubles(_)))
            .map(Position::from_value);
        Self {
            bindings: bindings.clone(),
            target,
            executions: 0,
        }
    }

    fn bump(&self, counter: &str) {
        let knowledge = &self.bindings.knowledge;
        let key = format!(".algorithm.debug.{counter}");
        knowledge.set(&key, knowledge.integer(&key) + 1);
    }
}

impl Algorithm for DebugAlgorithm {
    fn name(&self) -> &str {
        "debug"
    }

    fn bind(&mut self, bindings: AlgorithmBindings) {
        self.bindings = bindings;
    }

    fn set_platform(&mut self, platform: Option<PlatformHandle>) {
        self.bindings.platform = platform;
    }

    fn analyze(&mut self) -> Status {
        self.bump("analyze_calls");
        Status::OK
    }

    fn plan(&mut self) -> Status {
        self.bump("plan_calls");
        Status::OK
    }

    fn execute(&mut self) -> Status {
        self.bump("execute_calls");
        self.executions += 1;
        let device = &self.bindings.self_record.device;
        self.bindings
            .knowledge
            .set(&device.key("debug.executions"), self.executions);

        match (self.target, self.bindings.platform.as_ref()) {
            (Some(target), Some(platform)) => platform
                .with(|platform| platform.move_to(target))
                .unwrap_or(Status::FAILED),
            _ => Status::OK,
        }
    }
}

/// Registers the built-in algorithms.
pub fn register_algorithms(registry: &mut AlgorithmRegistry) {
    registry.add(
        ["null"],
        Arc::new(
            |_: &[KnowledgeValue],
             bindings: &AlgorithmBindings|
             -> Result<Box<dyn Algorithm>, ControllerError> {
                let mut algorithm = NullAlgorithm::default();
                algorithm.bind(bindings.clone());
                Ok(Box::new(algorithm))
            },
        ),
    );
    registry.add(
        ["debug"],
        Arc::new(
            |args: &[KnowledgeValue],
             bindings: &AlgorithmBindings|
             -> Result<Box<dyn Algorithm>, ControllerError> {
                Ok(Box::new(DebugAlgorithm::new(args, bindings)))
            },
        ),
    );
}

/// Registers the built-in platforms.
pub fn register_platforms(registry: &mut PlatformRegistry) {
    registry.add(
        ["null"],
        Arc::new(
            |_: &[KnowledgeValue],
             bindings: &PlatformBindings|
             -> Result<Box<dyn Platform>, ControllerError> {
                let mut platform = NullPlatform::default();
                platform.bind(bindings.clone());
                Ok(Box::new(platform))
            },
        ),
    );
    registry.add(
        ["debug"],
        Arc::new(
            |_: &[KnowledgeValue],
             bindings: &PlatformBindings|
             -> Result<Box<dyn Platform>, ControllerError> {
                Ok(Box::new(DebugPlatform::new(bindings)))
            },
        ),
    );
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        behaviors::SharedPlatform,
        variables::{Devices, SelfRecord, SensorRegistry},
    };

    fn bindings(kb: &KnowledgeBase) -> (PlatformBindings, AlgorithmBindings) {
        let self_record = SelfRecord::init(kb, 0);
        let platform = PlatformBindings {
            knowledge: kb.clone(),
            self_record: self_record.clone(),
            sensors: SensorRegistry::default(),
        };
        let algorithm = AlgorithmBindings {
            knowledge: kb.clone(),
            self_record,
            sensors: SensorRegistry::default(),
            devices: Devices::init(kb, 1),
            platform: None,
        };
        (platform, algorithm)
    }

    #[test]
    fn registries_expose_builtin_names() {
        let mut algorithms = AlgorithmRegistry::new("algorithm");
        let mut platforms = PlatformRegistry::new("platform");
        register_algorithms(&mut algorithms);
        register_platforms(&mut platforms);
        assert_eq!(algorithms.names(), vec!["null", "debug"]);
        assert_eq!(platforms.names(), vec!["null", "debug"]);
    }

    #[test]
    fn debug_algorithm_drives_platform_to_target() {
        let kb = KnowledgeBase::new("agent.0");
        let (platform_bindings, algorithm_bindings) = bindings(&kb);
        let shared: SharedPlatform =
            Arc::new(Mutex::new(Box::new(DebugPlatform::new(&platform_bindings))));

        let mut algorithm = DebugAlgorithm::new(
            &[KnowledgeValue::Doubles(vec![5.0, 5.0, 1.0])],
            &algorithm_bindings,
        );
        algorithm.set_platform(Some(PlatformHandle::new(&shared)));
        assert!(algorithm.analyze().is_ok());
        assert!(algorithm.plan().is_ok());
        assert!(algorithm.execute().is_ok());

        assert_eq!(kb.integer("device.0.debug.executions"), 1);
        assert_eq!(kb.integer(".algorithm.debug.plan_calls"), 1);
        assert_eq!(
            algorithm_bindings.self_record.device.location(),
            Position::new(5.0, 5.0, 1.0)
        );

        drop(shared);
        assert_eq!(algorithm.execute(), Status::FAILED);
    }

    #[test]
    fn debug_platform_counts_and_reports_status() {
        let kb = KnowledgeBase::new("agent.0");
        let (platform_bindings, _) = bindings(&kb);
        let mut platform = DebugPlatform::new(&platform_bindings);
        platform.sense();
        platform.sense();
        platform.analyze();
        assert_eq!(kb.integer(".platform.debug.sense_calls"), 2);
        assert!(PlatformStatus::new(&kb, "debug").get(PlatformFlag::Ok));
    }
}
