//! Structured views over the knowledge store.
//!
//! Every record here is a thin, cloneable handle: reads and writes go
//! straight to the [`KnowledgeBase`] it was built from, so any number of
//! behaviors can share one record without copying state.

/// Vector container stored across several keys.
pub mod vector;

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vector::KnowledgeVector;

use crate::knowledge::{KnowledgeBase, KnowledgeValue};

/// Cartesian position or vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate (or latitude).
    pub x: f64,
    /// Y coordinate (or longitude).
    pub y: f64,
    /// Z coordinate (or altitude).
    pub z: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Reads from a value; missing components are zero.
    #[must_use]
    pub fn from_value(value: &KnowledgeValue) -> Self {
        let parts = value.to_doubles();
        let at = |index: usize| parts.get(index).copied().unwrap_or(0.0);
        Self::new(at(0), at(1), at(2))
    }

    /// Euclidean distance.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt()
    }
}

impl From<Position> for KnowledgeValue {
    fn from(position: Position) -> Self {
        Self::Doubles(vec![position.x, position.y, position.z])
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Published state of one agent, rooted at `device.{id}`.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    id: u64,
    prefix: String,
    knowledge: KnowledgeBase,
    command_args: KnowledgeVector,
}

impl DeviceRecord {
    /// Builds the view for device `id`.
    #[must_use]
    pub fn new(knowledge: &KnowledgeBase, id: u64) -> Self {
        let prefix = format!("device.{id}");
        Self {
            id,
            command_args: KnowledgeVector::new(knowledge, format!("{prefix}.command.args")),
            prefix,
            knowledge: knowledge.clone(),
        }
    }

    /// Agent identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Key prefix, e.g. `device.3`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full key for a field of this record.
    #[must_use]
    pub fn key(&self, field: &str) -> String {
        format!("{}.{field}", self.prefix)
    }

    /// Requested behavior name, empty when no request is pending.
    #[must_use]
    pub fn command(&self) -> String {
        self.knowledge.text(&self.key("command"))
    }

    /// Arguments accompanying [`Self::command`].
    #[must_use]
    pub fn command_args(&self) -> Vec<KnowledgeValue> {
        self.command_args.to_vec()
    }

    /// Posts a behavior request for this device.
    pub fn set_command(&self, name: &str, args: &[KnowledgeValue]) {
        self.command_args.assign(args);
        self.knowledge.set(&self.key("command"), name);
    }

    /// Clears the command and its arguments.
    pub fn clear_command(&self) {
        self.knowledge.set(&self.key("command"), "");
        self.command_args.resize(0);
    }

    /// Current location.
    #[must_use]
    pub fn location(&self) -> Position {
        self.position("location")
    }

    /// Publishes the current location.
    pub fn set_location(&self, position: Position) {
        self.knowledge.set(&self.key("location"), position);
    }

    /// Destination the device is moving towards.
    #[must_use]
    pub fn dest(&self) -> Position {
        self.position("dest")
    }

    /// Publishes the destination.
    pub fn set_dest(&self, position: Position) {
        self.knowledge.set(&self.key("dest"), position);
    }

    /// Home position.
    #[must_use]
    pub fn home(&self) -> Position {
        self.position("home")
    }

    /// Publishes the home position.
    pub fn set_home(&self, position: Position) {
        self.knowledge.set(&self.key("home"), position);
    }

    /// Remaining battery, in whatever unit the platform reports.
    #[must_use]
    pub fn battery_remaining(&self) -> i64 {
        self.knowledge.integer(&self.key("battery_remaining"))
    }

    /// Publishes the remaining battery.
    pub fn set_battery_remaining(&self, value: i64) {
        self.knowledge.set(&self.key("battery_remaining"), value);
    }

    /// Whether the device can move.
    #[must_use]
    pub fn mobile(&self) -> bool {
        self.knowledge
            .get(&self.key("mobile"))
            .is_some_and(|value| value.is_true())
    }

    /// Publishes mobility.
    pub fn set_mobile(&self, mobile: bool) {
        self.knowledge.set(&self.key("mobile"), mobile);
    }

    fn position(&self, field: &str) -> Position {
        self.knowledge
            .get(&self.key(field))
            .map(|value| Position::from_value(&value))
            .unwrap_or_default()
    }
}

/// The agent's own record: its id plus its device record.
#[derive(Debug, Clone)]
pub struct SelfRecord {
    /// Local agent id.
    pub id: u64,
    /// This agent's device record.
    pub device: DeviceRecord,
}

impl SelfRecord {
    /// Writes the local `.id` key and builds the device view.
    #[must_use]
    pub fn init(knowledge: &KnowledgeBase, id: u64) -> Self {
        knowledge.set(".id", i64::try_from(id).unwrap_or(i64::MAX));
        Self {
            id,
            device: DeviceRecord::new(knowledge, id),
        }
    }
}

/// Swarm-wide record rooted at `swarm`.
#[derive(Debug, Clone)]
pub struct SwarmRecord {
    knowledge: KnowledgeBase,
    command_args: KnowledgeVector,
}

impl SwarmRecord {
    /// Publishes the swarm size locally and builds the view.
    #[must_use]
    pub fn init(knowledge: &KnowledgeBase, processes: u64) -> Self {
        knowledge.set_local("swarm.size", i64::try_from(processes).unwrap_or(i64::MAX));
        Self {
            knowledge: knowledge.clone(),
            command_args: KnowledgeVector::new(knowledge, "swarm.command.args"),
        }
    }

    /// Number of agents in the swarm.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.knowledge.integer("swarm.size")).unwrap_or(0)
    }

    /// Requested behavior for the whole swarm.
    #[must_use]
    pub fn command(&self) -> String {
        self.knowledge.text("swarm.command")
    }

    /// Arguments accompanying [`Self::command`].
    #[must_use]
    pub fn command_args(&self) -> Vec<KnowledgeValue> {
        self.command_args.to_vec()
    }

    /// Posts a swarm-wide behavior request.
    pub fn set_command(&self, name: &str, args: &[KnowledgeValue]) {
        self.command_args.assign(args);
        self.knowledge.set("swarm.command", name);
    }

    /// Clears the command and its arguments.
    pub fn clear_command(&self) {
        self.knowledge.set("swarm.command", "");
        self.command_args.resize(0);
    }
}

/// Records of every agent in the swarm, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct Devices {
    records: Arc<Vec<DeviceRecord>>,
}

impl Devices {
    /// Builds views for ids `0..processes`.
    #[must_use]
    pub fn init(knowledge: &KnowledgeBase, processes: u64) -> Self {
        let records = (0..processes)
            .map(|id| DeviceRecord::new(knowledge, id))
            .collect();
        Self {
            records: Arc::new(records),
        }
    }

    /// Record for `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&DeviceRecord> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.records.get(index))
    }

    /// Number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no devices are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over every record.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }
}

/// Description of a sensor available to behaviors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Unique name, e.g. `thermal`.
    pub name: String,
    /// Sensing range in meters.
    pub range: f64,
}

impl SensorSpec {
    /// Creates a sensor description.
    #[must_use]
    pub fn new(name: impl Into<String>, range: f64) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }
}

/// Sensors shared between the controller and every bound behavior.
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    inner: Arc<RwLock<IndexMap<String, SensorSpec>>>,
}

impl SensorRegistry {
    /// Registers or replaces a sensor.
    pub fn insert(&self, sensor: SensorSpec) {
        self.inner.write().insert(sensor.name.clone(), sensor);
    }

    /// Looks up a sensor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SensorSpec> {
        self.inner.read().get(name).cloned()
    }

    /// Registered names, in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of registered sensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns true when no sensors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Status flags a platform publishes about itself under `.platform.{name}`.
#[derive(Debug, Clone)]
pub struct PlatformStatus {
    prefix: String,
    knowledge: KnowledgeBase,
}

/// Flags understood by [`PlatformStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFlag {
    /// Ready for commands.
    Ok,
    /// Busy with a blocking operation.
    Waiting,
    /// Moving towards a destination.
    Moving,
    /// Running with degraded sensors.
    ReducedSensing,
    /// Unrecoverable failure.
    Failed,
    /// Network link available.
    CommunicationAvailable,
}

impl PlatformFlag {
    const fn field(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Waiting => "waiting",
            Self::Moving => "moving",
            Self::ReducedSensing => "reduced_sensing",
            Self::Failed => "failed",
            Self::CommunicationAvailable => "communication_available",
        }
    }
}

impl PlatformStatus {
    /// Builds the status view for platform `name`.
    #[must_use]
    pub fn new(knowledge: &KnowledgeBase, name: &str) -> Self {
        Self {
            prefix: format!(".platform.{name}"),
            knowledge: knowledge.clone(),
        }
    }

    /// Reads a flag.
    #[must_use]
    pub fn get(&self, flag: PlatformFlag) -> bool {
        self.knowledge
            .get(&format!("{}.{}", self.prefix, flag.field()))
            .is_some_and(|value| value.is_true())
    }

    /// Writes a flag.
    pub fn set(&self, flag: PlatformFlag, on: bool) {
        self.knowledge
            .set(&format!("{}.{}", self.prefix, flag.field()), on);
    }
}
