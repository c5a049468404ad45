//! Behavior contracts driven by the controller.
//!
//! A [`Platform`] senses the world into the knowledge store and actuates the
//! vehicle; an [`Algorithm`] turns shared state into planned actions. Both are
//! constructed through the name-keyed registries in [`factory`] and receive
//! their view of shared state through bindings rather than raw ids.

/// Built-in `null`/`debug` behaviors.
pub mod builtin;
/// Name-keyed constructor registries.
pub mod factory;

use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    knowledge::KnowledgeBase,
    variables::{Devices, Position, SelfRecord, SensorRegistry},
};

/// Status bits reported by behavior operations.
///
/// Zero means success. Bits from several operations are OR-combined, so a
/// non-zero aggregate only says that something reported an abnormal
/// condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(u32);

impl Status {
    /// Nothing to report.
    pub const OK: Self = Self(0);
    /// Generic failure.
    pub const FAILED: Self = Self(1);
    /// Requested capability is not supported by the behavior.
    pub const UNSUPPORTED: Self = Self(1 << 1);
    /// Operation still in progress.
    pub const IN_PROGRESS: Self = Self(1 << 2);

    /// Wraps raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true when no bit is set.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Returns true when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Status {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Shared state handed to a platform.
#[derive(Debug, Clone)]
pub struct PlatformBindings {
    /// Knowledge store.
    pub knowledge: KnowledgeBase,
    /// The agent's own record.
    pub self_record: SelfRecord,
    /// Available sensors.
    pub sensors: SensorRegistry,
}

/// Shared state handed to an algorithm.
#[derive(Debug, Clone)]
pub struct AlgorithmBindings {
    /// Knowledge store.
    pub knowledge: KnowledgeBase,
    /// The agent's own record.
    pub self_record: SelfRecord,
    /// Available sensors.
    pub sensors: SensorRegistry,
    /// Records of every agent in the swarm.
    pub devices: Devices,
    /// Active platform, if any.
    pub platform: Option<PlatformHandle>,
}

/// Sensing and actuation backend (simulator or vehicle).
pub trait Platform: Send {
    /// Registered name of the platform.
    fn name(&self) -> &str;

    /// Receives the shared-state bindings. Called again whenever they change.
    fn bind(&mut self, bindings: PlatformBindings);

    /// Reads sensors into the knowledge store.
    fn sense(&mut self) -> Status;

    /// Interprets sensed state (health, arrival, failures).
    fn analyze(&mut self) -> Status;

    /// Starts moving towards `target`.
    fn move_to(&mut self, _target: Position) -> Status {
        Status::UNSUPPORTED
    }

    /// Leaves the ground.
    fn takeoff(&mut self) -> Status {
        Status::UNSUPPORTED
    }

    /// Returns to the ground.
    fn land(&mut self) -> Status {
        Status::UNSUPPORTED
    }
}

/// Decision behavior, used both as the main algorithm and as an accent.
pub trait Algorithm: Send {
    /// Registered name of the algorithm.
    fn name(&self) -> &str;

    /// Receives the shared-state bindings. Called again whenever they change.
    fn bind(&mut self, bindings: AlgorithmBindings);

    /// Swaps the platform this algorithm drives; `None` detaches it.
    fn set_platform(&mut self, platform: Option<PlatformHandle>);

    /// Digests current shared state.
    fn analyze(&mut self) -> Status;

    /// Decides what to do next.
    fn plan(&mut self) -> Status;

    /// Carries out the plan.
    fn execute(&mut self) -> Status;
}

/// Owning slot type for the active platform.
pub(crate) type SharedPlatform = Arc<Mutex<Box<dyn Platform>>>;

/// Non-owning reference to the controller's active platform.
///
/// The controller keeps sole ownership; once it drops or replaces the
/// platform, every handle stops resolving.
#[derive(Clone)]
pub struct PlatformHandle {
    inner: Weak<Mutex<Box<dyn Platform>>>,
}

impl PlatformHandle {
    pub(crate) fn new(platform: &SharedPlatform) -> Self {
        Self {
            inner: Arc::downgrade(platform),
        }
    }

    /// Runs `f` against the platform if it is still alive.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Platform) -> R) -> Option<R> {
        let platform = self.inner.upgrade()?;
        let mut guard = platform.lock();
        Some(f(guard.as_mut()))
    }

    /// Returns true while the controller still owns the platform.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Name of the platform, if still alive.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.with(|platform| platform.name().to_owned())
    }

    /// Returns true when both handles point at the same platform instance.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}
