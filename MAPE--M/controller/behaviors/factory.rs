use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use super::{Algorithm, AlgorithmBindings, Platform, PlatformBindings};
use crate::{error::ControllerError, knowledge::KnowledgeValue};

/// Builds algorithms from an argument list.
pub trait AlgorithmFactory: Send + Sync {
    /// Constructs a fresh instance bound to `bindings`.
    fn create(
        &self,
        args: &[KnowledgeValue],
        bindings: &AlgorithmBindings,
    ) -> Result<Box<dyn Algorithm>, ControllerError>;
}

impl<F> AlgorithmFactory for F
where
    F: Fn(&[KnowledgeValue], &AlgorithmBindings) -> Result<Box<dyn Algorithm>, ControllerError>
        + Send
        + Sync,
{
    fn create(
        &self,
        args: &[KnowledgeValue],
        bindings: &AlgorithmBindings,
    ) -> Result<Box<dyn Algorithm>, ControllerError> {
        self(args, bindings)
    }
}

/// Builds platforms from an argument list.
pub trait PlatformFactory: Send + Sync {
    /// Constructs a fresh instance bound to `bindings`.
    fn create(
        &self,
        args: &[KnowledgeValue],
        bindings: &PlatformBindings,
    ) -> Result<Box<dyn Platform>, ControllerError>;
}

impl<F> PlatformFactory for F
where
    F: Fn(&[KnowledgeValue], &PlatformBindings) -> Result<Box<dyn Platform>, ControllerError>
        + Send
        + Sync,
{
    fn create(
        &self,
        args: &[KnowledgeValue],
        bindings: &PlatformBindings,
    ) -> Result<Box<dyn Platform>, ControllerError> {
        self(args, bindings)
    }
}

/// Name → factory map where one factory can sit under several aliases.
///
/// Registering a name that already exists replaces it for later lookups.
pub struct BehaviorRegistry<F: ?Sized> {
    kind: &'static str,
    entries: IndexMap<String, Arc<F>>,
}

impl<F: ?Sized> BehaviorRegistry<F> {
    /// Creates an empty registry for `kind` (used in messages).
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: IndexMap::new(),
        }
    }

    /// Registers `factory` under every alias.
    pub fn add<I, S>(&mut self, aliases: I, factory: Arc<F>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for alias in aliases {
            self.entries.insert(alias.into(), Arc::clone(&factory));
        }
    }

    /// Looks up a factory.
    pub fn get(&self, name: &str) -> Result<Arc<F>, ControllerError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownBehavior {
                kind: self.kind,
                name: name.to_owned(),
            })
    }

    /// Returns true when `name` resolves.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Every registered alias, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Aliases grouped by the factory they resolve to, e.g. `["debug | dbg"]`.
    #[must_use]
    pub fn supported(&self) -> Vec<String> {
        let mut groups: Vec<(Arc<F>, Vec<&str>)> = Vec::new();
        for (alias, factory) in &self.entries {
            match groups
                .iter_mut()
                .find(|(known, _)| Arc::ptr_eq(known, factory))
            {
                Some((_, aliases)) => aliases.push(alias),
                None => groups.push((Arc::clone(factory), vec![alias.as_str()])),
            }
        }
        groups
            .into_iter()
            .map(|(_, aliases)| aliases.join(" | "))
            .collect()
    }

    /// Help text listing [`Self::supported`] names.
    #[must_use]
    pub fn help(&self) -> String {
        let mut text = format!("SUPPORTED {}S:\n", self.kind.to_ascii_uppercase());
        for line in self.supported() {
            text.push_str("  ");
            text.push_str(&line);
            text.push('\n');
        }
        text
    }
}

impl<F: ?Sized> fmt::Debug for BehaviorRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

/// Registry of algorithm constructors.
pub type AlgorithmRegistry = BehaviorRegistry<dyn AlgorithmFactory>;
/// Registry of platform constructors.
pub type PlatformRegistry = BehaviorRegistry<dyn PlatformFactory>;

impl BehaviorRegistry<dyn AlgorithmFactory> {
    /// Resolves `name` and constructs an algorithm.
    pub fn create(
        &self,
        name: &str,
        args: &[KnowledgeValue],
        bindings: &AlgorithmBindings,
    ) -> Result<Box<dyn Algorithm>, ControllerError> {
        self.get(name)?.create(args, bindings)
    }
}

impl BehaviorRegistry<dyn PlatformFactory> {
    /// Resolves `name` and constructs a platform.
    pub fn create(
        &self,
        name: &str,
        args: &[KnowledgeValue],
        bindings: &PlatformBindings,
    ) -> Result<Box<dyn Platform>, ControllerError> {
        self.get(name)?.create(args, bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviors::builtin::{NullAlgorithm, NullPlatform};

    fn null_algorithm(
        _args: &[KnowledgeValue],
        _bindings: &AlgorithmBindings,
    ) -> Result<Box<dyn Algorithm>, ControllerError> {
        Ok(Box::new(NullAlgorithm::default()))
    }

    #[test]
    fn aliases_share_one_factory() {
        let mut registry = AlgorithmRegistry::new("algorithm");
        registry.add(["null", "noop"], Arc::new(null_algorithm));
        registry.add(["idle"], Arc::new(null_algorithm));
        assert!(registry.contains("noop"));
        assert_eq!(registry.supported(), vec!["null | noop", "idle"]);
        assert!(registry.help().starts_with("SUPPORTED ALGORITHMS:"));
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = PlatformRegistry::new("platform");
        registry.add(
            ["sim"],
            Arc::new(
                |_: &[KnowledgeValue],
                 _: &PlatformBindings|
                 -> Result<Box<dyn Platform>, ControllerError> {
                    Err(ControllerError::construction("platform", "sim", "offline"))
                },
            ),
        );
        let first = registry.get("sim").unwrap();
        registry.add(
            ["sim"],
            Arc::new(
                |_: &[KnowledgeValue],
                 _: &PlatformBindings|
                 -> Result<Box<dyn Platform>, ControllerError> {
                    Ok(Box::new(NullPlatform::default()))
                },
            ),
        );
        assert!(!Arc::ptr_eq(&first, &registry.get("sim").unwrap()));
        assert_eq!(registry.names(), vec!["sim"]);
    }

    #[test]
    fn unknown_names_are_reported() {
        let registry = AlgorithmRegistry::new("algorithm");
        let err = registry.get("bridge").err().unwrap();
        assert_eq!(
            err,
            ControllerError::UnknownBehavior {
                kind: "algorithm",
                name: "bridge".into()
            }
        );
    }
}
