//! Modules group element declarations under a name
//!
//! A flow definition refers to an element type by `{module}.{functionFqn}`.
//! The registry resolves those keys to the factories declared by each module.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::element::{BoundElement, Declaration, ElementContext, ElementFactory, FlowFunction};
use crate::error::FlowError;

static MODULE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z][a-z0-9-]*/)?[a-z][a-z0-9-]*$")
        .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Whether `name` is a valid module name, e.g. `core` or `@acme/http-tools`
pub fn is_valid_module_name(name: &str) -> bool {
    MODULE_NAME_RE.is_match(name)
}

/// A named set of element declarations
#[derive(Clone)]
pub struct FlowModule {
    name: String,
    declarations: Vec<Arc<dyn ElementFactory>>,
}

impl FlowModule {
    /// Create an empty module
    ///
    /// The name is checked when the module is registered.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declarations: Vec::new(),
        }
    }

    /// Declare an element type; its descriptor is read immediately
    pub fn declare<E: FlowFunction>(mut self) -> Result<Self, FlowError> {
        let declaration = Declaration::<E>::describe().map_err(|e| match e {
            FlowError::InvalidFunctionFqn(fqn) if fqn.is_empty() => {
                FlowError::MissingFunctionFqn(std::any::type_name::<E>().to_string())
            }
            other => other,
        })?;
        self.declarations.push(Arc::new(declaration));
        Ok(self)
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function identifiers of the declared element types
    pub fn function_fqns(&self) -> Vec<&str> {
        self.declarations
            .iter()
            .map(|d| d.function_fqn().as_str())
            .collect()
    }
}

impl fmt::Debug for FlowModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowModule")
            .field("name", &self.name)
            .field("function_fqns", &self.function_fqns())
            .finish()
    }
}

/// Lookup table from `{module}.{functionFqn}` to element factories
#[derive(Default)]
pub struct ModuleRegistry {
    entries: HashMap<String, Arc<dyn ElementFactory>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `modules`, in order
    pub fn from_modules(modules: &[FlowModule]) -> Result<Self, FlowError> {
        let mut registry = Self::new();
        for module in modules {
            registry.register(module)?;
        }
        Ok(registry)
    }

    /// Register every declaration of `module`
    ///
    /// A key that is already registered is replaced.
    pub fn register(&mut self, module: &FlowModule) -> Result<(), FlowError> {
        if !is_valid_module_name(&module.name) {
            return Err(FlowError::InvalidModule(module.name.clone()));
        }
        for declaration in &module.declarations {
            let key = format!("{}.{}", module.name, declaration.function_fqn());
            if self.entries.insert(key.clone(), declaration.clone()).is_some() {
                tracing::warn!(key = %key, module = %module.name, "Element declaration replaced by a later module");
            } else {
                tracing::debug!(key = %key, "Registered element declaration");
            }
        }
        Ok(())
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn instantiate(
        &self,
        element_id: &str,
        key: &str,
        context: ElementContext,
        properties: Value,
    ) -> Result<BoundElement, FlowError> {
        let factory = self
            .entries
            .get(key)
            .ok_or_else(|| FlowError::UnknownElement(key.to_string()))?;
        factory
            .instantiate(context, properties)
            .map_err(|source| FlowError::ElementCreation {
                element_id: element_id.to_string(),
                key: key.to_string(),
                source,
            })
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
