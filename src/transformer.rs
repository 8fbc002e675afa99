//! Class transform driver
//!
//! The load-time hook. For each loaded class it decides eligibility, plans
//! every method, registers the class's lines with the registry and emits the
//! rewritten bodies. Each class is rewritten at most once, and a failure at
//! any step leaves the class exactly as it was loaded.
//!
//! ```text
//! transform(loader, class)
//!   ├─ skip: bootstrap loader, filtered name, no source file, seen before
//!   ├─ plan_method() for every method          (no side effects)
//!   ├─ register each distinct (source, line)  (once per class)
//!   └─ rewrite() for every method              (pure)
//! ```

use crate::config::Config;
use crate::filter::ClassFilter;
use crate::method::ClassFile;
use crate::planner::{plan_method, Dispatch, DispatchMode, MethodPlan, PlanError};
use crate::registry::{Registry, RegistryError};
use crate::rewriter::rewrite;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Method {method}: {source}")]
    Plan { method: String, source: PlanError },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Loader that defined a class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    /// Runtime's own classes; never instrumented
    Bootstrap,
    Application,
}

/// A rewritten class together with the plan used for each method
#[derive(Debug, Clone)]
pub struct InstrumentedClass {
    pub class: ClassFile,
    pub source_path: String,
    pub plans: Vec<(String, MethodPlan)>,
}

impl InstrumentedClass {
    /// Distinct lines registered for this class
    pub fn line_count(&self) -> usize {
        let mut lines: Vec<u32> = self
            .plans
            .iter()
            .flat_map(|(_, plan)| plan.lines.iter().copied())
            .collect();
        lines.sort_unstable();
        lines.dedup();
        lines.len()
    }
}

/// Load-time class rewriter bound to one registry
pub struct ClassTransformer {
    filter: ClassFilter,
    registry: Arc<Registry>,
    dispatch: DispatchMode,
    seen: Mutex<HashSet<String>>,
}

impl ClassTransformer {
    pub fn new(filter: ClassFilter, registry: Arc<Registry>, dispatch: DispatchMode) -> Self {
        Self {
            filter,
            registry,
            dispatch,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Build from configuration; fails when no include rule is configured
    pub fn from_config(config: &Config, registry: Arc<Registry>) -> anyhow::Result<Self> {
        config.validate()?;
        let filter = config.class_filter()?;
        Ok(Self::new(filter, registry, config.instrumentation.dispatch))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether a class would be rewritten if loaded now
    pub fn is_eligible(&self, loader: Loader, class_name: &str) -> bool {
        loader != Loader::Bootstrap && self.filter.should_instrument(class_name)
    }

    /// Transform hook: returns the rewritten class, or the class unchanged
    /// when it is ineligible, already rewritten, or fails to rewrite
    pub fn transform(&self, loader: Loader, class: ClassFile) -> ClassFile {
        if !self.is_eligible(loader, &class.name) {
            debug!(class = %class.name, ?loader, "Skipping class");
            return class;
        }

        let first_load = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class.name.clone());
        if !first_load {
            debug!(class = %class.name, "Class already transformed");
            return class;
        }

        match self.instrument(&class) {
            Ok(Some(instrumented)) => {
                info!(
                    class = %class.name,
                    methods = instrumented.plans.len(),
                    lines = instrumented.line_count(),
                    "Instrumented class"
                );
                instrumented.class
            }
            Ok(None) => class,
            Err(e) => {
                warn!(class = %class.name, error = %e, "Instrumentation failed, loading original");
                class
            }
        }
    }

    /// Plan, register and rewrite one class without eligibility checks
    ///
    /// Returns `Ok(None)` when the class has no source file, since its lines
    /// cannot be attributed.
    pub fn instrument(&self, class: &ClassFile) -> Result<Option<InstrumentedClass>, TransformError> {
        let Some(source_path) = class.source_path() else {
            debug!(class = %class.name, "No source file attribute");
            return Ok(None);
        };
        let dispatch = Dispatch::select(self.dispatch, class.version);

        let mut plans = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            if method.instructions.is_empty() {
                continue;
            }
            let plan = plan_method(&class.name, method, dispatch).map_err(|source| {
                TransformError::Plan {
                    method: method.name.clone(),
                    source,
                }
            })?;
            debug!(class = %class.name, method = %method.name, %plan, "Planned method");
            plans.push((method.name.clone(), plan));
        }

        let mut registered = HashSet::new();
        for (_, plan) in &plans {
            for &line in &plan.lines {
                if !registered.insert(line) {
                    continue;
                }
                match self.registry.try_register_line(&source_path, line) {
                    Ok(_) => {}
                    Err(RegistryError::DuplicateLine { existing, .. }) => {
                        debug!(%source_path, line, %existing, "Line shared with another class");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let mut rewritten = class.clone();
        let mut plan_iter = plans.iter();
        for method in rewritten.methods.iter_mut() {
            if method.instructions.is_empty() {
                continue;
            }
            if let Some((_, plan)) = plan_iter.next() {
                *method = rewrite(method, plan, &source_path);
            }
        }

        Ok(Some(InstrumentedClass {
            class: rewritten,
            source_path,
            plans,
        }))
    }
}
