//! Candidate validation, fault-isolated construction and the retry loop.
//!
//! One pass walks every candidate, resolves its activation record and
//! constructs the selected ones. The first construction failure aborts the
//! pass; [`run_cycle`] then excludes the failing module and starts over
//! with empty maps until a pass completes or the retry budget runs out.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::discovery::PluginCandidate;
use super::error_log::{self, ErrorLog};
use super::registry::{InactivePlugin, InactiveReason, PluginInstance};
use super::types::ModuleId;
use crate::store::{RecordStore, StoreError};

/// Reasons a pass stops early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    /// A plugin failed to construct (returned an error or panicked).
    #[error("plugin module '{module}' failed to construct: {message}")]
    Construction { module: ModuleId, message: String },

    /// The record store cannot be reached. No plugin is blamed.
    #[error("plugin record store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Modules excluded from construction in the current cycle.
///
/// Only grows within a cycle. The most recently added module is tracked so
/// its record is written inactive exactly once.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    members: BTreeSet<ModuleId>,
    newest: Option<ModuleId>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: ModuleId) {
        self.members.insert(module.clone());
        self.newest = Some(module);
    }

    pub fn contains(&self, module: &ModuleId) -> bool {
        self.members.contains(module)
    }

    pub fn is_newest(&self, module: &ModuleId) -> bool {
        self.newest.as_ref() == Some(module)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleId> {
        self.members.iter()
    }
}

/// Active and inactive maps built by one pass, keyed by slug.
#[derive(Default)]
pub struct PassResult {
    pub active: BTreeMap<String, Arc<PluginInstance>>,
    pub inactive: BTreeMap<String, InactivePlugin>,
}

impl PassResult {
    fn file_active(&mut self, instance: PluginInstance) {
        self.inactive.remove(&instance.slug);
        self.active.insert(instance.slug.clone(), Arc::new(instance));
    }

    fn file_inactive(&mut self, entry: InactivePlugin) {
        self.active.remove(&entry.slug);
        self.inactive.insert(entry.slug.clone(), entry);
    }
}

/// Result of a full cycle.
pub struct CycleOutcome {
    pub pass: PassResult,
    pub excluded: ExclusionSet,
    pub retries_used: u32,
    /// The budget ran out; `pass` is the partial result of the last pass.
    pub exhausted: bool,
}

fn store_failure(err: StoreError) -> Option<CycleError> {
    match err {
        StoreError::Unavailable(msg) | StoreError::Corrupt(msg) => {
            Some(CycleError::StoreUnavailable(msg))
        }
        StoreError::NotFound(_) => None,
    }
}

/// Message carried by a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run the loader of `candidate`, turning errors and panics into a message.
fn construct(candidate: &PluginCandidate) -> Result<PluginInstance, String> {
    match catch_unwind(AssertUnwindSafe(|| candidate.construct())) {
        Ok(Ok(plugin)) => Ok(PluginInstance::new(candidate, plugin)),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// One pass over `candidates`, filling `result`.
///
/// Stops at the first construction failure; `result` keeps whatever was
/// filed before it.
pub fn instantiate_pass(
    candidates: &[PluginCandidate],
    records: &dyn RecordStore,
    testing: bool,
    excluded: &ExclusionSet,
    log: &mut ErrorLog,
    result: &mut PassResult,
) -> Result<(), CycleError> {
    for candidate in candidates {
        let slug = candidate.slug();

        let record = match records.get_or_create(&slug, &candidate.meta.name, candidate.default_active)
        {
            Ok(record) => record,
            Err(e) => match store_failure(e.clone()) {
                Some(fatal) => return Err(fatal),
                None => {
                    warn!(plugin = %slug, error = %e, "No activation record, skipping");
                    log.record(error_log::INIT, candidate.module.as_str(), e.to_string());
                    continue;
                }
            },
        };

        if !(testing || record.active) {
            debug!(plugin = %slug, "Plugin disabled");
            result.file_inactive(InactivePlugin::new(
                candidate,
                Some(record.id),
                InactiveReason::Disabled,
            ));
            continue;
        }

        if excluded.contains(&candidate.module) {
            if excluded.is_newest(&candidate.module) {
                info!(plugin = %slug, module = %candidate.module, "Disabling plugin after failed construction");
                if let Err(e) = records.set_active(&slug, false) {
                    if let Some(fatal) = store_failure(e.clone()) {
                        return Err(fatal);
                    }
                    warn!(plugin = %slug, error = %e, "Could not persist disabled state");
                }
            }
            result.file_inactive(InactivePlugin::new(
                candidate,
                Some(record.id),
                InactiveReason::ConstructionFailed,
            ));
            continue;
        }

        match construct(candidate) {
            Ok(mut instance) => {
                instance.record_id = record.id;
                instance.record_active = record.active;
                info!(
                    plugin = %slug,
                    module = %candidate.module,
                    mixins = instance.capabilities().mixins().count(),
                    "Loaded plugin"
                );
                result.file_active(instance);
            }
            Err(message) => {
                error!(plugin = %slug, module = %candidate.module, error = %message, "Plugin failed to construct");
                log.record(error_log::INIT, candidate.module.as_str(), message.clone());
                return Err(CycleError::Construction {
                    module: candidate.module.clone(),
                    message,
                });
            }
        }
    }

    Ok(())
}

/// Instantiate `candidates`, excluding and retrying on construction
/// failures at most `retry_attempts` times.
///
/// Only [`CycleError::StoreUnavailable`] is returned as an error; running
/// out of retries keeps the partial result of the last pass.
pub fn run_cycle(
    candidates: &[PluginCandidate],
    records: &dyn RecordStore,
    testing: bool,
    retry_attempts: u32,
    log: &mut ErrorLog,
) -> Result<CycleOutcome, CycleError> {
    let mut excluded = ExclusionSet::new();
    let mut budget = retry_attempts;

    loop {
        let mut pass = PassResult::default();

        match instantiate_pass(candidates, records, testing, &excluded, log, &mut pass) {
            Ok(()) => {
                return Ok(CycleOutcome {
                    pass,
                    excluded,
                    retries_used: retry_attempts - budget,
                    exhausted: false,
                })
            }
            Err(CycleError::Construction { module, .. }) => {
                excluded.insert(module);

                if budget == 0 {
                    warn!(
                        attempts = retry_attempts,
                        excluded = excluded.len(),
                        "Plugin loading retries exhausted, keeping partial result"
                    );
                    return Ok(CycleOutcome {
                        pass,
                        excluded,
                        retries_used: retry_attempts,
                        exhausted: true,
                    });
                }

                budget -= 1;
                debug!(remaining = budget, "Retrying plugin instantiation");
            }
            Err(fatal @ CycleError::StoreUnavailable(_)) => return Err(fatal),
        }
    }
}
