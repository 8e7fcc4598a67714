use crate::report::harvest::{Harvest, OutputValue};
use crate::runner::Vars;
use crate::runner::command::{OUTPUT_PREFIX, SECRET_PREFIX};
use std::collections::BTreeMap;

/// Mutable per-run state shared by steps: template variables and the latest
/// harvest. Owned by the controller; steps see it one at a time.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    vars: Vars,
    harvest: Option<Harvest>,
}

impl RunContext {
    pub fn new(base: Vars) -> Self {
        Self {
            vars: base,
            harvest: None,
        }
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn harvest(&self) -> Option<&Harvest> {
        self.harvest.as_ref()
    }

    pub fn has_harvested(&self) -> bool {
        self.harvest.is_some()
    }

    pub fn insert_secrets(&mut self, values: &BTreeMap<String, String>) {
        for (name, value) in values {
            self.vars
                .insert(format!("{}{}", SECRET_PREFIX, name), value.clone());
        }
    }

    /// Replace any earlier harvest. Plain outputs become `${output.<key>}`,
    /// sensitive ones `${secret.output.<key>}`.
    pub fn apply_harvest(&mut self, harvest: Harvest) {
        let stale: Vec<String> = self
            .vars
            .keys()
            .filter(|k| {
                k.starts_with(OUTPUT_PREFIX)
                    || k.starts_with(&format!("{}{}", SECRET_PREFIX, OUTPUT_PREFIX))
            })
            .cloned()
            .collect();
        for key in stale {
            self.vars.remove(&key);
        }

        if let Some(outputs) = harvest.outputs() {
            for (key, value) in outputs {
                match value {
                    OutputValue::Plain(v) => {
                        self.vars.insert(format!("{}{}", OUTPUT_PREFIX, key), v.clone());
                    }
                    OutputValue::Sensitive(v) => {
                        self.vars.insert(
                            format!("{}{}{}", SECRET_PREFIX, OUTPUT_PREFIX, key),
                            v.clone(),
                        );
                    }
                }
            }
        }
        self.harvest = Some(harvest);
    }
}
