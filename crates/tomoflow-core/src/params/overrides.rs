use toml::{Table, Value};

use crate::error::{Result, TomoError};
use crate::registry::UnitId;
use crate::stage::Stage;

/// Explicit per-run overrides; the highest-precedence config layer.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    entries: Vec<(Vec<String>, Value)>,
    process_list: Option<Vec<UnitId>>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `section.key=value` assignments. `params` addresses the tool
    /// section of whichever stage the overrides are applied to.
    pub fn parse<S: AsRef<str>>(assignments: &[S]) -> Result<Self> {
        let mut overrides = Self::new();
        for a in assignments {
            overrides.push(a.as_ref())?;
        }
        Ok(overrides)
    }

    pub fn push(&mut self, assignment: &str) -> Result<()> {
        let (key, raw) = assignment.split_once('=').ok_or_else(|| {
            TomoError::config(assignment, "expected an assignment of the form key=value")
        })?;
        let path: Vec<String> = key.trim().split('.').map(|s| s.trim().to_string()).collect();
        if path.len() < 2 || path.iter().any(|s| s.is_empty()) {
            return Err(TomoError::config(
                key.trim(),
                "expected `system.<key>` or `params.<key>`",
            ));
        }
        self.entries.push((path, parse_value(raw.trim())));
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        let path = key.split('.').map(str::to_string).collect();
        self.entries.push((path, value.into()));
        self
    }

    pub fn with_process_list(mut self, units: Vec<UnitId>) -> Self {
        self.process_list = Some(units);
        self
    }

    pub fn process_list(&self) -> Option<&[UnitId]> {
        self.process_list.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.process_list.is_none()
    }

    /// Render the overrides as a partial table for `stage`.
    pub(crate) fn layer(&self, stage: Stage) -> Result<Table> {
        let mut layer = Table::new();
        for (path, value) in &self.entries {
            let section = match path[0].as_str() {
                "system" => "system",
                "params" => stage.key(),
                other if other == stage.key() => stage.key(),
                other => {
                    // Overrides addressed to another stage's section are ignored
                    // so one `--set` list can drive a whole `run-all`.
                    if Stage::from_key(other).is_some() {
                        continue;
                    }
                    return Err(TomoError::config(
                        path.join("."),
                        "unknown config section",
                    ));
                }
            };
            let mut keys = vec![section.to_string()];
            keys.extend(path[1..].iter().cloned());
            insert_nested(&mut layer, &keys, value.clone());
        }
        if let Some(units) = &self.process_list {
            let list = units
                .iter()
                .map(|u| Value::from(u.as_str().to_string()))
                .collect::<Vec<_>>();
            insert_nested(
                &mut layer,
                &["system".to_string(), "process_list".to_string()],
                Value::Array(list),
            );
        }
        Ok(layer)
    }
}

fn insert_nested(table: &mut Table, keys: &[String], value: Value) {
    let (last, parents) = match keys.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = table;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        current = match entry {
            Value::Table(t) => t,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

/// Interpret an override value as a TOML value, falling back to a string.
fn parse_value(raw: &str) -> Value {
    toml::from_str::<Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| Value::from(raw.to_string()))
}
