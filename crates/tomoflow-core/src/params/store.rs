use toml::{Table, Value};
use tracing::{debug, info};

use crate::artifact::{read_text, write_atomic};
use crate::error::{Result, TomoError};
use crate::project::Project;
use crate::stage::Stage;

use super::config::StageConfig;
use super::master::MasterConfig;
use super::overrides::Overrides;

/// The layers a stage config is resolved from.
pub struct ConfigSources<'a> {
    pub master: &'a MasterConfig,
    /// Resolved config of the predecessor stage, if it has been configured.
    pub upstream: Option<&'a StageConfig>,
    /// Previously persisted config of this stage.
    pub prior: Option<&'a Table>,
    pub overrides: &'a Overrides,
}

/// Merge the layers for `stage` and validate the result.
///
/// Precedence, lowest first: built-in defaults, master project fields,
/// values inherited from the upstream stage, the prior persisted config,
/// explicit overrides. Built-in defaults are the serde field defaults, so
/// they only apply to keys that no layer provides.
pub fn resolve(stage: Stage, sources: &ConfigSources<'_>) -> Result<StageConfig> {
    let mut merged = sources.master.stage_layer(stage);
    if let Some(upstream) = sources.upstream {
        merge_into(&mut merged, &upstream.downstream_layer(stage));
    }
    if let Some(prior) = sources.prior {
        merge_into(&mut merged, prior);
    }
    merge_into(&mut merged, &sources.overrides.layer(stage)?);
    StageConfig::from_table(stage, merged)
}

/// Deep-merge `layer` into `base`; nested tables merge key by key, every
/// other value replaces what was there.
pub fn merge_into(base: &mut Table, layer: &Table) {
    for (key, value) in layer {
        if let (Some(Value::Table(existing)), Value::Table(incoming)) = (base.get_mut(key), value)
        {
            merge_into(existing, incoming);
            continue;
        }
        base.insert(key.clone(), value.clone());
    }
}

/// Parameter Store bound to one project.
pub struct ParameterStore<'a> {
    project: &'a Project,
    master: &'a MasterConfig,
}

impl<'a> ParameterStore<'a> {
    pub fn new(project: &'a Project, master: &'a MasterConfig) -> Self {
        Self { project, master }
    }

    /// The persisted config document of `stage`, unvalidated.
    pub fn load_prior(&self, stage: Stage) -> Result<Option<Table>> {
        let path = self.project.stage_config_path(stage);
        match read_text(&path)? {
            Some(text) => toml::from_str::<Table>(&text)
                .map(Some)
                .map_err(|e| TomoError::config(stage.key(), e.to_string())),
            None => Ok(None),
        }
    }

    /// The persisted config of `stage`, validated as-is.
    pub fn load_persisted(&self, stage: Stage) -> Result<Option<StageConfig>> {
        match self.load_prior(stage)? {
            Some(table) => StageConfig::from_table(stage, table).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve the config for a run of `stage` and persist it.
    ///
    /// An explicit process list supplied through `overrides` applies to this
    /// run only; the persisted document keeps the prior process list.
    pub fn resolve(&self, stage: Stage, overrides: &Overrides) -> Result<StageConfig> {
        let upstream = self.load_upstream(stage)?;
        let prior = self.load_prior(stage)?;
        let config = resolve(
            stage,
            &ConfigSources {
                master: self.master,
                upstream: upstream.as_ref(),
                prior: prior.as_ref(),
                overrides,
            },
        )?;

        let mut persisted = config.clone();
        if overrides.process_list().is_some() {
            persisted.system.process_list = match &prior {
                Some(table) => StageConfig::from_table(stage, table.clone())
                    .map(|c| c.system.process_list)
                    .unwrap_or_default(),
                None => Vec::new(),
            };
        }
        self.persist(&persisted)?;
        info!(stage = stage.key(), "Stage config resolved");
        Ok(config)
    }

    /// Write a fresh config for `stage`, ignoring any prior one.
    pub fn new_config(&self, stage: Stage, overrides: &Overrides) -> Result<StageConfig> {
        let upstream = self.load_upstream(stage)?;
        let config = resolve(
            stage,
            &ConfigSources {
                master: self.master,
                upstream: upstream.as_ref(),
                prior: None,
                overrides,
            },
        )?;
        self.persist(&config)?;
        info!(stage = stage.key(), "New stage config written");
        Ok(config)
    }

    pub fn persist(&self, config: &StageConfig) -> Result<()> {
        let path = self.project.stage_config_path(config.stage);
        let text = toml::to_string_pretty(&config.to_table()?)
            .map_err(|e| TomoError::config(config.stage.key(), e.to_string()))?;
        debug!(path = %path.display(), "Persisting stage config");
        write_atomic(&path, &text)
    }

    fn load_upstream(&self, stage: Stage) -> Result<Option<StageConfig>> {
        match stage.predecessor() {
            Some(pred) => self.load_persisted(pred),
            None => Ok(None),
        }
    }
}
