/// Characters rejected in project names; they end up in artifact file names.
pub const ILLEGAL_PROJECT_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Finished units between two ledger checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 1;

/// Default number of concurrent external-tool invocations.
pub const DEFAULT_PARALLELISM: usize = 1;

/// Poll interval while waiting on an external process.
pub const PROCESS_POLL_INTERVAL_MS: u64 = 20;

/// Tool-parameter keys that do not influence outputs; excluded from staleness
/// comparison.
pub const COSMETIC_PARAM_KEYS: [&str; 4] =
    ["exec_path", "newstack_path", "gpu_ids", "gpu_memory_usage"];

/// File suffixes of the per-project artifacts.
pub const MASTER_CONFIG_SUFFIX: &str = "proj";
pub const REGISTRY_SUFFIX: &str = "registry";
pub const LEDGER_SUFFIX: &str = "ledger";
pub const ARTIFACT_EXTENSION: &str = "toml";
