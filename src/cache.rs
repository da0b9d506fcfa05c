//! Per-stage cache records.
//!
//! Every stage output `foo.fits` gets a sidecar `foo.fits.cache.json`
//! describing what produced it. An output is reused only when its record
//! is valid, the output and all companion files exist, the recorded
//! parameters match the current ones and no input has been regenerated
//! since the record was written.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::pipeline::Stage;

/// Parameters closer than this count as unchanged
pub const PARAM_TOLERANCE: f64 = 1e-3;

const SIDECAR_SUFFIX: &str = ".cache.json";

pub type StageParams = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub stage: Stage,
    pub output_path: PathBuf,
    /// Further files the stage writes alongside `output_path`
    #[serde(default)]
    pub companions: Vec<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub params: StageParams,
    pub valid: bool,
    pub written_at: DateTime<Utc>,
}

/// Identity of one stage invocation
#[derive(Debug, Clone)]
pub struct StageKey {
    pub stage: Stage,
    pub output: PathBuf,
    pub companions: Vec<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub params: StageParams,
}

impl StageKey {
    pub fn new(stage: Stage, output: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            output: output.into(),
            companions: Vec::new(),
            inputs: Vec::new(),
            params: StageParams::new(),
        }
    }

    pub fn companion(mut self, path: impl Into<PathBuf>) -> Self {
        self.companions.push(path.into());
        self
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

/// Why a stage has to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeReason {
    Forced,
    MissingOutput,
    NoRecord,
    InvalidRecord,
    ParamsChanged,
    /// An input was rewritten after this output was recorded
    InputsChanged,
}

impl std::fmt::Display for RecomputeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RecomputeReason::Forced => "forced",
            RecomputeReason::MissingOutput => "output missing",
            RecomputeReason::NoRecord => "no cache record",
            RecomputeReason::InvalidRecord => "cache record invalid",
            RecomputeReason::ParamsChanged => "parameters changed",
            RecomputeReason::InputsChanged => "inputs regenerated",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Reuse,
    Compute(RecomputeReason),
}

pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn params_match(stored: &StageParams, current: &StageParams) -> bool {
    stored.len() == current.len()
        && stored.iter().all(|(name, a)| {
            current
                .get(name)
                .is_some_and(|b| (a - b).abs() <= PARAM_TOLERANCE)
        })
}

/// Cache decisions for one pipeline run
#[derive(Debug, Default)]
pub struct StageCache {
    /// Outputs already produced during this run
    computed: HashSet<PathBuf>,
    /// Outputs and companions written during this run
    written: HashSet<PathBuf>,
    counts: BTreeMap<Stage, usize>,
}

impl StageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(output: &Path) -> Result<Option<CacheRecord>> {
        let path = sidecar_path(output);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache record: {}", path.display()))?;
        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(record = %path.display(), error = %e, "ignoring unreadable cache record");
                Ok(None)
            }
        }
    }

    pub fn was_computed(&self, output: &Path) -> bool {
        self.computed.contains(output)
    }

    /// How many outputs each stage produced during this run
    pub fn computed_by_stage(&self) -> &BTreeMap<Stage, usize> {
        &self.counts
    }

    /// An input is newer than `record` when it was written during this
    /// run or its own record postdates this one
    fn inputs_changed(&self, key: &StageKey, record: &CacheRecord) -> Result<bool> {
        for input in &key.inputs {
            if self.written.contains(input) {
                return Ok(true);
            }
            if let Some(upstream) = Self::load(input)? {
                if upstream.written_at > record.written_at {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn decide(&self, key: &StageKey, forced: bool) -> Result<CacheDecision> {
        // Once per run, whatever the force flags say
        if self.was_computed(&key.output) {
            return Ok(CacheDecision::Reuse);
        }
        if forced {
            return Ok(CacheDecision::Compute(RecomputeReason::Forced));
        }
        if !key.output.exists() || key.companions.iter().any(|c| !c.exists()) {
            return Ok(CacheDecision::Compute(RecomputeReason::MissingOutput));
        }
        let Some(record) = Self::load(&key.output)? else {
            return Ok(CacheDecision::Compute(RecomputeReason::NoRecord));
        };
        if !record.valid || record.stage != key.stage {
            return Ok(CacheDecision::Compute(RecomputeReason::InvalidRecord));
        }
        if !params_match(&record.params, &key.params) {
            return Ok(CacheDecision::Compute(RecomputeReason::ParamsChanged));
        }
        if self.inputs_changed(key, &record)? {
            return Ok(CacheDecision::Compute(RecomputeReason::InputsChanged));
        }
        Ok(CacheDecision::Reuse)
    }

    /// Drop the records of the output and its companions before they are
    /// rewritten
    pub fn invalidate(&self, key: &StageKey) -> Result<()> {
        for path in std::iter::once(&key.output).chain(&key.companions) {
            let sidecar = sidecar_path(path);
            if sidecar.exists() {
                std::fs::remove_file(&sidecar).with_context(|| {
                    format!("Failed to remove cache record: {}", sidecar.display())
                })?;
            }
        }
        Ok(())
    }

    pub fn record(&mut self, key: &StageKey) -> Result<()> {
        let record = CacheRecord {
            stage: key.stage,
            output_path: key.output.clone(),
            companions: key.companions.clone(),
            inputs: key.inputs.clone(),
            params: key.params.clone(),
            valid: true,
            written_at: Utc::now(),
        };
        let path = sidecar_path(&key.output);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("Failed to write cache record: {}", path.display()))?;
        self.computed.insert(key.output.clone());
        self.written.insert(key.output.clone());
        self.written.extend(key.companions.iter().cloned());
        *self.counts.entry(key.stage).or_default() += 1;
        Ok(())
    }

    /// Reuse the cached output through `load`, or run `compute` and record
    /// it. Sidecar I/O failures surface through `E::from`.
    pub fn run_stage<T, E>(
        &mut self,
        key: &StageKey,
        forced: bool,
        load: impl FnOnce() -> Result<T, E>,
        compute: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        match self.decide(key, forced)? {
            CacheDecision::Reuse => {
                tracing::debug!(stage = %key.stage, output = %key.output.display(), "reusing cached output");
                load()
            }
            CacheDecision::Compute(reason) => {
                tracing::info!(stage = %key.stage, output = %key.output.display(), %reason, "computing");
                self.invalidate(key)?;
                let value = compute()?;
                self.record(key)?;
                Ok(value)
            }
        }
    }
}
