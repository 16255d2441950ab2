//! Scenario configuration

use crate::script::ScriptDef;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use vdm_scheduler::{CpuConfig, PeriodicSpec, Priority, SchedulerConfig, Time, Value};

/// Bus declaration, CPUs referenced by name
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusDef {
    /// Unique name
    pub name: String,
    /// Connected CPU names
    pub cpus: Vec<String>,
    /// Fixed transit latency
    #[serde(default)]
    pub latency: Time,
    /// Value units per time unit (0 = unbounded)
    #[serde(default)]
    pub speed: u64,
}

/// Deployed object
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObjectDef {
    /// Unique name
    pub name: String,
    /// Hosting CPU; the virtual CPU when omitted
    #[serde(default)]
    pub cpu: Option<String>,
    /// Initial instance variables
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

/// Per-CPU priority override
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriorityDef {
    /// CPU name
    pub cpu: String,
    /// Operation name
    pub operation: String,
    /// Priority on that CPU
    pub priority: Priority,
}

/// Activation chain started before the main entry point
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeriodicDef {
    /// Target object
    pub object: String,
    /// Operation name
    pub operation: String,
    /// Arguments of every activation
    #[serde(default)]
    pub args: Vec<Value>,
    /// Activation parameters
    #[serde(flatten)]
    pub spec: PeriodicSpec,
}

/// Main entry point
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MainDef {
    /// Object called synchronously; a free operation when omitted
    #[serde(default)]
    pub object: Option<String>,
    /// Operation name
    pub operation: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

/// One call of a test sequence
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepDef {
    /// Called object
    pub object: String,
    /// Operation name
    pub operation: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Named test sequence
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestDef {
    /// Test name
    pub name: String,
    /// Calls, run in order
    pub steps: Vec<StepDef>,
}

/// Complete scenario file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Scenario {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Declared CPUs
    #[serde(default, rename = "cpu")]
    pub cpus: Vec<CpuConfig>,
    /// Declared buses
    #[serde(default, rename = "bus")]
    pub buses: Vec<BusDef>,
    /// Deployed objects
    #[serde(default, rename = "object")]
    pub objects: Vec<ObjectDef>,
    /// Scripted operations
    #[serde(default, rename = "operation")]
    pub operations: Vec<ScriptDef>,
    /// Priority overrides
    #[serde(default, rename = "priority")]
    pub priorities: Vec<PriorityDef>,
    /// Activation chains
    #[serde(default, rename = "periodic")]
    pub periodic: Vec<PeriodicDef>,
    /// Main entry point
    #[serde(default)]
    pub main: Option<MainDef>,
    /// Test sequences
    #[serde(default, rename = "test")]
    pub tests: Vec<TestDef>,
}

impl Scenario {
    /// Load and validate a scenario file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading scenario from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("loading {}", path.display()))
    }

    /// Parse and validate scenario text
    pub fn from_toml(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check that every name the scenario uses is declared
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        let cpus = unique("cpu", self.cpus.iter().map(|c| c.name.as_str()))?;
        unique("bus", self.buses.iter().map(|b| b.name.as_str()))?;
        let objects = unique("object", self.objects.iter().map(|o| o.name.as_str()))?;
        let operations = unique("operation", self.operations.iter().map(|o| o.name.as_str()))?;

        for bus in &self.buses {
            for cpu in &bus.cpus {
                if !cpus.contains(cpu.as_str()) {
                    bail!("bus {} connects unknown cpu {}", bus.name, cpu);
                }
            }
        }
        for object in &self.objects {
            if let Some(cpu) = &object.cpu {
                if !cpus.contains(cpu.as_str()) {
                    bail!("object {} deployed on unknown cpu {}", object.name, cpu);
                }
            }
        }
        for op in &self.operations {
            for instr in &op.body {
                if let Some(name) = instr.object_ref() {
                    if !objects.contains(name) {
                        bail!("operation {} references unknown object {}", op.name, name);
                    }
                }
                if let Some(name) = instr.operation_ref() {
                    if !operations.contains(name) {
                        bail!("operation {} references unknown operation {}", op.name, name);
                    }
                }
            }
        }
        for p in &self.priorities {
            if !cpus.contains(p.cpu.as_str()) {
                bail!("priority override for unknown cpu {}", p.cpu);
            }
            if !operations.contains(p.operation.as_str()) {
                bail!("priority override for unknown operation {}", p.operation);
            }
        }
        for p in &self.periodic {
            if !objects.contains(p.object.as_str()) {
                bail!("periodic activation of unknown object {}", p.object);
            }
            if !operations.contains(p.operation.as_str()) {
                bail!("periodic activation of unknown operation {}", p.operation);
            }
            p.spec.validate()?;
        }
        if let Some(main) = &self.main {
            if let Some(object) = &main.object {
                if !objects.contains(object.as_str()) {
                    bail!("main calls unknown object {}", object);
                }
            }
            if !operations.contains(main.operation.as_str()) {
                bail!("main calls unknown operation {}", main.operation);
            }
        }
        for test in &self.tests {
            if test.steps.is_empty() {
                bail!("test {} has no steps", test.name);
            }
            for step in &test.steps {
                if !objects.contains(step.object.as_str()) {
                    bail!("test {} calls unknown object {}", test.name, step.object);
                }
                if !operations.contains(step.operation.as_str()) {
                    bail!("test {} calls unknown operation {}", test.name, step.operation);
                }
            }
        }
        Ok(())
    }
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            bail!("duplicate {} {}", what, name);
        }
    }
    Ok(seen)
}
