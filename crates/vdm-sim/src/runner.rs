//! Builds a scheduler from a scenario and runs it

use crate::config::{MainDef, Scenario};
use crate::script::Library;
use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;
use vdm_metrics::MetricsSnapshot;
use vdm_scheduler::{
    BusConfig, ObjectId, Operation, ResourceId, ResourceScheduler, RunError, RunOutcome,
    TestResult, TestStep, ThreadId, ThreadInfo, Time, Value, Verdict, VCPU,
};

/// How the main run ended, in report form
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeSummary {
    /// Entry point returned or the system went quiet
    Completed {
        /// Returned value
        value: Value,
    },
    /// A thread failed
    Failed {
        /// Failing thread
        thread: ThreadId,
        /// Its error
        error: RunError,
    },
    /// No thread could progress
    Deadlocked {
        /// Clock at detection
        time: Time,
        /// Blocked threads
        blocked: Vec<ThreadInfo>,
    },
    /// Time limit reached
    Stopped {
        /// Clock when stopped
        at: Time,
    },
}

impl From<RunOutcome> for OutcomeSummary {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(value) => OutcomeSummary::Completed { value },
            RunOutcome::Failed { thread, error } => OutcomeSummary::Failed { thread, error },
            RunOutcome::Deadlocked(report) => OutcomeSummary::Deadlocked {
                time: report.time,
                blocked: report.blocked,
            },
            RunOutcome::Stopped { at } => OutcomeSummary::Stopped { at },
        }
    }
}

impl OutcomeSummary {
    /// Whether the run ended without a failure or a deadlock
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            OutcomeSummary::Completed { .. } | OutcomeSummary::Stopped { .. }
        )
    }
}

/// Result of one test sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    /// Test name
    pub name: String,
    /// Verdict and executed steps
    #[serde(flatten)]
    pub result: TestResult,
}

/// Everything a scenario run produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Main run outcome
    pub outcome: OutcomeSummary,
    /// Clock at the end of the main run
    pub time: Time,
    /// Test sequences, in scenario order
    pub tests: Vec<TestReport>,
    /// Metrics of the main run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

impl Report {
    /// Whether the main run succeeded and no test failed
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok() && self.tests.iter().all(|t| t.result.verdict != Verdict::Failed)
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = match &self.outcome {
            OutcomeSummary::Completed { value } => {
                writeln!(out, "completed at t={} with {}", self.time, value)
            }
            OutcomeSummary::Failed { thread, error } => match &error.location {
                Some(at) => writeln!(
                    out,
                    "failed at t={} in {} ({}): {}",
                    self.time, thread, at, error
                ),
                None => writeln!(out, "failed at t={} in {}: {}", self.time, thread, error),
            },
            OutcomeSummary::Deadlocked { time, blocked } => {
                let names: Vec<&str> = blocked.iter().map(|t| t.name.as_str()).collect();
                writeln!(out, "deadlocked at t={}: {}", time, names.join(", "))
            }
            OutcomeSummary::Stopped { at } => writeln!(out, "stopped at t={}", at),
        };
        for test in &self.tests {
            let _ = writeln!(
                out,
                "test {}: {} ({} steps)",
                test.name,
                test.result.verdict,
                test.result.steps.len()
            );
        }
        out
    }
}

/// A scheduler populated from a scenario
pub struct Simulation {
    scheduler: ResourceScheduler,
    library: Arc<Library>,
    scenario: Scenario,
}

impl Simulation {
    /// Declare resources, deploy objects and load the operations
    pub fn build(scenario: Scenario) -> Result<Self> {
        let scheduler = ResourceScheduler::new(scenario.scheduler.clone())?;

        for cpu in &scenario.cpus {
            scheduler.add_cpu(cpu.clone())?;
        }
        for bus in &scenario.buses {
            let cpus = bus
                .cpus
                .iter()
                .map(|name| cpu_named(&scheduler, name))
                .collect::<Result<Vec<_>>>()?;
            scheduler.add_bus(
                BusConfig::new(bus.name.clone(), cpus)
                    .with_latency(bus.latency)
                    .with_speed(bus.speed),
            )?;
        }
        for object in &scenario.objects {
            let cpu = match &object.cpu {
                Some(name) => cpu_named(&scheduler, name)?,
                None => VCPU,
            };
            let id = scheduler.deploy(&object.name, cpu)?;
            for (field, value) in &object.fields {
                scheduler.define_field(id, field, value.clone())?;
            }
        }
        for p in &scenario.priorities {
            scheduler.set_priority(cpu_named(&scheduler, &p.cpu)?, &p.operation, p.priority)?;
        }

        let library = Library::new(scenario.operations.clone());
        info!(
            cpus = scenario.cpus.len(),
            buses = scenario.buses.len(),
            objects = scenario.objects.len(),
            operations = library.len(),
            "scenario loaded"
        );

        Ok(Self {
            scheduler,
            library,
            scenario,
        })
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &ResourceScheduler {
        &self.scheduler
    }

    fn object(&self, name: &str) -> Result<ObjectId> {
        self.scheduler
            .object_named(name)
            .ok_or_else(|| anyhow!("unknown object {}", name))
    }

    fn operation(&self, name: &str) -> Result<Arc<dyn Operation>> {
        self.library
            .get(name)
            .ok_or_else(|| anyhow!("unknown operation {}", name))
    }

    /// Start the activation chains, then run the main entry point, or the
    /// chains alone when the scenario has none
    pub fn run_main(&mut self) -> Result<RunOutcome> {
        if self.scenario.main.is_none()
            && !self.scenario.periodic.is_empty()
            && self.scenario.scheduler.time_limit.is_none()
        {
            bail!("periodic activations without a main entry point need a time limit");
        }

        for p in &self.scenario.periodic {
            let target = self.object(&p.object)?;
            let op = self.operation(&p.operation)?;
            self.scheduler.spawn_periodic(target, op, p.args.clone(), p.spec)?;
        }

        let outcome = match self.scenario.main.clone() {
            Some(MainDef {
                object: Some(name),
                operation,
                args,
            }) => {
                let target = self.object(&name)?;
                let op = self.operation(&operation)?;
                self.scheduler.spawn_sync(target, op, args)?
            }
            Some(MainDef {
                object: None,
                operation,
                args,
            }) => {
                let op = self.operation(&operation)?;
                self.scheduler.spawn_main(op, args)?
            }
            None => self.scheduler.run()?,
        };
        Ok(outcome)
    }

    /// Run every test sequence from a fresh state
    pub fn run_tests(&mut self) -> Result<Vec<TestReport>> {
        let mut reports = Vec::with_capacity(self.scenario.tests.len());
        for test in self.scenario.tests.clone() {
            self.scheduler.reset();
            let steps = test
                .steps
                .iter()
                .map(|s| {
                    Ok(TestStep::new(
                        self.object(&s.object)?,
                        self.operation(&s.operation)?,
                        s.args.clone(),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            let result = self.scheduler.run_test(steps)?;
            info!(test = %test.name, verdict = %result.verdict, "test sequence finished");
            reports.push(TestReport {
                name: test.name,
                result,
            });
        }
        Ok(reports)
    }
}

fn cpu_named(scheduler: &ResourceScheduler, name: &str) -> Result<ResourceId> {
    scheduler
        .cpu_named(name)
        .ok_or_else(|| anyhow!("unknown cpu {}", name))
}
