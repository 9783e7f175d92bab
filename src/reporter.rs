use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::settings::DepNotifySettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    BeginStep(String),
    CompleteStep(String),
    SetStepCount(usize),
    ResetStep,
    Message(String),
}

/// A progress sink. Modules run on the reporter worker thread, one event at a
/// time, in emission order.
pub trait ReportModule: Send {
    fn name(&self) -> &str;
    fn handle(&mut self, event: &ReportEvent) -> Result<()>;
}

/// Fire-and-forget progress reporting handle. Cloning is cheap; the worker
/// exits once every clone has been dropped.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<Sender<ReportEvent>>,
}

impl Reporter {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn spawn(mut modules: Vec<Box<dyn ReportModule>>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<ReportEvent>();
        let handle = thread::spawn(move || {
            for event in rx {
                for module in modules.iter_mut() {
                    if let Err(err) = module.handle(&event) {
                        warn!(module = module.name(), "report module failed: {err:#}");
                    }
                }
            }
        });
        (Self { tx: Some(tx) }, handle)
    }

    fn send(&self, event: ReportEvent) {
        if let Some(tx) = &self.tx {
            // The worker only goes away at shutdown; late events are dropped.
            let _ = tx.send(event);
        }
    }

    pub fn begin_step(&self, name: &str) {
        self.send(ReportEvent::BeginStep(name.to_string()));
    }

    pub fn complete_step(&self, name: &str) {
        self.send(ReportEvent::CompleteStep(name.to_string()));
    }

    pub fn set_step_count(&self, count: usize) {
        self.send(ReportEvent::SetStepCount(count));
    }

    pub fn reset_step(&self) {
        self.send(ReportEvent::ResetStep);
    }

    pub fn report(&self, message: &str) {
        self.send(ReportEvent::Message(message.to_string()));
    }
}

/// Mirrors progress events into the structured log.
#[derive(Debug, Default)]
pub struct LogModule;

impl ReportModule for LogModule {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&mut self, event: &ReportEvent) -> Result<()> {
        match event {
            ReportEvent::BeginStep(name) => info!(step = %name, "step started"),
            ReportEvent::CompleteStep(name) => info!(step = %name, "step completed"),
            ReportEvent::SetStepCount(count) => debug!(count, "step count set"),
            ReportEvent::ResetStep => debug!("step counter reset"),
            ReportEvent::Message(message) => info!("{message}"),
        }
        Ok(())
    }
}

/// Drives a DEPNotify window through its control file.
#[derive(Debug)]
pub struct DepNotify {
    control_file: PathBuf,
    determinate: bool,
    steps: Option<usize>,
    current: usize,
}

impl DepNotify {
    pub fn new(settings: &DepNotifySettings) -> Result<Self> {
        let control_file = settings.control_file.clone();
        if !control_file.exists() {
            fs::write(&control_file, b"").with_context(|| {
                format!(
                    "unable to create DEPNotify control file '{}'",
                    control_file.display()
                )
            })?;
        }
        Ok(Self {
            control_file,
            determinate: settings.determinate,
            steps: None,
            current: 0,
        })
    }

    pub fn control_file(&self) -> &Path {
        &self.control_file
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.control_file)
            .with_context(|| {
                format!(
                    "unable to open DEPNotify control file '{}'",
                    self.control_file.display()
                )
            })?;
        writeln!(file, "{line}").context("unable to write DEPNotify control file")
    }

    fn reset(&mut self) -> Result<()> {
        if self.steps.is_none() || !self.determinate {
            return Ok(());
        }
        self.append("Command: DeterminateOffReset")
    }
}

impl ReportModule for DepNotify {
    fn name(&self) -> &str {
        "depnotify"
    }

    fn handle(&mut self, event: &ReportEvent) -> Result<()> {
        match event {
            ReportEvent::BeginStep(message) | ReportEvent::Message(message) => {
                self.append(&format!("Status: {message}"))
            }
            ReportEvent::SetStepCount(count) => {
                self.steps = Some(*count);
                if self.determinate {
                    self.append(&format!("Command: DeterminateManual: {count}"))?;
                }
                Ok(())
            }
            ReportEvent::CompleteStep(_) => {
                self.current += 1;
                let Some(steps) = self.steps else {
                    return Ok(());
                };
                if !self.determinate {
                    return Ok(());
                }
                self.append("Command: DeterminateManualStep: 1")?;
                if self.current == steps {
                    self.reset()?;
                }
                Ok(())
            }
            ReportEvent::ResetStep => self.reset(),
        }
    }
}
