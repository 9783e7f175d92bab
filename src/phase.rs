use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::item::{DeployItem, ItemContext, ItemState, ItemVariant};
use crate::manifest::{FailPolicy, ItemKind, ItemSpec, PhaseKind};
use crate::reporter::Reporter;

/// A unit of scheduling inside a phase: one item on its own, or a run of
/// adjacent items sharing a parallel-group tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Single(usize),
    Group { tag: String, members: Vec<usize> },
}

/// Split `groups` (one optional tag per item, in manifest order) into
/// segments. Only immediately adjacent items with equal tags share a group.
pub fn segments<'a, I>(groups: I) -> Vec<Segment>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut out: Vec<Segment> = Vec::new();
    for (idx, tag) in groups.into_iter().enumerate() {
        let Some(tag) = tag else {
            out.push(Segment::Single(idx));
            continue;
        };
        if let Some(Segment::Group { tag: open, members }) = out.last_mut() {
            if open.as_str() == tag {
                members.push(idx);
                continue;
            }
        }
        out.push(Segment::Group {
            tag: tag.to_string(),
            members: vec![idx],
        });
    }
    out
}

/// Whether the run may continue after an item reached `state`.
pub fn should_proceed(state: ItemState, policy: FailPolicy) -> bool {
    match state {
        ItemState::FailedDownload => policy.tolerates_download_failure(),
        ItemState::Failed => policy.tolerates_execution_failure(),
        _ => true,
    }
}

/// Sticky AND of preflight results: unset until the first item reports,
/// and once false it stays false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionedFlag(Option<bool>);

impl ProvisionedFlag {
    pub fn fold(&mut self, passed: bool) {
        if self.0 != Some(false) {
            self.0 = Some(passed);
        }
    }

    pub fn get(self) -> Option<bool> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub aborted: bool,
    /// Only set by the preflight phase.
    pub already_provisioned: Option<bool>,
}

/// An ordered list of deploy items for one phase.
#[derive(Debug)]
pub struct Phase {
    kind: PhaseKind,
    items: Vec<Arc<DeployItem>>,
}

impl Phase {
    /// Build a phase from manifest entries. Entries whose type this phase
    /// does not run are dropped with a warning.
    pub fn from_specs(kind: PhaseKind, specs: &[ItemSpec], ctx: &ItemContext) -> Self {
        let mut items = Vec::with_capacity(specs.len());
        for spec in specs {
            if !kind.accepts(spec.kind) {
                warn!(phase = %kind, item = %spec.name, kind = %spec.kind, "item type not valid for phase; dropping");
                continue;
            }
            if let Some(item) = DeployItem::from_spec(spec, ctx) {
                items.push(item);
            }
        }
        Self { kind, items }
    }

    pub fn items(&self) -> &[Arc<DeployItem>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_user_scripts(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.variant(), ItemVariant::UserScript))
    }

    /// Kick off downloads in manifest order on a background thread.
    pub fn download_resources(&self) -> JoinHandle<()> {
        start_downloads(self.items.clone())
    }

    /// Execute the phase. Never interrupts an item that has started; an abort
    /// only stops later items and groups from starting.
    pub fn begin(&self, reporter: &Reporter) -> PhaseOutcome {
        info!(phase = %self.kind, items = self.items.len(), "phase starting");
        let outcome = match self.kind {
            PhaseKind::Preflight => self.run_preflight(reporter),
            _ => self.run_items(reporter),
        };
        if outcome.aborted {
            error!(phase = %self.kind, "phase aborted");
        } else {
            info!(phase = %self.kind, "phase finished");
        }
        outcome
    }

    fn run_items(&self, reporter: &Reporter) -> PhaseOutcome {
        let plan = segments(self.items.iter().map(|i| i.parallel_group()));
        for segment in plan {
            let proceed = match segment {
                Segment::Single(idx) => run_one(&self.items[idx], reporter),
                Segment::Group { tag, members } => {
                    let group: Vec<Arc<DeployItem>> =
                        members.iter().map(|&i| Arc::clone(&self.items[i])).collect();
                    run_group(&tag, group, reporter)
                }
            };
            if !proceed {
                return PhaseOutcome {
                    aborted: true,
                    already_provisioned: None,
                };
            }
        }
        PhaseOutcome::default()
    }

    fn run_preflight(&self, reporter: &Reporter) -> PhaseOutcome {
        let mut flag = ProvisionedFlag::default();
        for item in &self.items {
            if item.parallel_group().is_some() {
                debug!(item = %item.name(), "parallel groups are not used during preflight");
            }
            let proceed = run_one(item, reporter);
            let passed = item.exit_code() == Some(0);
            flag.fold(passed);
            debug!(item = %item.name(), passed, provisioned = ?flag.get(), "preflight result");
            if !proceed {
                return PhaseOutcome {
                    aborted: true,
                    already_provisioned: flag.get(),
                };
            }
        }
        PhaseOutcome {
            aborted: false,
            already_provisioned: flag.get(),
        }
    }
}

/// Start downloads for `items` in order on one background thread.
pub fn start_downloads(items: Vec<Arc<DeployItem>>) -> JoinHandle<()> {
    thread::spawn(move || {
        for item in &items {
            item.download_if_needed();
        }
    })
}

fn run_one(item: &Arc<DeployItem>, reporter: &Reporter) -> bool {
    reporter.begin_step(&format!("Running {}", item.name()));
    let state = item.execute();
    reporter.complete_step(&format!("Finished: {}", item.name()));
    decide(item, state)
}

fn run_group(tag: &str, group: Vec<Arc<DeployItem>>, reporter: &Reporter) -> bool {
    info!(group = tag, members = group.len(), "starting parallel group");
    let mut handles = Vec::with_capacity(group.len());
    for item in group {
        let reporter = reporter.clone();
        handles.push(thread::spawn(move || run_one(&item, &reporter)));
    }
    // Barrier: every member finishes before the verdict.
    let mut proceed = true;
    for handle in handles {
        match handle.join() {
            Ok(ok) => proceed &= ok,
            Err(_) => {
                error!(group = tag, "group member panicked");
                proceed = false;
            }
        }
    }
    info!(group = tag, proceed, "parallel group drained");
    proceed
}

fn decide(item: &DeployItem, state: ItemState) -> bool {
    let proceed = should_proceed(state, item.fail_policy());
    if !proceed {
        error!(
            item = %item.name(),
            %state,
            policy = %item.fail_policy(),
            "fail policy does not tolerate this failure; aborting run"
        );
    } else if matches!(state, ItemState::FailedDownload | ItemState::Failed) {
        warn!(item = %item.name(), %state, policy = %item.fail_policy(), "failure tolerated");
    }
    proceed
}

/// Kinds a phase would drop, for plan output.
pub fn rejected_kinds(kind: PhaseKind, specs: &[ItemSpec]) -> Vec<(String, ItemKind)> {
    specs
        .iter()
        .filter(|s| !kind.accepts(s.kind))
        .map(|s| (s.name.clone(), s.kind))
        .collect()
}
