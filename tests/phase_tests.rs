use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ias::item::{ItemContext, ItemState};
use ias::manifest::{ItemSpec, PhaseKind};
use ias::phase::Phase;
use ias::reporter::{ReportEvent, ReportModule, Reporter};
use serde_json::json;

mod helpers;
use helpers::{context, spec, test_settings, unique_test_temp_dir, write_script};

/// A local-only root script that appends `start <name>` and `end <name>` to
/// `log` around an optional sleep, then exits with `code`.
fn logging_script(dir: &Path, log: &Path, name: &str, sleep: &str, code: i32) -> ItemSpec {
    let body = format!(
        "echo \"start {name}\" >> {log}\nsleep {sleep}\necho \"end {name}\" >> {log}\nexit {code}",
        log = log.display()
    );
    let file = write_script(dir, &format!("{name}.sh"), &body);
    spec(json!({"name": name, "file": file, "type": "rootscript"}))
}

fn with(mut item: ItemSpec, f: impl FnOnce(&mut ItemSpec)) -> ItemSpec {
    f(&mut item);
    item
}

fn run_phase(kind: PhaseKind, specs: &[ItemSpec], ctx: &ItemContext) -> (Phase, ias::phase::PhaseOutcome) {
    let phase = Phase::from_specs(kind, specs, ctx);
    let downloads = phase.download_resources();
    let outcome = phase.begin(&Reporter::disabled());
    downloads.join().unwrap();
    (phase, outcome)
}

fn log_lines(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l == needle)
        .unwrap_or_else(|| panic!("'{needle}' missing from {lines:?}"))
}

#[test]
fn items_run_in_manifest_order() {
    let dir = unique_test_temp_dir("phase-order");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        logging_script(&dir, &log, "a", "0", 0),
        logging_script(&dir, &log, "b", "0", 0),
        logging_script(&dir, &log, "c", "0", 0),
    ];

    let (_, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(!outcome.aborted);
    assert_eq!(
        log_lines(&log),
        vec!["start a", "end a", "start b", "end b", "start c", "end c"]
    );
}

#[test]
fn adjacent_group_runs_concurrently_and_drains_before_next_item() {
    let dir = unique_test_temp_dir("phase-group");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        with(logging_script(&dir, &log, "g1", "0.5", 0), |s| {
            s.parallel_group = Some("tools".to_string())
        }),
        with(logging_script(&dir, &log, "g2", "0.5", 0), |s| {
            s.parallel_group = Some("tools".to_string())
        }),
        logging_script(&dir, &log, "after", "0", 0),
    ];

    let (_, outcome) = run_phase(PhaseKind::SetupAssistant, &specs, &ctx);
    assert!(!outcome.aborted);

    let lines = log_lines(&log);
    let first_end = position(&lines, "end g1").min(position(&lines, "end g2"));
    assert!(position(&lines, "start g1") < first_end, "{lines:?}");
    assert!(position(&lines, "start g2") < first_end, "{lines:?}");
    let after = position(&lines, "start after");
    assert!(after > position(&lines, "end g1"), "{lines:?}");
    assert!(after > position(&lines, "end g2"), "{lines:?}");
}

#[test]
fn fatal_failure_stops_later_items() {
    let dir = unique_test_temp_dir("phase-fatal");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        with(logging_script(&dir, &log, "critical", "0", 1), |s| {
            s.fail_policy = ias::manifest::FailPolicy::FailureIsNotAnOption
        }),
        logging_script(&dir, &log, "later", "0", 0),
    ];

    let (phase, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(outcome.aborted);
    assert_eq!(phase.items()[0].state(), ItemState::Failed);
    assert_eq!(phase.items()[1].state(), ItemState::Downloaded);
    assert!(!log_lines(&log).contains(&"start later".to_string()));
}

#[test]
fn execution_failure_is_tolerated_by_default() {
    let dir = unique_test_temp_dir("phase-tolerated");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        logging_script(&dir, &log, "flaky", "0", 2),
        logging_script(&dir, &log, "later", "0", 0),
    ];

    let (phase, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(!outcome.aborted);
    assert_eq!(phase.items()[0].state(), ItemState::Failed);
    assert_eq!(phase.items()[1].state(), ItemState::Finished);
}

#[test]
fn download_failure_aborts_unless_failable() {
    let dir = unique_test_temp_dir("phase-download");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let missing = spec(json!({
        "name": "missing",
        "file": dir.join("missing.sh"),
        "type": "rootscript"
    }));

    let specs = vec![missing.clone(), logging_script(&dir, &log, "later", "0", 0)];
    let (_, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(outcome.aborted);
    assert!(log_lines(&log).is_empty());

    let specs = vec![
        with(missing, |s| s.fail_policy = ias::manifest::FailPolicy::Failable),
        logging_script(&dir, &log, "later", "0", 0),
    ];
    let (phase, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(!outcome.aborted);
    assert_eq!(phase.items()[0].state(), ItemState::FailedDownload);
    assert_eq!(phase.items()[1].state(), ItemState::Finished);
}

#[test]
fn fatal_group_member_lets_siblings_finish_but_stops_next_item() {
    let dir = unique_test_temp_dir("phase-group-fatal");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        with(logging_script(&dir, &log, "fast-fail", "0", 1), |s| {
            s.parallel_group = Some("g".to_string());
            s.fail_policy = ias::manifest::FailPolicy::FailureIsNotAnOption;
        }),
        with(logging_script(&dir, &log, "slow-ok", "0.5", 0), |s| {
            s.parallel_group = Some("g".to_string())
        }),
        logging_script(&dir, &log, "next", "0", 0),
    ];

    let (phase, outcome) = run_phase(PhaseKind::Userland, &specs, &ctx);
    assert!(outcome.aborted);
    assert_eq!(phase.items()[1].state(), ItemState::Finished);
    let lines = log_lines(&log);
    assert!(lines.contains(&"end slow-ok".to_string()), "{lines:?}");
    assert!(!lines.contains(&"start next".to_string()), "{lines:?}");
}

#[test]
fn preflight_passes_only_when_every_item_exits_zero() {
    let dir = unique_test_temp_dir("phase-preflight");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));

    let all_pass = vec![
        logging_script(&dir, &log, "p1", "0", 0),
        logging_script(&dir, &log, "p2", "0", 0),
    ];
    let (_, outcome) = run_phase(PhaseKind::Preflight, &all_pass, &ctx);
    assert_eq!(outcome.already_provisioned, Some(true));

    let one_fails = vec![
        logging_script(&dir, &log, "p3", "0", 1),
        logging_script(&dir, &log, "p4", "0", 0),
    ];
    let (phase, outcome) = run_phase(PhaseKind::Preflight, &one_fails, &ctx);
    assert!(!outcome.aborted);
    assert_eq!(outcome.already_provisioned, Some(false));
    // Later items still run; a pass never flips the verdict back.
    assert_eq!(phase.items()[1].state(), ItemState::Finished);

    let (_, outcome) = run_phase(PhaseKind::Preflight, &[], &ctx);
    assert_eq!(outcome.already_provisioned, None);
}

#[test]
fn phases_drop_item_types_they_do_not_run() {
    let dir = unique_test_temp_dir("phase-drop");
    let ctx = context(test_settings(&dir));
    let specs = vec![
        spec(json!({"name": "pkg", "file": "/tmp/x.pkg", "type": "package"})),
        spec(json!({"name": "user", "file": "/tmp/u.sh", "type": "userscript"})),
        spec(json!({"name": "root", "file": "/tmp/r.sh", "type": "rootscript"})),
        spec(json!({"name": "odd", "file": "/tmp/o", "type": "mobileconfig"})),
    ];

    let preflight = Phase::from_specs(PhaseKind::Preflight, &specs, &ctx);
    assert_eq!(preflight.len(), 1);
    assert_eq!(preflight.items()[0].name(), "root");

    let setup = Phase::from_specs(PhaseKind::SetupAssistant, &specs, &ctx);
    let names: Vec<&str> = setup.items().iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["pkg", "root"]);
    assert!(!setup.has_user_scripts());

    let userland = Phase::from_specs(PhaseKind::Userland, &specs, &ctx);
    assert_eq!(userland.len(), 3);
    assert!(userland.has_user_scripts());
}

struct Recorder(Arc<Mutex<Vec<ReportEvent>>>);

impl ReportModule for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn handle(&mut self, event: &ReportEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[test]
fn each_item_reports_begin_and_complete() {
    let dir = unique_test_temp_dir("phase-report");
    let log = dir.join("log");
    let ctx = context(test_settings(&dir));
    let specs = vec![logging_script(&dir, &log, "only", "0", 0)];
    let phase = Phase::from_specs(PhaseKind::Userland, &specs, &ctx);

    let events = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<Box<dyn ReportModule>> = vec![Box::new(Recorder(Arc::clone(&events)))];
    let (reporter, worker) = Reporter::spawn(modules);
    let _downloads = phase.download_resources();
    phase.begin(&reporter);
    drop(reporter);
    worker.join().unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ReportEvent::BeginStep("Running only".to_string()),
            ReportEvent::CompleteStep("Finished: only".to_string()),
        ]
    );
}
