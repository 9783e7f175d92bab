use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::ipc::{AgentConnector, DaemonServer, CHECK_IN_WAKE_INTERVAL, LIVENESS_POLL_INTERVAL};
use crate::item::{DeployItem, ItemContext, ItemState};
use crate::limiter::ConcurrencyLimiter;
use crate::manifest::{Manifest, PhaseKind};
use crate::phase::{self, Phase};
use crate::reporter::{DepNotify, LogModule, ReportModule, Reporter};
use crate::settings::Settings;
use crate::signing;

const FALLBACK_MANIFEST_NAME: &str = "bootstrap.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    AlreadyProvisioned,
    Aborted(PhaseKind),
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed | Self::AlreadyProvisioned => 0,
            Self::Aborted(_) => 1,
        }
    }
}

/// Refuse to run without root unless this is a dry run.
pub fn ensure_privileges(settings: &Settings) -> Result<()> {
    if settings.dry_run {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(anyhow!(
            "iasd must run as root (effective uid {euid}); use --dry-run to test"
        ));
    }
    Ok(())
}

/// One full deployment run. `Err` means a fatal precondition failed; phase
/// aborts are reported through [`RunOutcome::Aborted`].
pub fn run(settings: Settings) -> Result<RunOutcome> {
    settings.validate()?;
    let settings = Arc::new(settings);
    info!("starting deployment: {}", settings.summary());

    prepare_directories(&settings)?;
    let limiter = ConcurrencyLimiter::new(
        settings.min_download_concurrency,
        settings.max_download_concurrency,
    )?;
    let agent = Arc::new(AgentConnector::from_settings(&settings)?);
    let server = DaemonServer::bind(&settings.daemon_endpoint, Arc::clone(&agent))
        .context("failed to open the agent check-in endpoint")?
        .spawn();
    let (reporter, reporter_thread) = Reporter::spawn(report_modules(&settings));
    let ctx = ItemContext::new(Arc::clone(&settings), limiter, Arc::clone(&agent))?;

    let result = deploy(&settings, &ctx, &reporter);
    match &result {
        Ok(outcome) => info!(?outcome, "deployment run ended"),
        Err(err) => reporter.report(&format!("Deployment failed: {err}")),
    }

    if settings.unload_agent_on_exit && agent.session().is_some() {
        if let Err(err) = agent.bootout_agent() {
            warn!("failed to unload agent: {err:#}");
        }
    }
    server.shutdown();
    drop(reporter);
    if reporter_thread.join().is_err() {
        warn!("reporter thread panicked");
    }
    result
}

fn deploy(settings: &Settings, ctx: &ItemContext, reporter: &Reporter) -> Result<RunOutcome> {
    let manifest = fetch_manifest(settings, ctx)?;

    let preflight = Phase::from_specs(
        PhaseKind::Preflight,
        manifest.items(PhaseKind::Preflight),
        ctx,
    );
    let setup = Phase::from_specs(
        PhaseKind::SetupAssistant,
        manifest.items(PhaseKind::SetupAssistant),
        ctx,
    );
    let userland = Phase::from_specs(
        PhaseKind::Userland,
        manifest.items(PhaseKind::Userland),
        ctx,
    );

    ctx.limiter.reset();
    if !preflight.is_empty() {
        let _downloads = preflight.download_resources();
        let outcome = preflight.begin(reporter);
        if outcome.aborted {
            reporter.report("Preflight failed");
            return Ok(RunOutcome::Aborted(PhaseKind::Preflight));
        }
        if outcome.already_provisioned == Some(true) {
            info!("preflight passed; machine is already provisioned");
            reporter.report("Already provisioned");
            return Ok(RunOutcome::AlreadyProvisioned);
        }
    }

    ctx.limiter.reset();
    let mut pending: Vec<Arc<DeployItem>> = setup.items().to_vec();
    pending.extend(userland.items().iter().cloned());
    let _downloads = phase::start_downloads(pending);
    reporter.set_step_count(setup.len() + userland.len());

    if setup.begin(reporter).aborted {
        reporter.report("Setup Assistant phase failed");
        return Ok(RunOutcome::Aborted(PhaseKind::SetupAssistant));
    }

    if userland.has_user_scripts() {
        if settings.dry_run {
            info!("dry run: not waiting for the agent");
        } else {
            reporter.report("Waiting for user session");
            ctx.agent
                .wait_for_agent(
                    settings.wait_for_agent_timeout,
                    CHECK_IN_WAKE_INTERVAL,
                    LIVENESS_POLL_INTERVAL,
                )
                .context("agent is not available")?;
        }
    }

    if userland.begin(reporter).aborted {
        reporter.report("Userland phase failed");
        return Ok(RunOutcome::Aborted(PhaseKind::Userland));
    }
    reporter.reset_step();
    reporter.report("Deployment complete");
    Ok(RunOutcome::Completed)
}

fn fetch_manifest(settings: &Settings, ctx: &ItemContext) -> Result<Manifest> {
    let url = settings
        .manifest_url
        .as_deref()
        .ok_or_else(|| anyhow!("JSONURL is required"))?;
    let file = settings.install_path.join(manifest_file_name(url));
    if !settings.skip_json_validation && file.exists() {
        fs::remove_file(&file)
            .with_context(|| format!("failed to remove stale manifest '{}'", file.display()))?;
    }

    let item = DeployItem::control_manifest(url, file.clone(), ctx);
    item.download_if_needed();
    if item.execute() != ItemState::Finished {
        return Err(anyhow!("control manifest could not be fetched from {url}"));
    }

    let raw = fs::read(&file)
        .with_context(|| format!("failed to read manifest '{}'", file.display()))?;
    if let Some(key) = settings.manifest_public_key.as_deref() {
        signing::verify_manifest_bytes(&raw, key).context("control manifest signature rejected")?;
        info!("control manifest signature verified");
    }
    Manifest::from_slice(&raw)
}

/// Local file name of the control manifest: the last path segment of its URL.
pub fn manifest_file_name(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_MANIFEST_NAME.to_string())
}

fn prepare_directories(settings: &Settings) -> Result<()> {
    for dir in [settings.install_path.clone(), settings.userscripts_path()] {
        create_dir(&dir)?;
    }
    Ok(())
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create '{}'", dir.display()))?;
    fs::set_permissions(dir, Permissions::from_mode(0o755))
        .with_context(|| format!("failed to set permissions on '{}'", dir.display()))
}

fn report_modules(settings: &Settings) -> Vec<Box<dyn ReportModule>> {
    let mut modules: Vec<Box<dyn ReportModule>> = vec![Box::new(LogModule)];
    if settings.depnotify.enabled {
        match DepNotify::new(&settings.depnotify) {
            Ok(module) => modules.push(Box::new(module)),
            Err(err) => warn!("DEPNotify reporting disabled: {err:#}"),
        }
    }
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_file_name_uses_last_url_segment() {
        assert_eq!(
            manifest_file_name("https://h.example/deploy/bootstrap-v2.json"),
            "bootstrap-v2.json"
        );
        assert_eq!(manifest_file_name("https://h.example/"), "bootstrap.json");
        assert_eq!(manifest_file_name("not a url"), "bootstrap.json");
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::AlreadyProvisioned.exit_code(), 0);
        assert_eq!(RunOutcome::Aborted(PhaseKind::Userland).exit_code(), 1);
    }

    #[test]
    fn dry_run_skips_privilege_check() {
        let settings = Settings {
            dry_run: true,
            ..Settings::default()
        };
        ensure_privileges(&settings).expect("dry run is always allowed");
    }
}
