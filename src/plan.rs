use std::fmt::Write;

use crate::manifest::{ItemSpec, Manifest, PhaseKind};
use crate::phase::{self, Segment};

/// Human-readable phase plan of a manifest: what runs, in which order, which
/// items run together, and which are dropped.
pub fn render_plan(manifest: &Manifest) -> String {
    let mut out = String::new();
    for kind in PhaseKind::ALL {
        let specs = manifest.items(kind);
        let accepted: Vec<&ItemSpec> = specs.iter().filter(|s| kind.accepts(s.kind)).collect();
        let _ = writeln!(out, "Phase: {kind}");
        let _ = writeln!(out, "Items: {}", accepted.len());

        let plan = phase::segments(accepted.iter().map(|s| s.group()));
        for (step, segment) in plan.into_iter().enumerate() {
            match segment {
                Segment::Single(idx) => {
                    let _ = writeln!(out, "  {step}. {}", format_item(accepted[idx]));
                }
                Segment::Group { tag, members } => {
                    let _ = writeln!(out, "  {step}. parallel group '{tag}':");
                    for idx in members {
                        let _ = writeln!(out, "       - {}", format_item(accepted[idx]));
                    }
                }
            }
        }
        for (name, item_kind) in phase::rejected_kinds(kind, specs) {
            let _ = writeln!(out, "  dropped: {name} (type {item_kind} not allowed in {kind})");
        }
    }
    out
}

fn format_item(spec: &ItemSpec) -> String {
    let mut line = format!(
        "{} [{}] fail_policy={}",
        spec.name, spec.kind, spec.fail_policy
    );
    if spec.url.is_none() {
        line.push_str(" local-only");
    }
    if spec.donotwait {
        line.push_str(" donotwait");
    }
    if spec.pkg_required {
        line.push_str(" pkg_required");
    }
    line
}
