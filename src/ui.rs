//! Terminal output: a progress bar fed by collection events and colored
//! summaries for reports, status and session listings.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{CollectionEvent, CollectionReport, StatusReport};
use crate::rate_limit::Health;
use crate::recovery::{RecoveryReport, RecoveryState};
use crate::session::{SessionStatus, SessionSummary};

/// Progress bar for one run, advanced by [`CollectionEvent`]s.
pub struct RunProgress {
    pb: ProgressBar,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start(units: u64) -> Self {
        let pb = ProgressBar::new(units);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style.progress_chars("=> "));
        pb.enable_steady_tick(std::time::Duration::from_millis(120));

        Self {
            pb,
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn handle(&self, event: &CollectionEvent) {
        match event {
            CollectionEvent::UnitStarted { unit_id, .. } => self.pb.set_message(unit_id.clone()),
            CollectionEvent::UnitCompleted { .. } => self.pb.inc(1),
            CollectionEvent::UnitFailed { unit_id, error } => {
                self.pb.inc(1);
                self.pb
                    .println(format!("  {} {unit_id}: {error}", self.red.apply_to("✗")));
            }
            CollectionEvent::UnitRequeued { unit_id, reason } => {
                self.pb
                    .println(format!("  {} {unit_id} re-queued ({reason})", self.yellow.apply_to("↻")));
            }
            CollectionEvent::HealthChanged(t) => {
                let (style, marker) = health_marker(t.from, t.to);
                self.pb.println(format!(
                    "  {} {} {} → {}",
                    style.apply_to(marker),
                    t.source,
                    t.from,
                    t.to
                ));
            }
            CollectionEvent::RecoveryValidated {
                report,
                recommendations,
            } => self.pb.suspend(|| print_recovery(report, recommendations)),
            CollectionEvent::Checkpointed { .. } => {}
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Red ▼ when a source gets worse, green ▲ when it recovers.
fn health_marker(from: Health, to: Health) -> (Style, &'static str) {
    if to > from {
        (Style::new().red().bold(), "▼")
    } else {
        (Style::new().green(), "▲")
    }
}

fn health_style(health: Health) -> Style {
    match health {
        Health::Healthy => Style::new().green(),
        Health::Degraded => Style::new().yellow(),
        Health::Critical => Style::new().red(),
        Health::Offline => Style::new().red().bold(),
    }
}

fn status_style(status: SessionStatus) -> Style {
    match status {
        SessionStatus::Completed => Style::new().green().bold(),
        SessionStatus::Active => Style::new().cyan(),
        SessionStatus::Paused => Style::new().yellow(),
        SessionStatus::Interrupted => Style::new().red(),
    }
}

pub fn print_report(report: &CollectionReport) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    println!();
    println!(
        "Session {} {}",
        report.session_id,
        status_style(report.status).apply_to(report.status)
    );
    println!(
        "  {} {} completed this run ({} of {} total)",
        green.apply_to("✓"),
        report.completed_this_run,
        report.counts.completed,
        report.counts.total
    );
    if report.failed_this_run > 0 || !report.failed_units.is_empty() {
        println!(
            "  {} {} failed this run ({} failed overall)",
            red.apply_to("✗"),
            report.failed_this_run,
            report.failed_units.len()
        );
        for unit in &report.failed_units {
            println!(
                "      {} ({}): {}",
                unit.id,
                unit.partition,
                unit.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if report.requeued > 0 {
        println!("  ↻ {} re-queued", report.requeued);
    }
    if !report.degraded_sources.is_empty() {
        println!(
            "  {} degraded sources: {}",
            Style::new().yellow().apply_to("!"),
            report.degraded_sources.join(", ")
        );
    }
    println!(
        "  corpus: {} records, run {}",
        report.corpus_records, report.degradation
    );
    if let Some(recovery) = &report.recovery {
        println!(
            "  resumed as {} ({:.1}% data loss, integrity {:.2})",
            recovery.state, recovery.data_loss_percentage, recovery.integrity_score
        );
    }
}

pub fn print_recovery(report: &RecoveryReport, recommendations: &[String]) {
    let style = match report.state {
        RecoveryState::Resumable => Style::new().green().bold(),
        RecoveryState::PartiallyResumable => Style::new().yellow().bold(),
        RecoveryState::Unrecoverable => Style::new().red().bold(),
    };
    println!("{}", style.apply_to("─── Recovery ───"));
    println!("  state:      {}", style.apply_to(report.state));
    println!(
        "  units:      {} completed / {} total, {} in doubt",
        report.completed_units,
        report.total_units,
        report.in_doubt_units.len()
    );
    println!("  data loss:  {:.1}%", report.data_loss_percentage);
    println!(
        "  integrity:  {:.2} ({} of {} records)",
        report.integrity_score, report.actual_records, report.expected_records
    );
    if let Some(gap) = &report.gap {
        println!(
            "  gap:        discarded {:?}, {} unit(s) reprocessed ({})",
            gap.discarded,
            gap.reprocessed_units.len(),
            gap.reason
        );
    }
    for line in recommendations {
        println!("  → {line}");
    }
}

pub fn print_status(status: &StatusReport) {
    println!(
        "Session {} {}",
        status.session_id,
        status_style(status.status).apply_to(status.status)
    );
    let c = &status.counts;
    println!(
        "  pending {}  in progress {}  completed {}  failed {}  (total {})",
        c.pending, c.in_progress, c.completed, c.failed, c.total
    );
    if let Some(checkpoint) = &status.last_checkpoint {
        println!("  last checkpoint: {checkpoint}");
    }
    if !status.degraded_sources.is_empty() {
        println!("  degraded last run: {}", status.degraded_sources.join(", "));
    }
    for (source, health) in &status.health {
        println!("  {source:<16} {}", health_style(*health).apply_to(health));
    }
}

pub fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }
    for s in sessions {
        println!(
            "{}  {:<11}  {}/{} completed, {} failed  updated {}",
            s.session_id,
            status_style(s.status).apply_to(s.status),
            s.counts.completed,
            s.counts.total,
            s.counts.failed,
            s.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}
