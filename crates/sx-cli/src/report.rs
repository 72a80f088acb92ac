//! Terminal rendering of a finished run.

use std::io::{self, Write};

use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::ExecutableCommand;

use sx_agents::controller::ReplyKind;
use sx_agents::{
    CommitRecord, DebugOnce, IterationRecord, PipelineReport, Plan, RunReport, Termination,
};

/// Print `report` to stdout, coloured when stdout is a terminal.
pub fn print_report(report: &RunReport) -> io::Result<()> {
    let color = atty::is(atty::Stream::Stdout);
    let mut out = io::stdout();
    render(&mut out, report, color)
}

pub fn print_pipeline(report: &PipelineReport) -> io::Result<()> {
    let color = atty::is(atty::Stream::Stdout);
    render_pipeline(&mut io::stdout(), report, color)
}

pub fn print_plan(plan: &Plan, path: &std::path::Path) {
    println!("{}", plan.to_markdown().trim_end());
    println!("\nWrote {}", path.display());
}

pub fn print_debug_once(outcome: &DebugOnce) -> io::Result<()> {
    match outcome {
        DebugOnce::NothingToFix { tests } => {
            println!("Nothing to fix: tests {}", tests);
            Ok(())
        }
        DebugOnce::Attempted { tests, report } => {
            println!("Tests {}", tests);
            print_report(report)
        }
    }
}

pub fn print_json<T: serde::Serialize>(report: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn paint<W: Write>(out: &mut W, color: bool, fg: Color, text: &str) -> io::Result<()> {
    if color {
        out.execute(SetForegroundColor(fg))?;
        write!(out, "{}", text)?;
        out.execute(ResetColor)?;
        Ok(())
    } else {
        write!(out, "{}", text)
    }
}

fn termination_color(termination: Termination) -> Color {
    match termination {
        Termination::Converged | Termination::Answered | Termination::DryRun => Color::Green,
        Termination::Stagnated => Color::Yellow,
        Termination::Exhausted => Color::Red,
    }
}

fn termination_label(termination: Termination) -> &'static str {
    match termination {
        Termination::Converged => "converged",
        Termination::Answered => "answered",
        Termination::Stagnated => "stagnated",
        Termination::Exhausted => "iteration budget exhausted",
        Termination::DryRun => "dry run: patch applies cleanly",
    }
}

/// One line per iteration, e.g. `iter 2: applied (git apply -p1), tests passed, committed abc123`.
pub fn iteration_line(record: &IterationRecord) -> String {
    let mut parts = Vec::new();
    match &record.apply {
        Some(apply) if apply.applied && apply.check_only => match &apply.strategy {
            Some(strategy) => parts.push(format!("applies ({})", strategy)),
            None => parts.push("applies".to_string()),
        },
        Some(apply) if apply.applied => match &apply.strategy {
            Some(strategy) => parts.push(format!("applied ({})", strategy)),
            None => parts.push("applied".to_string()),
        },
        Some(_) => parts.push("patch rejected".to_string()),
        None => parts.push(reply_label(record).to_string()),
    }
    if let Some(test) = &record.test {
        parts.push(format!("tests {}", test));
    }
    match &record.commit {
        Some(CommitRecord::Committed { sha, .. }) => {
            parts.push(format!("committed {}", sha.chars().take(10).collect::<String>()))
        }
        Some(CommitRecord::NothingToCommit) => parts.push("nothing to commit".to_string()),
        Some(CommitRecord::Failed { error }) => parts.push(format!("commit failed: {}", error)),
        None => {}
    }
    if let Some(push) = &record.push {
        if push.ok {
            parts.push(format!("pushed to {}", push.remote));
        } else {
            let kind = push.failure.map(|k| k.to_string()).unwrap_or_else(|| "other".into());
            parts.push(format!("push failed ({})", kind));
        }
    }
    format!("iter {}: {}", record.iteration, parts.join(", "))
}

fn reply_label(record: &IterationRecord) -> &'static str {
    match &record.reply {
        ReplyKind::Patch => "patch",
        ReplyKind::NoOp => "no change needed",
        ReplyKind::Prose => "answer",
        ReplyKind::Unparseable { .. } => "no patch found in reply",
    }
}

fn render<W: Write>(out: &mut W, report: &RunReport, color: bool) -> io::Result<()> {
    if report.termination == Termination::Answered {
        if let Some(answer) = report.answer() {
            writeln!(out, "{}", answer.trim_end())?;
            writeln!(out)?;
        }
    }

    for record in &report.iterations {
        writeln!(out, "{}", iteration_line(record))?;
    }

    write!(out, "Result: ")?;
    paint(
        out,
        color,
        termination_color(report.termination),
        termination_label(report.termination),
    )?;
    writeln!(out)?;

    if let Some(branch) = &report.branch {
        writeln!(out, "Branch: {}", branch)?;
    }
    let commits = report.commits();
    if !commits.is_empty() {
        writeln!(out, "Commits: {}", commits.join(", "))?;
    }
    if report.push_failed() {
        paint(out, color, Color::Yellow, "Push failed; commits are local only")?;
        writeln!(out)?;
    }
    Ok(())
}

fn render_pipeline<W: Write>(out: &mut W, report: &PipelineReport, color: bool) -> io::Result<()> {
    writeln!(out, "Plan: {} ({} milestones)", report.plan.title, report.plan.milestones.len())?;
    if let Some(path) = &report.plan_path {
        writeln!(out, "Written to {}", path.display())?;
    }
    for milestone in &report.milestones {
        writeln!(out)?;
        writeln!(out, "Milestone {}: {}", milestone.index, milestone.milestone)?;
        for record in &milestone.implement.iterations {
            writeln!(out, "  {}", iteration_line(record))?;
        }
        if let Some(debug) = &milestone.debug {
            for record in &debug.iterations {
                writeln!(out, "  debug {}", iteration_line(record))?;
            }
        }
        let outcome = milestone.outcome();
        write!(out, "  Result: ")?;
        paint(
            out,
            color,
            termination_color(outcome.termination),
            termination_label(outcome.termination),
        )?;
        writeln!(out)?;
        if let Some(failure) = milestone.failure() {
            writeln!(out, "  {}", failure)?;
        }
    }

    writeln!(out)?;
    let failed = report.failed().len();
    if failed == 0 {
        paint(out, color, Color::Green, "All milestones converged")?;
    } else {
        paint(
            out,
            color,
            Color::Yellow,
            &format!("{} of {} milestones did not converge", failed, report.milestones.len()),
        )?;
    }
    writeln!(out)?;
    let commits = report.commits();
    if !commits.is_empty() {
        writeln!(out, "Commits: {}", commits.join(", "))?;
    }
    Ok(())
}
