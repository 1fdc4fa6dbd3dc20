//! Terminal output

use colored::{ColoredString, Colorize};
use devorch_core::{
    CommandRecord, CommandStatus, LogEntry, LogLevel, PendingApproval, Service, ServiceStatus,
    StateSnapshot, Submission, SubmissionStatus,
};
use devorch_gateway::ServerFrame;
use serde_json::Value;
use std::fmt::Write;

fn command_status(status: CommandStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        CommandStatus::Completed => text.green(),
        CommandStatus::Failed | CommandStatus::Rejected => text.red(),
        CommandStatus::Queued => text.yellow(),
        CommandStatus::Running => text.cyan(),
    }
}

fn service_status(status: ServiceStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        ServiceStatus::Running => text.green(),
        ServiceStatus::Starting | ServiceStatus::Stopping => text.yellow(),
        ServiceStatus::Stopped => text.dimmed(),
        ServiceStatus::Crashed => text.red(),
    }
}

fn level(level: LogLevel) -> ColoredString {
    match level {
        LogLevel::Info => "INFO".normal(),
        LogLevel::Warn => "WARN".yellow(),
        LogLevel::Error => "ERROR".red().bold(),
    }
}

pub fn submission(submission: &Submission) -> String {
    let mut out = String::new();
    if let Some(original) = &submission.translated_from {
        let _ = writeln!(out, "{} {}", "translated:".dimmed(), original);
    }
    match submission.status {
        SubmissionStatus::Executed => {
            let what = submission
                .command
                .as_deref()
                .or(submission.tool.as_deref())
                .unwrap_or_default();
            let _ = write!(out, "{} {} {}", "▶".green(), submission.id.as_str().bold(), what);
            if let Some(result) = &submission.result {
                let _ = write!(out, "\n{}", result);
            }
        }
        SubmissionStatus::PendingApproval => {
            let _ = write!(
                out,
                "{} {} needs approval: {}",
                "⏸".yellow(),
                submission.id.as_str().bold(),
                submission.reason.as_deref().unwrap_or_default()
            );
            if let Some(approval) = &submission.approval_id {
                let _ = write!(out, "\n  devorch approve {}", approval);
            }
        }
        SubmissionStatus::Rejected => {
            let _ = write!(
                out,
                "{} {} blocked: {}",
                "✖".red(),
                submission.id.as_str().bold(),
                submission.reason.as_deref().unwrap_or_default()
            );
        }
    }
    out
}

pub fn command_record(record: &CommandRecord) -> String {
    let mut out = format!(
        "{} {} [{}]",
        record.id.as_str().bold(),
        record.text,
        command_status(record.status)
    );
    if let Some(code) = record.exit_code {
        let _ = write!(out, " exit {}", code);
    }
    if let Some(ms) = record.duration_ms() {
        let _ = write!(out, " in {}ms", ms);
    }
    if let Some(error) = record.error.as_deref().or(record.reason.as_deref()) {
        let _ = write!(out, "\n  {}", error.red());
    }
    if !record.stdout.is_empty() {
        let _ = write!(out, "\n{}", record.stdout.trim_end());
    }
    if !record.stderr.is_empty() {
        let _ = write!(out, "\n{}", record.stderr.trim_end().red());
    }
    out
}

pub fn services(services: &[Service]) -> String {
    if services.is_empty() {
        return "no services".dimmed().to_string();
    }
    let mut out = String::new();
    for service in services {
        let port = service.port.map(|p| format!(":{}", p)).unwrap_or_default();
        let pid = service.pid.map(|p| format!("pid {}", p)).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<38} {:<16} {:<9} {:<6} {:<10} {}",
            service.id.as_str(),
            service.name,
            service_status(service.status),
            port,
            pid,
            service.command
        );
    }
    out.trim_end().to_string()
}

fn approval(approval: &PendingApproval) -> String {
    format!(
        "{} {}\n    in {}\n    {}",
        approval.id.as_str().bold(),
        approval.command_text,
        approval.working_directory.display(),
        approval.reason.as_str().dimmed()
    )
}

fn log_line(entry: &LogEntry) -> String {
    format!(
        "{} {:<5} {}: {}",
        entry.timestamp.format("%H:%M:%S").to_string().as_str().dimmed(),
        level(entry.level),
        entry.source,
        entry.message
    )
}

pub fn status(snapshot: &StateSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", "state version".dimmed(), snapshot.version);
    match &snapshot.current_project {
        Some(project) => {
            let branch = project
                .git_branch
                .as_deref()
                .map(|b| format!(" ({})", b))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{} {}{} {}",
                "project".bold(),
                project.name,
                branch,
                project.path.display().to_string().as_str().dimmed()
            );
        }
        None => {
            let _ = writeln!(out, "{} none", "project".bold());
        }
    }

    let services: Vec<Service> = snapshot.services.values().cloned().collect();
    let _ = writeln!(out, "\n{}\n{}", "services".bold(), self::services(&services));

    if !snapshot.pending_approvals.is_empty() {
        let _ = writeln!(out, "\n{}", "pending approvals".yellow().bold());
        for pending in &snapshot.pending_approvals {
            let _ = writeln!(out, "  {}", approval(pending));
        }
    }

    if !snapshot.command_history.is_empty() {
        let _ = writeln!(out, "\n{}", "recent commands".bold());
        let skip = snapshot.command_history.len().saturating_sub(5);
        for record in snapshot.command_history.iter().skip(skip) {
            let _ = writeln!(
                out,
                "  {} {} [{}]",
                record.id.as_str().dimmed(),
                record.text,
                command_status(record.status)
            );
        }
    }

    if !snapshot.logs.is_empty() {
        let _ = writeln!(out, "\n{}", "logs".bold());
        let skip = snapshot.logs.len().saturating_sub(10);
        for entry in snapshot.logs.iter().skip(skip) {
            let _ = writeln!(out, "  {}", log_line(entry));
        }
    }
    out.trim_end().to_string()
}

fn field<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("?")
}

/// One line per interesting frame for `devorch tail`
pub fn frame(frame: &ServerFrame) -> Option<String> {
    let data = &frame.data;
    let line = match frame.kind.as_str() {
        "state" => {
            let snapshot: StateSnapshot = serde_json::from_value(data.clone()).ok()?;
            format!(
                "{} version {}: {} services, {} pending approvals",
                "connected".green(),
                snapshot.version,
                snapshot.services.len(),
                snapshot.pending_approvals.len()
            )
        }
        "log" => log_line(&serde_json::from_value(data.clone()).ok()?),
        "command" => {
            let record: CommandRecord = serde_json::from_value(data.clone()).ok()?;
            let exit = record
                .exit_code
                .map(|c| format!(" exit {}", c))
                .unwrap_or_default();
            format!(
                "{} {} {} [{}]{}",
                "command".cyan(),
                record.id.as_str().dimmed(),
                record.text,
                command_status(record.status),
                exit
            )
        }
        "approval_required" => format!(
            "{} {}",
            "approval required".yellow().bold(),
            approval(&serde_json::from_value(data.clone()).ok()?)
        ),
        "approval_resolved" => format!(
            "{} {} {}",
            "approval".yellow(),
            field(data, "id"),
            field(data, "resolution")
        ),
        "service_started" | "service_status" => {
            let service: Service = serde_json::from_value(data.clone()).ok()?;
            format!(
                "{} {} [{}]",
                "service".cyan(),
                service.name,
                service_status(service.status)
            )
        }
        "service_stopped" => format!(
            "{} {} [{}]{}",
            "service".cyan(),
            field(data, "name"),
            field(data, "status"),
            data.get("reason")
                .and_then(Value::as_str)
                .map(|r| format!(" {}", r))
                .unwrap_or_default()
        ),
        "project_changed" => format!("{} {}", "project".cyan(), field(data, "name")),
        "logs_cleared" => "logs cleared".dimmed().to_string(),
        "error" => format!(
            "{} {}: {}",
            "error".red(),
            field(data, "code"),
            field(data, "message")
        ),
        _ => return None,
    };
    Some(format!("{} {}", format!("#{}", frame.version).as_str().dimmed(), line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devorch_core::{ApprovalId, CommandId};
    use std::path::PathBuf;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_pending_submission_shows_approve_hint() {
        plain();
        let submission = Submission {
            status: SubmissionStatus::PendingApproval,
            id: "cmd_1".to_string(),
            approval_id: Some(ApprovalId::from("apr_1")),
            reason: Some("force push".to_string()),
            command: Some("git push --force".to_string()),
            translated_from: None,
            tool: None,
            result: None,
        };
        let text = super::submission(&submission);
        assert!(text.contains("needs approval: force push"));
        assert!(text.contains("devorch approve apr_1"));
    }

    #[test]
    fn test_status_lists_full_approval_text() {
        plain();
        let mut snapshot = StateSnapshot::default();
        snapshot.pending_approvals.push(PendingApproval {
            id: ApprovalId::from("apr_9"),
            command_id: CommandId::from("cmd_9"),
            command_text: "git reset --hard HEAD~3".to_string(),
            working_directory: PathBuf::from("/work/app"),
            reason: "history rewrite".to_string(),
            requested_at: chrono::Utc::now(),
            expires_at: None,
        });
        let text = status(&snapshot);
        assert!(text.contains("project none"));
        assert!(text.contains("no services"));
        assert!(text.contains("git reset --hard HEAD~3"));
        assert!(text.contains("/work/app"));
    }

    #[test]
    fn test_tail_frames() {
        plain();
        let log = ServerFrame {
            kind: "log".to_string(),
            data: serde_json::json!({
                "level": "ERROR",
                "message": "Service 'web' crashed",
                "source": "services",
                "timestamp": "2026-01-02T03:04:05Z",
            }),
            version: 41,
            timestamp: "2026-01-02T03:04:05Z".to_string(),
        };
        let line = frame(&log).unwrap();
        assert!(line.starts_with("#41"));
        assert!(line.contains("ERROR"));
        assert!(line.contains("crashed"));

        let ack = ServerFrame {
            kind: "ack".to_string(),
            data: serde_json::json!({}),
            version: 42,
            timestamp: "2026-01-02T03:04:05Z".to_string(),
        };
        assert!(frame(&ack).is_none());
    }
}
