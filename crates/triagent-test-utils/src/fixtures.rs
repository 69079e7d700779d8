use chrono::{TimeZone, Utc};

use triagent_core::config::OrchestratorConfig;
use triagent_core::types::{AgentOutput, AgentType, Attachment, Email, TriageHint};

/// An email with a fixed arrival time so graphs built from it are comparable.
pub fn email(id: &str, subject: &str, has_attachments: bool) -> Email {
    let attachments = if has_attachments {
        vec![Attachment {
            filename: "document.pdf".into(),
            content_type: "application/pdf".into(),
            size: 48_213,
        }]
    } else {
        vec![]
    };
    Email {
        id: id.to_string(),
        subject: subject.to_string(),
        sender: "vendor@example.com".into(),
        body: "Please see the details below.".into(),
        has_attachments,
        attachments,
        arrival_time: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
    }
}

/// Scenario 1: no attachments, neutral subject.
pub fn shift_question() -> Email {
    email("msg-shift", "Shift question", false)
}

/// Scenario 2: PDF attachment, invoice subject.
pub fn invoice_email() -> Email {
    email("msg-invoice", "Invoice #123 due", true)
}

pub fn hint(requires_vision: bool) -> TriageHint {
    TriageHint {
        requires_vision,
        category: None,
    }
}

/// A recommendation value as the context stage emits it.
pub fn recommendation(action_type: &str, confidence: f64, risk_level: &str) -> serde_json::Value {
    serde_json::json!({
        "type": action_type,
        "payload": {"title": format!("{} from email", action_type)},
        "confidence": confidence,
        "risk_level": risk_level,
    })
}

/// A context output carrying the given recommendations.
pub fn context_output(recommendations: Vec<serde_json::Value>, confidence: f64) -> AgentOutput {
    let findings = serde_json::json!({
        "synthesis": "Vendor requests payment confirmation.",
        "recommendations": recommendations,
    });
    AgentOutput::new(
        AgentType::Context,
        findings.as_object().cloned().unwrap_or_default(),
        confidence,
        "scripted-context",
    )
}

/// Config with short timeouts and near-zero backoff for fast tests.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.orchestrator.sla_secs = 10;
    config.orchestrator.cpu_workers = 4;
    config.orchestrator.gpu_workers = 1;
    for agent_type in AgentType::ALL {
        let policy = config.agents.policy_mut(agent_type);
        policy.timeout_ms = 200;
        policy.backoff_ms = 1;
    }
    config
}
