//! Task registry: one struct per task type instead of scattered
//! name/queue/url lookup tables.

use crate::core::TaskError;
use crate::jobs::payload::{AirparkComplaint, JobEnvelope};
use crate::util::parse_flexible_date;

/// Everything the worker needs to know about one task type, resolved once
/// at job pickup.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Queue discriminator carried in `JobEnvelope::job_type`.
    pub kind: &'static str,
    pub display_name: &'static str,
    pub queue: &'static str,
    pub page_url: &'static str,
    /// Element that proves the form actually rendered.
    pub anchor_selector: &'static str,
    /// Default minimum proxy trust score; a worker-level override may
    /// replace it.
    pub min_trust_score: u8,
    /// Resources suppressed while the page loads during tear-up/tear-down,
    /// so the challenge widget does not fire before the form is ready.
    pub tearup_block_urls: &'static [&'static str],
}

const AIRPARK_TEARUP_BLOCKS: &[&str] = &[
    "*://www.google.com/recaptcha/*",
    "*://www.gstatic.com/recaptcha/*",
    "*://www.googletagmanager.com/*",
];

static DEFINITIONS: &[TaskDefinition] = &[TaskDefinition {
    kind: "KGAI",
    display_name: "Montgomery County Airpark",
    queue: "montgomery-queue",
    page_url: "https://www.montgomerycountyairpark.com/noisecomplaint",
    anchor_selector: "[id='First Name']",
    min_trust_score: 3,
    tearup_block_urls: AIRPARK_TEARUP_BLOCKS,
}];

/// Look up the definition for a task type string.
pub fn find_definition(kind: &str) -> Option<&'static TaskDefinition> {
    DEFINITIONS.iter().find(|def| def.kind == kind)
}

/// Resolve the worker's definition or fault with a type mismatch before any
/// browser interaction happens.
pub fn definition_for_job(
    worker_type: &str,
    job: &JobEnvelope,
) -> Result<&'static TaskDefinition, TaskError> {
    if job.job_type != worker_type {
        return Err(TaskError::TypeMismatch {
            expected: worker_type.to_string(),
            actual: job.job_type.clone(),
        });
    }
    find_definition(worker_type).ok_or_else(|| TaskError::TypeMismatch {
        expected: worker_type.to_string(),
        actual: job.job_type.clone(),
    })
}

// ── Form plan ────────────────────────────────────────────────────────────────

/// One field typed at human cadence.
#[derive(Debug, Clone)]
pub struct FieldEntry {
    pub selector: String,
    /// Used in log lines and fault messages ("first name", "e-mail address").
    pub description: String,
    pub value: String,
}

/// A field set directly through JS by element `name`, bypassing the
/// keyboard. Used for composite widgets that reject synthetic keystrokes.
#[derive(Debug, Clone)]
pub struct ScriptedAssignment {
    pub element_name: String,
    pub value: String,
}

/// Declarative submission plan the session controller executes.
#[derive(Debug, Clone)]
pub struct FormPlan {
    pub fields: Vec<FieldEntry>,
    pub scripted: Vec<ScriptedAssignment>,
    pub submit_selector: String,
    /// Page-source signature meaning the site rejected the submission.
    pub rejection_signature: String,
}

fn field(selector: &str, description: &str, value: &str) -> FieldEntry {
    FieldEntry {
        selector: selector.to_string(),
        description: description.to_string(),
        value: value.to_string(),
    }
}

/// Normalize an operator-typed date to the form's display format, falling
/// back to the raw text when the input is ambiguous.
fn display_date(raw: &str) -> String {
    parse_flexible_date(raw)
        .map(|date| date.format("%m/%d/%Y").to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn hidden_date(raw: &str) -> String {
    parse_flexible_date(raw)
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Build the submission plan for the airpark complaint form. The session
/// UID is appended to the description so a submission can be traced back to
/// its job from the site side.
pub fn airpark_form_plan(complaint: &AirparkComplaint, session_uid: &str) -> FormPlan {
    let start = format!("{} {}", display_date(&complaint.start_date), complaint.start_time);
    let end = format!("{} {}", display_date(&complaint.end_date), complaint.end_time);
    let hidden_start = format!("{} {}", hidden_date(&complaint.start_date), complaint.start_time);
    let hidden_end = format!("{} {}", hidden_date(&complaint.end_date), complaint.end_time);

    FormPlan {
        fields: vec![
            field("[id='First Name']", "first name", &complaint.first_name),
            field("[id='Last Name']", "last name", &complaint.last_name),
            field("#email", "e-mail address", &complaint.email),
            field("[id='Phone Number']", "phone number", &complaint.phone),
            field(
                "[id='Street Address Cross Streets']",
                "street address",
                &complaint.street,
            ),
            field("#City", "city address", &complaint.city),
            field("#State", "state address", &complaint.state),
            field("#ZIP", "ZIP address", &complaint.zip),
            field(
                "[id='Aircraft Type']",
                "aircraft type",
                &complaint.aircraft_type,
            ),
            field(
                "[id='Description Question']",
                "description/question",
                &format!("{} ({session_uid})", complaint.description),
            ),
            field(
                "[id='Response requested']",
                "response request",
                &complaint.response_requested,
            ),
        ],
        scripted: vec![
            ScriptedAssignment {
                element_name: "form[Approximate Start Date Time]".to_string(),
                value: start,
            },
            ScriptedAssignment {
                element_name: "hidden[3_Approximate Start Date Time]".to_string(),
                value: hidden_start,
            },
            ScriptedAssignment {
                element_name: "form[Approximate End Date Time]".to_string(),
                value: end,
            },
            ScriptedAssignment {
                element_name: "hidden[3_Approximate End Date Time]".to_string(),
                value: hidden_end,
            },
        ],
        submit_selector: "#Send".to_string(),
        rejection_signature: "Please complete all required fields!".to_string(),
    }
}
