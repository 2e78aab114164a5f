//! Structurally-typed operation payloads.
//!
//! Preflight, review, and heartbeat payloads are typed by their required
//! key set, with a flattened extra map for forward compatibility. A
//! required key that is absent fails deserialization; a required key that
//! is null or an empty string fails [`validate`] with `PayloadInvalid`.
//! Empty arrays are legitimate (an ambiguity register with no entries is a
//! statement, not an omission).
//!
//! [`validate`]: PreflightAssessment::validate

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GovernanceError, Result, TransitionErrorKind};
use crate::risk::RiskSeverity;

/// The executor's pre-execution assessment, stored on the runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightAssessment {
    /// Confirmation that the packet context was read and understood.
    pub context_confirmation: Value,
    /// Known ambiguities and how they will be resolved.
    pub ambiguity_register: Value,
    /// Risks flagged before execution.
    pub risk_flags: Value,
    /// The intended execution plan.
    pub execution_plan: Value,
    /// Forward-compatible extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PreflightAssessment {
    /// Validates the required keys are populated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition{PayloadInvalid}` when a required key is
    /// null or an empty string.
    pub fn validate(&self, packet_id: &str) -> Result<()> {
        require_populated(packet_id, "context_confirmation", &self.context_confirmation)?;
        require_populated(packet_id, "ambiguity_register", &self.ambiguity_register)?;
        require_populated(packet_id, "risk_flags", &self.risk_flags)?;
        require_populated(packet_id, "execution_plan", &self.execution_plan)
    }
}

/// A reviewer's assessment submitted with a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAssessment {
    /// Per-exit-criterion evaluation.
    pub exit_criteria_assessment: Value,
    /// Findings, if any.
    pub findings: Value,
    /// Risks flagged during review.
    pub risk_flags: Value,
    /// Forward-compatible extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReviewAssessment {
    /// Validates the required keys are populated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition{PayloadInvalid}` when a required key is
    /// null or an empty string.
    pub fn validate(&self, packet_id: &str) -> Result<()> {
        require_populated(
            packet_id,
            "exit_criteria_assessment",
            &self.exit_criteria_assessment,
        )?;
        require_populated(packet_id, "findings", &self.findings)?;
        require_populated(packet_id, "risk_flags", &self.risk_flags)
    }
}

/// A liveness heartbeat from the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Current working status.
    pub status: Value,
    /// Decisions taken since the last heartbeat.
    pub decisions: Value,
    /// Obstacles encountered.
    pub obstacles: Value,
    /// Estimated completion.
    pub completion_estimate: Value,
    /// Forward-compatible extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HeartbeatPayload {
    /// Validates the required keys are populated.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition{PayloadInvalid}` when a required key is
    /// null or an empty string.
    pub fn validate(&self, packet_id: &str) -> Result<()> {
        require_populated(packet_id, "status", &self.status)?;
        require_populated(packet_id, "decisions", &self.decisions)?;
        require_populated(packet_id, "obstacles", &self.obstacles)?;
        require_populated(packet_id, "completion_estimate", &self.completion_estimate)
    }
}

/// Review verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewVerdict {
    /// Exit criteria met; packet completes.
    Approve,
    /// Deficiencies found; packet returns to the executor.
    Reject,
    /// Needs supervisor attention.
    Escalate,
}

impl ReviewVerdict {
    /// Parses a verdict from operator input.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for unrecognized verdicts.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "APPROVE" => Ok(Self::Approve),
            "REJECT" => Ok(Self::Reject),
            "ESCALATE" => Ok(Self::Escalate),
            _ => Err(GovernanceError::Usage {
                message: format!("invalid review verdict: {s} (use APPROVE|REJECT|ESCALATE)"),
            }),
        }
    }

    /// The string representation of this verdict.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Escalate => "ESCALATE",
        }
    }
}

/// A residual risk declared at completion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRiskDeclaration {
    /// Risk severity.
    pub severity: RiskSeverity,
    /// What the risk is.
    pub description: String,
    /// Who owns tracking it. Defaults to the completing actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// The residual-risk acknowledgement required by every `done` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ack", content = "risks", rename_all = "snake_case")]
pub enum ResidualRiskAck {
    /// The executor asserts no residual risk remains.
    None,
    /// One or more residual risks are declared and recorded.
    Declared(Vec<ResidualRiskDeclaration>),
}

impl ResidualRiskAck {
    /// Validates the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition{InvalidResidualRisk}` when `declared`
    /// carries no entries or an entry has an empty description.
    pub fn validate(&self, packet_id: &str) -> Result<()> {
        let Self::Declared(risks) = self else {
            return Ok(());
        };
        if risks.is_empty() {
            return Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::InvalidResidualRisk,
                packet_id: packet_id.to_string(),
                message: "declared residual risk requires at least one entry".to_string(),
            });
        }
        for risk in risks {
            if risk.description.trim().is_empty() {
                return Err(GovernanceError::InvalidTransition {
                    kind: TransitionErrorKind::InvalidResidualRisk,
                    packet_id: packet_id.to_string(),
                    message: "residual risk entry has empty description".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn require_populated(packet_id: &str, key: &str, value: &Value) -> Result<()> {
    let empty = match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    };
    if empty {
        return Err(GovernanceError::InvalidTransition {
            kind: TransitionErrorKind::PayloadInvalid,
            packet_id: packet_id.to_string(),
            message: format!("required payload key is empty: {key}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn preflight() -> PreflightAssessment {
        serde_json::from_value(json!({
            "context_confirmation": {"ok": true},
            "ambiguity_register": [],
            "risk_flags": [],
            "execution_plan": {"steps": ["implement", "test"]},
        }))
        .unwrap()
    }

    #[test]
    fn test_preflight_valid_with_empty_registers() {
        assert!(preflight().validate("PKT-1").is_ok());
    }

    #[test]
    fn test_preflight_missing_key_fails_deserialization() {
        let result: std::result::Result<PreflightAssessment, _> =
            serde_json::from_value(json!({"context_confirmation": {"ok": true}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_preflight_empty_string_rejected() {
        let mut assessment = preflight();
        assessment.execution_plan = json!("");
        let result = assessment.validate("PKT-1");
        assert!(matches!(
            result,
            Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::PayloadInvalid,
                ..
            })
        ));
    }

    #[test]
    fn test_preflight_extra_keys_preserved() {
        let assessment: PreflightAssessment = serde_json::from_value(json!({
            "context_confirmation": "read",
            "ambiguity_register": [],
            "risk_flags": [],
            "execution_plan": "plan",
            "estimated_hours": 3,
        }))
        .unwrap();
        assert_eq!(assessment.extra["estimated_hours"], json!(3));
    }

    #[test]
    fn test_heartbeat_requires_all_keys_populated() {
        let hb: HeartbeatPayload = serde_json::from_value(json!({
            "status": "working",
            "decisions": [],
            "obstacles": [],
            "completion_estimate": "60%",
        }))
        .unwrap();
        assert!(hb.validate("PKT-1").is_ok());

        let mut bad = hb;
        bad.status = Value::Null;
        assert!(bad.validate("PKT-1").is_err());
    }

    #[test]
    fn test_review_verdict_parse() {
        assert_eq!(ReviewVerdict::parse("approve").unwrap(), ReviewVerdict::Approve);
        assert_eq!(ReviewVerdict::parse("REJECT").unwrap(), ReviewVerdict::Reject);
        assert_eq!(ReviewVerdict::parse("Escalate").unwrap(), ReviewVerdict::Escalate);
        assert!(ReviewVerdict::parse("maybe").is_err());
    }

    #[test]
    fn test_residual_risk_none_is_valid() {
        assert!(ResidualRiskAck::None.validate("PKT-1").is_ok());
    }

    #[test]
    fn test_residual_risk_declared_requires_entries() {
        let empty = ResidualRiskAck::Declared(Vec::new());
        assert!(matches!(
            empty.validate("PKT-1"),
            Err(GovernanceError::InvalidTransition {
                kind: TransitionErrorKind::InvalidResidualRisk,
                ..
            })
        ));

        let populated = ResidualRiskAck::Declared(vec![ResidualRiskDeclaration {
            severity: RiskSeverity::Medium,
            description: "follow-up hardening needed".to_string(),
            owner: None,
        }]);
        assert!(populated.validate("PKT-1").is_ok());
    }
}
