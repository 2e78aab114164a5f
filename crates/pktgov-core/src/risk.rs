//! Residual-risk register (`risk-register.json`).
//!
//! Risks declared at completion time (and by operators directly) land in a
//! single register document with dense `RR-%04d` ids. The register is
//! optional: a missing file reads as an empty register.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GovernanceError, Result};
use crate::payloads::ResidualRiskDeclaration;
use crate::store;
use crate::time;

/// Register schema version.
pub const RISK_REGISTER_VERSION: &str = "1.0";

/// Risk severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl RiskSeverity {
    /// Parses a severity from operator input.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for unrecognized values.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(GovernanceError::Usage {
                message: format!("invalid risk severity: {s} (use low|medium|high|critical)"),
            }),
        }
    }

    /// The string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Risk lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskStatus {
    /// The risk is live.
    Open,
    /// The risk has been addressed.
    Mitigated,
    /// The risk was explicitly accepted.
    Accepted,
}

impl RiskStatus {
    /// Parses a status from operator input.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for unrecognized values.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "mitigated" => Ok(Self::Mitigated),
            "accepted" => Ok(Self::Accepted),
            _ => Err(GovernanceError::Usage {
                message: format!("invalid risk status: {s} (use open|mitigated|accepted)"),
            }),
        }
    }

    /// The string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Mitigated => "mitigated",
            Self::Accepted => "accepted",
        }
    }
}

/// One entry in the residual-risk register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRiskEntry {
    /// Dense register id (`RR-0001`, ...).
    pub id: String,
    /// The packet the risk was declared against.
    pub packet_id: String,
    /// Severity.
    pub severity: RiskSeverity,
    /// Lifecycle status.
    pub status: RiskStatus,
    /// What the risk is.
    pub description: String,
    /// Who tracks it.
    pub owner: String,
    /// When the risk was opened (RFC 3339 UTC).
    pub opened_at: String,
    /// When the risk was resolved, if it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    /// Resolution notes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

/// The register document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRegister {
    /// Register schema version.
    pub version: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
    /// All risk entries, in declaration order.
    pub risks: Vec<ResidualRiskEntry>,
}

impl RiskRegister {
    fn new_empty() -> Self {
        let now = time::now_utc_string();
        Self {
            version: RISK_REGISTER_VERSION.to_string(),
            created_at: now.clone(),
            updated_at: now,
            risks: Vec::new(),
        }
    }

    fn next_id(&self) -> String {
        let max = self
            .risks
            .iter()
            .filter_map(|r| r.id.strip_prefix("RR-"))
            .filter_map(|tail| tail.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("RR-{:04}", max + 1)
    }

    /// Per-status entry counts.
    #[must_use]
    pub fn summary(&self) -> RiskSummary {
        let mut summary = RiskSummary {
            total: self.risks.len(),
            ..RiskSummary::default()
        };
        for risk in &self.risks {
            match risk.status {
                RiskStatus::Open => summary.open += 1,
                RiskStatus::Mitigated => summary.mitigated += 1,
                RiskStatus::Accepted => summary.accepted += 1,
            }
        }
        summary
    }
}

/// Aggregate counts over the register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSummary {
    /// Total entries.
    pub total: usize,
    /// Entries with status `open`.
    pub open: usize,
    /// Entries with status `mitigated`.
    pub mitigated: usize,
    /// Entries with status `accepted`.
    pub accepted: usize,
}

/// Filesystem-backed access to the register.
#[derive(Debug, Clone)]
pub struct RiskStore {
    path: PathBuf,
}

impl RiskStore {
    /// Creates a store for `risk-register.json` under the governance root.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("risk-register.json"),
        }
    }

    /// Loads the register, defaulting to empty when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `SchemaInvalid` on a present-but-unreadable file.
    pub fn load(&self) -> Result<RiskRegister> {
        Ok(store::read_json_opt(&self.path)?.unwrap_or_else(RiskRegister::new_empty))
    }

    fn save(&self, register: &mut RiskRegister) -> Result<()> {
        register.updated_at = time::now_utc_string();
        store::atomic_write_json(&self.path, register)
    }

    /// Appends declared risks against a packet, returning the new ids.
    ///
    /// # Errors
    ///
    /// Returns `Io` on persistence failure.
    pub fn add_declarations(
        &self,
        packet_id: &str,
        actor: &str,
        declarations: &[ResidualRiskDeclaration],
    ) -> Result<Vec<String>> {
        let mut register = self.load()?;
        let mut ids = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            let id = register.next_id();
            register.risks.push(ResidualRiskEntry {
                id: id.clone(),
                packet_id: packet_id.to_string(),
                severity: declaration.severity,
                status: RiskStatus::Open,
                description: declaration.description.clone(),
                owner: declaration.owner.clone().unwrap_or_else(|| actor.to_string()),
                opened_at: time::now_utc_string(),
                resolved_at: None,
                resolution_notes: None,
            });
            ids.push(id);
        }
        self.save(&mut register)?;
        Ok(ids)
    }

    /// Lists entries, optionally filtered by packet and status.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `SchemaInvalid` on load failure.
    pub fn list(
        &self,
        packet_id: Option<&str>,
        status: Option<RiskStatus>,
    ) -> Result<Vec<ResidualRiskEntry>> {
        let register = self.load()?;
        Ok(register
            .risks
            .into_iter()
            .filter(|r| packet_id.is_none_or(|p| r.packet_id == p))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect())
    }

    /// Fetches one entry by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub fn get(&self, risk_id: &str) -> Result<ResidualRiskEntry> {
        self.load()?
            .risks
            .into_iter()
            .find(|r| r.id == risk_id)
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "risk",
                id: risk_id.to_string(),
            })
    }

    /// Updates an entry's status, stamping `resolved_at` on mitigation or
    /// acceptance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `Io` on persistence failure.
    pub fn update_status(
        &self,
        risk_id: &str,
        status: RiskStatus,
        notes: Option<&str>,
    ) -> Result<ResidualRiskEntry> {
        let mut register = self.load()?;
        let entry = register
            .risks
            .iter_mut()
            .find(|r| r.id == risk_id)
            .ok_or_else(|| GovernanceError::NotFound {
                kind: "risk",
                id: risk_id.to_string(),
            })?;
        entry.status = status;
        entry.resolved_at = match status {
            RiskStatus::Open => None,
            RiskStatus::Mitigated | RiskStatus::Accepted => Some(time::now_utc_string()),
        };
        if let Some(notes) = notes {
            entry.resolution_notes = Some(notes.to_string());
        }
        let updated = entry.clone();
        self.save(&mut register)?;
        Ok(updated)
    }

    /// Aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `SchemaInvalid` on load failure.
    pub fn summary(&self) -> Result<RiskSummary> {
        Ok(self.load()?.summary())
    }
}
