//! Defence policy engine.
//!
//! The sensor boundary emits [`BehaviourSignal`]s; this engine decides
//! what response, if any, the agent is allowed to take. Decisions are a
//! pure function of the signal, the loaded [`DefencePolicy`], and the
//! rolling action window — the engine holds no other state across
//! signals, so two signals never need ordering between them.
//!
//! Every decision is recorded: [`DefenceModule::apply`] returns a
//! [`DefenceEvidence`] that callers seal and uplink through the evidence
//! broker. Policy downgrades are decisions, not errors — they never
//! raise.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Categories of behaviour the sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviourSignalType {
    /// Suspicious process activity.
    Process,
    /// Suspicious memory manipulation.
    Memory,
    /// Suspicious file activity.
    File,
    /// Privilege escalation indicators.
    Privilege,
}

/// Response actions the control plane can request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Record only; take no action.
    #[default]
    ObserveOnly,
    /// Terminate the offending process.
    KillProcess,
    /// Quarantine the offending file.
    QuarantineFile,
    /// Block network activity for the offending process.
    BlockNetwork,
    /// Prevent future execution of the offending file.
    PreventExecution,
}

impl ResponseAction {
    /// Whether this action needs a process identifier to act on.
    #[must_use]
    pub const fn requires_process_id(self) -> bool {
        matches!(self, Self::KillProcess | Self::BlockNetwork)
    }

    /// Whether this action needs a file path to act on.
    #[must_use]
    pub const fn requires_file_path(self) -> bool {
        matches!(self, Self::QuarantineFile | Self::PreventExecution)
    }
}

/// Policy mode: observe everything, or actually enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// All proposed actions are downgraded to observe-only.
    Observe,
    /// Permitted actions are performed.
    Enforce,
}

/// One behaviour finding from the sensor boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviourSignal {
    /// Signal category.
    pub signal_type: BehaviourSignalType,
    /// Behaviour signature name.
    pub name: String,
    /// Detection rule that fired; empty means unenforceable.
    #[serde(default)]
    pub rule_id: String,
    /// Offending process, when known.
    #[serde(default)]
    pub process_id: String,
    /// Offending file, when known.
    #[serde(default)]
    pub file_path: String,
    /// Offending command line, when captured.
    #[serde(default)]
    pub command_line: String,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f64,
    /// Observation time, ISO-8601 UTC; empty means "now".
    #[serde(default)]
    pub observed_at: String,
    /// Whether the rule defines a response at all.
    #[serde(default)]
    pub response_defined: bool,
    /// The response the rule asks for.
    #[serde(default)]
    pub requested_response: ResponseAction,
}

/// The engine's verdict on one signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenceFinding {
    /// Derived detection identifier.
    pub detection_id: String,
    /// Rule that fired.
    pub rule_id: String,
    /// Behaviour signature name.
    pub behaviour_signature: String,
    /// Confidence copied from the signal.
    pub confidence: f64,
    /// Process scope, when present.
    pub process_id: String,
    /// File scope, when present.
    pub file_path: String,
    /// Decision time.
    pub timestamp: String,
    /// The action this engine proposes.
    pub proposed_response: ResponseAction,
    /// Why the proposal is what it is.
    pub decision_reason: String,
}

/// Evidence record of an applied (or downgraded) response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenceEvidence {
    /// The finding this evidence belongs to.
    pub finding_id: String,
    /// The policy in force.
    pub policy_id: String,
    /// The action actually taken.
    pub action: ResponseAction,
    /// Whether policy allow-bits permitted the action.
    pub permitted_by_policy: bool,
    /// Final decision reason.
    pub decision_reason: String,
    /// Pre-action state capture, provided by the executor.
    pub before_state: String,
    /// Post-action state capture, provided by the executor.
    pub after_state: String,
    /// Evidence time.
    pub timestamp: String,
}

/// Response policy, loaded at startup and replaced only on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefencePolicy {
    /// Policy identifier for evidence records.
    pub policy_id: String,
    /// Observe or enforce.
    pub mode: PolicyMode,
    /// Findings below this confidence are observe-only.
    pub min_confidence: f64,
    /// Maximum non-observe actions per rolling window.
    pub max_actions_per_window: u32,
    /// Rolling window length in seconds.
    pub action_window_seconds: u64,
    /// Allow-bit for [`ResponseAction::KillProcess`].
    pub allow_kill_process: bool,
    /// Allow-bit for [`ResponseAction::QuarantineFile`].
    pub allow_quarantine_file: bool,
    /// Allow-bit for [`ResponseAction::BlockNetwork`].
    pub allow_block_network: bool,
    /// Allow-bit for [`ResponseAction::PreventExecution`].
    pub allow_prevent_execution: bool,
}

impl Default for DefencePolicy {
    fn default() -> Self {
        Self {
            policy_id: "default-policy".to_string(),
            mode: PolicyMode::Observe,
            min_confidence: 0.7,
            max_actions_per_window: 5,
            action_window_seconds: 300,
            allow_kill_process: false,
            allow_quarantine_file: false,
            allow_block_network: false,
            allow_prevent_execution: false,
        }
    }
}

impl DefencePolicy {
    /// Load the policy from `AGENT_DEFENCE_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the policy from an explicit lookup (injected for tests).
    #[must_use]
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_bool = |key: &str, fallback: bool| {
            env(key).map_or(fallback, |value| match value.as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => fallback,
            })
        };

        Self {
            policy_id: env("AGENT_DEFENCE_POLICY_ID").unwrap_or(defaults.policy_id),
            mode: match env("AGENT_DEFENCE_MODE").as_deref() {
                Some("enforce") => PolicyMode::Enforce,
                _ => PolicyMode::Observe,
            },
            min_confidence: env("AGENT_DEFENCE_MIN_CONFIDENCE")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.min_confidence),
            max_actions_per_window: env("AGENT_DEFENCE_MAX_ACTIONS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.max_actions_per_window),
            action_window_seconds: env("AGENT_DEFENCE_ACTION_WINDOW")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.action_window_seconds),
            allow_kill_process: parse_bool("AGENT_DEFENCE_ALLOW_KILL", false),
            allow_quarantine_file: parse_bool("AGENT_DEFENCE_ALLOW_QUARANTINE", false),
            allow_block_network: parse_bool("AGENT_DEFENCE_ALLOW_BLOCK", false),
            allow_prevent_execution: parse_bool("AGENT_DEFENCE_ALLOW_PREVENT", false),
        }
    }

    /// Whether the allow-bits permit an action. Observe-only is always
    /// permitted; everything else additionally requires enforce mode.
    #[must_use]
    pub const fn permits(&self, action: ResponseAction) -> bool {
        match action {
            ResponseAction::ObserveOnly => true,
            ResponseAction::KillProcess => {
                matches!(self.mode, PolicyMode::Enforce) && self.allow_kill_process
            },
            ResponseAction::QuarantineFile => {
                matches!(self.mode, PolicyMode::Enforce) && self.allow_quarantine_file
            },
            ResponseAction::BlockNetwork => {
                matches!(self.mode, PolicyMode::Enforce) && self.allow_block_network
            },
            ResponseAction::PreventExecution => {
                matches!(self.mode, PolicyMode::Enforce) && self.allow_prevent_execution
            },
        }
    }
}

/// Rolling window of action timestamps, trimmed on every use.
#[derive(Debug)]
struct ActionWindow {
    timestamps: VecDeque<Instant>,
    window: Duration,
}

impl ActionWindow {
    fn new(window: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            window,
        }
    }

    fn trim(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(front) = self.timestamps.front() {
            if *front >= cutoff {
                break;
            }
            self.timestamps.pop_front();
        }
    }

    fn count(&mut self, now: Instant) -> usize {
        self.trim(now);
        self.timestamps.len()
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.trim(now);
    }
}

/// The defence engine. Exclusively owns its action window; callers
/// serialise access (one engine per process).
#[derive(Debug)]
pub struct DefenceModule {
    policy: DefencePolicy,
    window: ActionWindow,
}

impl DefenceModule {
    /// Create an engine for a policy.
    #[must_use]
    pub fn new(policy: DefencePolicy) -> Self {
        let window = ActionWindow::new(Duration::from_secs(policy.action_window_seconds));
        Self { policy, window }
    }

    /// The policy in force.
    #[must_use]
    pub const fn policy(&self) -> &DefencePolicy {
        &self.policy
    }

    /// Replace the policy (reload). The action window restarts.
    pub fn set_policy(&mut self, policy: DefencePolicy) {
        self.window = ActionWindow::new(Duration::from_secs(policy.action_window_seconds));
        self.policy = policy;
    }

    /// One-line policy summary for status reporting.
    #[must_use]
    pub fn status_summary(&self) -> String {
        format!(
            "policy {} mode={} min_confidence={}",
            self.policy.policy_id,
            match self.policy.mode {
                PolicyMode::Enforce => "enforce",
                PolicyMode::Observe => "observe",
            },
            self.policy.min_confidence
        )
    }

    /// Evaluate a signal against the policy.
    ///
    /// The rules run top to bottom; the first that fires downgrades the
    /// proposal to observe-only with its reason. Otherwise the requested
    /// response stands with reason `action permitted`.
    pub fn evaluate(&mut self, signal: &BehaviourSignal) -> DefenceFinding {
        let mut finding = DefenceFinding {
            detection_id: format!("DEF-{}", signal.name),
            rule_id: signal.rule_id.clone(),
            behaviour_signature: signal.name.clone(),
            confidence: signal.confidence,
            process_id: signal.process_id.clone(),
            file_path: signal.file_path.clone(),
            timestamp: if signal.observed_at.is_empty() {
                now_iso8601()
            } else {
                signal.observed_at.clone()
            },
            proposed_response: ResponseAction::ObserveOnly,
            decision_reason: String::new(),
        };

        let requested = signal.requested_response;
        let downgrade_reason = if signal.rule_id.is_empty() {
            Some("missing rule identifier")
        } else if !signal.response_defined {
            Some("response undefined")
        } else if signal.confidence < self.policy.min_confidence {
            Some("confidence below threshold")
        } else if requested.requires_process_id() && signal.process_id.is_empty() {
            Some("missing process identifier")
        } else if requested.requires_file_path() && signal.file_path.is_empty() {
            Some("missing file path")
        } else if matches!(self.policy.mode, PolicyMode::Observe) {
            Some("policy observe-only")
        } else if self.is_rate_limited() {
            Some("rate limited")
        } else {
            None
        };

        match downgrade_reason {
            Some(reason) => {
                finding.proposed_response = ResponseAction::ObserveOnly;
                finding.decision_reason = reason.to_string();
            },
            None => {
                finding.proposed_response = requested;
                finding.decision_reason = "action permitted".to_string();
            },
        }

        debug!(
            detection_id = %finding.detection_id,
            response = ?finding.proposed_response,
            reason = %finding.decision_reason,
            "signal evaluated"
        );
        finding
    }

    /// Apply a finding under the allow-bits and record the action in the
    /// rate window. Returns the decision evidence; `before_state` /
    /// `after_state` are filled in by the executor afterwards.
    pub fn apply(&mut self, finding: &DefenceFinding) -> DefenceEvidence {
        let permitted = self.policy.permits(finding.proposed_response);
        let mut evidence = DefenceEvidence {
            finding_id: finding.detection_id.clone(),
            policy_id: self.policy.policy_id.clone(),
            action: finding.proposed_response,
            permitted_by_policy: permitted,
            decision_reason: finding.decision_reason.clone(),
            before_state: String::new(),
            after_state: String::new(),
            timestamp: now_iso8601(),
        };

        if evidence.action != ResponseAction::ObserveOnly && permitted {
            self.window.record(Instant::now());
        }

        if !permitted {
            evidence.action = ResponseAction::ObserveOnly;
            evidence.decision_reason = "action blocked by policy".to_string();
        }

        evidence
    }

    fn is_rate_limited(&mut self) -> bool {
        if self.policy.max_actions_per_window == 0 || self.policy.action_window_seconds == 0 {
            return false;
        }
        self.window.count(Instant::now()) >= self.policy.max_actions_per_window as usize
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
