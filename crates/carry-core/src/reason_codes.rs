//! Canonical, enumerated reason codes for ledger records.
//!
//! These codes are stable across releases and meant for downstream analytics
//! (JSON reports, dashboards). They never carry free-form text.

use risk_core::RiskReason;
use serde::{Deserialize, Serialize};

use crate::venue::RefusalReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Ingestion
    DataFault,

    // Governor
    KillSwitchLatched,
    KillSwitchReleased,
    KillSwitchCarryOnly,
    KillSwitchHaltAll,
    DirectionalNotAllowed,
    LeverageCapScaled,
    VenueCapScaled,
    VolSpikeDerisk,
    NonPositiveNav,

    // Control layer refusals / skips
    RebalanceWait,
    OracleDivergence,
    RiskVeto,
    InvalidQuote,
    BelowMinTrade,
    SlippageGuard,
    VenueRejected,
    PartialFill,

    // Post-trade enforcement
    ForcedDelever,
    ForcedFlatten,

    // Balance events
    FundingSettlement,

    // Lifecycles
    EntrySignal,
    ExitSignal,
    ExitRegime,
    ExitKillSwitch,
    ExitVolSpike,
    ExitForcedDelever,
    ExitEndOfRun,
}

impl From<RiskReason> for ReasonCode {
    fn from(r: RiskReason) -> Self {
        match r {
            RiskReason::KillSwitchLatched => ReasonCode::KillSwitchLatched,
            RiskReason::KillSwitchReleased => ReasonCode::KillSwitchReleased,
            RiskReason::KillSwitchCarryOnly => ReasonCode::KillSwitchCarryOnly,
            RiskReason::KillSwitchHaltAll => ReasonCode::KillSwitchHaltAll,
            RiskReason::DirectionalNotAllowed => ReasonCode::DirectionalNotAllowed,
            RiskReason::LeverageCapScaled => ReasonCode::LeverageCapScaled,
            RiskReason::VenueCapScaled => ReasonCode::VenueCapScaled,
            RiskReason::VolSpikeDerisk => ReasonCode::VolSpikeDerisk,
            RiskReason::NonPositiveNav => ReasonCode::NonPositiveNav,
            RiskReason::DataFault => ReasonCode::DataFault,
        }
    }
}

impl From<RefusalReason> for ReasonCode {
    fn from(r: RefusalReason) -> Self {
        match r {
            RefusalReason::RebalanceWait => ReasonCode::RebalanceWait,
            RefusalReason::OracleDivergence => ReasonCode::OracleDivergence,
            RefusalReason::RiskVeto => ReasonCode::RiskVeto,
            RefusalReason::InvalidQuote => ReasonCode::InvalidQuote,
            RefusalReason::BelowMinTrade => ReasonCode::BelowMinTrade,
            RefusalReason::SlippageGuard => ReasonCode::SlippageGuard,
            RefusalReason::VenueRejected => ReasonCode::VenueRejected,
        }
    }
}

impl ReasonCode {
    pub fn is_refusal(self) -> bool {
        matches!(
            self,
            ReasonCode::RebalanceWait
                | ReasonCode::OracleDivergence
                | ReasonCode::RiskVeto
                | ReasonCode::InvalidQuote
                | ReasonCode::BelowMinTrade
                | ReasonCode::SlippageGuard
                | ReasonCode::VenueRejected
        )
    }
}

/// Pick the lifecycle exit code that best explains why a leg went flat on a bar,
/// given every reason recorded for that bar and whether the regime left RISK_ON.
pub fn classify_exit(bar_reasons: &[ReasonCode], left_risk_on: bool) -> ReasonCode {
    let has = |code: ReasonCode| bar_reasons.contains(&code);
    if has(ReasonCode::ForcedFlatten) || has(ReasonCode::ForcedDelever) {
        return ReasonCode::ExitForcedDelever;
    }
    if has(ReasonCode::KillSwitchCarryOnly) || has(ReasonCode::KillSwitchHaltAll) {
        return ReasonCode::ExitKillSwitch;
    }
    if has(ReasonCode::VolSpikeDerisk) {
        return ReasonCode::ExitVolSpike;
    }
    if left_risk_on || has(ReasonCode::DirectionalNotAllowed) {
        return ReasonCode::ExitRegime;
    }
    ReasonCode::ExitSignal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_actions_take_priority() {
        let code = classify_exit(&[ReasonCode::VolSpikeDerisk, ReasonCode::ForcedFlatten], true);
        assert_eq!(code, ReasonCode::ExitForcedDelever);
    }

    #[test]
    fn kill_switch_beats_vol_spike() {
        let code = classify_exit(&[ReasonCode::VolSpikeDerisk, ReasonCode::KillSwitchCarryOnly], false);
        assert_eq!(code, ReasonCode::ExitKillSwitch);
    }

    #[test]
    fn plain_exit_is_signal() {
        assert_eq!(classify_exit(&[], false), ReasonCode::ExitSignal);
        assert_eq!(classify_exit(&[], true), ReasonCode::ExitRegime);
        assert_eq!(
            classify_exit(&[ReasonCode::DirectionalNotAllowed], false),
            ReasonCode::ExitRegime
        );
    }

    #[test]
    fn risk_and_refusal_reasons_map_through() {
        assert_eq!(ReasonCode::from(RiskReason::VenueCapScaled), ReasonCode::VenueCapScaled);
        assert_eq!(
            ReasonCode::from(RefusalReason::OracleDivergence),
            ReasonCode::OracleDivergence
        );
        assert!(ReasonCode::SlippageGuard.is_refusal());
        assert!(!ReasonCode::ForcedDelever.is_refusal());
    }

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ReasonCode::ExitEndOfRun).unwrap();
        assert_eq!(json, "\"exit_end_of_run\"");
    }
}
