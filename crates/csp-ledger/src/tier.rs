// tier.rs — Conformance tiers.
//
// The tier decides which protections are mandatory:
//
// | Tier        | Plan/verdict binding        | Signatures | Tri-temporal |
// |-------------|-----------------------------|------------|--------------|
// | Basic       | CRITICAL actions only       | optional   | optional     |
// | Standard    | HIGH and CRITICAL actions   | optional   | optional     |
// | CourtGrade  | HIGH and CRITICAL actions   | required   | required     |

use serde::{Deserialize, Serialize};

/// Conformance tier for a gateway deployment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConformanceTier {
    Basic,
    #[default]
    Standard,
    CourtGrade,
}

impl ConformanceTier {
    /// Every receipt must be signed, and verification rejects unsigned receipts.
    pub fn requires_signatures(self) -> bool {
        self == ConformanceTier::CourtGrade
    }

    /// Every receipt must carry `valid_time` and `observed_at`.
    pub fn requires_tri_temporal(self) -> bool {
        self == ConformanceTier::CourtGrade
    }

    /// HIGH-risk actions (not only CRITICAL ones) need a bound plan or a token.
    pub fn binds_high_risk(self) -> bool {
        self >= ConformanceTier::Standard
    }
}

impl std::fmt::Display for ConformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConformanceTier::Basic => write!(f, "basic"),
            ConformanceTier::Standard => write!(f, "standard"),
            ConformanceTier::CourtGrade => write!(f, "court_grade"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_court_grade_requires_signatures_and_time() {
        assert!(!ConformanceTier::Basic.requires_signatures());
        assert!(!ConformanceTier::Standard.requires_tri_temporal());
        assert!(ConformanceTier::CourtGrade.requires_signatures());
        assert!(ConformanceTier::CourtGrade.requires_tri_temporal());
    }

    #[test]
    fn tier_serializes_as_snake_case() {
        let json = serde_json::to_string(&ConformanceTier::CourtGrade).unwrap();
        assert_eq!(json, "\"court_grade\"");
    }
}
