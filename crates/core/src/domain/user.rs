use serde::{Deserialize, Serialize};

/// Buyer identity. The buyer's email address doubles as the identifier so
/// the ledger, history, and checkout all key off the same string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a reservation would push a buyer past their limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverLimitPolicy {
    /// Fail the checkout outright.
    Reject,
    /// Pause and ask the buyer to confirm before spending over the limit.
    #[default]
    Confirm,
}

impl OverLimitPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Confirm => "confirm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "confirm" => Some(Self::Confirm),
            _ => None,
        }
    }
}

/// Policy for buyers who have never had a limit set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownUserPolicy {
    /// Treat the buyer as having no cap. Matches the historical behavior
    /// where limits are opt-in.
    #[default]
    Unlimited,
    /// Refuse to reserve until a limit exists.
    Reject,
}

impl UnknownUserPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlimited => "unlimited",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unlimited" => Some(Self::Unlimited),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OverLimitPolicy, UnknownUserPolicy};

    #[test]
    fn over_limit_policy_round_trips() {
        for policy in [OverLimitPolicy::Reject, OverLimitPolicy::Confirm] {
            assert_eq!(OverLimitPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(OverLimitPolicy::parse("  Confirm "), Some(OverLimitPolicy::Confirm));
        assert_eq!(OverLimitPolicy::parse("ask"), None);
    }

    #[test]
    fn unknown_user_policy_round_trips() {
        for policy in [UnknownUserPolicy::Unlimited, UnknownUserPolicy::Reject] {
            assert_eq!(UnknownUserPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(UnknownUserPolicy::parse("deny"), None);
    }

    #[test]
    fn defaults_favor_confirmation_and_open_spending() {
        assert_eq!(OverLimitPolicy::default(), OverLimitPolicy::Confirm);
        assert_eq!(UnknownUserPolicy::default(), UnknownUserPolicy::Unlimited);
    }
}
