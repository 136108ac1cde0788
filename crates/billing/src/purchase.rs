//! Purchase classification from Stripe metadata
//!
//! Checkout sessions, subscriptions and payment intents carry a loose
//! string map. It is resolved once into [`Purchase`] so handlers never
//! read raw metadata keys.

use std::collections::HashMap;

use evisit_shared::PlanType;
use uuid::Uuid;

pub const PURCHASE_TYPE_KEY: &str = "purchase_type";
pub const USER_ID_KEY: &str = "userId";
pub const PLAN_TYPE_KEY: &str = "plan_type";
pub const COINS_KEY: &str = "coins_to_add";

pub const PURCHASE_TYPE_COINS: &str = "ev_coins";
pub const PURCHASE_TYPE_SUBSCRIPTION: &str = "subscription";
pub const PURCHASE_TYPE_LICENSE: &str = "license";

/// What a payment bought
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purchase {
    /// Subscription or one-time license, optionally bundling bonus coins
    License {
        user_id: Option<Uuid>,
        plan: Option<PlanType>,
        bonus_coins: i64,
    },
    /// Coin package paid with a one-off payment
    CoinPackage { user_id: Option<Uuid>, coins: i64 },
    Unknown,
}

impl Purchase {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        let user_id = metadata
            .get(USER_ID_KEY)
            .or_else(|| metadata.get("user_id"))
            .and_then(|v| Uuid::parse_str(v.trim()).ok());
        let coins = metadata
            .get(COINS_KEY)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);

        match metadata.get(PURCHASE_TYPE_KEY).map(|s| s.as_str()) {
            Some(PURCHASE_TYPE_COINS) => Self::CoinPackage { user_id, coins },
            Some(PURCHASE_TYPE_SUBSCRIPTION) | Some(PURCHASE_TYPE_LICENSE) => Self::License {
                user_id,
                plan: metadata.get(PLAN_TYPE_KEY).and_then(|p| p.parse().ok()),
                bonus_coins: coins,
            },
            _ => Self::Unknown,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::License { user_id, .. } | Self::CoinPackage { user_id, .. } => *user_id,
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Metadata written when a checkout is started, so the webhook can
    /// resolve the purchase again.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        match self {
            Self::License {
                user_id,
                plan,
                bonus_coins,
            } => {
                metadata.insert(PURCHASE_TYPE_KEY.to_string(), PURCHASE_TYPE_SUBSCRIPTION.to_string());
                if let Some(plan) = plan {
                    metadata.insert(PLAN_TYPE_KEY.to_string(), plan.to_string());
                }
                metadata.insert(COINS_KEY.to_string(), bonus_coins.to_string());
                if let Some(user_id) = user_id {
                    metadata.insert(USER_ID_KEY.to_string(), user_id.to_string());
                }
            }
            Self::CoinPackage { user_id, coins } => {
                metadata.insert(PURCHASE_TYPE_KEY.to_string(), PURCHASE_TYPE_COINS.to_string());
                metadata.insert(COINS_KEY.to_string(), coins.to_string());
                if let Some(user_id) = user_id {
                    metadata.insert(USER_ID_KEY.to_string(), user_id.to_string());
                }
            }
            Self::Unknown => {}
        }
        metadata
    }
}
