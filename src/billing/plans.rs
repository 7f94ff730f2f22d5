use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::models::PlanType;

/// key: billing-features -> meterable capabilities
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    ChatMessages,
    PropertyReports,
    WebSearches,
    WeatherLookups,
    DocumentCreation,
    SmsMessages,
    VoiceCalls,
    EmailMessages,
}

const FEATURE_COUNT: usize = 8;
const PLAN_COUNT: usize = 3;

impl FeatureType {
    pub const ALL: [FeatureType; FEATURE_COUNT] = [
        FeatureType::ChatMessages,
        FeatureType::PropertyReports,
        FeatureType::WebSearches,
        FeatureType::WeatherLookups,
        FeatureType::DocumentCreation,
        FeatureType::SmsMessages,
        FeatureType::VoiceCalls,
        FeatureType::EmailMessages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::ChatMessages => "chat_messages",
            FeatureType::PropertyReports => "property_reports",
            FeatureType::WebSearches => "web_searches",
            FeatureType::WeatherLookups => "weather_lookups",
            FeatureType::DocumentCreation => "document_creation",
            FeatureType::SmsMessages => "sms_messages",
            FeatureType::VoiceCalls => "voice_calls",
            FeatureType::EmailMessages => "email_messages",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|feature| feature.as_str() == value)
    }

    fn index(&self) -> usize {
        match self {
            FeatureType::ChatMessages => 0,
            FeatureType::PropertyReports => 1,
            FeatureType::WebSearches => 2,
            FeatureType::WeatherLookups => 3,
            FeatureType::DocumentCreation => 4,
            FeatureType::SmsMessages => 5,
            FeatureType::VoiceCalls => 6,
            FeatureType::EmailMessages => 7,
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan limit. Serialized as a bare number or the string `"unlimited"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    Limited(i64),
    Unlimited,
}

impl Limit {
    pub fn allows(&self, current_usage: i64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Limited(max) => current_usage < *max,
        }
    }

    pub fn remaining(&self, current_usage: i64) -> Option<i64> {
        match self {
            Limit::Unlimited => None,
            Limit::Limited(max) => Some(max.saturating_sub(current_usage).max(0)),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Limited(value) => serializer.serialize_i64(*value),
            Limit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) if value >= 0 => Ok(Limit::Limited(value)),
            Raw::Number(value) => Err(serde::de::Error::custom(format!(
                "limit must be non-negative, got {value}"
            ))),
            Raw::Text(text) if text.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            Raw::Text(text) => Err(serde::de::Error::custom(format!(
                "limit must be a number or \"unlimited\", got {text:?}"
            ))),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanTableError {
    #[error("plan limit table is missing {plan}/{feature}")]
    Missing { plan: &'static str, feature: &'static str },
    #[error("unknown plan `{0}` in limit overrides")]
    UnknownPlan(String),
    #[error("unknown feature `{0}` in limit overrides")]
    UnknownFeature(String),
}

/// key: billing-plan-table -> plan x feature -> limit
///
/// Every plan/feature pair is populated at construction; lookups cannot miss.
#[derive(Clone, Debug)]
pub struct PlanLimitTable {
    limits: [[Limit; FEATURE_COUNT]; PLAN_COUNT],
}

impl PlanLimitTable {
    /// Builds a table from explicit entries, failing if any pair is absent.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (PlanType, FeatureType, Limit)>,
    ) -> Result<Self, PlanTableError> {
        let mut slots: [[Option<Limit>; FEATURE_COUNT]; PLAN_COUNT] =
            [[None; FEATURE_COUNT]; PLAN_COUNT];
        for (plan, feature, limit) in entries {
            slots[plan.index()][feature.index()] = Some(limit);
        }

        let mut limits = [[Limit::Limited(0); FEATURE_COUNT]; PLAN_COUNT];
        for plan in PlanType::ALL {
            for feature in FeatureType::ALL {
                limits[plan.index()][feature.index()] = slots[plan.index()][feature.index()]
                    .ok_or(PlanTableError::Missing {
                        plan: plan.as_str(),
                        feature: feature.as_str(),
                    })?;
            }
        }
        Ok(Self { limits })
    }

    pub fn defaults() -> Self {
        let mut limits = [[Limit::Limited(0); FEATURE_COUNT]; PLAN_COUNT];
        for plan in PlanType::ALL {
            for feature in FeatureType::ALL {
                limits[plan.index()][feature.index()] = default_limit(plan, feature);
            }
        }
        Self { limits }
    }

    /// Applies `{"premium": {"chat_messages": 2000}}` style overrides on top of
    /// the defaults.
    pub fn with_overrides(
        overrides: &HashMap<String, HashMap<String, Limit>>,
    ) -> Result<Self, PlanTableError> {
        let mut entries: HashMap<(PlanType, FeatureType), Limit> = PlanType::ALL
            .into_iter()
            .flat_map(|plan| {
                FeatureType::ALL
                    .into_iter()
                    .map(move |feature| ((plan, feature), default_limit(plan, feature)))
            })
            .collect();
        for (plan_key, features) in overrides {
            let plan = PlanType::from_str(plan_key)
                .ok_or_else(|| PlanTableError::UnknownPlan(plan_key.clone()))?;
            for (feature_key, limit) in features {
                let feature = FeatureType::from_str(feature_key)
                    .ok_or_else(|| PlanTableError::UnknownFeature(feature_key.clone()))?;
                entries.insert((plan, feature), *limit);
            }
        }
        Self::from_entries(
            entries
                .into_iter()
                .map(|((plan, feature), limit)| (plan, feature, limit)),
        )
    }

    pub fn limit(&self, plan: PlanType, feature: FeatureType) -> Limit {
        self.limits[plan.index()][feature.index()]
    }

    /// Lowest plan above `plan` whose limit for `feature` would admit `current_usage`.
    pub fn upgrade_for(
        &self,
        plan: PlanType,
        feature: FeatureType,
        current_usage: i64,
    ) -> Option<PlanType> {
        let mut candidate = plan.next_tier();
        while let Some(next) = candidate {
            if self.limit(next, feature).allows(current_usage) {
                return Some(next);
            }
            candidate = next.next_tier();
        }
        None
    }
}

impl Default for PlanLimitTable {
    fn default() -> Self {
        Self::defaults()
    }
}

fn default_limit(plan: PlanType, feature: FeatureType) -> Limit {
    use FeatureType::*;
    use Limit::{Limited, Unlimited};
    match (plan, feature) {
        (PlanType::Free, ChatMessages) => Limited(20),
        (PlanType::Free, PropertyReports) => Limited(1),
        (PlanType::Free, WebSearches) => Limited(0),
        (PlanType::Free, WeatherLookups) => Limited(10),
        (PlanType::Free, DocumentCreation) => Limited(5),
        (PlanType::Free, SmsMessages) => Limited(0),
        (PlanType::Free, VoiceCalls) => Limited(0),
        (PlanType::Free, EmailMessages) => Limited(50),

        (PlanType::Premium, ChatMessages) => Limited(1000),
        (PlanType::Premium, PropertyReports) => Limited(20),
        (PlanType::Premium, WebSearches) => Limited(50),
        (PlanType::Premium, WeatherLookups) => Limited(200),
        (PlanType::Premium, DocumentCreation) => Limited(100),
        (PlanType::Premium, SmsMessages) => Limited(250),
        (PlanType::Premium, VoiceCalls) => Limited(0),
        (PlanType::Premium, EmailMessages) => Limited(1000),

        (PlanType::Business, ChatMessages) => Limited(5000),
        (PlanType::Business, PropertyReports) => Limited(100),
        (PlanType::Business, WebSearches) => Limited(250),
        (PlanType::Business, WeatherLookups) => Unlimited,
        (PlanType::Business, DocumentCreation) => Unlimited,
        (PlanType::Business, SmsMessages) => Limited(1000),
        (PlanType::Business, VoiceCalls) => Limited(100),
        (PlanType::Business, EmailMessages) => Unlimited,
    }
}
