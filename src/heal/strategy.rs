// src/heal/strategy.rs
//! Healing strategies and deterministic selection.
//!
//! Candidates are the strategies listing the issue's kind whose `target_prefix` (if
//! any) prefixes the rendered target (`cache:VIX`, `dependent:dashboard`, ...). Among
//! candidates the longest prefix wins; no prefix ranks below any prefix; ties keep
//! configuration order. `unknown` issues never match.

use std::time::Duration;

use crate::config::{ActionKind, StrategyCfg};
use crate::issue::{Issue, IssueKind};

#[derive(Debug, Clone, PartialEq)]
pub struct HealingStrategy {
    pub name: String,
    pub kinds: Vec<IssueKind>,
    pub target_prefix: Option<String>,
    pub action: ActionKind,
    pub max_attempts: u32,
    pub cooldown: Duration,
    pub timeout: Duration,
}

impl From<&StrategyCfg> for HealingStrategy {
    fn from(c: &StrategyCfg) -> Self {
        Self {
            name: c.name.clone(),
            kinds: c.kinds.clone(),
            target_prefix: c.target_prefix.clone().filter(|p| !p.is_empty()),
            action: c.action,
            max_attempts: c.max_attempts.max(1),
            cooldown: Duration::from_secs(c.cooldown_secs),
            timeout: Duration::from_secs(c.timeout_secs.max(1)),
        }
    }
}

impl HealingStrategy {
    pub fn matches(&self, issue: &Issue) -> bool {
        if issue.kind == IssueKind::Unknown || !self.kinds.contains(&issue.kind) {
            return false;
        }
        match &self.target_prefix {
            Some(p) => issue.target.to_string().starts_with(p.as_str()),
            None => true,
        }
    }

    fn specificity(&self) -> usize {
        self.target_prefix.as_ref().map_or(0, |p| p.len() + 1)
    }
}

/// Strategies pre-sorted most specific first.
#[derive(Debug, Clone, Default)]
pub struct StrategyBook {
    ordered: Vec<HealingStrategy>,
}

impl StrategyBook {
    pub fn new(strategies: Vec<HealingStrategy>) -> Self {
        let mut ordered = strategies;
        // stable: equal specificity keeps config order
        ordered.sort_by_key(|s| std::cmp::Reverse(s.specificity()));
        Self { ordered }
    }

    pub fn from_cfg(cfgs: &[StrategyCfg]) -> Self {
        Self::new(cfgs.iter().map(HealingStrategy::from).collect())
    }

    pub fn select(&self, issue: &Issue) -> Option<&HealingStrategy> {
        self.ordered.iter().find(|s| s.matches(issue))
    }

    pub fn strategies(&self) -> &[HealingStrategy] {
        &self.ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_strategies;
    use crate::issue::Target;
    use chrono::Utc;

    fn cfg(name: &str, kind: IssueKind, prefix: Option<&str>, action: ActionKind) -> StrategyCfg {
        StrategyCfg {
            name: name.into(),
            kinds: vec![kind],
            target_prefix: prefix.map(str::to_string),
            action,
            max_attempts: 3,
            cooldown_secs: 60,
            timeout_secs: 30,
        }
    }

    fn stale(key: &str) -> Issue {
        Issue::new(IssueKind::StaleCache, Target::CacheKey(key.into()), "stale", Utc::now())
    }

    #[test]
    fn defaults_cover_known_kinds() {
        let book = StrategyBook::from_cfg(&default_strategies());
        let s = book.select(&stale("VIX")).unwrap();
        assert_eq!(s.name, "refetch-and-repair");
        let rl = Issue::new(IssueKind::RateLimited, Target::Provider("fred".into()), "", Utc::now());
        assert_eq!(book.select(&rl).unwrap().action, ActionKind::BackoffIncrease);
    }

    #[test]
    fn longest_prefix_wins_then_config_order() {
        let book = StrategyBook::from_cfg(&[
            cfg("generic", IssueKind::StaleCache, None, ActionKind::Refetch),
            cfg("all-cache", IssueKind::StaleCache, Some("cache:"), ActionKind::Refetch),
            cfg("vix", IssueKind::StaleCache, Some("cache:VIX"), ActionKind::RestoreFromDurable),
            cfg("vix-dup", IssueKind::StaleCache, Some("cache:VIX"), ActionKind::Refetch),
        ]);
        assert_eq!(book.select(&stale("VIX")).unwrap().name, "vix");
        assert_eq!(book.select(&stale("DGS10")).unwrap().name, "all-cache");
    }

    #[test]
    fn unknown_never_matches() {
        let book = StrategyBook::from_cfg(&[cfg("catch", IssueKind::Unknown, None, ActionKind::Refetch)]);
        let i = Issue::new(IssueKind::Unknown, Target::Resource("x".into()), "?", Utc::now());
        assert!(book.select(&i).is_none());
    }
}
