//! Complexity tier to model mapping with availability fallback.

use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::complexity::{ComplexityScore, ComplexityScorer, ComplexityTier};
use crate::model::{Goal, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPair {
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl ModelPair {
    fn new(primary: &str, fallback: &str) -> Self {
        Self {
            primary: primary.to_string(),
            fallback: Some(fallback.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTiers {
    pub simple: ModelPair,
    pub medium: ModelPair,
    pub complex: ModelPair,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            simple: ModelPair::new("haiku", "sonnet"),
            medium: ModelPair::new("sonnet", "opus"),
            complex: ModelPair::new("opus", "sonnet"),
        }
    }
}

impl ModelTiers {
    pub fn pair(&self, tier: ComplexityTier) -> &ModelPair {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Medium => &self.medium,
            ComplexityTier::Complex => &self.complex,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pair) in [
            ("simple", &self.simple),
            ("medium", &self.medium),
            ("complex", &self.complex),
        ] {
            if pair.primary.trim().is_empty() {
                return Err(anyhow!("models.{name}.primary must not be empty"));
            }
            if pair.fallback.as_deref().is_some_and(|f| f.trim().is_empty()) {
                return Err(anyhow!("models.{name}.fallback must not be empty when set"));
            }
        }
        Ok(())
    }

    /// All configured models in global fallback order: simple, medium,
    /// complex; primary before fallback.
    fn global_order(&self) -> impl Iterator<Item = &str> {
        [&self.simple, &self.medium, &self.complex]
            .into_iter()
            .flat_map(|pair| std::iter::once(pair.primary.as_str()).chain(pair.fallback.as_deref()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Primary,
    Fallback,
    Global,
}

impl fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionSource::Primary => "primary",
            SelectionSource::Fallback => "fallback",
            SelectionSource::Global => "global",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSelection {
    pub model: String,
    pub tier: ComplexityTier,
    pub score: u8,
    pub source: SelectionSource,
}

pub type Availability = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct ModelSelector {
    scorer: ComplexityScorer,
    tiers: ModelTiers,
    is_model_available: Availability,
}

impl fmt::Debug for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSelector")
            .field("scorer", &self.scorer)
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}

impl ModelSelector {
    /// Every configured model is treated as available.
    pub fn new(scorer: ComplexityScorer, tiers: ModelTiers) -> Self {
        Self::with_availability(scorer, tiers, Arc::new(|_: &str| true))
    }

    pub fn with_availability(
        scorer: ComplexityScorer,
        tiers: ModelTiers,
        is_model_available: Availability,
    ) -> Self {
        Self {
            scorer,
            tiers,
            is_model_available,
        }
    }

    pub fn scorer(&self) -> &ComplexityScorer {
        &self.scorer
    }

    pub fn select_model(&self, item: &WorkItem) -> Result<ModelSelection> {
        let score = self.scorer.score_work_item(item);
        self.pick(&score)
            .ok_or_else(|| anyhow!("no model available for work item '{}'", item.id))
    }

    pub fn select_model_for_planning(&self, goal: &Goal) -> Result<ModelSelection> {
        let score = self.scorer.score_goal(goal);
        self.pick(&score)
            .ok_or_else(|| anyhow!("no model available to plan goal '{}'", goal.id))
    }

    fn pick(&self, score: &ComplexityScore) -> Option<ModelSelection> {
        let available = |model: &str| (self.is_model_available)(model);
        let selection = |model: &str, source| ModelSelection {
            model: model.to_string(),
            tier: score.tier,
            score: score.score,
            source,
        };

        let pair = self.tiers.pair(score.tier);
        if available(&pair.primary) {
            return Some(selection(&pair.primary, SelectionSource::Primary));
        }
        if let Some(fallback) = pair.fallback.as_deref().filter(|&m| available(m)) {
            return Some(selection(fallback, SelectionSource::Fallback));
        }
        self.tiers
            .global_order()
            .find(|&model| available(model))
            .map(|model| selection(model, SelectionSource::Global))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Effort, ItemType};
    use crate::test_support::{goal, work_item};

    fn selector_with(available: &'static [&'static str]) -> ModelSelector {
        ModelSelector::with_availability(
            ComplexityScorer::default(),
            ModelTiers::default(),
            Arc::new(move |model: &str| available.contains(&model)),
        )
    }

    fn complex_item() -> WorkItem {
        let mut item = work_item("a", "g");
        item.item_type = ItemType::Design;
        item.estimated_effort = Effort::XL;
        item.description = "x".repeat(2_000);
        item.retry_count = 3;
        item.priority = 90;
        item
    }

    #[test]
    fn simple_item_uses_simple_primary() {
        let selection = ModelSelector::new(ComplexityScorer::default(), ModelTiers::default())
            .select_model(&work_item("a", "g"))
            .expect("selection");
        assert_eq!(selection.tier, ComplexityTier::Simple);
        assert_eq!(selection.model, "haiku");
        assert_eq!(selection.source, SelectionSource::Primary);
    }

    #[test]
    fn falls_back_within_tier() {
        let selection = selector_with(&["sonnet"])
            .select_model(&complex_item())
            .expect("selection");
        assert_eq!(selection.tier, ComplexityTier::Complex);
        assert_eq!(selection.model, "sonnet");
        assert_eq!(selection.source, SelectionSource::Fallback);
    }

    #[test]
    fn searches_every_tier_when_pair_unavailable() {
        let mut tiers = ModelTiers::default();
        tiers.complex = ModelPair {
            primary: "big".to_string(),
            fallback: None,
        };
        let selector = ModelSelector::with_availability(
            ComplexityScorer::default(),
            tiers,
            Arc::new(|model: &str| model == "opus"),
        );
        let selection = selector.select_model(&complex_item()).expect("selection");
        assert_eq!(selection.model, "opus");
        assert_eq!(selection.source, SelectionSource::Global);
    }

    #[test]
    fn errors_when_nothing_available() {
        let err = selector_with(&[])
            .select_model(&work_item("a", "g"))
            .expect_err("no model");
        assert!(err.to_string().contains("no model available"));
    }

    #[test]
    fn planning_selection_is_deterministic() {
        let selector = ModelSelector::new(ComplexityScorer::default(), ModelTiers::default());
        let g = goal("g");
        let first = selector.select_model_for_planning(&g).expect("first");
        let second = selector.select_model_for_planning(&g).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_blank_model_names() {
        let mut tiers = ModelTiers::default();
        tiers.medium.primary = " ".to_string();
        assert!(tiers.validate().is_err());
    }
}
