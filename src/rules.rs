// 🏷️ Categorization Rules - Rules as Data
// Payee/notes pattern matching that sets a category and/or renames the payee

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// Which transaction text a rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Payee,
    Notes,
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationRule {
    /// Rule ID for tracking
    pub id: String,

    /// Pattern to match (supports wildcards with *)
    pub pattern: String,

    #[serde(default)]
    pub field: RuleField,

    /// Payee name to set
    #[serde(default)]
    pub set_payee: Option<String>,

    /// Category to assign
    #[serde(default)]
    pub set_category: Option<String>,

    /// Priority (higher = applied first)
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    0
}

impl CategorizationRule {
    /// Check if pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        let pattern_lower = self.pattern.to_lowercase();
        let text_lower = text.to_lowercase();

        if pattern_lower.contains('*') {
            // Wildcard matching
            let parts: Vec<&str> = pattern_lower.split('*').collect();

            let first = parts[0];
            let last = parts[parts.len() - 1];

            if !first.is_empty() && !text_lower.starts_with(first) {
                return false;
            }
            if !last.is_empty() && !text_lower.ends_with(last) {
                return false;
            }

            // Middle parts appear in order, between the anchored ends
            let mut current_pos = first.len();
            let end_limit = text_lower.len().saturating_sub(last.len());
            for part in &parts[1..parts.len() - 1] {
                if part.is_empty() {
                    continue;
                }
                match text_lower[current_pos..].find(part) {
                    Some(pos) if current_pos + pos + part.len() <= end_limit => {
                        current_pos += pos + part.len();
                    }
                    _ => return false,
                }
            }

            current_pos <= end_limit || last.is_empty()
        } else {
            // Substring match (case-insensitive)
            text_lower.contains(&pattern_lower)
        }
    }

    /// Check the rule against a transaction's payee and notes
    pub fn matches_transaction(&self, payee: Option<&str>, notes: Option<&str>) -> bool {
        let payee_hit = payee.map(|p| self.matches(p)).unwrap_or(false);
        let notes_hit = notes.map(|n| self.matches(n)).unwrap_or(false);
        match self.field {
            RuleField::Payee => payee_hit,
            RuleField::Notes => notes_hit,
            RuleField::Any => payee_hit || notes_hit,
        }
    }
}

// ============================================================================
// RULE OUTCOME
// ============================================================================

/// Mutations produced by every rule that matched one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub payee: Option<String>,
    pub category: Option<String>,
    pub matched: usize,
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CategorizationRule>,
}

impl RuleSet {
    /// Create a new empty rule set
    pub fn new() -> Self {
        RuleSet { rules: Vec::new() }
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: Vec<CategorizationRule> =
            serde_json::from_str(&content).context("Failed to parse rules JSON")?;

        Ok(RuleSet::from_rules(rules))
    }

    /// Create a rule set from a list of rules
    pub fn from_rules(mut rules: Vec<CategorizationRule>) -> Self {
        // Sort by priority (higher first)
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        RuleSet { rules }
    }

    /// Run every rule in priority order. A rule that renames the payee feeds
    /// the new name to the rules after it.
    pub fn apply(&self, payee: Option<&str>, notes: Option<&str>) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();
        let mut current_payee = payee.map(|p| p.to_string());

        for rule in &self.rules {
            if !rule.matches_transaction(current_payee.as_deref(), notes) {
                continue;
            }
            outcome.matched += 1;
            if let Some(new_payee) = &rule.set_payee {
                current_payee = Some(new_payee.clone());
                outcome.payee = Some(new_payee.clone());
            }
            if let Some(category) = &rule.set_category {
                outcome.category = Some(category.clone());
            }
        }

        outcome
    }

    /// Rules in application order
    pub fn rules(&self) -> &[CategorizationRule] {
        &self.rules
    }

    /// Get number of rules loaded
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
