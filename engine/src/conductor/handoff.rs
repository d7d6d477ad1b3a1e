//! Handoff Evaluator
//!
//! Decides, after a task finishes, whether the next unit of work should move
//! to a different agent. Rules are declarative `from -> to` pairs guarded by a
//! condition and ordered by priority (highest first, declaration order among
//! equals).
//!
//! Conditions form a small predicate language:
//!
//! - `NaturalLanguage`: heuristic phrase matching, the default kind. A
//!   condition that talks about completion ("complete", "completed",
//!   "finished", "done") matches results mentioning any of those words; the
//!   same goes for failure ("error", "fail", "failed", "failure"). A
//!   double-quoted phrase in the condition matches by substring.
//! - `Contains`: case-insensitive substring of the result
//! - `Regex`: compiled once when the evaluator is built
//! - `Classifier`: delegated to a pluggable [`ConditionClassifier`]
//!
//! Evaluation never fails: a condition that cannot be evaluated is not met.
//! The evaluator never touches the plan; injecting the handoff task is the
//! orchestrator's job.

use async_trait::async_trait;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const COMPLETION_WORDS: &[&str] = &["complete", "completed", "finished", "done"];
const FAILURE_WORDS: &[&str] = &["error", "fail", "failed", "failure"];

/// Predicate guarding a handoff rule
///
/// In TOML a bare string is a natural-language condition; the other kinds
/// use a tagged table, e.g. `{ kind = "regex", pattern = "^APPROVED" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConditionSpec", into = "ConditionSpec")]
pub enum HandoffCondition {
    NaturalLanguage(String),
    Contains(String),
    Regex(String),
    Classifier(String),
}

impl HandoffCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            HandoffCondition::NaturalLanguage(_) => "natural_language",
            HandoffCondition::Contains(_) => "contains",
            HandoffCondition::Regex(_) => "regex",
            HandoffCondition::Classifier(_) => "classifier",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            HandoffCondition::NaturalLanguage(t)
            | HandoffCondition::Contains(t)
            | HandoffCondition::Regex(t)
            | HandoffCondition::Classifier(t) => t,
        }
    }
}

impl fmt::Display for HandoffCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.text())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ConditionSpec {
    Text(String),
    Tagged(TaggedCondition),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedCondition {
    NaturalLanguage { text: String },
    Contains { text: String },
    Regex { pattern: String },
    Classifier { question: String },
}

impl From<ConditionSpec> for HandoffCondition {
    fn from(spec: ConditionSpec) -> Self {
        match spec {
            ConditionSpec::Text(text) => HandoffCondition::NaturalLanguage(text),
            ConditionSpec::Tagged(TaggedCondition::NaturalLanguage { text }) => {
                HandoffCondition::NaturalLanguage(text)
            }
            ConditionSpec::Tagged(TaggedCondition::Contains { text }) => {
                HandoffCondition::Contains(text)
            }
            ConditionSpec::Tagged(TaggedCondition::Regex { pattern }) => {
                HandoffCondition::Regex(pattern)
            }
            ConditionSpec::Tagged(TaggedCondition::Classifier { question }) => {
                HandoffCondition::Classifier(question)
            }
        }
    }
}

impl From<HandoffCondition> for ConditionSpec {
    fn from(condition: HandoffCondition) -> Self {
        match condition {
            HandoffCondition::NaturalLanguage(text) => ConditionSpec::Text(text),
            HandoffCondition::Contains(text) => {
                ConditionSpec::Tagged(TaggedCondition::Contains { text })
            }
            HandoffCondition::Regex(pattern) => {
                ConditionSpec::Tagged(TaggedCondition::Regex { pattern })
            }
            HandoffCondition::Classifier(question) => {
                ConditionSpec::Tagged(TaggedCondition::Classifier { question })
            }
        }
    }
}

/// Declarative reroute from one agent to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRule {
    pub from: String,
    pub to: String,
    pub condition: HandoffCondition,
    #[serde(default)]
    pub priority: i32,
}

impl HandoffRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: HandoffCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Input for one evaluation, built fresh for every finished task
#[derive(Debug, Clone, Default)]
pub struct HandoffContext {
    pub current_agent: String,
    pub task_result: String,
    pub goal: String,
    pub conversation: Vec<Message>,
    pub taskspace_files: Vec<String>,
}

/// Answers fuzzy handoff conditions, typically by asking a model
#[async_trait]
pub trait ConditionClassifier: Send + Sync {
    async fn classify(&self, question: &str, context: &HandoffContext)
        -> Result<bool, EngineError>;
}

enum Matcher {
    NaturalLanguage(String),
    Contains(String),
    Regex(Regex),
    Classifier(String),
}

struct CompiledRule {
    rule: HandoffRule,
    matcher: Matcher,
}

/// Compile a regex condition, reporting a team-definition error on failure
pub fn compile_condition_regex(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|e| EngineError::InvalidTeam(format!("Invalid regex '{}': {}", pattern, e)))
}

/// Rule index keyed by source agent
pub struct HandoffEvaluator {
    rules: HashMap<String, Vec<CompiledRule>>,
    fallbacks: HashMap<String, String>,
    agents: HashSet<String>,
    classifier: Option<Arc<dyn ConditionClassifier>>,
}

impl HandoffEvaluator {
    /// Index `rules` by source agent
    ///
    /// Rules naming an agent outside `agents` are skipped with a warning.
    /// An invalid regex is a configuration error.
    pub fn new<I, S>(rules: Vec<HandoffRule>, agents: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents: HashSet<String> = agents.into_iter().map(Into::into).collect();
        let mut index: HashMap<String, Vec<CompiledRule>> = HashMap::new();

        for rule in rules {
            if !agents.contains(&rule.from) || !agents.contains(&rule.to) {
                warn!(
                    "Skipping handoff rule {} -> {}: agent not available",
                    rule.from, rule.to
                );
                continue;
            }

            let matcher = match &rule.condition {
                HandoffCondition::NaturalLanguage(text) => {
                    Matcher::NaturalLanguage(text.to_lowercase())
                }
                HandoffCondition::Contains(text) => Matcher::Contains(text.to_lowercase()),
                HandoffCondition::Regex(pattern) => {
                    Matcher::Regex(compile_condition_regex(pattern)?)
                }
                HandoffCondition::Classifier(question) => Matcher::Classifier(question.clone()),
            };

            index
                .entry(rule.from.clone())
                .or_default()
                .push(CompiledRule { rule, matcher });
        }

        // Stable sort keeps declaration order among equal priorities
        for rules in index.values_mut() {
            rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        }

        Ok(Self {
            rules: index,
            fallbacks: HashMap::new(),
            agents,
            classifier: None,
        })
    }

    /// An evaluator with no rules
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            fallbacks: HashMap::new(),
            agents: HashSet::new(),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ConditionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Rules for an agent in evaluation order
    pub fn rules_for(&self, agent: &str) -> Vec<&HandoffRule> {
        self.rules
            .get(agent)
            .map(|rules| rules.iter().map(|c| &c.rule).collect())
            .unwrap_or_default()
    }

    /// Target of the first rule for `context.current_agent` whose condition holds
    pub async fn evaluate_handoffs(&self, context: &HandoffContext) -> Option<String> {
        let rules = self.rules.get(&context.current_agent)?;

        for compiled in rules {
            if self.condition_holds(&compiled.matcher, context).await {
                debug!(
                    "Handoff rule matched: {} -> {} ({})",
                    compiled.rule.from, compiled.rule.to, compiled.rule.condition
                );
                return Some(compiled.rule.to.clone());
            }
        }
        None
    }

    /// Default reroute for an agent when no rule matched
    pub fn get_fallback_agent(&self, agent_name: &str) -> Option<&str> {
        self.fallbacks.get(agent_name).map(String::as_str)
    }

    /// Register a default reroute; both agents must be available
    pub fn register_fallback(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<(), EngineError> {
        let from = from.into();
        let to = to.into();
        for name in [&from, &to] {
            if !self.agents.contains(name) {
                return Err(EngineError::AgentNotFound(name.clone()));
            }
        }
        self.fallbacks.insert(from, to);
        Ok(())
    }

    async fn condition_holds(&self, matcher: &Matcher, context: &HandoffContext) -> bool {
        match matcher {
            Matcher::NaturalLanguage(condition) => {
                natural_language_matches(condition, &context.task_result)
            }
            Matcher::Contains(needle) => context.task_result.to_lowercase().contains(needle),
            Matcher::Regex(re) => re.is_match(&context.task_result),
            Matcher::Classifier(question) => {
                let Some(classifier) = &self.classifier else {
                    debug!("No classifier configured, condition '{}' not met", question);
                    return false;
                };
                match classifier.classify(question, context).await {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        warn!("Classifier failed for '{}': {}", question, e);
                        false
                    }
                }
            }
        }
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn quoted_phrases(condition: &str) -> Vec<&str> {
    condition
        .split('"')
        .skip(1)
        .step_by(2)
        .filter(|phrase| !phrase.trim().is_empty())
        .collect()
}

/// Heuristic match of a natural-language condition against a task result
///
/// `condition` is expected lowercased.
fn natural_language_matches(condition: &str, result: &str) -> bool {
    let result_lower = result.to_lowercase();
    if quoted_phrases(condition)
        .iter()
        .any(|phrase| result_lower.contains(phrase))
    {
        return true;
    }

    let condition_words = words(condition);
    let result_words = words(&result_lower);
    [COMPLETION_WORDS, FAILURE_WORDS].iter().any(|family| {
        family.iter().any(|w| condition_words.contains(*w))
            && family.iter().any(|w| result_words.contains(*w))
    })
}
