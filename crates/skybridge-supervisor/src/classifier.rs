//! [`OutputClassifier`] – ordered line-classification rules.
//!
//! Every line a supervised process writes is passed through
//! [`OutputClassifier::classify`].  Rules are evaluated in insertion order and
//! the first [`OutputRule`] whose pattern is contained in the line decides the
//! [`LineOutcome`].  Lines that match no rule are [`LineOutcome::Ignore`]d.
//!
//! An empty pattern matches every line, so a trailing empty-pattern rule acts
//! as a catch-all for its stream.

use skybridge_types::OutputStream;

// ────────────────────────────────────────────────────────────────────────────
// Outcome
// ────────────────────────────────────────────────────────────────────────────

/// What a classified line means for the operation that printed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// The operation reached its goal.
    Success,
    /// The operation failed; the string is the user-facing reason.
    Failure(String),
    /// No state change.
    Ignore,
}

// ────────────────────────────────────────────────────────────────────────────
// Rule
// ────────────────────────────────────────────────────────────────────────────

/// A single `(pattern, outcome)` pair, optionally restricted to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRule {
    /// Substring looked for in each line.
    pub pattern: String,
    /// Stream the rule applies to; `None` matches both.
    pub stream: Option<OutputStream>,
    pub outcome: LineOutcome,
}

impl OutputRule {
    /// A rule that applies to both streams.
    pub fn new(pattern: impl Into<String>, outcome: LineOutcome) -> Self {
        Self {
            pattern: pattern.into(),
            stream: None,
            outcome,
        }
    }

    /// Restrict the rule to `stream`.
    pub fn on(mut self, stream: OutputStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// `true` when `line` on `stream` is covered by this rule.
    pub fn matches(&self, stream: OutputStream, line: &str) -> bool {
        self.stream.is_none_or(|s| s == stream) && line.contains(self.pattern.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Classifier
// ────────────────────────────────────────────────────────────────────────────

/// Ordered rule list; first match wins.
///
/// # Example
///
/// ```
/// use skybridge_supervisor::classifier::{LineOutcome, OutputClassifier};
/// use skybridge_types::OutputStream;
///
/// let classifier = OutputClassifier::new()
///     .success("taken", Some(OutputStream::Stdout))
///     .failure("ERROR", Some(OutputStream::Stderr), "camera error");
///
/// assert_eq!(
///     classifier.classify(OutputStream::Stdout, "photo taken"),
///     LineOutcome::Success
/// );
/// assert_eq!(
///     classifier.classify(OutputStream::Stdout, "ERROR on stdout"),
///     LineOutcome::Ignore
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct OutputClassifier {
    rules: Vec<OutputRule>,
}

impl OutputClassifier {
    /// Create a classifier with no rules; every line is ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: OutputRule) {
        self.rules.push(rule);
    }

    /// Builder-style [`LineOutcome::Success`] rule.
    pub fn success(mut self, pattern: &str, stream: Option<OutputStream>) -> Self {
        self.rules.push(OutputRule {
            pattern: pattern.to_string(),
            stream,
            outcome: LineOutcome::Success,
        });
        self
    }

    /// Builder-style [`LineOutcome::Failure`] rule.
    pub fn failure(
        mut self,
        pattern: &str,
        stream: Option<OutputStream>,
        reason: impl Into<String>,
    ) -> Self {
        self.rules.push(OutputRule {
            pattern: pattern.to_string(),
            stream,
            outcome: LineOutcome::Failure(reason.into()),
        });
        self
    }

    /// Builder-style [`LineOutcome::Ignore`] rule, used to shadow a later
    /// catch-all.
    pub fn ignore(mut self, pattern: &str, stream: Option<OutputStream>) -> Self {
        self.rules.push(OutputRule {
            pattern: pattern.to_string(),
            stream,
            outcome: LineOutcome::Ignore,
        });
        self
    }

    /// Classify one line.
    pub fn classify(&self, stream: OutputStream, line: &str) -> LineOutcome {
        self.rules
            .iter()
            .find(|rule| rule.matches(stream, line))
            .map(|rule| rule.outcome.clone())
            .unwrap_or(LineOutcome::Ignore)
    }

    pub fn rules(&self) -> &[OutputRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_classifier() -> OutputClassifier {
        OutputClassifier::new()
            .success("launch initiated", Some(OutputStream::Stdout))
            .failure(
                "must be launched first",
                Some(OutputStream::Stderr),
                "dependencies not started",
            )
            .failure("Could not arm", Some(OutputStream::Stderr), "could not arm")
            .failure("", Some(OutputStream::Stderr), "process has died")
    }

    #[test]
    fn empty_classifier_ignores_everything() {
        let c = OutputClassifier::new();
        assert!(c.is_empty());
        assert_eq!(c.classify(OutputStream::Stdout, "taken"), LineOutcome::Ignore);
        assert_eq!(c.classify(OutputStream::Stderr, "ERROR"), LineOutcome::Ignore);
    }

    #[test]
    fn first_match_wins() {
        let c = launch_classifier();
        assert_eq!(
            c.classify(OutputStream::Stderr, "mavros must be launched first"),
            LineOutcome::Failure("dependencies not started".into())
        );
        assert_eq!(
            c.classify(OutputStream::Stderr, "FCU: Could not arm"),
            LineOutcome::Failure("could not arm".into())
        );
    }

    #[test]
    fn empty_pattern_is_catch_all_for_its_stream() {
        let c = launch_classifier();
        assert_eq!(
            c.classify(OutputStream::Stderr, "segmentation fault"),
            LineOutcome::Failure("process has died".into())
        );
        assert_eq!(
            c.classify(OutputStream::Stdout, "segmentation fault"),
            LineOutcome::Ignore
        );
    }

    #[test]
    fn stream_restriction_is_honoured() {
        let c = launch_classifier();
        assert_eq!(
            c.classify(OutputStream::Stdout, "launch initiated"),
            LineOutcome::Success
        );
        // Same text on stderr falls through to the catch-all.
        assert_eq!(
            c.classify(OutputStream::Stderr, "launch initiated"),
            LineOutcome::Failure("process has died".into())
        );
    }

    #[test]
    fn ignore_rule_shadows_later_rules() {
        let c = OutputClassifier::new()
            .ignore("WARN", Some(OutputStream::Stderr))
            .failure("", Some(OutputStream::Stderr), "stderr output");
        assert_eq!(
            c.classify(OutputStream::Stderr, "[WARN] low disk"),
            LineOutcome::Ignore
        );
        assert_eq!(
            c.classify(OutputStream::Stderr, "fatal"),
            LineOutcome::Failure("stderr output".into())
        );
    }

    #[test]
    fn any_stream_rule_matches_both() {
        let mut c = OutputClassifier::new();
        c.add_rule(OutputRule::new("done", LineOutcome::Success));
        assert_eq!(c.classify(OutputStream::Stdout, "done"), LineOutcome::Success);
        assert_eq!(c.classify(OutputStream::Stderr, "done"), LineOutcome::Success);
        assert_eq!(c.rules().len(), 1);
    }

    #[test]
    fn rule_on_restricts_stream() {
        let rule = OutputRule::new("taken", LineOutcome::Success).on(OutputStream::Stdout);
        assert!(rule.matches(OutputStream::Stdout, "picture taken"));
        assert!(!rule.matches(OutputStream::Stderr, "picture taken"));
        assert!(!rule.matches(OutputStream::Stdout, "picture failed"));
    }
}
