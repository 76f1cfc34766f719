//! Match-rule table (C4).
//!
//! A rule is a comma-separated list of `key='value'` pairs. Every key present
//! on a rule must match the corresponding field of a candidate message;
//! a key the rule omits means "don't care" for that field. This mirrors the
//! classic DBus match-rule grammar: manual scanning rather than a parser
//! combinator, since the grammar is a flat list with no recursive structure.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Recognised `type=` values (§3).
const MESSAGE_TYPES: &[&str] = &["signal", "method_call", "method_return", "error", "invalid"];

/// The tri-valued `sessionless` predicate (§3): a rule that never mentions
/// `sessionless` is `Unspecified` and matches either kind of message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sessionless {
    #[default]
    Unspecified,
    True,
    False,
}

/// A single parsed match rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub message_type: Option<String>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub destination: Option<String>,
    pub sessionless: Sessionless,
    /// The original rule text, used for de-duplication and removal.
    pub text: String,
}

/// A message's routable fields, as seen by [`Rule::matches`].
#[derive(Debug, Clone, Default)]
pub struct Candidate<'a> {
    pub message_type: Option<&'a str>,
    pub sender: Option<&'a str>,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub destination: Option<&'a str>,
    pub sessionless: bool,
}

impl Rule {
    /// Parse a rule string, e.g. `"type='signal',interface='org.example'"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rule = Rule {
            text: text.to_string(),
            ..Default::default()
        };

        for field in split_fields(text)? {
            let (key, value) = split_key_value(&field)?;
            match key {
                "type" => {
                    if !MESSAGE_TYPES.contains(&value) {
                        return Err(Error::InvalidRule(format!("unrecognised type {value:?}")));
                    }
                    rule.message_type = Some(value.to_string());
                }
                "sender" => rule.sender = Some(value.to_string()),
                "interface" => rule.interface = Some(value.to_string()),
                "member" => rule.member = Some(value.to_string()),
                "path" => rule.path = Some(value.to_string()),
                "destination" => rule.destination = Some(value.to_string()),
                "sessionless" => {
                    rule.sessionless = if value.starts_with('t') || value.starts_with('T') {
                        Sessionless::True
                    } else {
                        Sessionless::False
                    };
                }
                key if key.starts_with("arg") => {
                    return Err(Error::NotImplemented(format!("arg match key {key:?}")));
                }
                other => {
                    return Err(Error::InvalidRule(format!("unknown key {other:?}")));
                }
            }
        }

        Ok(rule)
    }

    /// Whether every field this rule constrains matches `candidate`.
    /// Fields the rule doesn't mention are treated as "don't care".
    pub fn matches(&self, candidate: &Candidate<'_>) -> bool {
        field_matches(&self.message_type, candidate.message_type)
            && field_matches(&self.sender, candidate.sender)
            && field_matches(&self.interface, candidate.interface)
            && field_matches(&self.member, candidate.member)
            && field_matches(&self.path, candidate.path)
            && field_matches(&self.destination, candidate.destination)
            && match self.sessionless {
                Sessionless::Unspecified => true,
                Sessionless::True => candidate.sessionless,
                Sessionless::False => !candidate.sessionless,
            }
    }
}

fn field_matches(rule_value: &Option<String>, candidate_value: Option<&str>) -> bool {
    match rule_value {
        None => true,
        Some(expected) => candidate_value == Some(expected.as_str()),
    }
}

/// Split `"k1='v1',k2='v2'"` into `["k1='v1'", "k2='v2'"]`, respecting quotes
/// so a comma inside a quoted value isn't treated as a field separator.
fn split_fields(text: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in text.chars() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(Error::InvalidRule("unterminated quote".into()));
    }
    if !current.is_empty() {
        fields.push(current);
    }
    if fields.is_empty() {
        return Err(Error::InvalidRule("empty rule".into()));
    }
    Ok(fields)
}

/// Split `"key='value'"` into `("key", "value")`.
fn split_key_value(field: &str) -> Result<(&str, &str)> {
    let eq = field
        .find('=')
        .ok_or_else(|| Error::InvalidRule(format!("missing '=' in {field:?}")))?;
    let key = field[..eq].trim();
    let rest = &field[eq + 1..];

    if !rest.starts_with('\'') || !rest.ends_with('\'') || rest.len() < 2 {
        return Err(Error::InvalidRule(format!(
            "value for {key:?} must be single-quoted"
        )));
    }
    let value = &rest[1..rest.len() - 1];
    if key.is_empty() {
        return Err(Error::InvalidRule("empty key".into()));
    }
    Ok((key, value))
}

/// A thread-safe collection of match rules held on behalf of one endpoint.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: Mutex<Vec<Rule>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Parse and add a rule. Idempotent: adding the same text twice keeps a
    /// single entry, matching AddMatch's "no-op on duplicate" behavior.
    pub fn add(&self, text: &str) -> Result<()> {
        let rule = Rule::parse(text)?;
        let mut rules = self.rules.lock().unwrap();
        if !rules.iter().any(|r| r.text == rule.text) {
            rules.push(rule);
        }
        Ok(())
    }

    /// Remove the rule with this exact text, if present.
    pub fn remove(&self, text: &str) {
        self.rules.lock().unwrap().retain(|r| r.text != text);
    }

    /// Drop every rule held by this table.
    pub fn remove_all(&self) {
        self.rules.lock().unwrap().clear();
    }

    /// Number of distinct rules currently held.
    pub fn len(&self) -> usize {
        self.rules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any held rule matches `candidate`.
    pub fn matches_any(&self, candidate: &Candidate<'_>) -> bool {
        self.rules.lock().unwrap().iter().any(|r| r.matches(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_rule() {
        let rule = Rule::parse("type='signal',interface='org.example',member='Foo'").unwrap();
        assert_eq!(rule.message_type.as_deref(), Some("signal"));
        assert_eq!(rule.interface.as_deref(), Some("org.example"));
        assert_eq!(rule.member.as_deref(), Some("Foo"));
        assert_eq!(rule.sender, None);
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(Rule::parse("bogus='x'").is_err());
    }

    #[test]
    fn rejects_unquoted_value() {
        assert!(Rule::parse("type=signal").is_err());
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(Rule::parse("type='signal").is_err());
    }

    #[test]
    fn comma_inside_quotes_is_not_a_separator() {
        let rule = Rule::parse("member='Foo,Bar'").unwrap();
        assert_eq!(rule.member.as_deref(), Some("Foo,Bar"));
    }

    #[test]
    fn sessionless_is_truthy_only_for_leading_t() {
        assert_eq!(Rule::parse("sessionless='t'").unwrap().sessionless, Sessionless::True);
        assert_eq!(Rule::parse("sessionless='true'").unwrap().sessionless, Sessionless::True);
        assert_eq!(Rule::parse("sessionless='T'").unwrap().sessionless, Sessionless::True);
        assert_eq!(Rule::parse("sessionless='f'").unwrap().sessionless, Sessionless::False);
        assert_eq!(Rule::parse("sessionless='0'").unwrap().sessionless, Sessionless::False);
    }

    #[test]
    fn arg_predicates_are_not_implemented() {
        let err = Rule::parse("arg0='foo'").unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[test]
    fn unrecognised_type_is_invalid_rule() {
        assert!(Rule::parse("type='bogus'").is_err());
    }

    #[test]
    fn path_namespace_is_an_unknown_key() {
        assert!(Rule::parse("path_namespace='/org/example'").is_err());
    }

    #[test]
    fn sessionless_false_rule_rejects_sessionless_candidate() {
        let rule = Rule::parse("sessionless='f',member='Foo'").unwrap();
        let sessionless = Candidate {
            member: Some("Foo"),
            sessionless: true,
            ..Default::default()
        };
        assert!(!rule.matches(&sessionless));
        let non_sessionless = Candidate {
            member: Some("Foo"),
            sessionless: false,
            ..Default::default()
        };
        assert!(rule.matches(&non_sessionless));
    }

    #[test]
    fn unset_fields_are_dont_care() {
        let rule = Rule::parse("interface='org.example'").unwrap();
        let candidate = Candidate {
            interface: Some("org.example"),
            member: Some("AnythingGoes"),
            ..Default::default()
        };
        assert!(rule.matches(&candidate));
    }

    #[test]
    fn mismatched_field_fails_match() {
        let rule = Rule::parse("interface='org.example'").unwrap();
        let candidate = Candidate {
            interface: Some("org.other"),
            ..Default::default()
        };
        assert!(!rule.matches(&candidate));
    }

    #[test]
    fn sessionless_rule_requires_sessionless_candidate() {
        let rule = Rule::parse("sessionless='t',member='Foo'").unwrap();
        let non_sessionless = Candidate {
            member: Some("Foo"),
            sessionless: false,
            ..Default::default()
        };
        assert!(!rule.matches(&non_sessionless));
        let sessionless = Candidate {
            member: Some("Foo"),
            sessionless: true,
            ..Default::default()
        };
        assert!(rule.matches(&sessionless));
    }

    #[test]
    fn table_deduplicates_identical_rules() {
        let table = RuleTable::new();
        table.add("member='Foo'").unwrap();
        table.add("member='Foo'").unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_remove_drops_matching_text() {
        let table = RuleTable::new();
        table.add("member='Foo'").unwrap();
        table.add("member='Bar'").unwrap();
        table.remove("member='Foo'");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_matches_any_rule() {
        let table = RuleTable::new();
        table.add("member='Foo'").unwrap();
        table.add("member='Bar'").unwrap();
        let candidate = Candidate {
            member: Some("Bar"),
            ..Default::default()
        };
        assert!(table.matches_any(&candidate));
    }

    #[test]
    fn table_remove_all_clears_table() {
        let table = RuleTable::new();
        table.add("member='Foo'").unwrap();
        table.remove_all();
        assert!(table.is_empty());
    }
}
