//! Rule compilation and evaluation

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::paths::SafePath;

/// Capture substituted for `$USER` in templated patterns
pub const USER_CAPTURE: &str = r"(?P<user>[A-Za-z0-9_.@+-]+)";

/// Placeholder recognised in templated patterns and principals
pub const USER_PLACEHOLDER: &str = "$USER";

// ============================================================================
// Rules
// ============================================================================

/// Stored access rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessRule {
    pub id: i64,

    /// Evaluation order (ties broken by id)
    pub position: i64,

    /// Regex over the normalized path, anchored at its start
    pub pattern: String,

    /// Regex the acting username must match in full
    pub principal: String,

    /// Whether `$USER` is expanded in `pattern` and `principal`
    pub is_template: bool,

    pub description: Option<String>,
}

/// Rule as supplied for insertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccessRule {
    pub pattern: String,
    pub principal: String,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewAccessRule {
    pub fn literal(pattern: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            principal: principal.into(),
            is_template: false,
            description: None,
        }
    }

    pub fn template(pattern: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            is_template: true,
            ..Self::literal(pattern, principal)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach storage identity
    pub fn into_rule(self, id: i64, position: i64) -> AccessRule {
        AccessRule {
            id,
            position,
            pattern: self.pattern,
            principal: self.principal,
            is_template: self.is_template,
            description: self.description,
        }
    }
}

impl AccessRule {
    /// Compile the rule's regexes
    pub fn compile(&self) -> Result<CompiledRule, AccessError> {
        let invalid = |e: regex::Error| AccessError::InvalidRule {
            id: self.id,
            pattern: self.pattern.clone(),
            reason: e.to_string(),
        };

        let source = if self.is_template {
            self.pattern.replace(USER_PLACEHOLDER, USER_CAPTURE)
        } else {
            self.pattern.clone()
        };
        let pattern = Regex::new(&format!("^(?:{source})")).map_err(invalid)?;

        let principal = if self.is_template && self.principal.contains(USER_PLACEHOLDER) {
            // Validate the shape now; the capture is substituted per request
            full_match(&self.principal.replace(USER_PLACEHOLDER, "user")).map_err(invalid)?;
            Principal::Template(self.principal.clone())
        } else {
            Principal::Fixed(full_match(&self.principal).map_err(invalid)?)
        };

        Ok(CompiledRule {
            id: self.id,
            source: self.pattern.clone(),
            description: self.description.clone(),
            pattern,
            principal,
        })
    }
}

fn full_match(source: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{source})$"))
}

#[derive(Debug, Clone)]
enum Principal {
    Fixed(Regex),
    /// Principal text with `$USER` still in place
    Template(String),
}

/// Rule ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledRule {
    id: i64,
    source: String,
    description: Option<String>,
    pattern: Regex,
    principal: Principal,
}

impl CompiledRule {
    /// Whether this rule blocks `user` on `path`
    fn denies(&self, path: &SafePath, user: &str) -> bool {
        let Some(captures) = self.pattern.captures(path.as_str()) else {
            return false;
        };

        match &self.principal {
            Principal::Fixed(principal) => !principal.is_match(user),
            Principal::Template(template) => {
                let captured = captures.name("user").map(|m| m.as_str()).unwrap_or_default();
                let principal = template.replace(USER_PLACEHOLDER, &regex::escape(captured));
                match full_match(&principal) {
                    Ok(principal) => !principal.is_match(user),
                    Err(e) => {
                        tracing::error!(rule = self.id, error = %e, "Substituted principal failed to compile");
                        true
                    }
                }
            }
        }
    }

    fn denial(&self) -> Denial {
        Denial {
            rule_id: self.id,
            pattern: self.source.clone(),
            description: self.description.clone(),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Ordered deny-list of compiled rules
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    rules: Vec<CompiledRule>,
}

impl AccessPolicy {
    /// Compile rules, sorted by position then id
    ///
    /// A single invalid rule fails the whole policy.
    pub fn new(rules: &[AccessRule]) -> Result<Self, AccessError> {
        let mut ordered: Vec<&AccessRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| (rule.position, rule.id));

        let rules = ordered
            .into_iter()
            .map(AccessRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule denying `user` on `path`, if any
    pub fn check(&self, path: &SafePath, user: &str) -> Result<(), Denial> {
        match self.rules.iter().find(|rule| rule.denies(path, user)) {
            Some(rule) => Err(rule.denial()),
            None => Ok(()),
        }
    }

    /// Check a raw client path; unsafe paths are never allowed
    pub fn is_allowed(&self, raw_path: &str, user: &str) -> bool {
        match SafePath::parse(raw_path) {
            Ok(path) => self.check(&path, user).is_ok(),
            Err(_) => false,
        }
    }
}

/// The rule that blocked a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub rule_id: i64,
    pub pattern: String,
    pub description: Option<String>,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blocked by rule {} ({})", self.rule_id, self.pattern)?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Access-control error types
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Access denied: {0}")]
    Denied(Denial),

    #[error("Access rule {id} ({pattern}) is invalid: {reason}")]
    InvalidRule {
        id: i64,
        pattern: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<Denial> for AccessError {
    fn from(denial: Denial) -> Self {
        Self::Denied(denial)
    }
}
