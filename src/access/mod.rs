//! Access Control
//!
//! Ordered deny-list of path/principal rules. A request is denied by the
//! first rule whose pattern matches the path while its principal does not
//! match the user; when no rule denies, the request is allowed.
//!
//! Template rules expand `$USER` in the pattern into a capture, and the
//! captured segment (escaped) replaces `$USER` in the principal, so
//! `users/$USER/` with principal `$USER` confines each user to their
//! own subtree.

pub mod repository;
pub mod rules;

pub use repository::{load_rules_file, AccessRuleRepository};
pub use rules::*;
