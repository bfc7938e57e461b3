//! Access rule persistence

use std::path::Path;

use sqlx::SqlitePool;

use super::rules::{AccessError, AccessPolicy, AccessRule, NewAccessRule};
use crate::error::AppError;

/// Access rule repository
pub struct AccessRuleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccessRuleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All rules in evaluation order
    pub async fn list(&self) -> Result<Vec<AccessRule>, AccessError> {
        let rules = sqlx::query_as::<_, AccessRule>(
            r#"
            SELECT id, position, pattern, principal, is_template, description
            FROM access_rules
            ORDER BY position ASC, id ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rules)
    }

    /// Load and compile the current policy
    pub async fn policy(&self) -> Result<AccessPolicy, AccessError> {
        AccessPolicy::new(&self.list().await?)
    }

    /// Append a rule after the existing ones
    pub async fn insert(&self, rule: &NewAccessRule) -> Result<AccessRule, AccessError> {
        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM access_rules",
        )
        .fetch_one(self.pool)
        .await?;

        // Refuse rules that would make every later check fail
        rule.clone().into_rule(0, position).compile()?;

        let id = sqlx::query(
            r#"
            INSERT INTO access_rules (position, pattern, principal, is_template, description)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(position)
        .bind(&rule.pattern)
        .bind(&rule.principal)
        .bind(rule.is_template)
        .bind(&rule.description)
        .execute(self.pool)
        .await?
        .last_insert_rowid();

        Ok(rule.clone().into_rule(id, position))
    }

    /// Replace the whole rule set; positions follow slice order
    pub async fn replace_all(&self, rules: &[NewAccessRule]) -> Result<usize, AccessError> {
        for (position, rule) in rules.iter().enumerate() {
            rule.clone().into_rule(0, position as i64).compile()?;
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM access_rules")
            .execute(&mut *tx)
            .await?;

        for (position, rule) in rules.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO access_rules (position, pattern, principal, is_template, description)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(position as i64)
            .bind(&rule.pattern)
            .bind(&rule.principal)
            .bind(rule.is_template)
            .bind(&rule.description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(count = rules.len(), "Access rules replaced");
        Ok(rules.len())
    }
}

/// Read a JSON array of rules from disk
pub async fn load_rules_file(path: &Path) -> Result<Vec<NewAccessRule>, AppError> {
    let content = tokio::fs::read(path).await?;
    serde_json::from_slice(&content)
        .map_err(|e| AppError::Rules(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_and_list_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let pool = test_pool(&temp_dir).await;
        let repo = AccessRuleRepository::new(&pool);

        let first = repo
            .insert(&NewAccessRule::literal("^secret/.*", "alice"))
            .await
            .unwrap();
        let second = repo
            .insert(&NewAccessRule::template("users/$USER/", "$USER").with_description("homes"))
            .await
            .unwrap();
        assert!(second.position > first.position);

        let rules = repo.list().await.unwrap();
        assert_eq!(rules, vec![first, second]);
        assert!(rules[1].is_template);

        let policy = repo.policy().await.unwrap();
        assert!(policy.is_allowed("users/bob/x", "bob"));
        assert!(!policy.is_allowed("secret/x", "bob"));
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_regex() {
        let temp_dir = TempDir::new().unwrap();
        let pool = test_pool(&temp_dir).await;
        let repo = AccessRuleRepository::new(&pool);

        let result = repo.insert(&NewAccessRule::literal("[oops", "alice")).await;
        assert!(matches!(result, Err(AccessError::InvalidRule { .. })));
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_all() {
        let temp_dir = TempDir::new().unwrap();
        let pool = test_pool(&temp_dir).await;
        let repo = AccessRuleRepository::new(&pool);

        repo.insert(&NewAccessRule::literal("old/", "nobody")).await.unwrap();

        let count = repo
            .replace_all(&[
                NewAccessRule::literal("a/", "alice"),
                NewAccessRule::literal("b/", "bob"),
            ])
            .await
            .unwrap();
        assert_eq!(count, 2);

        let rules = repo.list().await.unwrap();
        let patterns: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["a/", "b/"]);
        assert_eq!((rules[0].position, rules[1].position), (0, 1));
    }

    #[tokio::test]
    async fn test_replace_all_keeps_old_rules_on_invalid_input() {
        let temp_dir = TempDir::new().unwrap();
        let pool = test_pool(&temp_dir).await;
        let repo = AccessRuleRepository::new(&pool);

        repo.insert(&NewAccessRule::literal("keep/", "alice")).await.unwrap();

        let result = repo
            .replace_all(&[NewAccessRule::literal("(", "alice")])
            .await;
        assert!(result.is_err());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_rules_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rules.json");
        tokio::fs::write(
            &path,
            br#"[
                {"pattern": "^secret/.*", "principal": "alice"},
                {"pattern": "users/$USER/", "principal": "$USER", "is_template": true, "description": "homes"}
            ]"#,
        )
        .await
        .unwrap();

        let rules = load_rules_file(&path).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(!rules[0].is_template);
        assert_eq!(rules[1].description.as_deref(), Some("homes"));

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(load_rules_file(&path).await, Err(AppError::Rules(_))));
    }
}
