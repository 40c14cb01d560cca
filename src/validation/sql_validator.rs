use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::api::middleware::AppError;

/// Guards literal SQL before it reaches the columnar engine
pub struct SqlValidator;

impl SqlValidator {
    /// Accept exactly one read-only query statement.
    ///
    /// Returns the statement text with any trailing semicolons removed.
    pub fn validate_select_only(sql: &str) -> Result<String, AppError> {
        let dialect = GenericDialect {};
        let statements = Parser::parse_sql(&dialect, sql)
            .map_err(|e| AppError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        let statement = match statements.as_slice() {
            [] => return Err(AppError::InvalidSql("Empty SQL query".to_string())),
            [statement] => statement,
            _ => {
                return Err(AppError::InvalidSql(format!(
                    "Expected a single statement, found {}.",
                    statements.len()
                )))
            }
        };

        match statement {
            Statement::Query(_) => Ok(sql.trim().trim_end_matches(';').trim_end().to_string()),
            Statement::Insert { .. } => Err(AppError::InvalidSql("INSERT statements are not allowed.".to_string())),
            Statement::Update { .. } => Err(AppError::InvalidSql("UPDATE statements are not allowed.".to_string())),
            Statement::Delete { .. } => Err(AppError::InvalidSql("DELETE statements are not allowed.".to_string())),
            Statement::Drop { .. } => Err(AppError::InvalidSql("DROP statements are not allowed.".to_string())),
            other => Err(AppError::InvalidSql(format!(
                "Statement is not a query: {}",
                statement_keyword(other)
            ))),
        }
    }
}

/// First word of the rendered statement, for error messages
fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_select_only() {
        assert!(SqlValidator::validate_select_only("SELECT * FROM dataset_a_1234abcd").is_ok());
        assert!(SqlValidator::validate_select_only("SELECT COUNT(*) AS count FROM t WHERE x > 1").is_ok());

        assert!(SqlValidator::validate_select_only("INSERT INTO t VALUES (1)").is_err());
        assert!(SqlValidator::validate_select_only("UPDATE t SET name = 'test'").is_err());
        assert!(SqlValidator::validate_select_only("DELETE FROM t").is_err());
        assert!(SqlValidator::validate_select_only("DROP TABLE t").is_err());
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let result = SqlValidator::validate_select_only("SELECT 1; DROP TABLE t");
        assert!(matches!(result, Err(AppError::InvalidSql(_))));
    }

    #[test]
    fn test_trailing_semicolon_stripped() {
        let sql = SqlValidator::validate_select_only("SELECT a FROM t;  ").unwrap();
        assert_eq!(sql, "SELECT a FROM t");
    }

    #[test]
    fn test_garbage_is_invalid_sql() {
        assert!(matches!(
            SqlValidator::validate_select_only("SELECT FROM WHERE"),
            Err(AppError::InvalidSql(_))
        ));
        assert!(matches!(
            SqlValidator::validate_select_only(""),
            Err(AppError::InvalidSql(_))
        ));
    }
}
