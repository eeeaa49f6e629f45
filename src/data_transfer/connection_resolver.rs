use crate::config::ConnectionStrings;
use crate::error::MigrationError;

/// Both ends of a run, checked for presence only.
#[derive(Debug, Clone)]
pub struct ResolvedConnections {
    pub sql_server: String,
    pub postgres: String,
}

fn normalize_connection_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn resolve_connections(strings: &ConnectionStrings) -> Result<ResolvedConnections, MigrationError> {
    let sql_server = normalize_connection_string(strings.sql_server.as_deref());
    let postgres = normalize_connection_string(strings.postgre_sql.as_deref());

    match (sql_server, postgres) {
        (Some(sql_server), Some(postgres)) => Ok(ResolvedConnections {
            sql_server,
            postgres,
        }),
        _ => Err(MigrationError::Configuration(
            "Database connection strings are not configured properly.".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_connection_strings_required() {
        let strings = ConnectionStrings {
            sql_server: Some("server=tcp:legacy,1433".to_string()),
            postgre_sql: Some("   ".to_string()),
        };
        let err = resolve_connections(&strings).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Database connection strings are not configured properly."
        );

        let strings = ConnectionStrings {
            sql_server: None,
            postgre_sql: Some("postgres://localhost/app".to_string()),
        };
        assert!(resolve_connections(&strings).is_err());
    }

    #[test]
    fn test_connection_strings_are_trimmed() {
        let strings = ConnectionStrings {
            sql_server: Some(" server=tcp:legacy,1433 ".to_string()),
            postgre_sql: Some("postgres://localhost/app\n".to_string()),
        };
        let resolved = resolve_connections(&strings).unwrap();
        assert_eq!(resolved.sql_server, "server=tcp:legacy,1433");
        assert_eq!(resolved.postgres, "postgres://localhost/app");
    }
}
