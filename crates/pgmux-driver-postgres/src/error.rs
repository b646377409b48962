//! Mapping of tokio-postgres errors onto `PgmuxError`

use std::error::Error as _;

use pgmux_core::PgmuxError;
use tokio_postgres::error::DbError;

/// Classify a driver error.
///
/// Server errors keep their SQLSTATE so retry classification can see it. A
/// client whose connection is gone maps to `ConnectionClosed`, and an I/O
/// failure on a live socket to `ConnectionDestroyed`.
pub(crate) fn map_error(error: tokio_postgres::Error) -> PgmuxError {
    if let Some(db_error) = error.as_db_error() {
        return PgmuxError::database(db_error.code().code(), format_db_error(db_error));
    }
    if error.is_closed() {
        return PgmuxError::ConnectionClosed;
    }
    if let Some(io) = error
        .source()
        .and_then(|source| source.downcast_ref::<std::io::Error>())
    {
        return PgmuxError::ConnectionDestroyed(io.to_string());
    }
    PgmuxError::Connection(error.to_string())
}

fn format_db_error(db_error: &DbError) -> String {
    describe(
        db_error.message(),
        db_error.detail(),
        db_error.hint(),
        db_error.column(),
    )
}

fn describe(message: &str, detail: Option<&str>, hint: Option<&str>, column: Option<&str>) -> String {
    let mut text = message.to_string();
    for (label, part) in [("detail", detail), ("hint", hint), ("column", column)] {
        if let Some(part) = part.filter(|p| !p.trim().is_empty()) {
            text.push_str(&format!(" ({}: {})", label, part));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_describe_message_only() {
        assert_eq!(
            describe("could not serialize access", None, None, None),
            "could not serialize access"
        );
    }

    #[test]
    fn test_describe_appends_non_empty_parts() {
        assert_eq!(
            describe(
                "duplicate key value violates unique constraint",
                Some("Key (id)=(1) already exists."),
                Some("  "),
                Some("id"),
            ),
            "duplicate key value violates unique constraint (detail: Key (id)=(1) already exists.) (column: id)"
        );
    }
}
