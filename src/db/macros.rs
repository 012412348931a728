//! Dispatch macros for reducing code duplication.
//!
//! These expand at compile time into plain `match` expressions over the
//! physical connection variants.

/// Run the same expression against whichever sqlx connection is held.
///
/// # Example
///
/// ```ignore
/// dispatch_connection!(self, conn => conn.ping().await)
/// ```
#[macro_export]
macro_rules! dispatch_connection {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::sqlx_backend::SqlxConnection::Postgres($c) => $body,
            $crate::db::sqlx_backend::SqlxConnection::MySql($c) => $body,
            $crate::db::sqlx_backend::SqlxConnection::Sqlite($c) => $body,
        }
    };
}

/// Build a `Vec<QueryParam>` from heterogeneous values.
///
/// ```ignore
/// let args = params![42, "alice", None::<i64>];
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::models::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::models::QueryParam::from($value)),+]
    };
}

pub use dispatch_connection;
pub use params;
