//! Embedded database migrations.
//!
//! The schema is fixed and versioned; both backends run their migration set
//! at startup (or via `edgebus-admin migrate`) before serving traffic.

use sqlx::migrate::Migrator;

static POSTGRES_MIGRATOR: Migrator = sqlx::migrate!("migrations/postgres");
static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");

pub fn postgres_migrator() -> &'static Migrator {
    &POSTGRES_MIGRATOR
}

pub fn sqlite_migrator() -> &'static Migrator {
    &SQLITE_MIGRATOR
}
