//! SQLite database for the Punchclock attendance server.

pub use punchclock_core::db::DatabaseError;

punchclock_core::define_database!(
    AttendanceDatabase,
    "Attendance database migrations complete"
);
