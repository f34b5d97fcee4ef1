//! Single-flight guard: at most one queued or running analysis per target key.

use sea_orm::DbBackend;

const SINGLE_FLIGHT_UP: &str = include_str!("single_flight.up.sql");
const SINGLE_FLIGHT_DOWN: &str = include_str!("single_flight.down.sql");

pub fn up(backend: DbBackend) -> Option<&'static str> {
    match backend {
        DbBackend::Sqlite | DbBackend::Postgres => Some(SINGLE_FLIGHT_UP),
        _ => None,
    }
}

pub fn down(backend: DbBackend) -> Option<&'static str> {
    match backend {
        DbBackend::Sqlite | DbBackend::Postgres => Some(SINGLE_FLIGHT_DOWN),
        _ => None,
    }
}
