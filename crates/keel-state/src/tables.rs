//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Service ids are `{project}/{name}`; children of a service are keyed
//! `{service_id}:{child_id}`.

use redb::TableDefinition;

/// Service specs keyed by `{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Releases keyed by `{service_id}:{release_id}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Reconciliation records keyed by `{service_id}`.
pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// SLO signal snapshots keyed by `{service_id}:{release_id}:{epoch}`.
pub const SIGNALS: TableDefinition<&str, &[u8]> = TableDefinition::new("signals");
