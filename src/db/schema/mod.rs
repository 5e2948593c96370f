mod base;
mod v1_to_v2;
mod v2_to_v3;
mod v3_to_v4;
mod v4_to_v5;

use crate::db::migration::Migration;

pub use base::{create_current_schema, META_TABLE_SQL};

/// Version produced by `create_current_schema` and by the last migration.
pub const CURRENT_SCHEMA_VERSION: u32 = 5;

pub const MIGRATION_1_TO_2: Migration = Migration {
    target_version: 2,
    description: "add marker value and required_value",
    pre_sql: None,
    code_fn: Some(v1_to_v2::migrate_1_to_2),
    post_sql: None,
};

pub const MIGRATION_2_TO_3: Migration = Migration {
    target_version: 3,
    description: "add marker status colors",
    pre_sql: None,
    code_fn: Some(v2_to_v3::migrate_2_to_3),
    post_sql: None,
};

pub const MIGRATION_3_TO_4: Migration = Migration {
    target_version: 4,
    description: "rebuild markers and images tables",
    pre_sql: Some(v3_to_v4::UPGRADE_3_TO_4_PRE_SQL),
    code_fn: Some(v3_to_v4::migrate_3_to_4),
    post_sql: Some(base::IMAGES_INDEX_SQL),
};

pub const MIGRATION_4_TO_5: Migration = Migration {
    target_version: 5,
    description: "add visit and action logging",
    pre_sql: None,
    code_fn: Some(v4_to_v5::migrate_4_to_5),
    post_sql: None,
};

/// Every known migration, ordered by target version.
pub const MIGRATIONS: &[Migration] = &[
    MIGRATION_1_TO_2,
    MIGRATION_2_TO_3,
    MIGRATION_3_TO_4,
    MIGRATION_4_TO_5,
];
