//! 数据库表结构

/// 当前数据库结构版本，作为全局属性持久化
pub const SCHEMA_VERSION: i64 = 1;

/// 建表语句，按依赖顺序排列
pub const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS global_properties (
        property INTEGER PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
        public_id TEXT UNIQUE NOT NULL,
        resource_level INTEGER NOT NULL,
        parent_id INTEGER REFERENCES resources(internal_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS main_dicom_tags (
        resource_id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
        tag_group INTEGER NOT NULL,
        tag_element INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (resource_id, tag_group, tag_element)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dicom_identifiers (
        resource_id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
        tag_group INTEGER NOT NULL,
        tag_element INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (resource_id, tag_group, tag_element)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        resource_id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
        meta_key INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (resource_id, meta_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attached_files (
        resource_id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
        content_type INTEGER NOT NULL,
        uuid TEXT NOT NULL,
        compressed_size INTEGER NOT NULL,
        uncompressed_size INTEGER NOT NULL,
        compression INTEGER NOT NULL,
        uncompressed_md5 TEXT NOT NULL,
        compressed_md5 TEXT NOT NULL,
        PRIMARY KEY (resource_id, content_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        change_kind INTEGER NOT NULL,
        internal_id INTEGER REFERENCES resources(internal_id) ON DELETE CASCADE,
        resource_level INTEGER NOT NULL,
        public_id TEXT NOT NULL,
        date TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exported_resources (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_level INTEGER NOT NULL,
        public_id TEXT NOT NULL,
        remote_aet TEXT NOT NULL,
        patient_id TEXT NOT NULL,
        study_instance_uid TEXT NOT NULL,
        series_instance_uid TEXT NOT NULL,
        sop_instance_uid TEXT NOT NULL,
        date TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patient_recycling_order (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        patient_id INTEGER UNIQUE NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE
    )
    "#,
];

/// 索引语句，保障公共标识符与识别标签的O(log n)查找
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_resources_level ON resources(resource_level)",
    "CREATE INDEX IF NOT EXISTS idx_main_tags_resource ON main_dicom_tags(resource_id)",
    "CREATE INDEX IF NOT EXISTS idx_identifiers_value ON dicom_identifiers(tag_group, tag_element, value)",
    "CREATE INDEX IF NOT EXISTS idx_identifiers_resource ON dicom_identifiers(resource_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_attached_files_uuid ON attached_files(uuid)",
    "CREATE INDEX IF NOT EXISTS idx_changes_resource ON changes(internal_id)",
    "CREATE INDEX IF NOT EXISTS idx_metadata_resource ON metadata(resource_id)",
];
