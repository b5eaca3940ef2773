//! Canonical database schema.
//!
//! This is the single source of truth for fresh databases. Existing databases
//! are brought up to date by the forward-only migrations in `migrations.rs`;
//! the two must be kept in sync by hand.

/// Version written for a freshly created database. Must equal the last entry
/// of `migrations::MIGRATIONS`.
pub const SCHEMA_VERSION: &str = "6.0.0";

/// Tables whose absence makes the database unusable. `validate_schema`
/// checks these; missing indexes only produce a warning.
pub const EXPECTED_TABLES: &[&str] = &[
    "schema_version",
    "projects",
    "branches",
    "photo_folders",
    "photo_metadata",
    "video_metadata",
    "tags",
    "photo_tags",
    "video_tags",
    "project_images",
    "project_videos",
    "media_asset",
    "media_instance",
    "media_stack",
    "media_stack_member",
    "media_stack_meta",
    "semantic_embeddings",
    "semantic_index_meta",
    "face_crops",
    "face_branch_reps",
    "face_merge_history",
    "mobile_devices",
    "import_sessions",
    "device_files",
    "ml_job",
    "batch_checkpoints",
    "search_history",
    "saved_search",
];

pub const SCHEMA: &str = r#"
-- Schema version history; one row per applied migration
CREATE TABLE IF NOT EXISTS schema_version (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Projects: top-level container owning everything below
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    folder TEXT NOT NULL,
    semantic_model TEXT NOT NULL DEFAULT 'clip-vit-b32',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Branches: named photo subsets (all, by_date:YYYY-MM-DD, face_NNN)
CREATE TABLE IF NOT EXISTS branches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    branch_key TEXT NOT NULL,
    display_name TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    UNIQUE (project_id, branch_key)
);

-- Folder tree, one per project
CREATE TABLE IF NOT EXISTS photo_folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    parent_id INTEGER,
    photo_count INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_id) REFERENCES photo_folders(id),
    UNIQUE (project_id, path)
);

-- Photos: one physical file under one folder of one project
CREATE TABLE IF NOT EXISTS photo_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    folder_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    size_kb REAL,
    modified TEXT,
    width INTEGER,
    height INTEGER,
    date_taken TEXT,
    gps_latitude REAL,
    gps_longitude REAL,
    title TEXT,
    caption TEXT,
    rating INTEGER,
    file_hash TEXT,
    image_content_hash TEXT,
    thumbnail_status TEXT NOT NULL DEFAULT 'pending',
    metadata_status TEXT NOT NULL DEFAULT 'pending',
    metadata_fail_count INTEGER NOT NULL DEFAULT 0,
    created_ts INTEGER,
    created_date TEXT,
    created_year INTEGER,
    updated_at TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (folder_id) REFERENCES photo_folders(id),
    UNIQUE (path, project_id)
);

-- Videos mirror photos, plus duration
CREATE TABLE IF NOT EXISTS video_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    folder_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    size_kb REAL,
    modified TEXT,
    width INTEGER,
    height INTEGER,
    duration REAL,
    date_taken TEXT,
    file_hash TEXT,
    metadata_status TEXT NOT NULL DEFAULT 'pending',
    metadata_fail_count INTEGER NOT NULL DEFAULT 0,
    created_ts INTEGER,
    created_date TEXT,
    created_year INTEGER,
    updated_at TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (folder_id) REFERENCES photo_folders(id),
    UNIQUE (path, project_id)
);

-- Tags: unique per project, case-insensitive
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    name TEXT NOT NULL COLLATE NOCASE,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS photo_tags (
    photo_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (photo_id, tag_id),
    FOREIGN KEY (photo_id) REFERENCES photo_metadata(id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS video_tags (
    video_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (video_id, tag_id),
    FOREIGN KEY (video_id) REFERENCES video_metadata(id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- Materialized branch membership (the 'all' branch included)
CREATE TABLE IF NOT EXISTS project_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    branch_key TEXT,
    image_path TEXT NOT NULL,
    label TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS project_videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    branch_key TEXT,
    video_path TEXT NOT NULL,
    label TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

-- Logical content identity, keyed by strong hash
CREATE TABLE IF NOT EXISTS media_asset (
    asset_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    representative_photo_id INTEGER,
    perceptual_hash TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (representative_photo_id) REFERENCES photo_metadata(id) ON DELETE SET NULL,
    UNIQUE (project_id, content_hash)
);

-- Physical occurrence of an asset with import provenance
CREATE TABLE IF NOT EXISTS media_instance (
    instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    asset_id INTEGER NOT NULL,
    photo_id INTEGER NOT NULL,
    source_device_id INTEGER,
    source_path TEXT,
    import_session_id INTEGER,
    file_size INTEGER,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (asset_id) REFERENCES media_asset(asset_id) ON DELETE CASCADE,
    FOREIGN KEY (photo_id) REFERENCES photo_metadata(id) ON DELETE CASCADE,
    UNIQUE (project_id, photo_id)
);

-- Stacks: versioned photo groupings (duplicate / near_duplicate / similar / burst)
CREATE TABLE IF NOT EXISTS media_stack (
    stack_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    stack_type TEXT NOT NULL CHECK (stack_type IN ('duplicate', 'near_duplicate', 'similar', 'burst')),
    representative_photo_id INTEGER,
    rule_version TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    FOREIGN KEY (representative_photo_id) REFERENCES photo_metadata(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS media_stack_member (
    stack_id INTEGER NOT NULL,
    project_id INTEGER NOT NULL,
    photo_id INTEGER NOT NULL,
    rank INTEGER NOT NULL,
    similarity_score REAL,
    PRIMARY KEY (stack_id, photo_id),
    FOREIGN KEY (stack_id) REFERENCES media_stack(stack_id) ON DELETE CASCADE,
    FOREIGN KEY (photo_id) REFERENCES photo_metadata(id) ON DELETE CASCADE,
    UNIQUE (stack_id, rank)
);

CREATE TABLE IF NOT EXISTS media_stack_meta (
    stack_id INTEGER PRIMARY KEY,
    params_json TEXT NOT NULL,
    FOREIGN KEY (stack_id) REFERENCES media_stack(stack_id) ON DELETE CASCADE
);

-- Semantic embeddings, one row per (photo, model); unit-norm float32 blobs
CREATE TABLE IF NOT EXISTS semantic_embeddings (
    photo_id INTEGER NOT NULL,
    model TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dim INTEGER NOT NULL,
    norm REAL,
    source_photo_hash TEXT,
    source_photo_mtime TEXT,
    artifact_version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (photo_id, model),
    FOREIGN KEY (photo_id) REFERENCES photo_metadata(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS semantic_index_meta (
    model TEXT PRIMARY KEY,
    artifact_version INTEGER NOT NULL DEFAULT 1,
    dim INTEGER,
    embedded_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT
);

-- Face crops; image_path is the original photo, never a crop
CREATE TABLE IF NOT EXISTS face_crops (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    branch_key TEXT NOT NULL,
    image_path TEXT NOT NULL,
    crop_path TEXT NOT NULL,
    bbox_x INTEGER NOT NULL DEFAULT 0,
    bbox_y INTEGER NOT NULL DEFAULT 0,
    bbox_w INTEGER NOT NULL DEFAULT 0,
    bbox_h INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    quality_score REAL,
    is_representative INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    UNIQUE (project_id, branch_key, crop_path),
    UNIQUE (project_id, image_path, bbox_x, bbox_y, bbox_w, bbox_h)
);

-- One rep row per cluster: label, member count, centroid, preview
CREATE TABLE IF NOT EXISTS face_branch_reps (
    project_id INTEGER NOT NULL,
    branch_key TEXT NOT NULL,
    label TEXT,
    count INTEGER NOT NULL DEFAULT 0,
    centroid BLOB,
    rep_path TEXT,
    rep_thumb_png BLOB,
    PRIMARY KEY (project_id, branch_key),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

-- Reversible merge snapshots (JSON, binaries base64-encoded)
CREATE TABLE IF NOT EXISTS face_merge_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    target_branch TEXT NOT NULL,
    source_branches TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

-- Import provenance chain
CREATE TABLE IF NOT EXISTS mobile_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_uid TEXT NOT NULL UNIQUE,
    name TEXT,
    device_type TEXT,
    serial TEXT,
    volume_guid TEXT,
    last_mount TEXT,
    first_seen TEXT NOT NULL DEFAULT (datetime('now')),
    last_seen TEXT NOT NULL DEFAULT (datetime('now')),
    files_imported_total INTEGER NOT NULL DEFAULT 0,
    bytes_imported_total INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS import_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id INTEGER NOT NULL,
    project_id INTEGER,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT,
    files_found INTEGER NOT NULL DEFAULT 0,
    files_imported INTEGER NOT NULL DEFAULT 0,
    files_skipped INTEGER NOT NULL DEFAULT 0,
    files_failed INTEGER NOT NULL DEFAULT 0,
    bytes_imported INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT,
    FOREIGN KEY (device_id) REFERENCES mobile_devices(id) ON DELETE CASCADE
);

-- Every file ever seen on a device, with import outcome
CREATE TABLE IF NOT EXISTS device_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id INTEGER NOT NULL,
    device_path TEXT NOT NULL,
    size INTEGER,
    mtime TEXT,
    content_hash TEXT,
    import_status TEXT NOT NULL DEFAULT 'seen',
    photo_id INTEGER,
    video_id INTEGER,
    import_session_id INTEGER,
    first_seen TEXT NOT NULL DEFAULT (datetime('now')),
    last_seen TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (device_id) REFERENCES mobile_devices(id) ON DELETE CASCADE,
    UNIQUE (device_id, device_path)
);

-- Background job queue
CREATE TABLE IF NOT EXISTS ml_job (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    backend TEXT,
    state TEXT NOT NULL DEFAULT 'queued'
        CHECK (state IN ('queued', 'running', 'succeeded', 'failed', 'canceled')),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    started_at TEXT,
    finished_at TEXT,
    error TEXT
);

-- Resumable batch processor checkpoints
CREATE TABLE IF NOT EXISTS batch_checkpoints (
    checkpoint_key TEXT PRIMARY KEY,
    items_processed INTEGER NOT NULL DEFAULT 0,
    total_items INTEGER NOT NULL DEFAULT 0,
    last_item_index INTEGER NOT NULL DEFAULT 0,
    last_item_id TEXT,
    extra_data_json TEXT,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Search history and saved searches
CREATE TABLE IF NOT EXISTS search_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_type TEXT NOT NULL,
    query_text TEXT,
    query_image_path TEXT,
    result_count INTEGER NOT NULL DEFAULT 0,
    top_photo_ids TEXT,
    filters TEXT,
    execution_time_ms REAL NOT NULL DEFAULT 0,
    model TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS saved_search (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    query_type TEXT NOT NULL,
    query_text TEXT,
    query_image_path TEXT,
    filters TEXT,
    model TEXT,
    use_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_folder_parent ON photo_folders(parent_id);
CREATE INDEX IF NOT EXISTS idx_folder_project ON photo_folders(project_id);

CREATE INDEX IF NOT EXISTS idx_meta_path ON photo_metadata(path);
CREATE INDEX IF NOT EXISTS idx_meta_status ON photo_metadata(metadata_status);
CREATE INDEX IF NOT EXISTS idx_meta_proj_folder ON photo_metadata(project_id, folder_id);
CREATE INDEX IF NOT EXISTS idx_meta_proj_year_date ON photo_metadata(project_id, created_year, created_date);
CREATE INDEX IF NOT EXISTS idx_meta_proj_thumb ON photo_metadata(project_id, thumbnail_status);
CREATE INDEX IF NOT EXISTS idx_meta_proj_file_hash ON photo_metadata(project_id, file_hash);

CREATE INDEX IF NOT EXISTS idx_video_proj_folder ON video_metadata(project_id, folder_id);
CREATE INDEX IF NOT EXISTS idx_video_proj_year_date ON video_metadata(project_id, created_year, created_date);

CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name);
CREATE INDEX IF NOT EXISTS idx_photo_tags_photo ON photo_tags(photo_id);
CREATE INDEX IF NOT EXISTS idx_photo_tags_tag ON photo_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_video_tags_tag ON video_tags(tag_id);

CREATE INDEX IF NOT EXISTS idx_branches_key ON branches(project_id, branch_key);
CREATE INDEX IF NOT EXISTS idx_projimgs_branch ON project_images(project_id, branch_key);
CREATE INDEX IF NOT EXISTS idx_projimgs_path ON project_images(image_path);
CREATE INDEX IF NOT EXISTS idx_projvids_branch ON project_videos(project_id, branch_key);

CREATE INDEX IF NOT EXISTS idx_media_asset_hash ON media_asset(project_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_media_instance_asset_project ON media_instance(asset_id, project_id);
CREATE INDEX IF NOT EXISTS idx_media_instance_project ON media_instance(project_id);
CREATE INDEX IF NOT EXISTS idx_media_stack_rule ON media_stack(project_id, stack_type, rule_version);
CREATE INDEX IF NOT EXISTS idx_stack_member_photo ON media_stack_member(photo_id);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON semantic_embeddings(model);

CREATE INDEX IF NOT EXISTS idx_face_crops_proj_branch ON face_crops(project_id, branch_key);
CREATE INDEX IF NOT EXISTS idx_face_crops_proj_rep ON face_crops(project_id, is_representative);
CREATE INDEX IF NOT EXISTS idx_fbreps_proj ON face_branch_reps(project_id);

CREATE INDEX IF NOT EXISTS idx_device_files_status ON device_files(device_id, import_status);
CREATE INDEX IF NOT EXISTS idx_import_sessions_device ON import_sessions(device_id);

CREATE INDEX IF NOT EXISTS idx_ml_job_state ON ml_job(state);
CREATE INDEX IF NOT EXISTS idx_search_history_created ON search_history(created_at);
"#;
