//! SQLite schema definition

/// SQL schema for the metadata database
pub const SCHEMA_SQL: &str = r#"
-- Projects: owners of documents, requirements and one knowledge base
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Documents: uploaded text awaiting or past extraction
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    filename TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    file_type TEXT NOT NULL DEFAULT 'txt',
    status TEXT NOT NULL DEFAULT 'uploaded',
    content_hash TEXT,
    processed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Requirements: extracted (re-derivable per document) or manual
CREATE TABLE IF NOT EXISTS requirements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    document_id INTEGER REFERENCES documents(id),
    requirement_number INTEGER NOT NULL,
    title TEXT NOT NULL,
    requirement_text TEXT NOT NULL,
    requirement_type TEXT NOT NULL DEFAULT 'functional',
    priority TEXT NOT NULL DEFAULT 'medium',
    confidence_score REAL,
    source TEXT NOT NULL DEFAULT 'extracted',
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Knowledge bases: one row per project, never deleted
CREATE TABLE IF NOT EXISTS knowledge_bases (
    project_id INTEGER PRIMARY KEY REFERENCES projects(id),
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    stage TEXT NOT NULL DEFAULT 'initializing',
    index_path TEXT,
    meta_path TEXT,
    total_chunks INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    documents_count INTEGER NOT NULL DEFAULT 0,
    job_id TEXT,
    last_error TEXT,
    conflict_state TEXT,
    last_built_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Conflicts: unordered requirement pairs reported by the analysis service
CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    requirement_id_1 INTEGER NOT NULL REFERENCES requirements(id),
    requirement_id_2 INTEGER NOT NULL REFERENCES requirements(id),
    severity TEXT NOT NULL DEFAULT 'medium',
    confidence TEXT,
    description TEXT NOT NULL,
    cluster_id TEXT,
    resolution_status TEXT NOT NULL DEFAULT 'pending',
    detected_at TEXT NOT NULL
);

-- Locks: named, TTL-bounded mutual exclusion
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Jobs: persisted scheduler queue
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    unique_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    run_at TEXT NOT NULL,
    locked_until TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id);
CREATE INDEX IF NOT EXISTS idx_requirements_project ON requirements(project_id);
CREATE INDEX IF NOT EXISTS idx_requirements_document ON requirements(document_id, source);
CREATE INDEX IF NOT EXISTS idx_conflicts_project ON conflicts(project_id);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);

-- At most one live job per unique key
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_key ON jobs(unique_key)
    WHERE status IN ('queued', 'running');
"#;
