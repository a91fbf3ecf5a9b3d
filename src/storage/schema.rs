//! Database schema constants.
//!
//! Every statement is idempotent so migrations can be replayed safely.

/// Jobs table. `pipeline` holds the serialized `PipelineKind`,
/// `pipeline_name` its short name for filtering.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id VARCHAR(64) PRIMARY KEY,
    status VARCHAR(32) NOT NULL,
    pipeline JSONB NOT NULL,
    pipeline_name VARCHAR(32) NOT NULL,
    config JSONB NOT NULL DEFAULT '{}'::jsonb,
    input_locator TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    task_handle VARCHAR(64),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Artifacts produced by stages. Deleted with their job.
pub const CREATE_JOB_ARTIFACTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_artifacts (
    id UUID PRIMARY KEY,
    job_id VARCHAR(64) NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    kind VARCHAR(32) NOT NULL,
    locator TEXT NOT NULL,
    size_bytes BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Scalar metrics. Deleted with their job.
pub const CREATE_JOB_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_metrics (
    id UUID PRIMARY KEY,
    job_id VARCHAR(64) NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL,
    value DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)";

pub const CREATE_JOBS_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC)";

pub const CREATE_ARTIFACTS_JOB_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_job_artifacts_job_id ON job_artifacts(job_id)";

pub const CREATE_METRICS_JOB_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_job_metrics_job_id ON job_metrics(job_id)";

/// A named schema change. Names are recorded once applied and must never
/// be reused for different SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every migration in dependency order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_create_jobs",
        sql: CREATE_JOBS_TABLE,
    },
    Migration {
        name: "0002_create_job_artifacts",
        sql: CREATE_JOB_ARTIFACTS_TABLE,
    },
    Migration {
        name: "0003_create_job_metrics",
        sql: CREATE_JOB_METRICS_TABLE,
    },
    Migration {
        name: "0004_index_jobs_status",
        sql: CREATE_JOBS_STATUS_INDEX,
    },
    Migration {
        name: "0005_index_jobs_created_at",
        sql: CREATE_JOBS_CREATED_AT_INDEX,
    },
    Migration {
        name: "0006_index_artifacts_job",
        sql: CREATE_ARTIFACTS_JOB_INDEX,
    },
    Migration {
        name: "0007_index_metrics_job",
        sql: CREATE_METRICS_JOB_INDEX,
    },
];
