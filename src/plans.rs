//! SQL for every state transition, parameterized by schema name.
//!
//! Nothing in here talks to the database; [`PgStore`](crate::PgStore) binds
//! the parameters and executes the statements. The schema name is validated
//! by [`BossConfig::validate`](crate::BossConfig::validate) before it is ever
//! interpolated.

use crate::schema::{COMPLETED_JOB_SUFFIX, STATE_JOB_DELIMITER};

/// Version recorded in `<schema>.version` by [`create`].
pub const SCHEMA_VERSION: i32 = 1;

/// Column list of the job table, in [`Job`](crate::Job) field order.
const JOB_COLUMNS: &str = "id, name, priority, data, state, retry_limit, retry_count, start_after, \
     started_on, singleton_key, singleton_on, expire_in_seconds, created_on, completed_on";

/// Column list for reading a [`Job`](crate::Job) row. `state` is read as text
/// so the enum does not need to be registered with the driver.
fn select_job_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|column| match column {
            "state" => format!("{alias}state::text AS state"),
            other => format!("{alias}{other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statements that create the schema, in execution order.
pub fn create(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        "CREATE EXTENSION IF NOT EXISTS pgcrypto".to_owned(),
        format!(
            "CREATE TABLE {schema}.version (
              version integer PRIMARY KEY,
              maintained_on timestamp with time zone
            )"
        ),
        // Declaration order defines the comparison order used below.
        format!(
            "CREATE TYPE {schema}.job_state AS ENUM (
              'created', 'retry', 'active', 'complete', 'expired', 'cancelled', 'failed'
            )"
        ),
        format!(
            "CREATE TABLE {schema}.job (
              id uuid PRIMARY KEY NOT NULL DEFAULT gen_random_uuid(),
              name text NOT NULL,
              priority integer NOT NULL DEFAULT 0,
              data jsonb,
              state {schema}.job_state NOT NULL DEFAULT 'created',
              retry_limit integer NOT NULL DEFAULT 0,
              retry_count integer NOT NULL DEFAULT 0,
              start_after timestamp with time zone NOT NULL DEFAULT now(),
              started_on timestamp with time zone,
              singleton_key text,
              singleton_on timestamp without time zone,
              expire_in_seconds integer NOT NULL DEFAULT 900,
              created_on timestamp with time zone NOT NULL DEFAULT now(),
              completed_on timestamp with time zone
            )"
        ),
        format!("CREATE TABLE {schema}.archive (LIKE {schema}.job)"),
        format!(
            "ALTER TABLE {schema}.archive ADD archived_on timestamp with time zone NOT NULL DEFAULT now()"
        ),
        format!("CREATE INDEX archive_archived_on_idx ON {schema}.archive (archived_on)"),
        format!("CREATE INDEX archive_id_idx ON {schema}.archive (id)"),
        format!(
            "CREATE INDEX job_fetch ON {schema}.job (name, priority DESC, created_on, id) WHERE state < 'active'"
        ),
        // A key alone: one queued or active job per key.
        format!(
            "CREATE UNIQUE INDEX job_singleton_key ON {schema}.job (name, singleton_key)
              WHERE state < 'complete' AND singleton_on IS NULL"
        ),
        // A window alone: one job per window, queued, active or completed.
        format!(
            "CREATE UNIQUE INDEX job_singleton_on ON {schema}.job (name, singleton_on)
              WHERE state < 'expired' AND singleton_key IS NULL"
        ),
        // Both: one job per key per window, queued, active or completed.
        format!(
            "CREATE UNIQUE INDEX job_singleton_key_on ON {schema}.job (name, singleton_on, singleton_key)
              WHERE state < 'expired'"
        ),
        format!("INSERT INTO {schema}.version (version) VALUES ({SCHEMA_VERSION})"),
    ]
}

/// Takes a transaction-scoped advisory lock so that concurrent installs serialize.
pub fn lock_install(schema: &str) -> String {
    format!("SELECT pg_advisory_xact_lock(hashtext('{schema}.install'))")
}

/// Returns the name of the version table, or `NULL` when the schema is not installed.
pub fn version_table_exists(schema: &str) -> String {
    format!("SELECT to_regclass('{schema}.version')::text")
}

/// Returns the installed schema version.
pub fn get_version(schema: &str) -> String {
    format!("SELECT version FROM {schema}.version")
}

/// Records when maintenance last ran.
pub fn set_maintenance_time(schema: &str) -> String {
    format!("UPDATE {schema}.version SET maintained_on = now()")
}

/// Inserts a job, or does nothing when a singleton constraint rejects it.
///
/// `$1` id, `$2` name, `$3` priority, `$4` retry limit, `$5` absolute start
/// (nullable), `$6` start delay in seconds, `$7` expire in seconds, `$8` data,
/// `$9` singleton key, `$10` singleton window seconds (nullable), `$11`
/// singleton offset seconds.
pub fn insert_job(schema: &str) -> String {
    format!(
        "INSERT INTO {schema}.job (
          id, name, priority, state, retry_limit, start_after, expire_in_seconds, data, singleton_key, singleton_on
        )
        VALUES (
          $1, $2, $3, 'created', $4,
          COALESCE($5::timestamptz, now() + $6::float8 * interval '1 second'),
          $7, $8, $9,
          CASE WHEN $10::integer IS NOT NULL
            THEN 'epoch'::timestamp + '1 second'::interval * ($10 * floor((floor(date_part('epoch', now())) + $11::integer) / $10))
            ELSE NULL
          END
        )
        ON CONFLICT DO NOTHING"
    )
}

/// Claims up to `$2` eligible jobs named in `$1` and returns them in claim order.
///
/// `SKIP LOCKED` makes concurrent claims pass over rows another transaction
/// is already claiming instead of blocking on them or claiming them twice.
pub fn fetch_next_job(schema: &str) -> String {
    let returning = select_job_columns("j.");
    let columns = select_job_columns("");
    format!(
        "WITH next_job AS (
          SELECT id
          FROM {schema}.job
          WHERE state < 'active'
            AND name = ANY($1)
            AND start_after < now()
          ORDER BY priority DESC, created_on, id
          LIMIT $2
          FOR UPDATE SKIP LOCKED
        ),
        claimed AS (
          UPDATE {schema}.job j SET
            state = 'active',
            started_on = now(),
            retry_count = CASE WHEN j.state = 'retry' THEN j.retry_count + 1 ELSE j.retry_count END
          FROM next_job
          WHERE j.id = next_job.id
          RETURNING {returning}
        )
        SELECT {columns}
        FROM claimed
        ORDER BY priority DESC, created_on, id"
    )
}

/// Builds the completion record insert for the rows of `source`.
fn insert_completion_jobs(schema: &str, source: &str, response: &str, filter: &str) -> String {
    format!(
        "INSERT INTO {schema}.job (name, data)
          SELECT
            name || '{COMPLETED_JOB_SUFFIX}',
            jsonb_build_object(
              'request', jsonb_build_object('id', id, 'name', name, 'data', data),
              'response', {response},
              'state', state
            )
          FROM {source}
          WHERE {filter}
            AND strpos(name, '{STATE_JOB_DELIMITER}') = 0"
    )
}

/// Completes the active jobs in `$1` with response `$2` and returns how many changed.
pub fn complete_jobs(schema: &str) -> String {
    let completions = insert_completion_jobs(schema, "results", "$2::jsonb", "true");
    format!(
        "WITH results AS (
          UPDATE {schema}.job
          SET completed_on = now(),
            state = 'complete'
          WHERE id = ANY($1)
            AND state = 'active'
          RETURNING *
        ),
        completions AS (
          {completions}
        )
        SELECT COUNT(*) FROM results"
    )
}

/// Fails the unfinished jobs in `$1` with response `$2` and returns how many changed.
///
/// Jobs with retries left go back to `retry`; the rest end in `failed` and
/// get a completion record.
pub fn fail_jobs(schema: &str) -> String {
    let completions = insert_completion_jobs(schema, "results", "$2::jsonb", "state = 'failed'");
    format!(
        "WITH results AS (
          UPDATE {schema}.job
          SET state = CASE WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state ELSE 'failed'::{schema}.job_state END,
            completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END
          WHERE id = ANY($1)
            AND state < 'complete'
          RETURNING *
        ),
        completions AS (
          {completions}
        )
        SELECT COUNT(*) FROM results"
    )
}

/// Cancels the unfinished jobs in `$1`.
pub fn cancel_jobs(schema: &str) -> String {
    format!(
        "UPDATE {schema}.job
        SET completed_on = now(),
          state = 'cancelled'
        WHERE id = ANY($1)
          AND state < 'complete'"
    )
}

/// Moves stuck active jobs to `retry` or `expired` and returns both counts.
pub fn expire(schema: &str) -> String {
    let completions = insert_completion_jobs(schema, "results", "NULL", "state = 'expired'");
    format!(
        "WITH results AS (
          UPDATE {schema}.job
          SET state = CASE WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state ELSE 'expired'::{schema}.job_state END,
            completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END
          WHERE state = 'active'
            AND started_on + expire_in_seconds * interval '1 second' < now()
          RETURNING *
        ),
        completions AS (
          {completions}
        )
        SELECT
          COUNT(*) FILTER (WHERE state = 'retry') AS retried,
          COUNT(*) FILTER (WHERE state = 'expired') AS expired
        FROM results"
    )
}

/// Moves jobs finished more than `$1` seconds ago, and unconsumed completion
/// records older than that, into the archive.
pub fn archive(schema: &str) -> String {
    format!(
        "WITH archived_rows AS (
          DELETE FROM {schema}.job
          WHERE completed_on + $1::float8 * interval '1 second' < now()
            OR (
              state = 'created'
              AND strpos(name, '{STATE_JOB_DELIMITER}') > 0
              AND created_on + $1::float8 * interval '1 second' < now()
            )
          RETURNING *
        )
        INSERT INTO {schema}.archive ({JOB_COLUMNS})
        SELECT {JOB_COLUMNS}
        FROM archived_rows"
    )
}

/// Deletes archive rows archived more than `$1` seconds ago.
pub fn purge(schema: &str) -> String {
    format!(
        "DELETE FROM {schema}.archive
        WHERE archived_on + $1::float8 * interval '1 second' < now()"
    )
}

/// Deletes the queued jobs of queue `$1`.
pub fn delete_queue(schema: &str) -> String {
    format!("DELETE FROM {schema}.job WHERE name = $1 AND state < 'active'")
}

/// Deletes the queued jobs of every queue.
pub fn delete_all_queues(schema: &str) -> String {
    format!("DELETE FROM {schema}.job WHERE state < 'active'")
}

/// Counts jobs per queue and state, with `NULL` rows for the rollup totals.
pub fn count_states(schema: &str) -> String {
    format!(
        "SELECT name, state::text AS state, COUNT(*) AS size
        FROM {schema}.job
        WHERE strpos(name, '{STATE_JOB_DELIMITER}') = 0
        GROUP BY ROLLUP(name), ROLLUP(state)"
    )
}

/// Loads one job by id.
pub fn get_job_by_id(schema: &str) -> String {
    let columns = select_job_columns("");
    format!("SELECT {columns} FROM {schema}.job WHERE id = $1")
}

/// Loads one archived job by id.
pub fn get_archived_job_by_id(schema: &str) -> String {
    let columns = select_job_columns("");
    format!(
        "SELECT {columns}, archived_on FROM {schema}.archive WHERE id = $1 ORDER BY archived_on DESC LIMIT 1"
    )
}

/// Lists archived jobs, newest first, optionally filtered by queue `$1` and
/// limited to `$2` rows.
pub fn get_archived_jobs(schema: &str) -> String {
    let columns = select_job_columns("");
    format!(
        "SELECT {columns}, archived_on
        FROM {schema}.archive
        WHERE ($1::text IS NULL OR name = $1)
        ORDER BY archived_on DESC
        LIMIT $2"
    )
}

/// Counts archived jobs.
pub fn archived_job_count(schema: &str) -> String {
    format!("SELECT COUNT(*) FROM {schema}.archive")
}
