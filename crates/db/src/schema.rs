use sqlx::SqlitePool;
use tidemark_common::error::{TidemarkError, TidemarkResult};

/// Idempotent schema bootstrap. A full migration runner is overkill for three
/// tables; every statement is `if not exists`.
pub async fn ensure_schema(pool: &SqlitePool) -> TidemarkResult<()> {
    for ddl in [SYNC_STATE_DDL, OBJECT_VALUE_DDL, PROJECT_DDL] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| TidemarkError::Database(e.to_string()))?;
    }
    Ok(())
}

const SYNC_STATE_DDL: &str = "
create table if not exists sync_state (
  entity          text primary key,
  phase           text not null,
  cursor          text,
  started_at      text not null,
  as_of           text not null,
  subscription_id integer
)";

const OBJECT_VALUE_DDL: &str = "
create table if not exists object_value (
  id           integer primary key autoincrement,
  remote_db_id integer not null unique,
  code         text
)";

const PROJECT_DDL: &str = "
create table if not exists project (
  id           integer primary key autoincrement,
  remote_db_id integer not null unique,

  main_project_id integer references project(id),
  xgl_id          integer references object_value(id),
  gl_object1_id   integer references object_value(id),
  gl_object2_id   integer references object_value(id),
  gl_object3_id   integer references object_value(id),
  gl_object4_id   integer references object_value(id),
  gl_object5_id   integer references object_value(id),

  code                    text,
  description             text,
  text                    text,
  email                   text,
  your_reference          text,
  ext_identifier          text,
  ext_order               text,
  contract                text,
  overview                text,
  invoice_header          text,
  invoice_footer          text,
  short_info              text,
  short_internal_info     text,
  from_date               text,
  to_date                 text,
  total_revenue           text,
  yearly_revenue          text,
  contracted_revenue      text,
  total_cost              text,
  yearly_cost             text,
  pct_completed           real,
  total_estimate_hours    real,
  yearly_estimate_hours   real,
  budget_coverage_percent real,
  external                integer,
  billable                integer,
  fixed_client            integer,
  allow_posting           integer,
  timesheet_entry         integer,
  access_control          integer,
  assignment              integer,
  activity                integer,
  expense_ledger          integer,
  fund_project            integer,
  created_at              text,
  modified_at             text,
  progress_date           text
)";
