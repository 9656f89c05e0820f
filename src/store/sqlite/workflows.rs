use super::{encode_ts, get_ts, SqliteStore};
use crate::error::Result;
use crate::store::WorkflowStore;
use crate::workflow::Workflow;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const WORKFLOW_COLUMNS: &str =
    "id, name, remote_id, input_component, output_component, created_at, updated_at";

fn map_workflow(row: &SqliteRow) -> Result<Workflow> {
    Ok(Workflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        remote_id: row.try_get("remote_id")?,
        input_component: row.try_get("input_component")?,
        output_component: row.try_get("output_component")?,
        created_at: get_ts(row, "workflow", "created_at")?,
        updated_at: get_ts(row, "workflow", "updated_at")?,
    })
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    /// Insert or update; the original created_at is kept on update
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, remote_id, input_component, output_component, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                remote_id = excluded.remote_id,
                input_component = excluded.input_component,
                output_component = excluded.output_component,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.remote_id)
        .bind(&workflow.input_component)
        .bind(&workflow.output_component)
        .bind(encode_ts(&workflow.created_at))
        .bind(encode_ts(&workflow.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflows WHERE id = $1", WORKFLOW_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_workflow).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflows ORDER BY updated_at DESC",
            WORKFLOW_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_workflow).collect()
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
