use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tasklane_types::{Task, TaskImage};

use crate::db::Database;
use crate::error::{is_foreign_key_violation, StoreError, StoreResult};
use crate::isolation::IsolationLevel;

const TASK_COLUMNS: &str = "id, owner_id, label, done, image_url, image_metadata";

/// Task rows, always scoped to their owner.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    db: Database,
}

impl TaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Owner's tasks, most recently created first.
    pub fn list(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![owner_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    /// The owner must already be provisioned; otherwise this fails with
    /// `StoreError::UnknownOwner`.
    pub fn insert(&self, task: &Task) -> StoreResult<()> {
        let conn = self.db.connect()?;
        let (image_url, image_metadata) = match &task.image {
            Some(image) if image.metadata.is_null() => (Some(image.url.as_str()), None),
            Some(image) => (
                Some(image.url.as_str()),
                Some(serde_json::to_string(&image.metadata)?),
            ),
            None => (None, None),
        };
        let inserted = conn.execute(
            "INSERT INTO tasks (id, owner_id, label, done, image_url, image_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.id,
                task.owner_id,
                task.label,
                task.done,
                image_url,
                image_metadata,
                Utc::now().timestamp_millis(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_foreign_key_violation(&err) => {
                Err(StoreError::UnknownOwner(task.owner_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the updated row, or `None` if the owner has no such task.
    pub fn set_done(&self, owner_id: &str, task_id: &str, done: bool) -> StoreResult<Option<Task>> {
        let mut conn = self.db.connect()?;
        let tx = Database::begin(&mut conn, IsolationLevel::Serializable)?;
        let changed = tx.execute(
            "UPDATE tasks SET done = ?1 WHERE id = ?2 AND owner_id = ?3",
            params![done, task_id, owner_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let task = fetch(&tx, owner_id, task_id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Deletes and returns the row, or `None` if the owner has no such task.
    pub fn delete(&self, owner_id: &str, task_id: &str) -> StoreResult<Option<Task>> {
        let mut conn = self.db.connect()?;
        let tx = Database::begin(&mut conn, IsolationLevel::Serializable)?;
        let Some(task) = fetch(&tx, owner_id, task_id)? else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM tasks WHERE id = ?1 AND owner_id = ?2",
            params![task_id, owner_id],
        )?;
        tx.commit()?;
        Ok(Some(task))
    }
}

fn fetch(conn: &Connection, owner_id: &str, task_id: &str) -> StoreResult<Option<Task>> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND owner_id = ?2"),
            params![task_id, owner_id],
            row_to_task,
        )
        .optional()?;
    row.transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<StoreResult<Task>> {
    let image_url: Option<String> = row.get(4)?;
    let image_metadata: Option<String> = row.get(5)?;
    let image = match image_url {
        Some(url) => {
            let metadata = match image_metadata {
                Some(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => value,
                    Err(err) => return Ok(Err(err.into())),
                },
                None => Value::Null,
            };
            Some(TaskImage { url, metadata })
        }
        None => None,
    };
    Ok(Ok(Task {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        label: row.get(2)?,
        done: row.get(3)?,
        image,
    }))
}
