//! SQLite access for the query capabilities and the knowledge index.
//!
//! A single connection behind a mutex; independent sessions share the
//! handle, calls are serialized at the connection level and carry no
//! cross-session state.

use anyhow::{Context, Result};
use rusqlite::params;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// A knowledge document with its stored embedding.
#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("Failed to open database at {:?}", path.as_ref())
        })?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_knowledge_table()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_knowledge_table()?;
        Ok(db)
    }

    fn init_knowledge_table(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS knowledge_docs (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                added_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create knowledge_docs table")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Textual enumeration of user tables and their columns. System/catalog
    /// tables (`sqlite_*`) and the internal knowledge store are excluded.
    pub fn schema_summary(&self) -> Result<String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .context("Failed to query sqlite_master")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read table names")?;

        let mut sections = Vec::new();
        for table in tables {
            if table.starts_with("sqlite_") || table == "knowledge_docs" {
                continue;
            }
            let mut cols = conn
                .prepare(&format!("PRAGMA table_info({})", quote_identifier(&table)))
                .with_context(|| format!("Failed to inspect table '{}'", table))?;
            let columns: Vec<String> = cols
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let kind: String = row.get(2)?;
                    Ok(format!("{} ({})", name, kind))
                })?
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("Failed to read columns of '{}'", table))?;
            sections.push(format!("Table: {}\nColumns: {}", table, columns.join(", ")));
        }
        Ok(sections.join("\n\n"))
    }

    /// Execute a SELECT statement and return rows as field→value maps.
    ///
    /// The caller is responsible for the read-only prefix check; this
    /// method only runs what it is given.
    pub fn run_select(&self, query: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(query)
            .with_context(|| format!("Failed to prepare query: {}", query))?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut rows = stmt.query([]).context("Query execution failed")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("Failed to read result row")? {
            let mut record = serde_json::Map::new();
            for (idx, name) in column_names.iter().enumerate() {
                record.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    pub fn upsert_knowledge_doc(&self, id: &str, text: &str, embedding: &[f32]) -> Result<()> {
        let encoded = serde_json::to_string(embedding).context("Failed to encode embedding")?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO knowledge_docs (id, text, embedding, added_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET text = ?2, embedding = ?3, added_at = ?4",
            params![id, text, encoded, chrono::Utc::now().to_rfc3339()],
        )
        .context("Failed to upsert knowledge doc")?;
        Ok(())
    }

    pub fn list_knowledge_docs(&self) -> Result<Vec<KnowledgeDoc>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, text, embedding FROM knowledge_docs")
            .context("Failed to query knowledge docs")?;
        let docs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read knowledge docs")?;

        let mut out = Vec::with_capacity(docs.len());
        for (id, text, encoded) in docs {
            let embedding: Vec<f32> = serde_json::from_str(&encoded)
                .with_context(|| format!("Corrupt embedding for knowledge doc '{}'", id))?;
            out.push(KnowledgeDoc {
                id,
                text,
                embedding,
            });
        }
        Ok(out)
    }

    /// Create the demo company schema with sample rows, if absent.
    pub fn seed_demo_data(&self) -> Result<()> {
        let conn = self.lock();
        let already: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'departments'",
                [],
                |row| row.get(0),
            )
            .context("Failed to probe for demo schema")?;
        if already > 0 {
            return Ok(());
        }

        conn.execute_batch(
            "BEGIN;
             CREATE TABLE departments (id INTEGER PRIMARY KEY, name TEXT, budget REAL);
             CREATE TABLE employees (
                 id INTEGER PRIMARY KEY,
                 name TEXT,
                 dep_id INTEGER,
                 hire_date TEXT,
                 role TEXT,
                 FOREIGN KEY(dep_id) REFERENCES departments(id)
             );
             CREATE TABLE salaries (
                 emp_id INTEGER,
                 amount REAL,
                 updated_at TEXT,
                 FOREIGN KEY(emp_id) REFERENCES employees(id)
             );
             CREATE TABLE projects (id INTEGER PRIMARY KEY, title TEXT, status TEXT);
             CREATE TABLE project_assignments (emp_id INTEGER, project_id INTEGER, hours_spent INTEGER);

             INSERT INTO departments (name, budget) VALUES
                 ('IT', 500000), ('Sales', 300000), ('HR', 150000),
                 ('Marketing', 250000), ('Data Science', 450000);
             INSERT INTO employees (name, dep_id, hire_date, role) VALUES
                 ('Alex', 1, '2023-01-01', 'Senior'),
                 ('Maria', 5, '2023-02-15', 'Lead'),
                 ('Ivan', 5, '2023-03-01', 'Middle'),
                 ('Elena', 2, '2023-04-20', 'Manager'),
                 ('Petr', 3, '2023-05-05', 'Junior'),
                 ('Anna', 4, '2023-06-11', 'Middle');
             INSERT INTO salaries (emp_id, amount, updated_at) VALUES
                 (1, 130000, '2024-01-01'), (2, 145000, '2024-01-01'),
                 (3, 95000, '2024-01-01'), (4, 110000, '2024-01-01'),
                 (5, 52000, '2024-01-01'), (6, 87000, '2024-01-01');
             INSERT INTO projects (title, status) VALUES
                 ('AI Chatbot', 'Active'), ('Mobile App', 'Planning'),
                 ('Data Migration', 'Completed'), ('Cloud Setup', 'Active');
             INSERT INTO project_assignments (emp_id, project_id, hours_spent) VALUES
                 (1, 1, 120), (2, 1, 80), (3, 3, 64), (4, 2, 20), (6, 4, 45);
             COMMIT;",
        )
        .context("Failed to seed demo data")?;
        tracing::info!("Seeded demo company schema");
        Ok(())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(format!("<blob {} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.seed_demo_data().unwrap();
        db
    }

    #[test]
    fn schema_summary_lists_user_tables_only() {
        let db = demo_db();
        let summary = db.schema_summary().unwrap();
        assert!(summary.contains("Table: employees"));
        assert!(summary.contains("name (TEXT)"));
        assert!(!summary.contains("sqlite_"));
        assert!(!summary.contains("knowledge_docs"));
    }

    #[test]
    fn run_select_returns_named_fields() {
        let db = demo_db();
        let rows = db
            .run_select("SELECT name, budget FROM departments ORDER BY id LIMIT 2")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "IT");
        assert_eq!(rows[0]["budget"], 500000.0);
    }

    #[test]
    fn run_select_propagates_sql_errors() {
        let db = demo_db();
        assert!(db.run_select("SELECT nope FROM missing").is_err());
    }

    #[test]
    fn seeding_twice_is_a_no_op() {
        let db = demo_db();
        db.seed_demo_data().unwrap();
        let rows = db.run_select("SELECT COUNT(*) AS n FROM departments").unwrap();
        assert_eq!(rows[0]["n"], 5);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("querydesk.db");
        {
            let db = Database::new(&path).unwrap();
            db.seed_demo_data().unwrap();
            db.upsert_knowledge_doc("d1", "note", &[0.5]).unwrap();
        }
        let db = Database::new(&path).unwrap();
        let rows = db.run_select("SELECT COUNT(*) AS n FROM employees").unwrap();
        assert_eq!(rows[0]["n"], 6);
        assert_eq!(db.list_knowledge_docs().unwrap().len(), 1);
    }

    #[test]
    fn knowledge_docs_roundtrip() {
        let db = demo_db();
        db.upsert_knowledge_doc("d1", "dep_id joins employees to departments", &[0.1, 0.2])
            .unwrap();
        db.upsert_knowledge_doc("d1", "updated text", &[0.3, 0.4])
            .unwrap();
        let docs = db.list_knowledge_docs().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "updated text");
        assert_eq!(docs[0].embedding, vec![0.3, 0.4]);
    }
}
