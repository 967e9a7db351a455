//! SQLite persistence for normalized analysis results.

use crate::session::ItemKey;
use page_analysis_types::*;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};

/// Persistence collaborator used by the runner. Called on a blocking thread.
pub trait AnalysisStore: Send + Sync {
    fn store(&self, key: &ItemKey, context: &PageContext, result: &ItemResult)
    -> Result<i64, String>;
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS page_analysis_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                item_index INTEGER NOT NULL,
                page_name TEXT NOT NULL,
                page_url TEXT,
                page_description TEXT NOT NULL DEFAULT '',
                raw_analysis_json TEXT,
                confidence_score REAL NOT NULL DEFAULT 0,
                elements_count INTEGER NOT NULL DEFAULT 0,
                parse_mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, item_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS page_elements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                page_analysis_id INTEGER NOT NULL,
                element_name TEXT NOT NULL,
                element_type TEXT NOT NULL,
                element_description TEXT NOT NULL,
                element_data TEXT,
                confidence_score REAL,
                FOREIGN KEY (page_analysis_id) REFERENCES page_analysis_results(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS test_scenario_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                item_index INTEGER NOT NULL,
                test_description TEXT NOT NULL DEFAULT '',
                scenarios_json TEXT NOT NULL,
                summary_json TEXT NOT NULL,
                confidence_score REAL NOT NULL DEFAULT 0,
                degraded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, item_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS test_script_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                item_index INTEGER NOT NULL,
                format TEXT NOT NULL,
                file_name TEXT NOT NULL,
                content TEXT NOT NULL,
                scenario_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, item_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pages_created ON page_analysis_results(created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_elements_page ON page_elements(page_analysis_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_elements_type ON page_elements(element_type)",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Writes
    // =====================================================

    /// Insert a page record and its elements in one transaction
    pub fn insert_page_analysis(
        &self,
        key: &ItemKey,
        context: &PageContext,
        record: &AnalysisRecord,
    ) -> SqliteResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();

        let page_name = context
            .page_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&record.title);
        let raw_json = serde_json::to_string(&record.raw_source).ok();
        let parse_mode = serde_json::to_value(record.parse_mode)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();

        tx.execute(
            "INSERT OR REPLACE INTO page_analysis_results
                (session_id, item_index, page_name, page_url, page_description, raw_analysis_json,
                 confidence_score, elements_count, parse_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                key.session_id,
                key.index as i64,
                page_name,
                context.page_url,
                record.description,
                raw_json,
                record.confidence,
                record.elements.len() as i64,
                parse_mode,
                now,
            ],
        )?;
        let page_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO page_elements
                    (page_analysis_id, element_name, element_type, element_description, element_data, confidence_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for element in &record.elements {
                let data = serde_json::to_string(element).ok();
                stmt.execute(rusqlite::params![
                    page_id,
                    element.name,
                    element.element_type,
                    element.description,
                    data,
                    element.confidence_score,
                ])?;
            }
        }

        tx.commit()?;
        Ok(page_id)
    }

    pub fn insert_scenario_set(
        &self,
        key: &ItemKey,
        context: &PageContext,
        set: &ScenarioSet,
    ) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().to_rfc3339();
        let scenarios_json = serde_json::to_string(&set.scenarios).unwrap_or_else(|_| "[]".into());
        let summary_json = serde_json::to_string(&set.summary).unwrap_or_else(|_| "{}".into());

        conn.execute(
            "INSERT OR REPLACE INTO test_scenario_results
                (session_id, item_index, test_description, scenarios_json, summary_json,
                 confidence_score, degraded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                key.session_id,
                key.index as i64,
                context.test_description.as_deref().unwrap_or_default(),
                scenarios_json,
                summary_json,
                set.confidence,
                set.degraded,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_script(
        &self,
        key: &ItemKey,
        script: &GeneratedScript,
    ) -> SqliteResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO test_script_results
                (session_id, item_index, format, file_name, content, scenario_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                key.session_id,
                key.index as i64,
                script.format,
                script.file_name,
                script.content,
                script.scenario_count as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_page(&self, id: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM page_analysis_results WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // =====================================================
    // Reads
    // =====================================================

    /// Newest first, optional substring match on name or description
    pub fn list_pages(
        &self,
        page: usize,
        page_size: usize,
        search: Option<&str>,
    ) -> SqliteResult<(Vec<PageAnalysisRow>, usize)> {
        let conn = self.conn.lock();
        let pattern = search
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));
        let offset = page.saturating_sub(1) * page_size;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM page_analysis_results
             WHERE ?1 IS NULL OR page_name LIKE ?1 OR page_description LIKE ?1",
            [&pattern],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, session_id, item_index, page_name, page_url, page_description,
                    confidence_score, elements_count, parse_mode, created_at
             FROM page_analysis_results
             WHERE ?1 IS NULL OR page_name LIKE ?1 OR page_description LIKE ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![pattern, page_size as i64, offset as i64],
                row_to_page,
            )?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok((rows, total as usize))
    }

    pub fn get_page(&self, id: i64) -> SqliteResult<Option<PageAnalysisDetail>> {
        let conn = self.conn.lock();

        let found = conn
            .query_row(
                "SELECT id, session_id, item_index, page_name, page_url, page_description,
                        confidence_score, elements_count, parse_mode, created_at, raw_analysis_json
                 FROM page_analysis_results WHERE id = ?1",
                [id],
                |row| Ok((row_to_page(row)?, row.get::<_, Option<String>>(10)?)),
            )
            .optional()?;

        let (page, raw_analysis_json) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        let elements = elements_of(&conn, id)?;

        Ok(Some(PageAnalysisDetail {
            page,
            raw_analysis_json,
            elements,
        }))
    }

    /// Elements of one page, or `None` if the page does not exist
    pub fn page_elements(&self, id: i64) -> SqliteResult<Option<Vec<PageElementRow>>> {
        let conn = self.conn.lock();
        let exists = conn
            .query_row(
                "SELECT 1 FROM page_analysis_results WHERE id = ?1",
                [id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(None);
        }
        elements_of(&conn, id).map(Some)
    }

    // =====================================================
    // Knowledge base
    // =====================================================

    pub fn knowledge_summary(&self) -> SqliteResult<KnowledgeBaseSummary> {
        let conn = self.conn.lock();

        let (total_pages, average_confidence): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(confidence_score), 0) FROM page_analysis_results",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_elements: i64 =
            conn.query_row("SELECT COUNT(*) FROM page_elements", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT element_type, COUNT(*) AS n FROM page_elements
             WHERE element_type != ''
             GROUP BY element_type
             ORDER BY n DESC, element_type",
        )?;
        let element_types = stmt
            .query_map([], |row| {
                Ok(ElementTypeCount {
                    element_type: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(KnowledgeBaseSummary {
            total_pages: total_pages as usize,
            total_elements: total_elements as usize,
            average_confidence,
            element_types,
        })
    }

    /// Pages matching any keyword in name or description, most confident first
    pub fn search_by_keywords(
        &self,
        keywords: &[String],
        limit: usize,
    ) -> SqliteResult<Vec<PageAnalysisRow>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();

        let clauses: Vec<String> = (1..=keywords.len())
            .map(|n| format!("page_name LIKE ?{n} OR page_description LIKE ?{n}"))
            .collect();
        let sql = format!(
            "SELECT id, session_id, item_index, page_name, page_url, page_description,
                    confidence_score, elements_count, parse_mode, created_at
             FROM page_analysis_results
             WHERE {}
             ORDER BY confidence_score DESC, created_at DESC, id DESC
             LIMIT {}",
            clauses.join(" OR "),
            limit
        );

        let patterns: Vec<String> = keywords.iter().map(|k| format!("%{}%", k)).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(patterns.iter()), row_to_page)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Stored elements whose type contains `element_type`
    pub fn elements_by_type(
        &self,
        element_type: &str,
        limit: usize,
    ) -> SqliteResult<Vec<PageElementRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, page_analysis_id, element_name, element_type, element_description,
                    element_data, confidence_score
             FROM page_elements
             WHERE element_type LIKE ?1
             ORDER BY COALESCE(confidence_score, 0) DESC, id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![format!("%{}%", element_type), limit as i64],
                row_to_element,
            )?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn count_scripts(&self, session_id: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_script_results WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    #[cfg(test)]
    pub fn count_scenario_results(&self, session_id: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_scenario_results WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn elements_of(conn: &Connection, page_id: i64) -> SqliteResult<Vec<PageElementRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, page_analysis_id, element_name, element_type, element_description,
                element_data, confidence_score
         FROM page_elements WHERE page_analysis_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([page_id], row_to_element)?
        .collect::<SqliteResult<Vec<_>>>()?;
    Ok(rows)
}

fn row_to_element(row: &rusqlite::Row) -> SqliteResult<PageElementRow> {
    Ok(PageElementRow {
        id: row.get(0)?,
        page_analysis_id: row.get(1)?,
        element_name: row.get(2)?,
        element_type: row.get(3)?,
        element_description: row.get(4)?,
        element_data: row.get(5)?,
        confidence_score: row.get(6)?,
    })
}

fn row_to_page(row: &rusqlite::Row) -> SqliteResult<PageAnalysisRow> {
    Ok(PageAnalysisRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        item_index: row.get(2)?,
        page_name: row.get(3)?,
        page_url: row.get(4)?,
        page_description: row.get(5)?,
        confidence_score: row.get(6)?,
        elements_count: row.get(7)?,
        parse_mode: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl AnalysisStore for Db {
    fn store(
        &self,
        key: &ItemKey,
        context: &PageContext,
        result: &ItemResult,
    ) -> Result<i64, String> {
        let stored = match result {
            ItemResult::Page(record) => self.insert_page_analysis(key, context, record),
            ItemResult::Scenarios(set) => self.insert_scenario_set(key, context, set),
            ItemResult::Script(script) => self.insert_script(key, script),
        };
        stored.map_err(|e| format!("Failed to store {}: {}", key, e))
    }
}
