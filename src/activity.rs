use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::Database;
use crate::error::MapMarkError;

/// Most visitor groups returned by `visitor_summaries`.
pub const MAX_VISITOR_GROUPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    CreateMarker,
    UpdateMarker,
    DeleteMarker,
    UploadImage,
    DeleteImage,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreateMarker => "create_marker",
            ActionType::UpdateMarker => "update_marker",
            ActionType::DeleteMarker => "delete_marker",
            ActionType::UploadImage => "upload_image",
            ActionType::DeleteImage => "delete_image",
        }
    }
}

/// Who a visit or action came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Client {
    pub ip: String,
    pub user_agent: String,
}

pub fn record_visit(db: &Database, client: &Client, path: &str, referer: &str) -> Result<(), MapMarkError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO visits (ip, user_agent, path, referer) VALUES (?, ?, ?, ?)",
        params![client.ip, client.user_agent, path, referer],
    )?;
    Ok(())
}

pub fn record_action(
    db: &Database,
    client: &Client,
    action: ActionType,
    detail: &str,
    target_id: &str,
) -> Result<(), MapMarkError> {
    let conn = db.conn()?;
    conn.execute(
        "INSERT INTO user_actions (ip, user_agent, action_type, action_detail, target_id)
         VALUES (?, ?, ?, ?, ?)",
        params![client.ip, client.user_agent, action.as_str(), detail, target_id],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionEntry {
    #[serde(rename = "type")]
    pub action_type: String,
    pub detail: String,
    pub target: String,
    pub time: String,
}

/// Aggregated activity of one (ip, user agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSummary {
    pub ip: String,
    pub user_agent: String,
    pub visit_count: i64,
    pub first_visit: String,
    pub last_visit: String,
    pub paths: BTreeSet<String>,
    pub referers: BTreeSet<String>,
    pub actions: Vec<ActionEntry>,
}

type ClientKey = (String, String);

/// Groups visits by (ip, user agent), most recently active first, and
/// attaches the actions recorded for the same pair (newest first).
pub fn visitor_summaries(db: &Database, limit: usize) -> Result<Vec<VisitorSummary>, MapMarkError> {
    let conn = db.conn()?;

    let mut summaries = load_visit_groups(&conn, limit)?;
    let index: HashMap<ClientKey, usize> = summaries
        .iter()
        .enumerate()
        .map(|(i, s)| ((s.ip.clone(), s.user_agent.clone()), i))
        .collect();

    fill_paths_and_referers(&conn, &mut summaries, &index)?;
    fill_actions(&conn, &mut summaries, &index)?;

    Ok(summaries)
}

fn load_visit_groups(conn: &Connection, limit: usize) -> Result<Vec<VisitorSummary>, MapMarkError> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(ip, ''), COALESCE(user_agent, ''), COUNT(*),
                CAST(MIN(visit_time) AS TEXT), CAST(MAX(visit_time) AS TEXT)
         FROM visits
         GROUP BY COALESCE(ip, ''), COALESCE(user_agent, '')
         ORDER BY MAX(visit_time) DESC, MAX(id) DESC
         LIMIT ?",
    )?;

    let groups = stmt
        .query_map([limit as i64], |row| {
            Ok(VisitorSummary {
                ip: row.get(0)?,
                user_agent: row.get(1)?,
                visit_count: row.get(2)?,
                first_visit: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                last_visit: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                paths: BTreeSet::new(),
                referers: BTreeSet::new(),
                actions: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(groups)
}

fn fill_paths_and_referers(
    conn: &Connection,
    summaries: &mut [VisitorSummary],
    index: &HashMap<ClientKey, usize>,
) -> Result<(), MapMarkError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT COALESCE(ip, ''), COALESCE(user_agent, ''),
                COALESCE(path, ''), COALESCE(referer, '')
         FROM visits",
    )?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let key: ClientKey = (row.get(0)?, row.get(1)?);
        let Some(&i) = index.get(&key) else {
            continue;
        };

        let path: String = row.get(2)?;
        let referer: String = row.get(3)?;
        if !path.is_empty() {
            summaries[i].paths.insert(path);
        }
        if !referer.is_empty() {
            summaries[i].referers.insert(referer);
        }
    }

    Ok(())
}

fn fill_actions(
    conn: &Connection,
    summaries: &mut [VisitorSummary],
    index: &HashMap<ClientKey, usize>,
) -> Result<(), MapMarkError> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(ip, ''), COALESCE(user_agent, ''),
                COALESCE(action_type, ''), COALESCE(action_detail, ''),
                COALESCE(target_id, ''), COALESCE(CAST(action_time AS TEXT), '')
         FROM user_actions
         ORDER BY action_time DESC, id DESC",
    )?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let key: ClientKey = (row.get(0)?, row.get(1)?);
        let Some(&i) = index.get(&key) else {
            continue;
        };

        summaries[i].actions.push(ActionEntry {
            action_type: row.get(2)?,
            detail: row.get(3)?,
            target: row.get(4)?,
            time: row.get(5)?,
        });
    }

    Ok(())
}
