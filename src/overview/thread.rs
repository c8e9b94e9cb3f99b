//! Thread assignment, rebuild, and tree view (§4.3).
//!
//! The root is always an *older* article than any of its descendants, so the
//! thread graph is acyclic by construction — no arena of pointers is needed,
//! just `(group, article_num)` integer keys (§9).

use rusqlite::{params, Connection};

use crate::error::StorageError;
use crate::storage::shard::{ArticleRow, GroupShard, ThreadRow};

/// Parse a `References:` header value into an ordered list of message-ids,
/// outermost (oldest) ancestor first, exactly as it appears on the wire.
pub fn parse_references(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .filter(|s| s.starts_with('<') && s.ends_with('>'))
        .map(|s| s.to_string())
        .collect()
}

/// Assign `(root, parent, child, depth, order)` for a freshly inserted
/// article, using the already-open connection (so this composes inside a
/// batch-writer transaction). Walks `references` from the most recent back;
/// the first one already present in this group becomes the parent.
pub fn assign_thread(
    conn: &Connection,
    article_num: i64,
    references: &[String],
) -> Result<ThreadRow, StorageError> {
    let parent_num = references
        .iter()
        .rev()
        .find_map(|msgid| lookup_article_num(conn, msgid).transpose())
        .transpose()?;

    let row = match parent_num {
        Some(parent_num) => {
            let parent_thread = thread_row_for_child(conn, parent_num)?;
            let (root, depth) = match parent_thread {
                Some(p) => (p.root_article, p.depth + 1),
                // Parent exists as an article but has no thread row yet
                // (shouldn't happen in insert-order processing, but fall
                // back to treating the parent as its own root).
                None => (parent_num, 1),
            };
            let order = next_thread_order(conn, root)?;
            ThreadRow {
                root_article: root,
                parent_article: Some(parent_num),
                child_article: article_num,
                depth,
                thread_order: order,
            }
        }
        None => {
            let order = next_thread_order(conn, article_num)?;
            ThreadRow {
                root_article: article_num,
                parent_article: None,
                child_article: article_num,
                depth: 0,
                thread_order: order,
            }
        }
    };

    insert_thread_row(conn, &row)?;
    Ok(row)
}

fn lookup_article_num(conn: &Connection, msgid: &str) -> Result<Option<i64>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT article_num FROM articles WHERE message_id = ?1",
            params![msgid],
            |row| row.get(0),
        )
        .ok())
}

fn thread_row_for_child(conn: &Connection, article_num: i64) -> Result<Option<ThreadRow>, StorageError> {
    conn.query_row(
        "SELECT root_article, parent_article, child_article, depth, thread_order
         FROM threads WHERE child_article = ?1",
        params![article_num],
        |row| {
            Ok(ThreadRow {
                root_article: row.get(0)?,
                parent_article: row.get(1)?,
                child_article: row.get(2)?,
                depth: row.get(3)?,
                thread_order: row.get(4)?,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(StorageError::from(other)),
    })
}

fn next_thread_order(conn: &Connection, root_article: i64) -> Result<i64, StorageError> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(thread_order) FROM threads WHERE root_article = ?1",
        params![root_article],
        |row| row.get(0),
    )?;
    Ok(max.map(|m| m + 1).unwrap_or(0))
}

fn insert_thread_row(conn: &Connection, row: &ThreadRow) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO threads(root_article, parent_article, child_article, depth, thread_order)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.root_article,
            row.parent_article,
            row.child_article,
            row.depth,
            row.thread_order,
        ],
    )?;
    if row.parent_article.is_none() {
        conn.execute(
            "UPDATE articles SET is_thr_root = 1 WHERE article_num = ?1",
            params![row.child_article],
        )?;
    } else {
        conn.execute(
            "UPDATE articles SET is_reply = 1 WHERE article_num = ?1",
            params![row.child_article],
        )?;
        if let Some(parent) = row.parent_article {
            conn.execute(
                "UPDATE articles SET reply_count = reply_count + 1 WHERE article_num = ?1",
                params![parent],
            )?;
        }
    }
    Ok(())
}

/// Maintenance rebuild: clear `threads`, stream `articles` in article-number
/// order, and re-run assignment from scratch.
pub fn rebuild(shard: &GroupShard, batch_size: u32) -> Result<usize, StorageError> {
    shard.clear_threads()?;
    let articles = shard.stream_articles(batch_size)?;

    let conn = shard.conn_mutex().lock().unwrap();
    let mut assigned = 0;
    for article in &articles {
        let references = parse_references(&article.references_text);
        assign_thread(&conn, article.article_num, &references)?;
        assigned += 1;
    }
    Ok(assigned)
}

/// A depth-annotated, order-sorted view of one article in a thread tree.
#[derive(Debug, Clone)]
pub struct ThreadTreeNode {
    pub article: ArticleRow,
    pub depth: i64,
}

pub struct TreeOptions {
    pub max_depth: Option<i64>,
    pub collapse_threshold: Option<usize>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            collapse_threshold: None,
        }
    }
}

/// Build the depth-annotated, order-sorted sequence for a thread root.
/// Iterative (explicit work stack), not recursive, so a pathologically deep
/// thread cannot blow the call stack.
pub fn build_tree(
    shard: &GroupShard,
    root: i64,
    opts: &TreeOptions,
) -> Result<Vec<ThreadTreeNode>, StorageError> {
    let rows = shard.thread_rows_for_root(root)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut children_of: std::collections::HashMap<i64, Vec<&ThreadRow>> =
        std::collections::HashMap::new();
    let mut root_row: Option<&ThreadRow> = None;
    for row in &rows {
        match row.parent_article {
            None => root_row = Some(row),
            Some(parent) => children_of.entry(parent).or_default().push(row),
        }
    }
    for list in children_of.values_mut() {
        list.sort_by_key(|r| r.thread_order);
    }

    let mut out = Vec::with_capacity(rows.len());
    let Some(root_row) = root_row else {
        return Ok(out);
    };

    // Explicit stack, pushed in reverse child order so children pop in order.
    let mut stack: Vec<&ThreadRow> = vec![root_row];
    while let Some(row) = stack.pop() {
        if let Some(max_depth) = opts.max_depth {
            if row.depth > max_depth {
                continue;
            }
        }
        if let Some(article) = shard.get_article_by_num(row.child_article)? {
            out.push(ThreadTreeNode {
                article,
                depth: row.depth,
            });
        }

        if let Some(children) = children_of.get(&row.child_article) {
            if let Some(threshold) = opts.collapse_threshold {
                if children.len() > threshold {
                    continue; // collapsed: descendants omitted from this view
                }
            }
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shard::NewArticle;

    fn insert(shard: &GroupShard, msgid: &str, references: &str) -> i64 {
        let num = shard
            .insert_article(&NewArticle {
                message_id: msgid.to_string(),
                subject: "s".into(),
                from_header: "f".into(),
                date_sent: None,
                date_string: String::new(),
                references_text: references.to_string(),
                headers_json: "{}".into(),
                body_text: "body".into(),
                bytes: 4,
                lines: 1,
                path: String::new(),
            })
            .unwrap();
        let conn = shard.conn_mutex().lock().unwrap();
        let refs = parse_references(references);
        assign_thread(&conn, num, &refs).unwrap();
        num
    }

    #[test]
    fn root_then_reply_threading() {
        let dir = tempfile::tempdir().unwrap();
        let shard = GroupShard::open(dir.path(), "comp.lang.rust").unwrap();
        let root_num = insert(&shard, "<r@x>", "");
        let child_num = insert(&shard, "<c@x>", "<r@x>");

        let root_thread = shard.thread_row_for_child(root_num).unwrap().unwrap();
        assert_eq!(root_thread.parent_article, None);
        assert_eq!(root_thread.depth, 0);
        assert_eq!(root_thread.root_article, root_num);

        let child_thread = shard.thread_row_for_child(child_num).unwrap().unwrap();
        assert_eq!(child_thread.parent_article, Some(root_num));
        assert_eq!(child_thread.depth, 1);
        assert_eq!(child_thread.root_article, root_num);
    }

    #[test]
    fn tree_build_is_depth_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let shard = GroupShard::open(dir.path(), "comp.lang.rust").unwrap();
        let root_num = insert(&shard, "<r@x>", "");
        insert(&shard, "<c1@x>", "<r@x>");
        insert(&shard, "<c2@x>", "<r@x> <c1@x>");

        let tree = build_tree(&shard, root_num, &TreeOptions::default()).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].depth, 0);
    }
}
