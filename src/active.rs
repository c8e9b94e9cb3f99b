//! Active-file import/export (§6): `name high low status`, whitespace
//! separated, `#`-prefixed comment lines ignored. `status` is `y` (posting
//! allowed), `n` (no posting), or `m` (moderated) — the core only tracks
//! `active`, so `n`/`m` both import as active-but-not-postable today.

use std::path::Path;

use crate::error::StorageError;
use crate::storage::catalog::Catalog;

pub struct ActiveImportReport {
    pub lines_read: usize,
    pub groups_created: usize,
    pub groups_skipped: usize,
}

/// Parse and apply an active file, creating any newsgroup not already known.
/// Existing groups are left untouched (`ensure_group` is a no-op on conflict).
pub fn import_file(catalog: &Catalog, path: &Path) -> Result<ActiveImportReport, StorageError> {
    let contents = std::fs::read_to_string(path)?;
    let mut report = ActiveImportReport {
        lines_read: 0,
        groups_created: 0,
        groups_skipped: 0,
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        report.lines_read += 1;

        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else {
            report.groups_skipped += 1;
            continue;
        };
        // high/low/status are accepted for format compatibility but the
        // watermarks are owned by the batch writer from first insert onward.
        let _high = fields.next();
        let _low = fields.next();
        let _status = fields.next();

        if catalog.get_group(name)?.is_some() {
            report.groups_skipped += 1;
            continue;
        }
        catalog.ensure_group(name, "")?;
        report.groups_created += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_new_groups_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.ensure_group("comp.lang.rust", "").unwrap();

        let active_path = dir.path().join("active");
        std::fs::write(
            &active_path,
            "# comment\ncomp.lang.rust 0000001000 0000000001 y\ncomp.lang.go 0000000000 0000000001 y\n\n",
        )
        .unwrap();

        let report = import_file(&catalog, &active_path).unwrap();
        assert_eq!(report.lines_read, 2);
        assert_eq!(report.groups_created, 1);
        assert_eq!(report.groups_skipped, 1);
        assert!(catalog.get_group("comp.lang.go").unwrap().is_some());
    }
}
