//! Catalog hygiene: drop records without files, empty label folders that
//! no item uses, and rules for labels no longer in use.

use anyhow::Result;

use crate::pipeline::Session;

pub fn clean_db(session: &Session) -> Result<()> {
    let db = &session.db;
    let media_root = &session.config.media.root;

    // Records whose file is gone are stale; the file is the source of
    // truth.
    for item in db.all_items()? {
        let path = item.path(media_root);
        if !path.exists() {
            tracing::info!(item_id = item.id, path = %path.display(), "Dropping orphan record");
            db.delete_item(item.id)?;
        }
    }

    let labels_in_use = db.labels_in_use()?;

    // Unused label folders must be empty by now (orphan files would have
    // been ingested or reconciled); rmdir refuses otherwise and we leave
    // the folder alone.
    let items_dir = session.config.media.items_dir();
    if items_dir.exists() {
        for entry in std::fs::read_dir(&items_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !labels_in_use.contains(&name) {
                if let Err(e) = std::fs::remove_dir(entry.path()) {
                    tracing::debug!(label = %name, error = %e, "Label folder not removable");
                } else {
                    tracing::info!(label = %name, "Removed unused label folder");
                }
            }
        }
    }

    for rule in db.all_rules()? {
        if !labels_in_use.contains(&rule.label) {
            tracing::info!(label = %rule.label, tag = %rule.tag_name, "Dropping orphan rule");
            db.remove_rule(&rule.label, &rule.tag_name, &rule.tag_value)?;
        }
    }

    Ok(())
}
