use berth_domain::ArtifactClass;
use berth_storage::{ObjectStore, StorageError};

/// What one eviction sweep did. Delete failures are collected rather than
/// escalated; the next backup cycle retries them by construction.
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub examined: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Split an offsite artifact file name of the form
/// `<timestamp>-<site>-<class>.<ext>` into its site and class tokens.
/// The timestamp is `YYYYMMDD_HHMMSS` and the site part carries no dashes,
/// so the class token (which may contain dashes) runs to the first dot.
pub fn parse_artifact_name(file_name: &str) -> Option<(&str, &str)> {
    let (timestamp, rest) = file_name.split_once('-')?;
    if !is_artifact_timestamp(timestamp) {
        return None;
    }
    let (site, remainder) = rest.split_once('-')?;
    if site.is_empty() {
        return None;
    }
    let class_token = remainder.split('.').next()?;
    if class_token.is_empty() {
        return None;
    }
    Some((site, class_token))
}

fn is_artifact_timestamp(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 15 || bytes[8] != b'_' {
        return false;
    }
    bytes[..8].iter().all(u8::is_ascii_digit) && bytes[9..].iter().all(u8::is_ascii_digit)
}

/// Bound the number of retained artifacts per class under one site prefix,
/// deleting oldest first. Runs after each successful backup upload.
pub fn enforce(
    store: &dyn ObjectStore,
    prefix: &str,
    classes: &[ArtifactClass],
    max_per_class: usize,
) -> Result<RetentionReport, StorageError> {
    let objects = store.list_prefix(prefix)?;
    let mut report = RetentionReport {
        examined: objects.len(),
        ..RetentionReport::default()
    };

    for class in classes {
        let mut matching: Vec<_> = objects
            .iter()
            .filter(|meta| {
                let name = meta.key.rsplit('/').next().unwrap_or(&meta.key);
                parse_artifact_name(name)
                    .map(|(_, token)| token == class.token())
                    .unwrap_or(false)
            })
            .collect();

        if matching.len() <= max_per_class {
            continue;
        }

        matching.sort_by_key(|meta| meta.last_modified);
        let excess = matching.len() - max_per_class;
        for meta in matching.into_iter().take(excess) {
            match store.delete(&meta.key) {
                Ok(()) => report.deleted.push(meta.key.clone()),
                Err(err) => report.failed.push((meta.key.clone(), err.to_string())),
            }
        }
    }

    Ok(report)
}
