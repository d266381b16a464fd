use std::collections::HashMap;

use crate::error::DuplicateError;
use crate::snapshot::{DuplicateTable, MockTable, ModuleEntry, ModuleTable, platform_slot};

/// Register a binding for `id`, upholding "at most one winner per
/// `(id, platform)`". A contested key moves both candidates into the
/// duplicate table; later arrivals for a contested key accumulate there.
pub(crate) fn set_module(
    map: &mut ModuleTable,
    duplicates: &mut DuplicateTable,
    platforms: &[String],
    throw_on_collision: bool,
    id: &str,
    module: ModuleEntry,
) -> Result<(), DuplicateError> {
    let platform = platform_slot(&module.path, platforms).to_string();

    // Already contested: the newcomer joins the pile.
    if let Some(by_platform) = duplicates.get_mut(id)
        && let Some(paths) = by_platform.get_mut(&platform)
    {
        paths.insert(module.path, module.kind);
        return Ok(());
    }

    if let Some(by_platform) = map.get(id)
        && let Some(existing) = by_platform.get(&platform)
    {
        if existing.path == module.path {
            return Ok(());
        }

        let message = format!(
            "hastemap: haste module naming collision: {id}\n  the following files share their name:\n    * {}\n    * {}",
            existing.path, module.path,
        );
        if throw_on_collision {
            log::error!("{message}");
            return Err(DuplicateError::new(existing.path.clone(), module.path));
        }
        log::warn!("{message}");

        let existing = existing.clone();
        let by_platform = map.get_mut(id).expect("winner was just read");
        by_platform.remove(&platform);
        if by_platform.is_empty() {
            map.remove(id);
        }

        let mut paths = HashMap::new();
        paths.insert(existing.path, existing.kind);
        paths.insert(module.path, module.kind);
        duplicates
            .entry(id.to_string())
            .or_default()
            .insert(platform, paths);
        return Ok(());
    }

    map.entry(id.to_string())
        .or_default()
        .insert(platform, module);
    Ok(())
}

/// Drop `relative_path` from the duplicate pile for `id` after the file was
/// removed or is being re-processed. When exactly one candidate remains it
/// is promoted back into the module table.
///
/// The inner structures are cloned before mutation: published views may
/// still reference the previous maps, and emitted change events promise
/// immutability.
pub(crate) fn recover_duplicates(
    map: &mut ModuleTable,
    duplicates: &mut DuplicateTable,
    platforms: &[String],
    relative_path: &str,
    id: &str,
) {
    let Some(by_platform) = duplicates.get(id) else {
        return;
    };
    let platform = platform_slot(relative_path, platforms).to_string();
    let Some(paths) = by_platform.get(&platform) else {
        return;
    };

    let mut by_platform = by_platform.clone();
    let mut paths = paths.clone();
    paths.remove(relative_path);

    if paths.len() == 1 {
        let (survivor_path, survivor_kind) = paths.iter().next().expect("sole survivor");
        map.entry(id.to_string()).or_default().insert(
            platform.clone(),
            ModuleEntry {
                path: survivor_path.clone(),
                kind: *survivor_kind,
            },
        );
        by_platform.remove(&platform);
    } else {
        by_platform.insert(platform, paths);
    }

    if by_platform.is_empty() {
        duplicates.remove(id);
    } else {
        duplicates.insert(id.to_string(), by_platform);
    }
}

/// Register a manual mock. A second file binding the same mock name is a
/// collision; the latest binding always takes the slot, even when the
/// collision is reported as fatal.
pub(crate) fn set_mock(
    mocks: &mut MockTable,
    throw_on_collision: bool,
    mock_name: &str,
    relative_path: &str,
) -> Result<(), DuplicateError> {
    let existing = mocks.insert(mock_name.to_string(), relative_path.to_string());
    if let Some(existing) = existing
        && existing != relative_path
    {
        let message = format!(
            "hastemap: duplicate manual mock found: {mock_name}\n  the following files share their name:\n    * {existing}\n    * {relative_path}",
        );
        if throw_on_collision {
            log::error!("{message}");
            return Err(DuplicateError::new(existing, relative_path));
        }
        log::warn!("{message}");
    }
    Ok(())
}
