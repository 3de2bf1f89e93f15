use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TomoError};
use crate::params::SourceConfig;

use super::{RawInput, Unit, UnitId};

/// Fields extracted from one raw image file name.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedName {
    pub tilt_series: String,
    pub image_index: u32,
    pub tilt_angle: f64,
}

/// Parse a raw image file name such as `TS_01_003_-12.0.mrc` or
/// `TS_01_003[-12.00]_fractions.tif`.
///
/// `[` is treated as a field separator; field numbers count from the first
/// field after the file prefix.
pub fn parse_image_name(file_name: &str, source: &SourceConfig) -> Result<ParsedName> {
    let normalised = file_name.replace('[', "_");
    let fields: Vec<&str> = normalised.split('_').collect();
    let offset = source.file_prefix.split('_').count();
    let field = |n: usize, what: &str| -> Result<&str> {
        fields.get(n + offset).copied().ok_or_else(|| {
            TomoError::config(
                format!("source.{what}"),
                format!("field {n} not present in file name {file_name}"),
            )
        })
    };

    let tilt_series = field(source.stack_field, "stack_field")?
        .trim_end_matches(&format!(".{}", source.extension))
        .to_string();

    let index_digits: String = field(source.index_field, "index_field")?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let image_index = index_digits.parse::<u32>().map_err(|_| {
        TomoError::config(
            "source.index_field",
            format!("no image index in file name {file_name}"),
        )
    })?;

    let angle_field = field(source.tiltangle_field, "tiltangle_field")?;
    let tilt_angle = angle_field
        .replace(&format!(".{}", source.extension), "")
        .replace(['[', ']'], "")
        .parse::<f64>()
        .map_err(|_| {
            TomoError::config(
                "source.tiltangle_field",
                format!("no tilt angle in file name {file_name}"),
            )
        })?;

    Ok(ParsedName {
        tilt_series,
        image_index,
        tilt_angle,
    })
}

/// Discover the tilt-series below `source.source_folder` (relative paths
/// resolve against `base`). Units keep the order in which they are first
/// seen in the sorted file list.
pub fn scan_source(source: &SourceConfig, base: &Path) -> Result<Vec<Unit>> {
    if source.file_prefix.is_empty() {
        return Err(TomoError::missing("source.file_prefix"));
    }
    let root = if source.source_folder.is_absolute() {
        source.source_folder.clone()
    } else {
        base.join(&source.source_folder)
    };

    let mut images = Vec::new();
    for dir in candidate_folders(&root, &source.folder_prefix)? {
        images.extend(matching_images(&dir, source)?);
    }
    if images.is_empty() {
        return Err(TomoError::config(
            "source.source_folder",
            format!(
                "no files matching {}_*.{} found in {}",
                source.file_prefix,
                source.extension,
                root.display()
            ),
        ));
    }
    images.sort();

    let mut units: Vec<Unit> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for path in images {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parsed = parse_image_name(&file_name, source)?;
        let slot = *by_id.entry(parsed.tilt_series.clone()).or_insert_with(|| {
            units.push(Unit {
                id: UnitId::new(parsed.tilt_series.clone()),
                raw_inputs: Vec::new(),
            });
            units.len() - 1
        });
        units[slot].raw_inputs.push(RawInput {
            path,
            image_index: parsed.image_index,
            tilt_angle: parsed.tilt_angle,
        });
    }
    for unit in &mut units {
        unit.raw_inputs.sort_by_key(|r| r.image_index);
        debug!(unit = %unit.id, images = unit.raw_inputs.len(), "Discovered tilt-series");
    }
    info!(units = units.len(), root = %root.display(), "Source scan complete");
    Ok(units)
}

fn candidate_folders(root: &Path, folder_prefix: &str) -> Result<Vec<PathBuf>> {
    if folder_prefix.is_empty() {
        return Ok(vec![root.to_path_buf()]);
    }
    let wanted = format!("{folder_prefix}_");
    let mut folders = Vec::new();
    for entry in read_dir(root)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if folder_prefix == "*" || name.starts_with(&wanted) {
            folders.push(path);
        }
    }
    Ok(folders)
}

fn matching_images(dir: &Path, source: &SourceConfig) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}_", source.file_prefix);
    let suffix = format!(".{}", source.extension);
    let mut found = Vec::new();
    for entry in read_dir(dir)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_file() && name.starts_with(&prefix) && name.ends_with(&suffix) {
            found.push(fs::canonicalize(&path).unwrap_or(path));
        }
    }
    Ok(found)
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        TomoError::config(
            "source.source_folder",
            format!("cannot read {}: {e}", dir.display()),
        )
    })?;
    Ok(entries.filter_map(|e| e.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(prefix: &str) -> SourceConfig {
        SourceConfig {
            file_prefix: prefix.into(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_plain_names() {
        let p = parse_image_name("TS_01_003_-12.0.mrc", &source("TS")).unwrap();
        assert_eq!(p.tilt_series, "01");
        assert_eq!(p.image_index, 3);
        assert_eq!(p.tilt_angle, -12.0);
    }

    #[test]
    fn parses_bracketed_angles_with_multi_part_prefix() {
        let mut src = source("Position_A");
        src.extension = "tif".into();
        let p = parse_image_name("Position_A_7_012[45.00]_fractions.tif", &src).unwrap();
        assert_eq!(p.tilt_series, "7");
        assert_eq!(p.image_index, 12);
        assert_eq!(p.tilt_angle, 45.0);
    }

    #[test]
    fn missing_field_names_the_field() {
        let err = parse_image_name("TS_01.mrc", &source("TS")).unwrap_err();
        assert!(err.to_string().contains("index_field"), "got: {err}");
    }
}
