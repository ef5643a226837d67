//! Binary export format for trained maps.
//!
//! A trained instance serializes to a small magic-tagged file: a 4-byte
//! magic, a little-endian format version, then the bincode payload. Import
//! rebuilds a `Trained` instance in a registry; the entity store is not
//! part of the export (entities re-load from their upstream source).

use crate::config::MapConfig;
use crate::error::{MercatorError, Result};
use crate::grid::Grid;
use crate::registry::{InstanceId, InstanceRegistry};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Magic number for Mercator map files.
const MAGIC: &[u8; 4] = b"MERC";

/// Current format version.
const VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MapExport {
    config: MapConfig,
    grid: Grid,
    exported_at: DateTime<Utc>,
}

/// Writes a trained instance's configuration and grid to `path`.
///
/// `State` error when the instance has not finished a training run.
pub fn export_map(registry: &InstanceRegistry, id: InstanceId, path: &Path) -> Result<()> {
    let (config, grid) = registry.export_parts(id)?;
    let export = MapExport {
        config,
        grid,
        exported_at: Utc::now(),
    };

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    bincode::serialize_into(&mut writer, &export)?;
    writer.flush()?;

    info!("{id}: exported map to {}", path.display());
    Ok(())
}

/// Reads a map file and registers its grid as a new `Trained` instance.
pub fn import_map(registry: &InstanceRegistry, path: &Path) -> Result<InstanceId> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(MercatorError::Serialization(format!(
            "{} is not a mercator map file",
            path.display()
        )));
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != VERSION {
        return Err(MercatorError::Serialization(format!(
            "unsupported map format version {version} (expected {VERSION})"
        )));
    }

    let export: MapExport = bincode::deserialize_from(&mut reader)?;
    let id = registry.import_parts(export.config, export.grid)?;
    info!("{id}: imported map from {}", path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceStatus;
    use crate::training::TrainingParams;
    use tempfile::tempdir;

    fn trained_instance(registry: &InstanceRegistry) -> InstanceId {
        let config = MapConfig {
            grid_width: 4,
            grid_height: 4,
            embedding_dimension: 3,
            seed: Some(42),
            ..Default::default()
        };
        let id = registry.create(config).unwrap();
        registry.generate_sample_data(id, 8).unwrap();
        registry
            .train(
                id,
                TrainingParams {
                    epochs: 5,
                    batch_size: 2,
                },
            )
            .unwrap();
        registry.wait(id).unwrap();
        id
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("semantic.map");

        let registry = InstanceRegistry::new();
        let id = trained_instance(&registry);
        export_map(&registry, id, &path).unwrap();

        let imported = import_map(&registry, &path).unwrap();
        assert_ne!(imported, id);
        let info = registry.get(imported).unwrap();
        assert_eq!(info.status, InstanceStatus::Trained);

        let original = registry.grid_state(id, true).unwrap();
        let restored = registry.grid_state(imported, true).unwrap();
        assert_eq!(original.nodes.len(), restored.nodes.len());
        for (a, b) in original.nodes.iter().zip(&restored.nodes) {
            assert_eq!(a.weights, b.weights);
        }
        // The export carries no entities; mappings are empty until a
        // store is attached upstream.
        assert!(restored.mappings.is_empty());
    }

    #[test]
    fn test_export_untrained_rejected() {
        let dir = tempdir().unwrap();
        let registry = InstanceRegistry::new();
        let id = registry
            .create(MapConfig {
                grid_width: 4,
                grid_height: 4,
                embedding_dimension: 3,
                ..Default::default()
            })
            .unwrap();

        let err = export_map(&registry, id, &dir.path().join("x.map")).unwrap_err();
        assert!(matches!(err, MercatorError::State(_)));
    }

    #[test]
    fn test_import_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.map");
        std::fs::write(&path, b"PRETxxxxxxxx").unwrap();

        let registry = InstanceRegistry::new();
        let err = import_map(&registry, &path).unwrap_err();
        assert!(matches!(err, MercatorError::Serialization(_)));
    }
}
