// THEORY:
// Export is the only persistence the tracker offers: a read-all-then-serialise
// snapshot of every lineage, active or not, with two derived summaries per lineage
// (`lifetime` and `average_length`). Lineages are written in creation order.

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::core_modules::lineage::{LineageEvent, LineageId, LineageStore};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedLineage {
    pub id: LineageId,
    pub history: Vec<LineageEvent>,
    pub is_active: bool,
    pub creation_frame: u64,
    pub lifetime: u64,
    pub average_length: f64,
}

/// `{"lineages": {"D-0000": {...}, ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageExport {
    #[serde(serialize_with = "lineages_as_map", deserialize_with = "lineages_from_map")]
    pub lineages: Vec<ExportedLineage>,
}

fn lineages_as_map<S: Serializer>(
    lineages: &[ExportedLineage],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(lineages.len()))?;
    for lineage in lineages {
        map.serialize_entry(&lineage.id, lineage)?;
    }
    map.end()
}

fn lineages_from_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<ExportedLineage>, D::Error> {
    let map = BTreeMap::<LineageId, ExportedLineage>::deserialize(deserializer)?;
    for (key, lineage) in &map {
        if *key != lineage.id {
            return Err(serde::de::Error::custom(format!(
                "lineage stored under `{key}` reports id `{}`",
                lineage.id
            )));
        }
    }
    Ok(map.into_values().collect())
}

impl LineageExport {
    pub fn get(&self, id: LineageId) -> Option<&ExportedLineage> {
        self.lineages.iter().find(|l| l.id == id)
    }
}

/// Snapshots every lineage of the store.
pub fn export_lineages(store: &LineageStore) -> LineageExport {
    LineageExport {
        lineages: store
            .iter()
            .map(|lineage| ExportedLineage {
                id: lineage.id(),
                history: lineage.history().to_vec(),
                is_active: lineage.is_active(),
                creation_frame: lineage.creation_frame(),
                lifetime: lineage.lifetime(),
                average_length: lineage.average_length(),
            })
            .collect(),
    }
}

/// Writes the export as pretty-printed JSON.
pub fn write_export(export: &LineageExport, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, export)?;
    writer.flush()?;
    Ok(())
}

pub fn read_export(path: impl AsRef<Path>) -> Result<LineageExport> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
