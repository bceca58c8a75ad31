//! Experiment rows to job documents.
//!
//! Each experiment row describes one job through numbered entity column
//! groups (`entity_<i>_type`, `entity_<i>_id`, ...), JSON-encoded constraint
//! columns and an optional affinity binder. Cells holding JSON are parsed
//! under a parse-or-warn contract: a malformed cell is reported and dropped,
//! never failing the row or the batch.

use crate::identity::DEFAULT_EXTENSION;
use crate::yaml::{self, Node};
use anyhow::Result;
use fold_core::{atomic_write_bytes, ensure_dir, read_table, write_table, Row, Table};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

pub const DOCUMENT_COLUMN: &str = "yaml_file";
pub const NAME_COLUMN: &str = "foldname";
pub const AFFINITY_BINDER_COLUMN: &str = "affinity_binder";

fn entity_type_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^entity_(\d+)_type$").expect("valid entity column pattern"))
}

/// Chain identifiers of one entity. Several chains sharing one definition
/// are written as an inline list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIds {
    Single(String),
    Multiple(Vec<String>),
}

impl ChainIds {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut tokens: Vec<String> = raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        match tokens.len() {
            0 => None,
            1 => tokens.pop().map(ChainIds::Single),
            _ => Some(ChainIds::Multiple(tokens)),
        }
    }

    pub fn tokens(&self) -> Vec<&str> {
        match self {
            ChainIds::Single(id) => vec![id.as_str()],
            ChainIds::Multiple(ids) => ids.iter().map(String::as_str).collect(),
        }
    }

    fn to_node(&self) -> Node {
        match self {
            ChainIds::Single(id) => Node::str(id.clone()),
            ChainIds::Multiple(ids) => {
                Node::Flow(ids.iter().map(|id| Value::String(id.clone())).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolymerKind {
    Protein,
    Dna,
    Rna,
}

impl PolymerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolymerKind::Protein => "protein",
            PolymerKind::Dna => "dna",
            PolymerKind::Rna => "rna",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Modification {
    pub position: u32,
    pub ccd: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolymerEntity {
    pub kind: PolymerKind,
    pub id: ChainIds,
    pub sequence: String,
    pub msa: Option<String>,
    pub cyclic: bool,
    pub modifications: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LigandEntity {
    pub id: ChainIds,
    pub smiles: Option<String>,
    pub ccd: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Polymer(PolymerEntity),
    Ligand(LigandEntity),
}

impl Entity {
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::Polymer(p) => p.kind.as_str(),
            Entity::Ligand(_) => "ligand",
        }
    }

    pub fn id(&self) -> &ChainIds {
        match self {
            Entity::Polymer(p) => &p.id,
            Entity::Ligand(l) => &l.id,
        }
    }

    fn to_node(&self) -> Node {
        let mut fields = vec![("id".to_string(), self.id().to_node())];
        match self {
            Entity::Polymer(p) => {
                fields.push(("sequence".to_string(), Node::str(p.sequence.clone())));
                if let Some(msa) = &p.msa {
                    fields.push(("msa".to_string(), Node::str(msa.clone())));
                }
                if p.cyclic {
                    fields.push(("cyclic".to_string(), Node::Scalar(Value::Bool(true))));
                }
                if !p.modifications.is_empty() {
                    let mods = p
                        .modifications
                        .iter()
                        .map(|m| {
                            Node::Map(vec![
                                ("position".to_string(), Node::Scalar(json!(m.position))),
                                ("ccd".to_string(), Node::str(m.ccd.clone())),
                            ])
                        })
                        .collect();
                    fields.push(("modifications".to_string(), Node::Seq(mods)));
                }
            }
            Entity::Ligand(l) => {
                if let Some(smiles) = &l.smiles {
                    fields.push(("smiles".to_string(), Node::SingleQuoted(smiles.clone())));
                }
                if let Some(ccd) = &l.ccd {
                    fields.push(("ccd".to_string(), Node::str(ccd.clone())));
                }
            }
        }
        Node::Map(vec![(self.type_name().to_string(), Node::Map(fields))])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Bond,
    Pocket,
    Contact,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 3] =
        [ConstraintKind::Bond, ConstraintKind::Pocket, ConstraintKind::Contact];

    pub fn column(&self) -> &'static str {
        match self {
            ConstraintKind::Bond => "bonds",
            ConstraintKind::Pocket => "pockets",
            ConstraintKind::Contact => "contacts",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            ConstraintKind::Bond => "bond",
            ConstraintKind::Pocket => "pocket",
            ConstraintKind::Contact => "contact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Affinity { binder: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDocument {
    pub entities: Vec<Entity>,
    pub constraints: Vec<Constraint>,
    pub properties: Vec<Property>,
}

impl JobDocument {
    pub fn to_yaml(&self) -> String {
        let mut root = Vec::new();
        if !self.entities.is_empty() {
            root.push((
                "sequences".to_string(),
                Node::Seq(self.entities.iter().map(Entity::to_node).collect()),
            ));
        }
        if !self.constraints.is_empty() {
            let items = self
                .constraints
                .iter()
                .map(|c| Node::Map(vec![(c.kind.key().to_string(), Node::from(&c.payload))]))
                .collect();
            root.push(("constraints".to_string(), Node::Seq(items)));
        }
        if !self.properties.is_empty() {
            let items = self
                .properties
                .iter()
                .map(|p| match p {
                    Property::Affinity { binder } => Node::Map(vec![(
                        "affinity".to_string(),
                        Node::Map(vec![("binder".to_string(), Node::str(binder.clone()))]),
                    )]),
                })
                .collect();
            root.push(("properties".to_string(), Node::Seq(items)));
        }
        yaml::to_string(&Node::Map(root))
    }
}

/// Parses an optional JSON sub-document cell. Absent or blank cells are
/// `None`; malformed ones are reported and also `None`.
fn parse_cell<T: DeserializeOwned>(row: &Row, column: &str, row_number: usize) -> Option<T> {
    let raw = row.non_empty(column)?;
    match serde_json::from_str::<T>(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(row = row_number, column, error = %err, "unparseable JSON cell, skipping");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "1.0" => Some(true),
        "false" | "0" | "no" | "0.0" | "" => Some(false),
        _ => None,
    }
}

fn entity_indices(row: &Row) -> Vec<u32> {
    let mut indices: Vec<u32> = row
        .columns()
        .filter_map(|c| entity_type_pattern().captures(c))
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

fn encode_entity(row: &Row, index: u32, row_number: usize) -> Option<Entity> {
    let col = |field: &str| format!("entity_{}_{}", index, field);
    let entity_type = row.non_empty(&col("type"))?.to_ascii_lowercase();
    let Some(id) = row.non_empty(&col("id")).and_then(ChainIds::parse) else {
        warn!(row = row_number, entity = index, "entity has no chain id, skipping");
        return None;
    };
    let text = |field: &str| row.non_empty(&col(field)).map(str::to_string);

    let kind = match entity_type.as_str() {
        "protein" => PolymerKind::Protein,
        "dna" => PolymerKind::Dna,
        "rna" => PolymerKind::Rna,
        "ligand" => {
            for field in ["sequence", "msa", "cyclic", "modifications"] {
                if text(field).is_some() {
                    warn!(row = row_number, entity = index, field, "field does not apply to ligands, ignoring");
                }
            }
            let ligand = LigandEntity {
                id,
                smiles: text("smiles"),
                ccd: text("ccd"),
            };
            if ligand.smiles.is_none() && ligand.ccd.is_none() {
                warn!(row = row_number, entity = index, "ligand has neither smiles nor ccd, skipping");
                return None;
            }
            return Some(Entity::Ligand(ligand));
        }
        other => {
            warn!(row = row_number, entity = index, entity_type = other, "unknown entity type, skipping");
            return None;
        }
    };

    for field in ["smiles", "ccd"] {
        if text(field).is_some() {
            warn!(row = row_number, entity = index, field, "field does not apply to polymers, ignoring");
        }
    }
    let Some(sequence) = text("sequence") else {
        warn!(row = row_number, entity = index, "polymer has no sequence, skipping");
        return None;
    };
    let cyclic = match text("cyclic") {
        None => false,
        Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
            warn!(row = row_number, entity = index, value = %raw, "unrecognised cyclic flag, treating as false");
            false
        }),
    };
    let modifications =
        parse_cell::<Vec<Modification>>(row, &col("modifications"), row_number).unwrap_or_default();
    Some(Entity::Polymer(PolymerEntity {
        kind,
        id,
        sequence,
        msa: text("msa"),
        cyclic,
        modifications,
    }))
}

/// Builds the job document for one experiment row. `row_number` is 1-based
/// and only used in diagnostics.
pub fn encode_row(row: &Row, row_number: usize) -> JobDocument {
    let entities: Vec<Entity> = entity_indices(row)
        .into_iter()
        .filter_map(|index| encode_entity(row, index, row_number))
        .collect();

    let mut constraints = Vec::new();
    for kind in ConstraintKind::ALL {
        if let Some(items) = parse_cell::<Vec<Value>>(row, kind.column(), row_number) {
            constraints.extend(items.into_iter().map(|payload| Constraint { kind, payload }));
        }
    }

    let binder = row.non_empty(AFFINITY_BINDER_COLUMN);
    if let Some(binder) = binder {
        if !entities.iter().any(|e| e.id().tokens().contains(&binder)) {
            warn!(row = row_number, binder, "affinity binder is not an encoded chain id");
        }
    }
    let properties = binder
        .map(|binder| Property::Affinity {
            binder: binder.to_string(),
        })
        .into_iter()
        .collect();

    JobDocument {
        entities,
        constraints,
        properties,
    }
}

/// Document base name: `foldname` when set, otherwise the ids of the
/// entities that made it into the document, otherwise the row number.
pub fn document_base_name(row: &Row, document: &JobDocument, row_number: usize) -> String {
    if let Some(name) = row.non_empty(NAME_COLUMN) {
        return name.to_string();
    }
    let ids: Vec<String> = document
        .entities
        .iter()
        .map(|e| e.id().tokens().join(","))
        .collect();
    if ids.is_empty() {
        format!("job_{}", row_number)
    } else {
        ids.join("_")
    }
}

/// Keeps every row's document distinct: a name already taken in this batch
/// gets the row number appended (and a counter, should that clash too).
fn unique_base_name(taken: &BTreeMap<String, usize>, base: String, row_number: usize) -> String {
    let Some(previous) = taken.get(&base) else {
        return base;
    };
    let mut candidate = format!("{}_{}", base, row_number);
    let mut counter = 1;
    while taken.contains_key(&candidate) {
        counter += 1;
        candidate = format!("{}_{}_{}", base, row_number, counter);
    }
    warn!(
        row = row_number,
        previous = *previous,
        name = %base,
        renamed = %candidate,
        "document name already used in this batch, renaming"
    );
    candidate
}

pub struct WriteDocumentsResult {
    pub documents: Vec<PathBuf>,
    pub table_path: PathBuf,
}

/// Writes one document per experiment row into `out_dir` and the experiment
/// table, annotated with a `yaml_file` column, to `csv_out`.
pub fn write_documents(input_csv: &Path, out_dir: &Path, csv_out: &Path) -> Result<WriteDocumentsResult> {
    let mut table = read_table(input_csv)?;
    ensure_dir(out_dir)?;

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut documents = Vec::new();
    for (idx, row) in table.rows.iter_mut().enumerate() {
        let row_number = idx + 1;
        let document = encode_row(row, row_number);
        if document.entities.is_empty() {
            warn!(row = row_number, "row produced no entities");
        }
        let base = unique_base_name(
            &seen,
            document_base_name(row, &document, row_number),
            row_number,
        );
        seen.insert(base.clone(), row_number);
        let file_name = format!("{}.{}", base, DEFAULT_EXTENSION);
        let path = out_dir.join(&file_name);
        atomic_write_bytes(&path, document.to_yaml().as_bytes())?;
        row.set(DOCUMENT_COLUMN, file_name);
        documents.push(path);
    }
    if !table.has_column(DOCUMENT_COLUMN) {
        table.columns.push(DOCUMENT_COLUMN.to_string());
    }
    write_table(csv_out, &table)?;
    info!(
        documents = documents.len(),
        out_dir = %out_dir.display(),
        table = %csv_out.display(),
        "job documents written"
    );
    Ok(WriteDocumentsResult {
        documents,
        table_path: csv_out.to_path_buf(),
    })
}

pub const TEMPLATE_COLUMNS: [&str; 21] = [
    "foldname",
    "entity_1_type",
    "entity_1_id",
    "entity_1_sequence",
    "entity_1_smiles",
    "entity_1_ccd",
    "entity_1_msa",
    "entity_1_cyclic",
    "entity_1_modifications",
    "entity_2_type",
    "entity_2_id",
    "entity_2_sequence",
    "entity_2_smiles",
    "entity_2_ccd",
    "entity_2_msa",
    "entity_2_cyclic",
    "entity_2_modifications",
    "bonds",
    "pockets",
    "contacts",
    "affinity_binder",
];

/// Writes an experiment table with every recognised column and one worked
/// protein/ligand example row.
pub fn write_template(path: &Path) -> Result<()> {
    let example = [
        ("foldname", "protein_and_ligand_example"),
        ("entity_1_type", "protein"),
        ("entity_1_id", "A"),
        (
            "entity_1_sequence",
            "PIAQIHILEGRSDEQKETLIREVSEAISRSLDAPLTSVRVIITEMAKGHFGIGGELASK",
        ),
        ("entity_1_msa", "path/to/proteinA.msa"),
        ("entity_1_cyclic", "false"),
        ("entity_1_modifications", r#"[{"position": 10, "ccd": "SEP"}]"#),
        ("entity_2_type", "ligand"),
        ("entity_2_id", "B"),
        ("entity_2_smiles", "CC(=O)O"),
        ("bonds", r#"[{"atom1": ["A", 10, "OG"], "atom2": ["B", 2, "O1"]}]"#),
        (
            "pockets",
            r#"[{"binder": "B", "contacts": [["A", 25, "CA"], ["A", 30]], "max_distance": 12.0}]"#,
        ),
        ("affinity_binder", "B"),
    ];
    let mut table = Table::with_columns(TEMPLATE_COLUMNS);
    table.push(example.into_iter().collect());
    write_table(path, &table)?;
    info!(path = %path.display(), "template experiment table written");
    Ok(())
}
