//! The query surface: one `Snapshot` ties the reader, the index, the
//! derived context and the class table together, and serves class
//! statistics, per-object detail, reference listings and the retained-size
//! ranking.

use crate::context::{render_name, resolve_name, HeapContext};
use crate::dominator::DominatorTree;
use crate::error::Result;
use crate::graph::{HeapGraph, SUPER_ROOT};
use crate::heap_dump::FieldValue;
use crate::index::{Index, RecordEntry, RecordEntryKind};
use crate::indexer::{self, IndexerOptions};
use crate::reader::{HeapDumpFile, Record};
use crate::records::RecordKind;
use crate::resolve::ClassTable;
use itertools::Itertools;
use log::info;
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::Serialize;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};

/// Per-class aggregate over instances, object arrays (keyed by element
/// class) and primitive arrays (keyed by their synthesised element class).
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    pub id: u64,
    pub name: String,
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct InstanceStats {
    pub id: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceEdge {
    pub id: u64,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceView {
    pub id: u64,
    pub class: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: &'static str,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub id: u64,
    pub class: String,
    pub kind: &'static str,
    pub size: u64,
    pub fields: Vec<FieldView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedObject {
    pub id: u64,
    pub class: String,
    pub retained: u64,
    /// True when the retained sum overflowed and was clamped.
    pub saturated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameView {
    pub class: String,
    pub method: String,
    pub signature: String,
    pub source_file: String,
    pub line: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub serial: u32,
    pub obj_id: u64,
    pub name: String,
    pub group: String,
    pub frames: Vec<FrameView>,
    pub locals: Vec<u64>,
}

/// The one-shot graph + dominator computation, invalidated by re-indexing.
pub struct Analysis {
    pub graph: HeapGraph,
    pub dominators: DominatorTree,
}

pub struct Snapshot {
    reader: HeapDumpFile,
    index: Index,
    ctx: HeapContext,
    classes: ClassTable,
    analysis: Option<Analysis>,
}

impl Snapshot {
    /// Open a dump, building or reusing the index at `index_path`
    /// (`<dump>.index` next to the file by default).
    pub fn open(
        dump_path: &Path,
        index_path: Option<PathBuf>,
        options: IndexerOptions,
    ) -> Result<Snapshot> {
        let reader = HeapDumpFile::open(dump_path)?;
        let index_path = index_path.unwrap_or_else(|| default_index_path(dump_path));
        let index = indexer::open_or_build(&reader, &index_path, options)?;
        let ctx = HeapContext::build(&reader, &index)?;
        let classes = ClassTable::load(&reader, &index, &ctx)?;

        Ok(Snapshot {
            reader,
            index,
            ctx,
            classes,
            analysis: None,
        })
    }

    pub fn reader(&self) -> &HeapDumpFile {
        &self.reader
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn context(&self) -> &HeapContext {
        &self.ctx
    }

    pub fn class_table(&self) -> &ClassTable {
        &self.classes
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        self.analysis.as_ref()
    }

    /// Build the reachability graph and dominator tree if not done yet.
    /// Queries that need retained sizes call this first; everything else
    /// works without it.
    pub fn ensure_analysis(&mut self) -> Result<&Analysis> {
        if self.analysis.is_none() {
            let graph = HeapGraph::build(&self.index, &self.ctx)?;
            let dominators = DominatorTree::compute(&graph)?;
            self.analysis = Some(Analysis { graph, dominators });
        }
        Ok(self.analysis.as_ref().unwrap())
    }

    pub fn class_name(&self, class_obj_id: u64) -> String {
        self.ctx
            .class_name(class_obj_id)
            .map(|s| s.to_owned())
            .unwrap_or_else(|| format!("(class-{:X})", class_obj_id))
    }

    fn name_string(&self, name_id: u64) -> Result<Option<String>> {
        Ok(resolve_name(&self.reader, &self.index, name_id)?.map(|bytes| render_name(&bytes)))
    }

    /// Count + shallow size per class, sorted by descending count with
    /// descending size as the tie break.
    pub fn class_statistics(&self) -> Result<Vec<ClassStats>> {
        let tally = self
            .index
            .records_iter()
            .par_bridge()
            .try_fold(crate::counter::SizeTally::default, |mut tally, item| {
                let (_, entry) = item?;
                match entry.kind {
                    // class records are not instances of anything the
                    // statistics report
                    RecordEntryKind::Class => {}
                    RecordEntryKind::Instance
                    | RecordEntryKind::ObjectArray
                    | RecordEntryKind::PrimitiveArray => {
                        tally.add(entry.class_or_element, entry.shallow);
                    }
                }
                Ok::<_, crate::error::HprofError>(tally)
            })
            .try_reduce(crate::counter::SizeTally::default, |mut left, right| {
                left += right;
                Ok::<_, crate::error::HprofError>(left)
            })?;

        let stats = tally
            .into_iter()
            .map(|(class_id, (count, size))| ClassStats {
                id: class_id,
                name: self.class_name(class_id),
                count,
                size,
            })
            .sorted_by_key(|s| (Reverse(s.count), Reverse(s.size)))
            .collect();
        Ok(stats)
    }

    /// Object ids and shallow sizes for one class, largest first,
    /// optionally restricted to one record kind.
    pub fn instances_of(
        &self,
        class_obj_id: u64,
        kind_filter: Option<RecordEntryKind>,
    ) -> Result<Vec<InstanceStats>> {
        let mut out = Vec::new();
        for item in self.index.records_iter() {
            let (id, entry) = item?;
            if entry.kind == RecordEntryKind::Class || entry.class_or_element != class_obj_id {
                continue;
            }
            if let Some(filter) = kind_filter {
                if entry.kind != filter {
                    continue;
                }
            }
            out.push(InstanceStats {
                id,
                size: entry.shallow,
            });
        }
        out.sort_unstable_by_key(|s| (Reverse(s.size), s.id));
        Ok(out)
    }

    /// Decode one object: field values for instances, summary rows for
    /// arrays and classes. Object-typed fields carry a one-level lookup of
    /// the referent's class.
    pub fn instance_detail(&self, obj_id: u64) -> Result<Option<InstanceView>> {
        let entry = match self.index.record(obj_id)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let class_name = self.class_name(effective_class_id(&entry, obj_id));
        let mut view = InstanceView {
            id: obj_id,
            class: class_name,
            kind: kind_name(entry.kind),
            size: entry.shallow,
            fields: Vec::new(),
        };

        if entry.kind != RecordEntryKind::Instance {
            return Ok(Some(view));
        }

        let instance = match self.reader.parse_at(entry.offset, RecordKind::Instance)? {
            Record::Instance(i) => i,
            _ => unreachable!("parse_at validated the kind"),
        };

        let id_size = self.index.id_size();
        let descriptors = self.classes.chain_field_descriptors(entry.class_or_element);
        let mut input = instance.values();

        for descriptor in &descriptors {
            if input.len() < descriptor.field_type().size_in_bytes(id_size) {
                break;
            }
            let (rest, value) = descriptor
                .field_type()
                .parse_value(input, id_size)
                .expect("length checked above");
            input = rest;

            let name = self
                .name_string(descriptor.name_id().id())?
                .unwrap_or_else(|| format!("(name-{:X})", descriptor.name_id().id()));

            let reference = match value {
                FieldValue::ObjectId(target) if !target.is_null() => {
                    self.index.record(target.id())?.map(|target_entry| ReferenceView {
                        id: target.id(),
                        class: self.class_name(effective_class_id(&target_entry, target.id())),
                    })
                }
                _ => None,
            };

            view.fields.push(FieldView {
                name,
                field_type: descriptor.field_type().java_type_name(),
                value: value.render(),
                reference,
            });
        }

        Ok(Some(view))
    }

    pub fn outbound_references(&self, obj_id: u64) -> Result<Vec<ReferenceEdge>> {
        Ok(self
            .index
            .outbound(obj_id)?
            .into_iter()
            .map(|(id, kind)| ReferenceEdge {
                id,
                kind: kind.name(),
            })
            .collect())
    }

    pub fn inbound_references(&self, obj_id: u64) -> Result<Vec<ReferenceEdge>> {
        Ok(self
            .index
            .inbound(obj_id)?
            .into_iter()
            .map(|(id, kind)| ReferenceEdge {
                id,
                kind: kind.name(),
            })
            .collect())
    }

    /// Top objects by retained size, GC-root objects excluded, annotated
    /// with class names.
    pub fn retained_ranking(&mut self, limit: usize) -> Result<Vec<RankedObject>> {
        self.ensure_analysis()?;
        let analysis = self.analysis.as_ref().unwrap();
        let graph = &analysis.graph;
        let dominators = &analysis.dominators;

        let mut nodes: Vec<(u64, u32)> = (1..graph.node_count() as u32)
            .filter(|&node| dominators.is_reachable(node) && !graph.is_root_object(node))
            .map(|node| (dominators.retained(node), node))
            .collect();
        nodes.sort_unstable_by_key(|&(retained, node)| (Reverse(retained), node));
        nodes.truncate(limit);

        let mut out = Vec::with_capacity(nodes.len());
        for (retained, node) in nodes {
            let obj_id = graph.obj_id(node);
            let class_id = self
                .index
                .record(obj_id)?
                .map(|entry| effective_class_id(&entry, obj_id))
                .unwrap_or(0);
            out.push(RankedObject {
                id: obj_id,
                class: self.class_name(class_id),
                retained,
                saturated: dominators.is_saturated(node),
            });
        }
        Ok(out)
    }

    /// Total bytes reachable from the super-root.
    pub fn total_retained(&mut self) -> Result<u64> {
        let analysis = self.ensure_analysis()?;
        Ok(analysis.dominators.retained(SUPER_ROOT))
    }

    /// Thread listing with resolved stack frames and per-thread stack
    /// locals.
    pub fn threads(&self) -> Result<Vec<ThreadView>> {
        let mut out = Vec::new();

        for (&serial, thread) in self
            .ctx
            .threads_by_serial
            .iter()
            .sorted_by_key(|(serial, _)| **serial)
        {
            let name = self
                .name_string(thread.name_id)?
                .unwrap_or_else(|| "(unnamed)".to_owned());
            let group = self
                .name_string(thread.group_name_id)?
                .unwrap_or_else(|| String::new());

            let mut frames = Vec::new();
            if let Some(trace) = self.ctx.traces_by_serial.get(&thread.stack_trace_serial) {
                for frame_id in &trace.frame_ids {
                    let frame = match self.ctx.frames_by_id.get(frame_id) {
                        Some(frame) => frame,
                        None => continue,
                    };
                    let class = self
                        .index
                        .load_class_by_serial(frame.class_serial)?
                        .map(|lc| self.class_name(lc.class_obj_id))
                        .unwrap_or_else(|| "(unknown class)".to_owned());
                    frames.push(FrameView {
                        class,
                        method: self
                            .name_string(frame.method_name_id)?
                            .unwrap_or_else(|| "(unknown)".to_owned()),
                        signature: self
                            .name_string(frame.method_signature_id)?
                            .unwrap_or_default(),
                        source_file: self
                            .name_string(frame.source_file_name_id)?
                            .unwrap_or_default(),
                        line: frame.line,
                    });
                }
            }

            let locals = self
                .ctx
                .frame_locals_by_serial
                .get(&serial)
                .map(|locals| locals.iter().map(|l| l.obj_id).collect())
                .unwrap_or_default();

            out.push(ThreadView {
                serial,
                obj_id: thread.thread_obj_id,
                name,
                group,
                frames,
                locals,
            });
        }
        Ok(out)
    }
}

fn default_index_path(dump_path: &Path) -> PathBuf {
    let mut name = dump_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "heap".to_owned());
    name.push_str(".index");
    dump_path.with_file_name(name)
}

/// The class a record belongs to for display purposes. Class records are
/// instances of `java/lang/Class` via the rewrite, but display as
/// themselves.
fn effective_class_id(entry: &RecordEntry, obj_id: u64) -> u64 {
    match entry.kind {
        RecordEntryKind::Class => obj_id,
        _ => entry.class_or_element,
    }
}

fn kind_name(kind: RecordEntryKind) -> &'static str {
    match kind {
        RecordEntryKind::Class => "class",
        RecordEntryKind::Instance => "instance",
        RecordEntryKind::ObjectArray => "object-array",
        RecordEntryKind::PrimitiveArray => "primitive-array",
    }
}

/// Parse the `inst` / `oa` / `pa` kind filter of the instances listing.
pub fn parse_kind_filter(s: &str) -> Option<RecordEntryKind> {
    match s {
        "inst" => Some(RecordEntryKind::Instance),
        "oa" => Some(RecordEntryKind::ObjectArray),
        "pa" => Some(RecordEntryKind::PrimitiveArray),
        _ => None,
    }
}

/// Log a short per-phase summary after analysis.
pub fn log_analysis_summary(snapshot: &Snapshot) {
    if let Some(analysis) = snapshot.analysis() {
        info!(
            "analysis ready: {} graph nodes, total retained {} bytes",
            analysis.graph.node_count(),
            analysis.dominators.retained(SUPER_ROOT)
        );
    }
}
