//! One-pass index construction plus the fixed-order processors that finish
//! the job: class-name caches, object alignment, fake-class synthesis, and
//! reference resolution. Order matters: classes must be indexed before fake
//! classes are synthesised, and fake classes must exist before references
//! resolve.

use crate::context::HeapContext;
use crate::error::{HprofError, Result};
use crate::heap_dump::{FakeClass, FakeField, FieldType, PrimitiveArrayType};
use crate::index::{
    HprofFingerprint, Index, LoadedClassRecord, RecordEntry, RecordEntryKind, RefKind,
    SYNTHETIC_OFFSET,
};
use crate::index::{FrameRecord, ThreadRecord, TraceRecord};
use crate::reader::{HeapDumpFile, Record};
use crate::records::RecordKind;
use crate::resolve::{ClassTable, Resolver, CLASSLOADER_CLASS_NAME, CLASS_CLASS_NAME, OBJECT_CLASS_NAME};
use log::{info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashMap;
use std::path::Path;

const MIN_OBJECT_ALIGN: u64 = 8;
const MAX_OBJECT_ALIGN: u64 = 256;

/// Knobs for index construction.
#[derive(Debug, Clone, Copy)]
pub struct IndexerOptions {
    /// Bytes the runtime charges per object header. The classic figure is
    /// 16, but it varies with runtime and pointer compression settings.
    pub instance_header_size: u64,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        IndexerOptions {
            instance_header_size: 16,
        }
    }
}

/// Open the index next to the dump, building it first when missing or
/// stale. A failed build removes the partial index directory.
pub fn open_or_build(
    reader: &HeapDumpFile,
    index_path: &Path,
    options: IndexerOptions,
) -> Result<Index> {
    let fingerprint = HprofFingerprint::from_dump(reader);

    if let Some(index) = Index::open(index_path, &fingerprint)? {
        info!("reusing index at {}", index_path.display());
        return Ok(index);
    }

    info!("building index at {}", index_path.display());
    match build_index(reader, index_path, &fingerprint, options) {
        Ok(index) => Ok(index),
        Err(e) => {
            // leave no partial index behind
            if index_path.exists() {
                let _ = std::fs::remove_dir_all(index_path);
            }
            Err(e)
        }
    }
}

pub fn build_index(
    reader: &HeapDumpFile,
    index_path: &Path,
    fingerprint: &HprofFingerprint,
    options: IndexerOptions,
) -> Result<Index> {
    let index = Index::create(
        index_path,
        fingerprint,
        reader.id_size(),
        options.instance_header_size,
    )?;

    let mut builder = Builder::default();
    streaming_pass(reader, &index, options, &mut builder)?;

    let object_align = compute_object_align(&index)?;
    info!(
        "indexed {} objects, max id {:#x}, object alignment {}",
        builder.object_count, builder.max_object_id, object_align
    );

    let synth = synthesize_missing_classes(&index, &builder, object_align)?;
    rewrite_class_pointers(&index, &synth)?;

    let ctx = HeapContext::build(reader, &index)?;
    let classes = ClassTable::load(reader, &index, &ctx)?;
    resolve_references(reader, &index, &ctx, &classes)?;

    index.flush()?;
    Ok(index)
}

#[derive(Default)]
struct Builder {
    object_count: u64,
    max_object_id: u64,
    max_name_id: u64,
    /// Name ids of the well-known class names seen in the UTF8 stream.
    special_name_ids: HashMap<&'static str, u64>,
    /// Offsets of every UTF8 record, for resolving LoadClass names before
    /// batched writes land.
    name_offsets: FxHashMap<u64, u64>,
    /// Class id → byte size its instances need, from observed instance
    /// payloads and superclass size arithmetic.
    required_classes: FxHashMap<u64, (u64, bool)>,
    required_array_classes: FxHashSet<u64>,
    required_prim_arrays: FxHashSet<u8>,
}

impl Builder {
    fn observe_object_id(&mut self, id: u64) {
        self.object_count += 1;
        if id > self.max_object_id {
            self.max_object_id = id;
        }
    }

    fn require_class(&mut self, class_id: u64, size: u64, size_known: bool) {
        if class_id == 0 {
            return;
        }
        let entry = self.required_classes.entry(class_id).or_insert((size, size_known));
        if size_known {
            *entry = (size, true);
        }
    }
}

fn streaming_pass(
    reader: &HeapDumpFile,
    index: &Index,
    options: IndexerOptions,
    builder: &mut Builder,
) -> Result<()> {
    let id_size = reader.id_size();
    let mut writer = index.writer();
    let mut records = reader.records();

    while let Some(record) = records.next() {
        match record? {
            Record::Utf8(utf8) => {
                let (pos, _) = utf8.pos_and_len();
                let name_id = utf8.name_id().id();
                writer.put_name_offset(name_id, pos)?;
                builder.name_offsets.insert(name_id, pos);
                if name_id > builder.max_name_id {
                    builder.max_name_id = name_id;
                }
                for special in &[OBJECT_CLASS_NAME, CLASS_CLASS_NAME, CLASSLOADER_CLASS_NAME] {
                    if utf8.text() == special.as_bytes() {
                        builder.special_name_ids.insert(special, name_id);
                    }
                }
            }
            Record::LoadClass(lc) => {
                let record = LoadedClassRecord {
                    class_serial: lc.class_serial(),
                    class_obj_id: lc.class_obj_id().id(),
                    class_name_id: lc.class_name_id().id(),
                    synthetic: false,
                };
                let name = lookup_name_bytes(reader, builder, lc.class_name_id().id());
                match name {
                    Some(bytes) => writer.put_load_class(&record, &bytes)?,
                    None => {
                        warn!(
                            "LoadClass serial {} references unseen name {:#x}",
                            lc.class_serial(),
                            lc.class_name_id().id()
                        );
                        let placeholder = format!("(name-{:X})", lc.class_name_id().id());
                        writer.put_load_class(&record, placeholder.as_bytes())?;
                    }
                }
            }
            Record::StackFrame(frame) => {
                writer.put_frame(&FrameRecord {
                    frame_id: frame.id().id(),
                    method_name_id: frame.method_name_id().id(),
                    method_signature_id: frame.method_signature_id().id(),
                    source_file_name_id: frame.source_file_name_id().id(),
                    class_serial: frame.class_serial(),
                    line: frame.line_num().as_i32(),
                })?;
            }
            Record::StackTrace(trace) => {
                let mut frame_ids = Vec::new();
                for id in trace.frame_ids() {
                    match id {
                        Ok(id) => frame_ids.push(id.id()),
                        Err(_) => {
                            let (pos, _) = trace.pos_and_len();
                            return Err(HprofError::truncated("stack-trace", pos));
                        }
                    }
                }
                writer.put_trace(&TraceRecord {
                    stack_trace_serial: trace.stack_trace_serial(),
                    thread_serial: trace.thread_serial(),
                    frame_ids,
                })?;
            }
            Record::StartThread(thread) => {
                writer.put_thread(&ThreadRecord {
                    thread_serial: thread.thread_serial(),
                    thread_obj_id: thread.thread_obj_id().id(),
                    stack_trace_serial: thread.stack_trace_serial(),
                    name_id: thread.thread_name_id().id(),
                    group_name_id: thread.thread_group_name_id().id(),
                    group_parent_name_id: thread.thread_group_parent_name_id().id(),
                })?;
            }
            Record::HeapDumpBoundary(_) => {}
            Record::Class(class) => {
                let (pos, _) = class.pos_and_len();
                builder.observe_object_id(class.obj_id().id());

                // a superclass must be able to hold whatever of the instance
                // size this class's own fields do not account for
                if let Some(super_id) = class.super_class_obj_id() {
                    let own: u64 = class
                        .instance_fields()
                        .iter()
                        .map(|fd| fd.field_type().size_in_bytes(id_size) as u64)
                        .sum();
                    let super_size = (class.instance_size_bytes() as u64).saturating_sub(own);
                    builder.require_class(super_id.id(), super_size, false);
                }

                writer.put_record(
                    class.obj_id().id(),
                    &RecordEntry {
                        kind: RecordEntryKind::Class,
                        offset: pos,
                        class_or_element: 0,
                        shallow: 0,
                        fake: None,
                    },
                )?;
            }
            Record::Instance(instance) => {
                let (pos, _) = instance.pos_and_len();
                builder.observe_object_id(instance.obj_id().id());
                builder.require_class(
                    instance.class_obj_id().id(),
                    instance.values().len() as u64,
                    true,
                );
                writer.put_record(
                    instance.obj_id().id(),
                    &RecordEntry {
                        kind: RecordEntryKind::Instance,
                        offset: pos,
                        class_or_element: instance.class_obj_id().id(),
                        shallow: instance.shallow_size(options.instance_header_size),
                        fake: None,
                    },
                )?;
            }
            Record::ObjectArray(array) => {
                let (pos, _) = array.pos_and_len();
                builder.observe_object_id(array.obj_id().id());
                builder
                    .required_array_classes
                    .insert(array.array_class_obj_id().id());
                writer.put_record(
                    array.obj_id().id(),
                    &RecordEntry {
                        kind: RecordEntryKind::ObjectArray,
                        offset: pos,
                        class_or_element: array.array_class_obj_id().id(),
                        shallow: array.shallow_size(id_size),
                        fake: None,
                    },
                )?;
            }
            Record::PrimitiveArray(array) => {
                let (pos, _) = array.pos_and_len();
                builder.observe_object_id(array.obj_id().id());
                builder
                    .required_prim_arrays
                    .insert(array.element_type().type_code());
                writer.put_record(
                    array.obj_id().id(),
                    &RecordEntry {
                        kind: RecordEntryKind::PrimitiveArray,
                        offset: pos,
                        // element type code; replaced by the synthesised
                        // array class id later
                        class_or_element: array.element_type().type_code() as u64,
                        shallow: array.shallow_size(),
                        fake: None,
                    },
                )?;
            }
            Record::GcRoot(root) => {
                if !root.kind().is_skipped() {
                    let (pos, _) = root.pos_and_len();
                    writer.put_gc_root(root.kind(), pos)?;
                }
            }
        }
    }

    writer.apply()?;

    let unknown = records.unknown_tag_counts();
    if !unknown.is_empty() {
        let total: u64 = unknown.values().sum();
        warn!(
            "skipped {} records with {} distinct unknown tags",
            total,
            unknown.len()
        );
    }

    Ok(())
}

fn lookup_name_bytes(
    reader: &HeapDumpFile,
    builder: &Builder,
    name_id: u64,
) -> Option<Vec<u8>> {
    let offset = *builder.name_offsets.get(&name_id)?;
    match reader.parse_at(offset, RecordKind::Utf8) {
        Ok(Record::Utf8(utf8)) => Some(utf8.text().to_vec()),
        _ => None,
    }
}

/// Greatest common divisor of consecutive instance-id gaps, clamped to
/// `[8, 256]`. Used to place synthetic ids past the real ones plausibly.
fn compute_object_align(index: &Index) -> Result<u64> {
    let mut prev: Option<u64> = None;
    let mut align: u64 = 0;

    for entry in index.records_iter() {
        let (id, entry) = entry?;
        if entry.kind != RecordEntryKind::Instance || id == 0 {
            continue;
        }
        if let Some(p) = prev {
            let diff = id - p;
            align = gcd(align, diff);
            if align != 0 && align <= MIN_OBJECT_ALIGN {
                break;
            }
        }
        prev = Some(id);
    }

    Ok(align.min(MAX_OBJECT_ALIGN).max(MIN_OBJECT_ALIGN))
}

fn gcd(a: u64, b: u64) -> u64 {
    if a == 0 {
        return b;
    }
    if b == 0 {
        return a;
    }
    let (mut a, mut b) = (a.max(b), a.min(b));
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Rewrites applied after fake-class synthesis.
#[derive(Default)]
struct SyntheticClasses {
    /// `java/lang/Class`'s id (real or synthesised); class records become
    /// its instances.
    lang_class_id: u64,
    /// Missing array class id → synthesised class id.
    array_class_map: FxHashMap<u64, u64>,
    /// Primitive element type code → synthesised `<type>[]` class id.
    prim_class_map: FxHashMap<u8, u64>,
}

struct SyntheticAllocator<'i> {
    index: &'i Index,
    next_object_id: u64,
    object_align: u64,
    next_name_id: u64,
    next_serial: u32,
    text_ids: HashMap<Vec<u8>, u64>,
}

impl<'i> SyntheticAllocator<'i> {
    fn next_class_id(&mut self) -> u64 {
        self.next_object_id += self.object_align;
        self.next_object_id
    }

    fn get_or_create_text(&mut self, text: &[u8]) -> Result<u64> {
        if let Some(&id) = self.text_ids.get(text) {
            return Ok(id);
        }
        self.next_name_id += 1;
        let id = self.next_name_id;
        self.index.put_synthetic_name(id, text)?;
        self.text_ids.insert(text.to_vec(), id);
        Ok(id)
    }

    /// Register a fake class: record entry, load-class row, name indexes.
    fn add_fake_class(
        &mut self,
        class_obj_id: u64,
        super_class_obj_id: u64,
        name: &[u8],
        fields: Vec<FakeField>,
    ) -> Result<()> {
        let name_id = self.get_or_create_text(name)?;
        self.next_serial += 1;

        self.index.put_record(
            class_obj_id,
            &RecordEntry {
                kind: RecordEntryKind::Class,
                offset: SYNTHETIC_OFFSET,
                class_or_element: 0,
                shallow: 0,
                fake: Some(FakeClass {
                    class_obj_id,
                    super_class_obj_id,
                    instance_fields: fields,
                }),
            },
        )?;
        self.index.put_load_class(
            &LoadedClassRecord {
                class_serial: self.next_serial,
                class_obj_id,
                class_name_id: name_id,
                synthetic: true,
            },
            name,
        )?;
        Ok(())
    }
}

fn synthesize_missing_classes(
    index: &Index,
    builder: &Builder,
    object_align: u64,
) -> Result<SyntheticClasses> {
    let mut alloc = SyntheticAllocator {
        index,
        next_object_id: builder.max_object_id,
        object_align,
        next_name_id: builder.max_name_id,
        next_serial: index.max_class_serial()?,
        text_ids: builder
            .special_name_ids
            .iter()
            .map(|(name, id)| (name.as_bytes().to_vec(), *id))
            .collect(),
    };
    let mut synth = SyntheticClasses::default();

    let object_class_id = index
        .load_class_by_name(OBJECT_CLASS_NAME.as_bytes())?
        .map(|lc| lc.class_obj_id)
        .unwrap_or(0);
    if object_class_id == 0 {
        warn!("dump declares no {}; synthetic classes get no superclass", OBJECT_CLASS_NAME);
    }

    // java/lang/Class and java/lang/ClassLoader go first so class records
    // can become instances of the former
    synth.lang_class_id = match index.load_class_by_name(CLASS_CLASS_NAME.as_bytes())? {
        Some(lc) => lc.class_obj_id,
        None => {
            let id = alloc.next_class_id();
            alloc.add_fake_class(id, object_class_id, CLASS_CLASS_NAME.as_bytes(), Vec::new())?;
            id
        }
    };
    if index
        .load_class_by_name(CLASSLOADER_CLASS_NAME.as_bytes())?
        .is_none()
    {
        let id = alloc.next_class_id();
        alloc.add_fake_class(
            id,
            object_class_id,
            CLASSLOADER_CLASS_NAME.as_bytes(),
            Vec::new(),
        )?;
    }

    let mut unknown_class_counter = 0_u32;

    // arrays referencing classes the dump never declared
    let mut missing_arrays: Vec<u64> = builder
        .required_array_classes
        .iter()
        .copied()
        .collect();
    missing_arrays.sort_unstable();
    for class_id in missing_arrays {
        if index.record(class_id)?.is_some() {
            continue;
        }
        let fresh = alloc.next_class_id();
        let name = format!("unknown-class-{}[]", unknown_class_counter);
        unknown_class_counter += 1;
        alloc.add_fake_class(fresh, object_class_id, name.as_bytes(), Vec::new())?;
        synth.array_class_map.insert(class_id, fresh);
    }

    // every primitive array element type gets a `<type>[]` class
    for prim in PrimitiveArrayType::iter() {
        if !builder.required_prim_arrays.contains(&prim.type_code()) {
            continue;
        }
        let name = prim.array_class_name();
        let class_id = match index.load_class_by_name(name.as_bytes())? {
            Some(lc) => lc.class_obj_id,
            None => {
                let fresh = alloc.next_class_id();
                alloc.add_fake_class(fresh, object_class_id, name.as_bytes(), Vec::new())?;
                fresh
            }
        };
        synth.prim_class_map.insert(prim.type_code(), class_id);
    }

    // instances (and superclass slots) whose class the dump never declared:
    // fabricate a layout that consumes the observed payload bytes
    let mut missing_regular: Vec<(u64, u64)> = Vec::new();
    for (&class_id, &(size, _known)) in &builder.required_classes {
        if index.record(class_id)?.is_none() {
            missing_regular.push((class_id, size));
        }
    }
    missing_regular.sort_unstable();
    for (class_id, size) in missing_regular {
        let size = if size >= i32::MAX as u64 { 0 } else { size };
        let mut fields = Vec::new();
        let mut field_counter = 0_u32;
        for _ in 0..size / 4 {
            let name = format!("unknown-field-{}", field_counter);
            field_counter += 1;
            fields.push(FakeField {
                name_id: alloc.get_or_create_text(name.as_bytes())?,
                type_code: FieldType::Int.type_code(),
            });
        }
        if size & 2 != 0 {
            let name = format!("unknown-field-{}", field_counter);
            field_counter += 1;
            fields.push(FakeField {
                name_id: alloc.get_or_create_text(name.as_bytes())?,
                type_code: FieldType::Short.type_code(),
            });
        }
        if size & 1 != 0 {
            let name = format!("unknown-field-{}", field_counter);
            fields.push(FakeField {
                name_id: alloc.get_or_create_text(name.as_bytes())?,
                type_code: FieldType::Byte.type_code(),
            });
        }
        let name = format!("unknown-class-{}", unknown_class_counter);
        unknown_class_counter += 1;
        alloc.add_fake_class(class_id, object_class_id, name.as_bytes(), fields)?;
    }

    if unknown_class_counter > 0 {
        info!("synthesised {} unknown classes", unknown_class_counter);
    }

    Ok(synth)
}

/// Apply the post-synthesis pointer rewrites: class records become
/// instances of `java/lang/Class`, object arrays of vanished classes point
/// at their stand-ins, and primitive arrays trade their element type code
/// for the `<type>[]` class id.
fn rewrite_class_pointers(index: &Index, synth: &SyntheticClasses) -> Result<()> {
    let mut updates: Vec<(u64, RecordEntry)> = Vec::new();

    for entry in index.records_iter() {
        let (id, mut entry) = entry?;
        match entry.kind {
            RecordEntryKind::Class => {
                if entry.class_or_element != synth.lang_class_id {
                    entry.class_or_element = synth.lang_class_id;
                    updates.push((id, entry));
                }
            }
            RecordEntryKind::ObjectArray => {
                if let Some(&fresh) = synth.array_class_map.get(&entry.class_or_element) {
                    entry.class_or_element = fresh;
                    updates.push((id, entry));
                }
            }
            RecordEntryKind::PrimitiveArray => {
                if let Some(&class_id) = synth.prim_class_map.get(&(entry.class_or_element as u8)) {
                    entry.class_or_element = class_id;
                    updates.push((id, entry));
                }
            }
            RecordEntryKind::Instance => {}
        }
    }

    let mut writer = index.writer();
    for (id, entry) in updates {
        writer.put_record(id, &entry)?;
    }
    writer.apply()?;
    Ok(())
}

fn resolve_references(
    reader: &HeapDumpFile,
    index: &Index,
    ctx: &HeapContext,
    classes: &ClassTable,
) -> Result<()> {
    let mut resolver = Resolver::new(index, classes, ctx);
    let mut writer = index.writer();
    let mut inbound: FxHashMap<u64, Vec<(u64, RefKind)>> = FxHashMap::default();

    let mut record_refs = |writer: &mut crate::index::IndexWriter<'_>,
                           inbound: &mut FxHashMap<u64, Vec<(u64, RefKind)>>,
                           from: u64,
                           refs: Vec<(u64, RefKind)>|
     -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }
        for (to, kind) in &refs {
            inbound.entry(*to).or_default().push((from, *kind));
        }
        writer.put_outbound(from, &refs)
    };

    for entry in index.records_iter() {
        let (obj_id, entry) = entry?;
        match entry.kind {
            RecordEntryKind::Class => {
                if let Some(info) = classes.get(obj_id) {
                    let refs = resolver.class_refs(info)?;
                    record_refs(&mut writer, &mut inbound, obj_id, refs)?;
                }
            }
            RecordEntryKind::Instance => {
                let instance = match reader.parse_at(entry.offset, RecordKind::Instance)? {
                    Record::Instance(i) => i,
                    _ => unreachable!("parse_at validated the kind"),
                };
                let mut refs = resolver.instance_refs(&instance)?;
                if let Some(locals) = ctx.thread_locals.get(&obj_id) {
                    refs.extend(resolver.thread_local_refs(obj_id, locals)?);
                }
                record_refs(&mut writer, &mut inbound, obj_id, refs)?;
            }
            RecordEntryKind::ObjectArray => {
                let array = match reader.parse_at(entry.offset, RecordKind::ObjectArray)? {
                    Record::ObjectArray(a) => a,
                    _ => unreachable!("parse_at validated the kind"),
                };
                let refs = resolver.object_array_refs(&array, entry.class_or_element)?;
                record_refs(&mut writer, &mut inbound, obj_id, refs)?;
            }
            // primitive arrays hold no references
            RecordEntryKind::PrimitiveArray => {}
        }
    }

    let mut inbound: Vec<(u64, Vec<(u64, RefKind)>)> = inbound.into_iter().collect();
    inbound.sort_unstable_by_key(|(id, _)| *id);
    for (to, refs) in inbound {
        writer.put_inbound(to, &refs)?;
    }

    writer.apply()?;

    let stats = &resolver.stats;
    if stats.missing_referents > 0 || stats.layout_mismatches > 0 {
        warn!(
            "reference resolution dropped {} edges to missing records, {} layout mismatches",
            stats.missing_referents, stats.layout_mismatches
        );
    }
    Ok(())
}
