//! Durable index over the dump: object id → record location and summary
//! metadata, class lookups by serial / id / name, GC roots, thread state,
//! and the resolved reference tables.
//!
//! Backed by sled, one tree per logical table. Keys are big-endian
//! fixed-width ids so tree order is id order; values are either fixed-width
//! encodings (hot tables) or JSON (cold tables).

use crate::error::{HprofError, Result};
use crate::heap_dump::{FakeClass, GcRootKind};
use crate::reader::HeapDumpFile;
use crate::IdSize;
use log::debug;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use std::path::Path;

pub const INDEX_VERSION: u32 = 1;

/// Offset sentinel for records that exist only in the index (fake classes).
pub const SYNTHETIC_OFFSET: u64 = u64::MAX;

/// Writes are batched and applied once this many operations accumulate.
const BATCH_OPS: usize = 100_000;

const TREE_META: &str = "meta";
const TREE_NAMES: &str = "names";
const TREE_LOAD_CLASSES: &str = "load_classes";
const TREE_LOAD_CLASSES_BY_CID: &str = "load_classes_by_cid";
const TREE_LOAD_CLASSES_BY_NAME: &str = "load_classes_by_name";
const TREE_RECORDS: &str = "records";
const TREE_GC_ROOTS: &str = "gc_roots";
const TREE_THREADS: &str = "threads";
const TREE_TRACES: &str = "traces";
const TREE_FRAMES: &str = "frames";
const TREE_REFS_OUT: &str = "refs_out";
const TREE_REFS_IN: &str = "refs_in";

const META_VERSION: &str = "version";
const META_ID_SIZE: &str = "idsize";
const META_TIMESTAMP: &str = "timestamp";
const META_FILE_LEN: &str = "file_len";
const META_INSTANCE_HEADER: &str = "instance_header";

/// What kind of record an object id resolves to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordEntryKind {
    Class,
    Instance,
    ObjectArray,
    PrimitiveArray,
}

impl RecordEntryKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            RecordEntryKind::Class => 0,
            RecordEntryKind::Instance => 1,
            RecordEntryKind::ObjectArray => 2,
            RecordEntryKind::PrimitiveArray => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<RecordEntryKind> {
        match v {
            0 => Some(RecordEntryKind::Class),
            1 => Some(RecordEntryKind::Instance),
            2 => Some(RecordEntryKind::ObjectArray),
            3 => Some(RecordEntryKind::PrimitiveArray),
            _ => None,
        }
    }
}

/// One entry of the `records` table.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub kind: RecordEntryKind,
    /// File offset of the sub-record, or [`SYNTHETIC_OFFSET`].
    pub offset: u64,
    /// Class id for instances and classes (their own id), element class id
    /// for object arrays. Primitive arrays hold the element type code here
    /// until the synthesised array classes replace it.
    pub class_or_element: u64,
    pub shallow: u64,
    /// Present only for synthesised classes.
    pub fake: Option<FakeClass>,
}

impl RecordEntry {
    pub fn is_synthetic(&self) -> bool {
        self.offset == SYNTHETIC_OFFSET
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(25);
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.class_or_element.to_be_bytes());
        out.extend_from_slice(&self.shallow.to_be_bytes());
        if let Some(fake) = &self.fake {
            out.extend_from_slice(&serde_json::to_vec(fake).expect("fake class serializes"));
        }
        out
    }

    fn decode(key: u64, bytes: &[u8]) -> Result<RecordEntry> {
        if bytes.len() < 25 {
            return Err(inconsistent(format!("record {:#x}", key)));
        }
        let kind = RecordEntryKind::from_u8(bytes[0])
            .ok_or_else(|| inconsistent(format!("record {:#x} kind {}", key, bytes[0])))?;
        let offset = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
        let class_or_element = u64::from_be_bytes(bytes[9..17].try_into().unwrap());
        let shallow = u64::from_be_bytes(bytes[17..25].try_into().unwrap());
        let fake = if bytes.len() > 25 {
            Some(
                serde_json::from_slice(&bytes[25..])
                    .map_err(|_| inconsistent(format!("record {:#x} fake class body", key)))?,
            )
        } else {
            None
        };
        if offset == SYNTHETIC_OFFSET && fake.is_none() {
            return Err(inconsistent(format!("record {:#x} synthetic without body", key)));
        }
        Ok(RecordEntry {
            kind,
            offset,
            class_or_element,
            shallow,
            fake,
        })
    }
}

/// Where a name's bytes live.
#[derive(Debug, Clone)]
pub enum NameRef {
    /// Offset of the UTF8 record in the dump.
    Offset(u64),
    /// Inline bytes for names synthesized by the analyzer.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedClassRecord {
    pub class_serial: u32,
    pub class_obj_id: u64,
    pub class_name_id: u64,
    pub synthetic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_serial: u32,
    pub thread_obj_id: u64,
    pub stack_trace_serial: u32,
    pub name_id: u64,
    pub group_name_id: u64,
    pub group_parent_name_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub stack_trace_serial: u32,
    pub thread_serial: u32,
    pub frame_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_id: u64,
    pub method_name_id: u64,
    pub method_signature_id: u64,
    pub source_file_name_id: u64,
    pub class_serial: u32,
    pub line: i32,
}

/// GC root as indexed: kind + where to re-read the full record.
#[derive(Debug, Copy, Clone)]
pub struct GcRootEntry {
    pub kind: GcRootKind,
    pub offset: u64,
}

/// What an edge in the reference tables means.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RefKind {
    /// Instance → its class, array → its array class.
    Class,
    /// Instance field slot.
    Field,
    /// Object array element.
    Element,
    /// Class static field.
    Static,
    /// Class → superclass.
    Super,
    /// Class → class loader.
    Loader,
    /// Thread object → stack-local object.
    ThreadLocal,
}

impl RefKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            RefKind::Class => 0,
            RefKind::Field => 1,
            RefKind::Element => 2,
            RefKind::Static => 3,
            RefKind::Super => 4,
            RefKind::Loader => 5,
            RefKind::ThreadLocal => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<RefKind> {
        match v {
            0 => Some(RefKind::Class),
            1 => Some(RefKind::Field),
            2 => Some(RefKind::Element),
            3 => Some(RefKind::Static),
            4 => Some(RefKind::Super),
            5 => Some(RefKind::Loader),
            6 => Some(RefKind::ThreadLocal),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RefKind::Class => "class",
            RefKind::Field => "field",
            RefKind::Element => "element",
            RefKind::Static => "static",
            RefKind::Super => "super",
            RefKind::Loader => "loader",
            RefKind::ThreadLocal => "thread-local",
        }
    }
}

fn encode_refs(refs: &[(u64, RefKind)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(refs.len() * 9);
    for (id, kind) in refs {
        out.extend_from_slice(&id.to_be_bytes());
        out.push(kind.as_u8());
    }
    out
}

fn decode_refs(key: u64, bytes: &[u8]) -> Result<Vec<(u64, RefKind)>> {
    if bytes.len() % 9 != 0 {
        return Err(inconsistent(format!("refs {:#x}", key)));
    }
    let mut out = Vec::with_capacity(bytes.len() / 9);
    for chunk in bytes.chunks_exact(9) {
        let id = u64::from_be_bytes(chunk[..8].try_into().unwrap());
        let kind = RefKind::from_u8(chunk[8])
            .ok_or_else(|| inconsistent(format!("refs {:#x} kind {}", key, chunk[8])))?;
        out.push((id, kind));
    }
    Ok(out)
}

fn inconsistent(key: String) -> HprofError {
    HprofError::IndexInconsistency { key }
}

/// Cheap identity of a dump, stored in the index so a stale index directory
/// is never used against a different file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HprofFingerprint {
    pub timestamp: u64,
    pub file_len: u64,
}

impl HprofFingerprint {
    pub fn from_dump(dump: &HeapDumpFile) -> HprofFingerprint {
        HprofFingerprint {
            timestamp: dump.header().timestamp_millis(),
            file_len: dump.data().len() as u64,
        }
    }
}

pub struct Index {
    db: sled::Db,
    meta: sled::Tree,
    names: sled::Tree,
    load_classes: sled::Tree,
    load_classes_by_cid: sled::Tree,
    load_classes_by_name: sled::Tree,
    records: sled::Tree,
    gc_roots: sled::Tree,
    threads: sled::Tree,
    traces: sled::Tree,
    frames: sled::Tree,
    refs_out: sled::Tree,
    refs_in: sled::Tree,
    id_size: IdSize,
    instance_header_size: u64,
}

fn index_from_db(db: sled::Db, id_size: IdSize, instance_header_size: u64) -> Result<Index> {
    Ok(Index {
        meta: db.open_tree(TREE_META)?,
        names: db.open_tree(TREE_NAMES)?,
        load_classes: db.open_tree(TREE_LOAD_CLASSES)?,
        load_classes_by_cid: db.open_tree(TREE_LOAD_CLASSES_BY_CID)?,
        load_classes_by_name: db.open_tree(TREE_LOAD_CLASSES_BY_NAME)?,
        records: db.open_tree(TREE_RECORDS)?,
        gc_roots: db.open_tree(TREE_GC_ROOTS)?,
        threads: db.open_tree(TREE_THREADS)?,
        traces: db.open_tree(TREE_TRACES)?,
        frames: db.open_tree(TREE_FRAMES)?,
        refs_out: db.open_tree(TREE_REFS_OUT)?,
        refs_in: db.open_tree(TREE_REFS_IN)?,
        db,
        id_size,
        instance_header_size,
    })
}

impl Index {
    /// Create a fresh index directory. Any existing content is discarded.
    pub fn create(
        path: &Path,
        fingerprint: &HprofFingerprint,
        id_size: IdSize,
        instance_header_size: u64,
    ) -> Result<Index> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        let db = sled::open(path)?;
        let index = index_from_db(db, id_size, instance_header_size)?;

        index
            .meta
            .insert(META_VERSION, &INDEX_VERSION.to_le_bytes()[..])?;
        index.meta.insert(
            META_ID_SIZE,
            &[id_size.size_in_bytes() as u8][..],
        )?;
        index
            .meta
            .insert(META_TIMESTAMP, &fingerprint.timestamp.to_le_bytes()[..])?;
        index
            .meta
            .insert(META_FILE_LEN, &fingerprint.file_len.to_le_bytes()[..])?;
        index.meta.insert(
            META_INSTANCE_HEADER,
            &instance_header_size.to_le_bytes()[..],
        )?;

        Ok(index)
    }

    /// Open an existing index and verify version and fingerprint. Returns
    /// `Ok(None)` when the directory is missing, version-mismatched, or was
    /// built from a different dump; the caller rebuilds.
    pub fn open(path: &Path, fingerprint: &HprofFingerprint) -> Result<Option<Index>> {
        if !path.exists() {
            return Ok(None);
        }
        let db = sled::open(path)?;

        let meta = db.open_tree(TREE_META)?;
        let version = match meta.get(META_VERSION)? {
            Some(v) if v.len() == 4 => u32::from_le_bytes(v.as_ref().try_into().unwrap()),
            _ => {
                debug!("index at {:?} has no readable version, rebuilding", path);
                return Ok(None);
            }
        };
        if version != INDEX_VERSION {
            debug!(
                "index version {} != supported {}, rebuilding",
                version, INDEX_VERSION
            );
            return Ok(None);
        }

        let ts = meta.get(META_TIMESTAMP)?;
        let file_len = meta.get(META_FILE_LEN)?;
        let matches = ts
            .map(|v| v.as_ref() == &fingerprint.timestamp.to_le_bytes()[..])
            .zip(file_len.map(|v| v.as_ref() == &fingerprint.file_len.to_le_bytes()[..]))
            .map(|(a, b)| a && b)
            .unwrap_or(false);
        if !matches {
            debug!("index fingerprint mismatch, rebuilding");
            return Ok(None);
        }

        let id_size = match meta.get(META_ID_SIZE)? {
            Some(v) if v.len() == 1 => IdSize::from_header_num(v[0] as u32)
                .ok_or_else(|| inconsistent("meta idsize".to_owned()))?,
            _ => return Err(inconsistent("meta idsize".to_owned())),
        };
        let instance_header_size = match meta.get(META_INSTANCE_HEADER)? {
            Some(v) if v.len() == 8 => u64::from_le_bytes(v.as_ref().try_into().unwrap()),
            _ => return Err(inconsistent("meta instance_header".to_owned())),
        };

        let index = index_from_db(db, id_size, instance_header_size)?;
        Ok(Some(index))
    }

    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    pub fn instance_header_size(&self) -> u64 {
        self.instance_header_size
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            names: sled::Batch::default(),
            load_classes: sled::Batch::default(),
            load_classes_by_cid: sled::Batch::default(),
            load_classes_by_name: sled::Batch::default(),
            records: sled::Batch::default(),
            gc_roots: sled::Batch::default(),
            threads: sled::Batch::default(),
            traces: sled::Batch::default(),
            frames: sled::Batch::default(),
            refs_out: sled::Batch::default(),
            refs_in: sled::Batch::default(),
            pending: 0,
            root_seq: std::collections::HashMap::new(),
        }
    }

    // ---- reads ----

    pub fn name(&self, name_id: u64) -> Result<Option<NameRef>> {
        let value = match self.names.get(name_id.to_be_bytes())? {
            Some(v) => v,
            None => return Ok(None),
        };
        match value.first() {
            Some(0x00) if value.len() == 9 => Ok(Some(NameRef::Offset(u64::from_be_bytes(
                value[1..9].try_into().unwrap(),
            )))),
            Some(0x01) => Ok(Some(NameRef::Inline(value[1..].to_vec()))),
            _ => Err(inconsistent(format!("name {:#x}", name_id))),
        }
    }

    pub fn load_class_by_serial(&self, serial: u32) -> Result<Option<LoadedClassRecord>> {
        match self.load_classes.get(serial.to_be_bytes())? {
            Some(v) => serde_json::from_slice(&v)
                .map(Some)
                .map_err(|_| inconsistent(format!("load_class {}", serial))),
            None => Ok(None),
        }
    }

    pub fn load_class_by_cid(&self, class_obj_id: u64) -> Result<Option<LoadedClassRecord>> {
        let serial = match self.load_classes_by_cid.get(class_obj_id.to_be_bytes())? {
            Some(v) if v.len() == 4 => u32::from_be_bytes(v.as_ref().try_into().unwrap()),
            Some(_) => return Err(inconsistent(format!("load_class_by_cid {:#x}", class_obj_id))),
            None => return Ok(None),
        };
        self.load_class_by_serial(serial)
    }

    pub fn load_class_by_name(&self, name: &[u8]) -> Result<Option<LoadedClassRecord>> {
        let serial = match self.load_classes_by_name.get(name)? {
            Some(v) if v.len() == 4 => u32::from_be_bytes(v.as_ref().try_into().unwrap()),
            Some(_) => {
                return Err(inconsistent(format!(
                    "load_class_by_name {}",
                    String::from_utf8_lossy(name)
                )))
            }
            None => return Ok(None),
        };
        self.load_class_by_serial(serial)
    }

    pub fn load_classes_iter(
        &self,
    ) -> impl Iterator<Item = Result<LoadedClassRecord>> + '_ {
        self.load_classes.iter().map(|kv| {
            let (k, v) = kv?;
            serde_json::from_slice(&v)
                .map_err(|_| inconsistent(format!("load_class key {:?}", k.as_ref())))
        })
    }

    pub fn record(&self, obj_id: u64) -> Result<Option<RecordEntry>> {
        match self.records.get(obj_id.to_be_bytes())? {
            Some(v) => RecordEntry::decode(obj_id, &v).map(Some),
            None => Ok(None),
        }
    }

    /// All record entries in ascending object-id order.
    pub fn records_iter(&self) -> impl Iterator<Item = Result<(u64, RecordEntry)>> + '_ {
        self.records.iter().map(|kv| {
            let (k, v) = kv?;
            if k.len() != 8 {
                return Err(inconsistent(format!("record key {:?}", k.as_ref())));
            }
            let id = u64::from_be_bytes(k.as_ref().try_into().unwrap());
            RecordEntry::decode(id, &v).map(|e| (id, e))
        })
    }

    /// Replace a record entry outside the batched build path (fake class
    /// registration, primitive array class rewrite).
    pub fn put_record(&self, obj_id: u64, entry: &RecordEntry) -> Result<()> {
        self.records
            .insert(obj_id.to_be_bytes().to_vec(), entry.encode())?;
        Ok(())
    }

    pub fn put_synthetic_name(&self, name_id: u64, text: &[u8]) -> Result<()> {
        let mut value = Vec::with_capacity(1 + text.len());
        value.push(0x01);
        value.extend_from_slice(text);
        self.names.insert(name_id.to_be_bytes().to_vec(), value)?;
        Ok(())
    }

    pub fn put_load_class(&self, record: &LoadedClassRecord, name: &[u8]) -> Result<()> {
        let body = serde_json::to_vec(record).expect("loaded class serializes");
        self.load_classes
            .insert(record.class_serial.to_be_bytes().to_vec(), body)?;
        self.load_classes_by_cid.insert(
            record.class_obj_id.to_be_bytes().to_vec(),
            record.class_serial.to_be_bytes().to_vec(),
        )?;
        self.load_classes_by_name
            .insert(name.to_vec(), record.class_serial.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Highest class serial in use; synthesised classes get serials above it.
    pub fn max_class_serial(&self) -> Result<u32> {
        match self.load_classes.last()? {
            Some((k, _)) if k.len() == 4 => {
                Ok(u32::from_be_bytes(k.as_ref().try_into().unwrap()))
            }
            Some((k, _)) => Err(inconsistent(format!("load_class key {:?}", k.as_ref()))),
            None => Ok(0),
        }
    }

    /// GC roots in enumeration order (kind-major, then file order within a
    /// kind; the per-kind sequence is assigned at indexing time).
    pub fn gc_roots(&self) -> Result<Vec<GcRootEntry>> {
        let mut out = Vec::new();
        for kv in self.gc_roots.iter() {
            let (k, v) = kv?;
            if k.len() != 5 || v.len() != 8 {
                return Err(inconsistent(format!("gc_root key {:?}", k.as_ref())));
            }
            let kind = GcRootKind::from_sub_tag(k[0])
                .ok_or_else(|| inconsistent(format!("gc_root kind {}", k[0])))?;
            let offset = u64::from_be_bytes(v.as_ref().try_into().unwrap());
            out.push(GcRootEntry { kind, offset });
        }
        Ok(out)
    }

    pub fn threads_iter(&self) -> impl Iterator<Item = Result<ThreadRecord>> + '_ {
        self.threads.iter().map(|kv| {
            let (k, v) = kv?;
            serde_json::from_slice(&v)
                .map_err(|_| inconsistent(format!("thread key {:?}", k.as_ref())))
        })
    }

    pub fn traces_iter(&self) -> impl Iterator<Item = Result<TraceRecord>> + '_ {
        self.traces.iter().map(|kv| {
            let (k, v) = kv?;
            serde_json::from_slice(&v)
                .map_err(|_| inconsistent(format!("trace key {:?}", k.as_ref())))
        })
    }

    pub fn frames_iter(&self) -> impl Iterator<Item = Result<FrameRecord>> + '_ {
        self.frames.iter().map(|kv| {
            let (k, v) = kv?;
            serde_json::from_slice(&v)
                .map_err(|_| inconsistent(format!("frame key {:?}", k.as_ref())))
        })
    }

    pub fn outbound(&self, obj_id: u64) -> Result<Vec<(u64, RefKind)>> {
        match self.refs_out.get(obj_id.to_be_bytes())? {
            Some(v) => decode_refs(obj_id, &v),
            None => Ok(Vec::new()),
        }
    }

    pub fn inbound(&self, obj_id: u64) -> Result<Vec<(u64, RefKind)>> {
        match self.refs_in.get(obj_id.to_be_bytes())? {
            Some(v) => decode_refs(obj_id, &v),
            None => Ok(Vec::new()),
        }
    }

    pub fn put_outbound(&self, obj_id: u64, refs: &[(u64, RefKind)]) -> Result<()> {
        self.refs_out
            .insert(obj_id.to_be_bytes().to_vec(), encode_refs(refs))?;
        Ok(())
    }

    pub fn put_inbound(&self, obj_id: u64, refs: &[(u64, RefKind)]) -> Result<()> {
        self.refs_in
            .insert(obj_id.to_be_bytes().to_vec(), encode_refs(refs))?;
        Ok(())
    }
}

/// Batched write handle for the one-pass builder.
pub struct IndexWriter<'i> {
    index: &'i Index,
    names: sled::Batch,
    load_classes: sled::Batch,
    load_classes_by_cid: sled::Batch,
    load_classes_by_name: sled::Batch,
    records: sled::Batch,
    gc_roots: sled::Batch,
    threads: sled::Batch,
    traces: sled::Batch,
    frames: sled::Batch,
    refs_out: sled::Batch,
    refs_in: sled::Batch,
    pending: usize,
    root_seq: std::collections::HashMap<u8, u32>,
}

impl<'i> IndexWriter<'i> {
    pub fn put_name_offset(&mut self, name_id: u64, offset: u64) -> Result<()> {
        let mut value = Vec::with_capacity(9);
        value.push(0x00);
        value.extend_from_slice(&offset.to_be_bytes());
        self.names.insert(name_id.to_be_bytes().to_vec(), value);
        self.bump(1)
    }

    pub fn put_load_class(&mut self, record: &LoadedClassRecord, name: &[u8]) -> Result<()> {
        let body = serde_json::to_vec(record).expect("loaded class serializes");
        self.load_classes
            .insert(record.class_serial.to_be_bytes().to_vec(), body);
        self.load_classes_by_cid.insert(
            record.class_obj_id.to_be_bytes().to_vec(),
            record.class_serial.to_be_bytes().to_vec(),
        );
        self.load_classes_by_name
            .insert(name.to_vec(), record.class_serial.to_be_bytes().to_vec());
        self.bump(3)
    }

    pub fn put_record(&mut self, obj_id: u64, entry: &RecordEntry) -> Result<()> {
        self.records
            .insert(obj_id.to_be_bytes().to_vec(), entry.encode());
        self.bump(1)
    }

    pub fn put_gc_root(&mut self, kind: GcRootKind, offset: u64) -> Result<()> {
        let seq = self.root_seq.entry(kind.sub_tag()).or_insert(0);
        let mut key = Vec::with_capacity(5);
        key.push(kind.sub_tag());
        key.extend_from_slice(&seq.to_be_bytes());
        *seq += 1;
        self.gc_roots.insert(key, offset.to_be_bytes().to_vec());
        self.bump(1)
    }

    pub fn put_thread(&mut self, record: &ThreadRecord) -> Result<()> {
        let body = serde_json::to_vec(record).expect("thread serializes");
        self.threads
            .insert(record.thread_serial.to_be_bytes().to_vec(), body);
        self.bump(1)
    }

    pub fn put_trace(&mut self, record: &TraceRecord) -> Result<()> {
        let body = serde_json::to_vec(record).expect("trace serializes");
        self.traces
            .insert(record.stack_trace_serial.to_be_bytes().to_vec(), body);
        self.bump(1)
    }

    pub fn put_frame(&mut self, record: &FrameRecord) -> Result<()> {
        let body = serde_json::to_vec(record).expect("frame serializes");
        self.frames
            .insert(record.frame_id.to_be_bytes().to_vec(), body);
        self.bump(1)
    }

    pub fn put_outbound(&mut self, obj_id: u64, refs: &[(u64, RefKind)]) -> Result<()> {
        self.refs_out
            .insert(obj_id.to_be_bytes().to_vec(), encode_refs(refs));
        self.bump(1)
    }

    pub fn put_inbound(&mut self, obj_id: u64, refs: &[(u64, RefKind)]) -> Result<()> {
        self.refs_in
            .insert(obj_id.to_be_bytes().to_vec(), encode_refs(refs));
        self.bump(1)
    }

    fn bump(&mut self, ops: usize) -> Result<()> {
        self.pending += ops;
        if self.pending >= BATCH_OPS {
            self.apply()?;
        }
        Ok(())
    }

    /// Apply all pending batches.
    pub fn apply(&mut self) -> Result<()> {
        let index = self.index;
        index
            .names
            .apply_batch(std::mem::take(&mut self.names))?;
        index
            .load_classes
            .apply_batch(std::mem::take(&mut self.load_classes))?;
        index
            .load_classes_by_cid
            .apply_batch(std::mem::take(&mut self.load_classes_by_cid))?;
        index
            .load_classes_by_name
            .apply_batch(std::mem::take(&mut self.load_classes_by_name))?;
        index
            .records
            .apply_batch(std::mem::take(&mut self.records))?;
        index
            .gc_roots
            .apply_batch(std::mem::take(&mut self.gc_roots))?;
        index
            .threads
            .apply_batch(std::mem::take(&mut self.threads))?;
        index
            .traces
            .apply_batch(std::mem::take(&mut self.traces))?;
        index
            .frames
            .apply_batch(std::mem::take(&mut self.frames))?;
        index
            .refs_out
            .apply_batch(std::mem::take(&mut self.refs_out))?;
        index
            .refs_in
            .apply_batch(std::mem::take(&mut self.refs_in))?;
        self.pending = 0;
        Ok(())
    }
}
