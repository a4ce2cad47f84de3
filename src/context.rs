//! In-memory tables derived from the index: thread state, GC roots in
//! enumeration order, and class-name caches. Rebuilt cheaply on every open;
//! read-only afterwards.

use crate::error::Result;
use crate::heap_dump::GcRootKind;
use crate::index::{FrameRecord, Index, NameRef, ThreadRecord, TraceRecord};
use crate::reader::{HeapDumpFile, Record};
use crate::records::RecordKind;
use crate::Serial;
use log::warn;
use std::collections::HashMap;

/// A GC root with its object id materialized from the dump.
#[derive(Debug, Copy, Clone)]
pub struct ResolvedGcRoot {
    pub kind: GcRootKind,
    pub obj_id: u64,
    pub thread_serial: Option<Serial>,
    pub frame_number: Option<u32>,
}

/// A stack-local object of a thread, for the thread listing.
#[derive(Debug, Copy, Clone)]
pub struct LocalFrameRef {
    pub obj_id: u64,
    pub frame_number: u32,
}

pub struct HeapContext {
    pub threads_by_serial: HashMap<Serial, ThreadRecord>,
    pub traces_by_serial: HashMap<Serial, TraceRecord>,
    pub frames_by_id: HashMap<u64, FrameRecord>,
    /// Enumeration order is the index's root order; graph construction
    /// depends on it being stable.
    pub gc_roots: Vec<ResolvedGcRoot>,
    /// Thread object id → the object ids its stack keeps alive.
    pub thread_locals: HashMap<u64, Vec<u64>>,
    /// Thread serial → stack locals with frame numbers.
    pub frame_locals_by_serial: HashMap<Serial, Vec<LocalFrameRef>>,
    pub class_names: HashMap<u64, String>,
    pub class_ids_by_name: HashMap<String, u64>,
}

impl HeapContext {
    pub fn build(reader: &HeapDumpFile, index: &Index) -> Result<HeapContext> {
        let mut threads_by_serial = HashMap::new();
        for thread in index.threads_iter() {
            let thread = thread?;
            threads_by_serial.insert(thread.thread_serial, thread);
        }

        let mut traces_by_serial = HashMap::new();
        for trace in index.traces_iter() {
            let trace = trace?;
            traces_by_serial.insert(trace.stack_trace_serial, trace);
        }

        let mut frames_by_id = HashMap::new();
        for frame in index.frames_iter() {
            let frame = frame?;
            frames_by_id.insert(frame.frame_id, frame);
        }

        let mut gc_roots = Vec::new();
        for entry in index.gc_roots()? {
            match reader.parse_at(entry.offset, RecordKind::GcRoot(entry.kind))? {
                Record::GcRoot(root) => gc_roots.push(ResolvedGcRoot {
                    kind: root.kind(),
                    obj_id: root.obj_id().id(),
                    thread_serial: root.thread_serial(),
                    frame_number: root.frame_number(),
                }),
                _ => unreachable!("parse_at validated the kind"),
            }
        }

        // thread serial -> thread object id, from thread-obj roots first and
        // StartThread records as backstop
        let mut thread_id_by_serial: HashMap<Serial, u64> = HashMap::new();
        for root in &gc_roots {
            if root.kind == GcRootKind::ThreadObj {
                if let Some(serial) = root.thread_serial {
                    thread_id_by_serial.insert(serial, root.obj_id);
                }
            }
        }
        for (serial, thread) in &threads_by_serial {
            thread_id_by_serial.entry(*serial).or_insert(thread.thread_obj_id);
        }

        let mut thread_locals: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut frame_locals_by_serial: HashMap<Serial, Vec<LocalFrameRef>> = HashMap::new();
        for root in &gc_roots {
            if !matches!(root.kind, GcRootKind::JniLocal | GcRootKind::JavaFrame) {
                continue;
            }
            if let Some(serial) = root.thread_serial {
                if let Some(&thread_obj_id) = thread_id_by_serial.get(&serial) {
                    thread_locals.entry(thread_obj_id).or_default().push(root.obj_id);
                }
                if let Some(frame_number) = root.frame_number {
                    frame_locals_by_serial
                        .entry(serial)
                        .or_default()
                        .push(LocalFrameRef {
                            obj_id: root.obj_id,
                            frame_number,
                        });
                }
            }
        }

        let mut class_names = HashMap::new();
        let mut class_ids_by_name = HashMap::new();
        for loaded in index.load_classes_iter() {
            let loaded = loaded?;
            let name = match resolve_name(reader, index, loaded.class_name_id)? {
                Some(bytes) => render_name(&bytes),
                None => {
                    warn!(
                        "class {:#x} has unresolvable name id {:#x}",
                        loaded.class_obj_id, loaded.class_name_id
                    );
                    format!("(class-{:X})", loaded.class_obj_id)
                }
            };
            class_ids_by_name
                .entry(name.clone())
                .or_insert(loaded.class_obj_id);
            class_names.insert(loaded.class_obj_id, name);
        }

        Ok(HeapContext {
            threads_by_serial,
            traces_by_serial,
            frames_by_id,
            gc_roots,
            thread_locals,
            frame_locals_by_serial,
            class_names,
            class_ids_by_name,
        })
    }

    pub fn class_name(&self, class_obj_id: u64) -> Option<&str> {
        self.class_names.get(&class_obj_id).map(|s| s.as_str())
    }
}

/// Fetch a name's bytes, following the indirection into the dump for real
/// UTF8 records and reading inline for synthesized ones.
pub fn resolve_name(
    reader: &HeapDumpFile,
    index: &Index,
    name_id: u64,
) -> Result<Option<Vec<u8>>> {
    match index.name(name_id)? {
        Some(NameRef::Offset(offset)) => match reader.parse_at(offset, RecordKind::Utf8)? {
            Record::Utf8(utf8) => Ok(Some(utf8.text().to_vec())),
            _ => unreachable!("parse_at validated the kind"),
        },
        Some(NameRef::Inline(bytes)) => Ok(Some(bytes)),
        None => Ok(None),
    }
}

/// Names are usually UTF-8 but the format does not guarantee it; invalid
/// sequences render as base64 rather than lossy replacement.
pub fn render_name(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => base64::encode(bytes),
    }
}
