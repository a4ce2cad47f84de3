//! End-to-end pipeline tests over synthetic dumps: index build, reference
//! resolution, graph + dominator analysis, and the query surface.

mod common;

use common::{DumpBuilder, InstanceField, StaticField};
use hprof_analyzer::heap_dump::{FieldType, FieldValue};
use hprof_analyzer::index::RecordEntryKind;
use hprof_analyzer::indexer::IndexerOptions;
use hprof_analyzer::reader::{HeapDumpFile, Record};
use hprof_analyzer::records::RecordKind;
use hprof_analyzer::snapshot::Snapshot;

const N_OBJECT: u64 = 0x101;
const N_CLASS: u64 = 0x102;
const N_NODE: u64 = 0x110;
const N_NEXT: u64 = 0x111;

const C_OBJECT: u64 = 0x1000;
const C_NODE: u64 = 0x1010;

fn open(dir: &tempfile::TempDir, path: std::path::PathBuf) -> Snapshot {
    let _ = dir;
    Snapshot::open(&path, None, IndexerOptions::default()).expect("snapshot opens")
}

/// Object class + a linked-list node class with a single object field.
fn node_classes(b: &mut DumpBuilder) {
    b.utf8(N_OBJECT, b"java/lang/Object")
        .utf8(N_CLASS, b"java/lang/Class")
        .utf8(N_NODE, b"com/example/Node")
        .utf8(N_NEXT, b"next")
        .load_class(1, C_OBJECT, N_OBJECT)
        .load_class(2, C_NODE, N_NODE);
    b.class(C_OBJECT, 0, 0, &[], &[]);
    b.class(
        C_NODE,
        C_OBJECT,
        8,
        &[],
        &[InstanceField {
            name_id: N_NEXT,
            type_code: common::TYPE_OBJECT,
        }],
    );
}

#[test]
fn cycle_with_one_root_retains_both_objects() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b.instance_with_refs(0x2010, C_NODE, &[0x2000]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "cycle.hprof");

    let mut snapshot = open(&dir, path);
    let shallow = 8 + 16; // one id-sized field plus the object header

    let analysis = snapshot.ensure_analysis().unwrap();
    let a = analysis.graph.node_index(0x2000).expect("A is in the graph");
    let b_node = analysis.graph.node_index(0x2010).expect("B is in the graph");

    assert_eq!(Some(a), analysis.dominators.idom(b_node));
    assert_eq!(shallow, analysis.dominators.retained(b_node));
    assert_eq!(2 * shallow, analysis.dominators.retained(a));

    // classes are reachable but weightless, so the super-root total is the
    // two instances
    assert_eq!(2 * shallow, snapshot.total_retained().unwrap());
}

#[test]
fn outbound_references_list_each_field_slot_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b.instance_with_refs(0x2010, C_NODE, &[0]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "refs.hprof");

    let snapshot = open(&dir, path);

    let out = snapshot.outbound_references(0x2000).unwrap();
    let field_targets: Vec<u64> = out
        .iter()
        .filter(|e| e.kind == "field")
        .map(|e| e.id)
        .collect();
    assert_eq!(vec![0x2010], field_targets);
    let class_targets: Vec<u64> = out
        .iter()
        .filter(|e| e.kind == "class")
        .map(|e| e.id)
        .collect();
    assert_eq!(vec![C_NODE], class_targets);

    // null field of B contributes nothing
    let out_b = snapshot.outbound_references(0x2010).unwrap();
    assert!(out_b.iter().all(|e| e.kind != "field"));

    let inbound = snapshot.inbound_references(0x2010).unwrap();
    assert_eq!(1, inbound.len());
    assert_eq!(0x2000, inbound[0].id);
    assert_eq!("field", inbound[0].kind);
}

#[test]
fn weak_referent_is_suppressed_and_unreachable() {
    const N_REFERENCE: u64 = 0x120;
    const N_WEAK: u64 = 0x121;
    const N_W: u64 = 0x122;
    const N_T: u64 = 0x123;
    const N_REFERENT: u64 = 0x124;
    const C_REFERENCE: u64 = 0x1020;
    const C_WEAK: u64 = 0x1030;
    const C_W: u64 = 0x1040;
    const C_T: u64 = 0x1050;

    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    b.utf8(N_OBJECT, b"java/lang/Object")
        .utf8(N_REFERENCE, b"java/lang/ref/Reference")
        .utf8(N_WEAK, b"java/lang/ref/WeakReference")
        .utf8(N_W, b"com/example/W")
        .utf8(N_T, b"com/example/T")
        .utf8(N_REFERENT, b"referent")
        .load_class(1, C_OBJECT, N_OBJECT)
        .load_class(2, C_REFERENCE, N_REFERENCE)
        .load_class(3, C_WEAK, N_WEAK)
        .load_class(4, C_W, N_W)
        .load_class(5, C_T, N_T);
    b.class(C_OBJECT, 0, 0, &[], &[]);
    b.class(
        C_REFERENCE,
        C_OBJECT,
        8,
        &[],
        &[InstanceField {
            name_id: N_REFERENT,
            type_code: common::TYPE_OBJECT,
        }],
    );
    b.class(C_WEAK, C_REFERENCE, 8, &[], &[]);
    b.class(C_W, C_WEAK, 8, &[], &[]);
    b.class(C_T, C_OBJECT, 0, &[], &[]);
    // w's only field is the inherited referent slot, pointing at t
    b.instance_with_refs(0x2000, C_W, &[0x2010]);
    b.instance(0x2010, C_T, &[]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "weak.hprof");

    let mut snapshot = open(&dir, path);

    let out = snapshot.outbound_references(0x2000).unwrap();
    assert!(
        out.iter().all(|e| e.id != 0x2010),
        "the referent edge must not be recorded"
    );

    let w_shallow = 8 + 16;
    let analysis = snapshot.ensure_analysis().unwrap();
    assert!(
        analysis.graph.node_index(0x2010).is_none(),
        "t must be unreachable"
    );
    let w = analysis.graph.node_index(0x2000).unwrap();
    assert_eq!(w_shallow, analysis.dominators.retained(w));
}

#[test]
fn missing_array_class_is_synthesised() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    b.utf8(N_OBJECT, b"java/lang/Object")
        .load_class(1, C_OBJECT, N_OBJECT);
    b.class(C_OBJECT, 0, 0, &[], &[]);
    // the dump references class 0x9999 but never declares it
    b.object_array(0x3000, 0x9999, &[]);
    b.root_jni_global(0x3000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "missing-class.hprof");

    let snapshot = open(&dir, path);

    let entry = snapshot.index().record(0x3000).unwrap().expect("array indexed");
    let synthetic_id = entry.class_or_element;
    assert!(
        synthetic_id > 0x3000,
        "stand-in id {:#x} must exceed every observed object id",
        synthetic_id
    );

    let class_entry = snapshot
        .index()
        .record(synthetic_id)
        .unwrap()
        .expect("stand-in class resolvable");
    assert_eq!(RecordEntryKind::Class, class_entry.kind);
    assert!(class_entry.is_synthetic());

    let name = snapshot.class_name(synthetic_id);
    assert!(
        name.starts_with("unknown-class-") && name.ends_with("[]"),
        "unexpected stand-in name {:?}",
        name
    );

    let loaded = snapshot
        .index()
        .load_class_by_cid(synthetic_id)
        .unwrap()
        .expect("stand-in has a load-class row");
    assert!(loaded.synthetic);
}

#[test]
fn truncated_tail_segment_reads_to_eof() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b.instance_with_refs(0x2010, C_NODE, &[0]);
    b.root_jni_global(0x2000);
    b.flush_heap_truncated();
    let path = b.write_to(dir.path(), "truncated.hprof");

    // the raw stream must parse cleanly to EOF
    let reader = HeapDumpFile::open(&path).unwrap();
    let mut instances = 0;
    let mut roots = 0;
    let mut records = reader.records();
    while let Some(record) = records.next() {
        match record.expect("no parse error in truncated tail") {
            Record::Instance(_) => instances += 1,
            Record::GcRoot(_) => roots += 1,
            _ => {}
        }
    }
    assert_eq!(2, instances);
    assert_eq!(1, roots);

    // and the whole pipeline must work on top of it
    let mut snapshot = open(&dir, path);
    assert_eq!(2 * (8 + 16), snapshot.total_retained().unwrap());
}

#[test]
fn class_statistics_sort_by_count_then_size() {
    const N_A: u64 = 0x130;
    const N_B: u64 = 0x131;
    const N_C: u64 = 0x132;
    const C_A: u64 = 0x1060;
    const C_B: u64 = 0x1070;
    const C_C: u64 = 0x1080;

    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    b.utf8(N_OBJECT, b"java/lang/Object")
        .utf8(N_A, b"com/example/A")
        .utf8(N_B, b"com/example/B")
        .utf8(N_C, b"com/example/C")
        .load_class(1, C_OBJECT, N_OBJECT)
        .load_class(2, C_A, N_A)
        .load_class(3, C_B, N_B)
        .load_class(4, C_C, N_C);
    b.class(C_OBJECT, 0, 0, &[], &[]);
    // byte-array payloads so instances decode without object fields
    let fields = |n: u64, count: u32| -> Vec<InstanceField> {
        (0..count)
            .map(|i| InstanceField {
                name_id: n + i as u64,
                type_code: common::TYPE_BYTE,
            })
            .collect()
    };
    b.class(C_A, C_OBJECT, 4, &[], &fields(0x200, 4));
    b.class(C_B, C_OBJECT, 8, &[], &fields(0x210, 8));
    b.class(C_C, C_OBJECT, 100, &[], &fields(0x220, 100));
    for i in 0..10_u64 {
        b.instance(0x2000 + i * 0x10, C_A, &[0; 4]);
    }
    for i in 0..10_u64 {
        b.instance(0x3000 + i * 0x10, C_B, &[0; 8]);
    }
    for i in 0..5_u64 {
        b.instance(0x4000 + i * 0x10, C_C, &[0; 100]);
    }
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "stats.hprof");

    let snapshot = open(&dir, path);
    let stats = snapshot.class_statistics().unwrap();
    let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();

    // B and A tie on count, B is bigger; C trails on count despite size
    assert_eq!(
        vec!["com/example/B", "com/example/A", "com/example/C"],
        names
    );
    assert_eq!(10, stats[0].count);
    assert_eq!(10 * (8 + 16), stats[0].size);
    assert_eq!(10, stats[1].count);
    assert_eq!(10 * (4 + 16), stats[1].size);
    assert_eq!(5, stats[2].count);
    assert_eq!(5 * (100 + 16), stats[2].size);
}

#[test]
fn primitive_arrays_get_element_type_classes() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    b.utf8(N_OBJECT, b"java/lang/Object")
        .load_class(1, C_OBJECT, N_OBJECT);
    b.class(C_OBJECT, 0, 0, &[], &[]);
    b.primitive_array(0x2000, common::TYPE_INT, &[0, 0, 0, 7]);
    b.primitive_array(0x2010, common::TYPE_BYTE, &[1, 2, 3]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "prim.hprof");

    let snapshot = open(&dir, path);
    let stats = snapshot.class_statistics().unwrap();

    let ints = stats.iter().find(|s| s.name == "int[]").expect("int[] class");
    assert_eq!(1, ints.count);
    assert_eq!(16 + 8 + 4, ints.size);

    let bytes = stats.iter().find(|s| s.name == "byte[]").expect("byte[] class");
    assert_eq!(1, bytes.count);
    assert_eq!(16 + 8 + 3, bytes.size);

    // the kind filter narrows the instance listing
    let listed = snapshot
        .instances_of(ints.id, Some(RecordEntryKind::PrimitiveArray))
        .unwrap();
    assert_eq!(1, listed.len());
    assert_eq!(0x2000, listed[0].id);
    assert!(snapshot
        .instances_of(ints.id, Some(RecordEntryKind::Instance))
        .unwrap()
        .is_empty());
}

#[test]
fn id_width_4_and_8_agree_on_logical_results() {
    let build = |id_size: usize, dir: &std::path::Path| -> std::path::PathBuf {
        const N_D: u64 = 0x140;
        const C_D: u64 = 0x1090;
        let mut b = DumpBuilder::new(id_size);
        b.utf8(N_OBJECT, b"java/lang/Object")
            .utf8(N_D, b"com/example/D")
            .load_class(1, C_OBJECT, N_OBJECT)
            .load_class(2, C_D, N_D);
        b.class(C_OBJECT, 0, 0, &[], &[]);
        b.class(
            C_D,
            C_OBJECT,
            4,
            &[],
            &[InstanceField {
                name_id: 0x200,
                type_code: common::TYPE_INT,
            }],
        );
        b.instance(0x2000, C_D, &[0, 0, 0, 5]);
        b.instance(0x2010, C_D, &[0, 0, 0, 6]);
        b.root_jni_global(0x2000);
        b.root_jni_global(0x2010);
        b.flush_heap_dump();
        b.write_to(dir, &format!("width-{}.hprof", id_size))
    };

    let dir4 = tempfile::tempdir().unwrap();
    let dir8 = tempfile::tempdir().unwrap();
    let mut narrow = open(&dir4, build(4, dir4.path()));
    let mut wide = open(&dir8, build(8, dir8.path()));

    let stats4: Vec<(String, u64, u64)> = narrow
        .class_statistics()
        .unwrap()
        .into_iter()
        .map(|s| (s.name, s.count, s.size))
        .collect();
    let stats8: Vec<(String, u64, u64)> = wide
        .class_statistics()
        .unwrap()
        .into_iter()
        .map(|s| (s.name, s.count, s.size))
        .collect();
    assert_eq!(stats4, stats8);

    assert_eq!(
        narrow.total_retained().unwrap(),
        wide.total_retained().unwrap()
    );
}

#[test]
fn one_frame_and_many_segments_build_identical_indices() {
    let build = |segments: Option<usize>, dir: &std::path::Path| -> std::path::PathBuf {
        let mut b = DumpBuilder::new(8);
        node_classes(&mut b);
        b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
        b.instance_with_refs(0x2010, C_NODE, &[0x2020]);
        b.instance_with_refs(0x2020, C_NODE, &[0]);
        b.root_jni_global(0x2000);
        match segments {
            None => b.flush_heap_dump(),
            Some(n) => b.flush_heap_segments(n),
        };
        b.write_to(dir, "segmented.hprof")
    };

    let dir_one = tempfile::tempdir().unwrap();
    let dir_many = tempfile::tempdir().unwrap();
    let mut one = open(&dir_one, build(None, dir_one.path()));
    let mut many = open(&dir_many, build(Some(3), dir_many.path()));

    let entries = |s: &Snapshot| -> Vec<(u64, u8, u64, u64)> {
        s.index()
            .records_iter()
            .map(|r| {
                let (id, e) = r.unwrap();
                (id, e.kind.as_u8(), e.class_or_element, e.shallow)
            })
            .collect()
    };
    assert_eq!(entries(&one), entries(&many));

    assert_eq!(
        one.outbound_references(0x2010).unwrap().len(),
        many.outbound_references(0x2010).unwrap().len()
    );
    assert_eq!(one.total_retained().unwrap(), many.total_retained().unwrap());
}

#[test]
fn indexed_records_reparse_byte_identically() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b.instance_with_refs(0x2010, C_NODE, &[0]);
    b.object_array(0x2020, C_NODE, &[0x2000, 0, 0x2010]);
    b.primitive_array(0x2030, common::TYPE_LONG, &[0; 16]);
    b.root_jni_global(0x2000);
    b.root_jni_global(0x2020);
    b.root_jni_global(0x2030);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "reparse.hprof");

    let snapshot = open(&dir, path);
    let reader = snapshot.reader();

    for entry in snapshot.index().records_iter() {
        let (obj_id, entry) = entry.unwrap();
        if entry.is_synthetic() {
            continue;
        }
        let kind = match entry.kind {
            RecordEntryKind::Class => RecordKind::Class,
            RecordEntryKind::Instance => RecordKind::Instance,
            RecordEntryKind::ObjectArray => RecordKind::ObjectArray,
            RecordEntryKind::PrimitiveArray => RecordKind::PrimitiveArray,
        };

        let record = reader.parse_at(entry.offset, kind).unwrap();
        let (pos, len) = record.pos_and_len();
        assert_eq!(entry.offset, pos);

        let parsed_id = match record {
            Record::Class(ref c) => c.obj_id().id(),
            Record::Instance(ref i) => i.obj_id().id(),
            Record::ObjectArray(ref a) => a.obj_id().id(),
            Record::PrimitiveArray(ref a) => a.obj_id().id(),
            _ => panic!("unexpected record kind"),
        };
        assert_eq!(obj_id, parsed_id);

        let first = reader.record_bytes(pos, len).unwrap().to_vec();
        let second = reader.record_bytes(pos, len).unwrap().to_vec();
        assert_eq!(first, second);
    }
}

#[test]
fn unknown_top_level_tags_are_skipped_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    b.utf8(N_OBJECT, b"java/lang/Object")
        .load_class(1, C_OBJECT, N_OBJECT)
        .unknown_record(0x42, b"not part of any spec")
        .unknown_record(0x42, b"again");
    b.class(C_OBJECT, 0, 0, &[], &[]);
    b.instance(0x2000, C_OBJECT, &[]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "unknown-tags.hprof");

    let reader = HeapDumpFile::open(&path).unwrap();
    let mut records = reader.records();
    let mut seen = 0;
    while let Some(record) = records.next() {
        record.unwrap();
        seen += 1;
    }
    assert!(seen >= 4, "utf8, load class, boundary, class, instance, root");
    assert_eq!(Some(&2), records.unknown_tag_counts().get(&0x42));

    // the pipeline shrugs the unknown records off
    let mut snapshot = open(&dir, path);
    assert_eq!(16, snapshot.total_retained().unwrap());
}

#[test]
fn instance_detail_renders_fields_and_references() {
    const N_HOLDER: u64 = 0x150;
    const N_COUNT: u64 = 0x151;
    const C_HOLDER: u64 = 0x10A0;

    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.utf8(N_HOLDER, b"com/example/Holder").utf8(N_COUNT, b"count");
    b.load_class(3, C_HOLDER, N_HOLDER);
    b.class(
        C_HOLDER,
        C_OBJECT,
        12,
        &[],
        &[
            InstanceField {
                name_id: N_COUNT,
                type_code: common::TYPE_INT,
            },
            InstanceField {
                name_id: N_NEXT,
                type_code: common::TYPE_OBJECT,
            },
        ],
    );
    let mut values = vec![0, 0, 0, 7];
    values.extend_from_slice(&0x2010_u64.to_be_bytes());
    b.instance(0x2000, C_HOLDER, &values);
    b.instance_with_refs(0x2010, C_NODE, &[0]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "detail.hprof");

    let snapshot = open(&dir, path);
    let view = snapshot
        .instance_detail(0x2000)
        .unwrap()
        .expect("holder resolves");

    assert_eq!("com/example/Holder", view.class);
    assert_eq!("instance", view.kind);
    assert_eq!(2, view.fields.len());

    assert_eq!("count", view.fields[0].name);
    assert_eq!("int", view.fields[0].field_type);
    assert_eq!("7", view.fields[0].value);
    assert!(view.fields[0].reference.is_none());

    assert_eq!("next", view.fields[1].name);
    assert_eq!("object", view.fields[1].field_type);
    let reference = view.fields[1].reference.as_ref().expect("one-level lookup");
    assert_eq!(0x2010, reference.id);
    assert_eq!("com/example/Node", reference.class);

    assert!(snapshot.instance_detail(0xF00D).unwrap().is_none());
}

#[test]
fn diamond_joins_are_dominated_by_the_fork() {
    // X -> L, X -> R, L -> T, R -> T, all via object arrays
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.object_array(0x2000, C_NODE, &[0x2010, 0x2020]);
    b.object_array(0x2010, C_NODE, &[0x2030]);
    b.object_array(0x2020, C_NODE, &[0x2030]);
    b.object_array(0x2030, C_NODE, &[]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "diamond.hprof");

    let mut snapshot = open(&dir, path);
    let analysis = snapshot.ensure_analysis().unwrap();
    let graph = &analysis.graph;
    let dom = &analysis.dominators;

    let x = graph.node_index(0x2000).unwrap();
    let l = graph.node_index(0x2010).unwrap();
    let r = graph.node_index(0x2020).unwrap();
    let t = graph.node_index(0x2030).unwrap();

    assert_eq!(Some(x), dom.idom(t));
    assert_eq!(Some(x), dom.idom(l));
    assert_eq!(Some(x), dom.idom(r));

    // 16 + 8 + elements
    let sz = |n: u64| 16 + 8 + 8 * n;
    assert_eq!(sz(1), dom.retained(l));
    assert_eq!(sz(1), dom.retained(r));
    assert_eq!(sz(0), dom.retained(t));
    assert_eq!(sz(2) + 2 * sz(1) + sz(0), dom.retained(x));

    let inbound_t = snapshot.inbound_references(0x2030).unwrap();
    assert_eq!(2, inbound_t.len());
}

#[test]
fn threads_resolve_names_frames_and_locals() {
    const N_THREAD: u64 = 0x160;
    const N_MAIN: u64 = 0x161;
    const N_SIG: u64 = 0x162;
    const N_FILE: u64 = 0x163;
    const F_MAIN: u64 = 0x500;

    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.utf8(N_THREAD, b"worker-1")
        .utf8(N_MAIN, b"main")
        .utf8(N_SIG, b"([Ljava/lang/String;)V")
        .utf8(N_FILE, b"Node.java");
    b.stack_frame(F_MAIN, N_MAIN, N_SIG, N_FILE, 2, 42);
    b.stack_trace(7, 3, &[F_MAIN]);
    b.start_thread(3, 0x2000, 7, N_THREAD);
    b.instance_with_refs(0x2000, C_NODE, &[0]);
    b.instance_with_refs(0x2010, C_NODE, &[0]);
    b.root_thread_obj(0x2000, 3, 7);
    b.root_java_frame(0x2010, 3, 0);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "threads.hprof");

    let snapshot = open(&dir, path);
    let threads = snapshot.threads().unwrap();
    assert_eq!(1, threads.len());

    let thread = &threads[0];
    assert_eq!(3, thread.serial);
    assert_eq!("worker-1", thread.name);
    assert_eq!(0x2000, thread.obj_id);
    assert_eq!(vec![0x2010], thread.locals);

    assert_eq!(1, thread.frames.len());
    let frame = &thread.frames[0];
    assert_eq!("com/example/Node", frame.class);
    assert_eq!("main", frame.method);
    assert_eq!("Node.java", frame.source_file);
    assert_eq!(42, frame.line);

    // the thread object keeps its stack locals alive in the graph
    let out = snapshot.outbound_references(0x2000).unwrap();
    assert!(out
        .iter()
        .any(|e| e.id == 0x2010 && e.kind == "thread-local"));
}

#[test]
fn retained_ranking_excludes_root_objects_and_sorts() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    // root R holds X; X holds a big primitive array
    b.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b.instance_with_refs(0x2010, C_NODE, &[0x2020]);
    b.primitive_array(0x2020, common::TYPE_BYTE, &[0xAB; 1000]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "ranking.hprof");

    let mut snapshot = open(&dir, path);
    let ranking = snapshot.retained_ranking(10).unwrap();

    assert!(
        ranking.iter().all(|r| r.id != 0x2000),
        "GC-root objects are excluded from the ranking"
    );

    let x = ranking.iter().find(|r| r.id == 0x2010).expect("X is ranked");
    assert_eq!("com/example/Node", x.class);
    assert_eq!((8 + 16) + (16 + 8 + 1000), x.retained);
    assert!(!x.saturated);

    // descending retained order
    for pair in ranking.windows(2) {
        assert!(pair[0].retained >= pair[1].retained);
    }
    assert_eq!(0x2010, ranking[0].id);
}

#[test]
fn class_dump_round_trips_through_the_reader() {
    const N_STATIC: u64 = 0x170;
    let dir = tempfile::tempdir().unwrap();
    let mut b = DumpBuilder::new(8);
    node_classes(&mut b);
    b.utf8(N_STATIC, b"INSTANCE");
    const C_SINGLETON: u64 = 0x10B0;
    b.class(
        C_SINGLETON,
        C_OBJECT,
        12,
        &[
            StaticField {
                name_id: N_STATIC,
                type_code: common::TYPE_OBJECT,
                value: 0x2000,
            },
            StaticField {
                name_id: N_STATIC,
                type_code: common::TYPE_INT,
                value: 3,
            },
        ],
        &[
            InstanceField {
                name_id: N_NEXT,
                type_code: common::TYPE_OBJECT,
            },
            InstanceField {
                name_id: N_COUNT_PLACEHOLDER,
                type_code: common::TYPE_LONG,
            },
        ],
    );
    b.instance_with_refs(0x2000, C_NODE, &[0]);
    b.root_jni_global(0x2000);
    b.flush_heap_dump();
    let path = b.write_to(dir.path(), "class-dump.hprof");

    let reader = HeapDumpFile::open(&path).unwrap();
    let mut found = None;
    let mut records = reader.records();
    while let Some(record) = records.next() {
        if let Record::Class(class) = record.unwrap() {
            if class.obj_id().id() == C_SINGLETON {
                found = Some(class);
            }
        }
    }
    let class = found.expect("class dump parsed");

    assert_eq!(Some(C_OBJECT), class.super_class_obj_id().map(|id| id.id()));
    assert_eq!(None, class.class_loader_obj_id());
    assert_eq!(12, class.instance_size_bytes());

    let statics = class.static_fields();
    assert_eq!(2, statics.len());
    assert_eq!(N_STATIC, statics[0].name_id().id());
    assert_eq!(
        FieldValue::ObjectId(hprof_analyzer::Id::from(0x2000)),
        statics[0].value()
    );
    assert_eq!(FieldValue::Int(3), statics[1].value());

    let fields = class.instance_fields();
    assert_eq!(2, fields.len());
    assert_eq!(FieldType::Object, fields[0].field_type());
    assert_eq!(FieldType::Long, fields[1].field_type());

    // the class's static object ref keeps 0x2000 inbound-visible
    let snapshot = open(&dir, path);
    let inbound = snapshot.inbound_references(0x2000).unwrap();
    assert!(inbound
        .iter()
        .any(|e| e.id == C_SINGLETON && e.kind == "static"));
}

const N_COUNT_PLACEHOLDER: u64 = 0x171;

#[test]
fn stale_index_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();

    let mut b1 = DumpBuilder::new(8);
    node_classes(&mut b1);
    b1.instance_with_refs(0x2000, C_NODE, &[0]);
    b1.root_jni_global(0x2000);
    b1.flush_heap_dump();
    let path1 = b1.write_to(dir.path(), "first.hprof");

    let index_path = dir.path().join("shared.index");
    {
        let mut snapshot =
            Snapshot::open(&path1, Some(index_path.clone()), IndexerOptions::default()).unwrap();
        assert_eq!(24, snapshot.total_retained().unwrap());
    }

    // a different dump against the same index path must trigger a rebuild
    let mut b2 = DumpBuilder::new(8);
    node_classes(&mut b2);
    b2.instance_with_refs(0x2000, C_NODE, &[0x2010]);
    b2.instance_with_refs(0x2010, C_NODE, &[0]);
    b2.root_jni_global(0x2000);
    b2.flush_heap_dump();
    let path2 = b2.write_to(dir.path(), "second.hprof");

    let mut snapshot =
        Snapshot::open(&path2, Some(index_path), IndexerOptions::default()).unwrap();
    assert_eq!(48, snapshot.total_retained().unwrap());
}
