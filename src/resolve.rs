//! Reference resolution: every live record's outgoing object ids, computed
//! from class pointers, superclass-chain instance fields, array elements and
//! static fields, with soft/weak/final/phantom referents suppressed.

use crate::context::{resolve_name, HeapContext};
use crate::error::Result;
use crate::heap_dump::{FieldDescriptor, FieldType, FieldValue, Instance, ObjectArray};
use crate::index::{Index, RecordEntryKind, RefKind};
use crate::reader::{HeapDumpFile, Record};
use crate::records::RecordKind;
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};

pub const OBJECT_CLASS_NAME: &str = "java/lang/Object";
pub const CLASS_CLASS_NAME: &str = "java/lang/Class";
pub const CLASSLOADER_CLASS_NAME: &str = "java/lang/ClassLoader";

const REFERENCE_CLASS_NAME: &str = "java/lang/ref/Reference";
const REFERENT_FIELD_NAME: &[u8] = b"referent";
const SPECIAL_REFERENCE_CLASSES: [&str; 4] = [
    "java/lang/ref/WeakReference",
    "java/lang/ref/SoftReference",
    "java/lang/ref/FinalReference",
    "java/lang/ref/PhantomReference",
];

/// A class as the resolver sees it: hierarchy link, loader, declared fields,
/// and the object-typed static values.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub class_obj_id: u64,
    /// 0 at the top of the hierarchy.
    pub super_class_obj_id: u64,
    /// 0 for bootstrap-loaded and synthesised classes.
    pub class_loader_obj_id: u64,
    pub instance_size_bytes: u32,
    /// Own declared fields only.
    pub instance_fields: Vec<FieldDescriptor>,
    /// Non-null values of OBJECT-typed statics, in declaration order.
    pub static_object_refs: Vec<u64>,
    pub synthetic: bool,
}

/// Every class in the snapshot plus the derived layout tables the resolver
/// and the field decoder need.
pub struct ClassTable {
    classes: FxHashMap<u64, ClassInfo>,
    /// Class id → superclass chain (the class itself first).
    chains: FxHashMap<u64, Vec<u64>>,
    /// Classes whose instances get `referent` suppression.
    special_reference_classes: FxHashSet<u64>,
    /// Name ids whose bytes decode to `referent`. Multiple UTF8 records may
    /// carry the same bytes, so the match is on decoded content.
    referent_name_ids: FxHashSet<u64>,
}

impl ClassTable {
    pub fn load(reader: &HeapDumpFile, index: &Index, ctx: &HeapContext) -> Result<ClassTable> {
        let mut classes = FxHashMap::default();

        for entry in index.records_iter() {
            let (obj_id, entry) = entry?;
            if entry.kind != RecordEntryKind::Class {
                continue;
            }

            let info = if let Some(fake) = &entry.fake {
                ClassInfo {
                    class_obj_id: obj_id,
                    super_class_obj_id: fake.super_class_obj_id,
                    class_loader_obj_id: 0,
                    instance_size_bytes: 0,
                    instance_fields: fake.field_descriptors(),
                    static_object_refs: Vec::new(),
                    synthetic: true,
                }
            } else {
                match reader.parse_at(entry.offset, RecordKind::Class)? {
                    Record::Class(class) => ClassInfo {
                        class_obj_id: obj_id,
                        super_class_obj_id: class
                            .super_class_obj_id()
                            .map(|id| id.id())
                            .unwrap_or(0),
                        class_loader_obj_id: class
                            .class_loader_obj_id()
                            .map(|id| id.id())
                            .unwrap_or(0),
                        instance_size_bytes: class.instance_size_bytes(),
                        instance_fields: class.instance_fields().to_vec(),
                        static_object_refs: class
                            .static_fields()
                            .iter()
                            .filter_map(|sf| match sf.value() {
                                FieldValue::ObjectId(id) if !id.is_null() => Some(id.id()),
                                _ => None,
                            })
                            .collect(),
                        synthetic: false,
                    },
                    _ => unreachable!("parse_at validated the kind"),
                }
            };
            classes.insert(obj_id, info);
        }

        let chains = build_chains(&classes);
        let special_reference_classes = find_special_reference_classes(ctx, &chains);
        let referent_name_ids =
            find_referent_name_ids(reader, index, ctx, &classes, &special_reference_classes)?;

        Ok(ClassTable {
            classes,
            chains,
            special_reference_classes,
            referent_name_ids,
        })
    }

    pub fn get(&self, class_obj_id: u64) -> Option<&ClassInfo> {
        self.classes.get(&class_obj_id)
    }

    /// The superclass chain, this class first.
    pub fn chain(&self, class_obj_id: u64) -> &[u64] {
        self.chains
            .get(&class_obj_id)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// The full instance field layout of an instance of `class_obj_id`:
    /// own declared fields first, then each superclass's, to the top.
    pub fn chain_field_descriptors(&self, class_obj_id: u64) -> Vec<FieldDescriptor> {
        let mut out = Vec::new();
        for cid in self.chain(class_obj_id) {
            if let Some(info) = self.classes.get(cid) {
                out.extend_from_slice(&info.instance_fields);
            }
        }
        out
    }

    pub fn is_special_reference(&self, class_obj_id: u64) -> bool {
        self.special_reference_classes.contains(&class_obj_id)
    }

    pub fn is_referent_slot(&self, descriptor: &FieldDescriptor) -> bool {
        descriptor.field_type() == FieldType::Object
            && self.referent_name_ids.contains(&descriptor.name_id().id())
    }
}

fn build_chains(classes: &FxHashMap<u64, ClassInfo>) -> FxHashMap<u64, Vec<u64>> {
    let mut chains = FxHashMap::default();
    for (&cid, _) in classes {
        let mut chain = Vec::new();
        let mut current = cid;
        // cycle guard: a well-formed dump terminates at super id 0
        while current != 0 && !chain.contains(&current) {
            chain.push(current);
            current = classes
                .get(&current)
                .map(|info| info.super_class_obj_id)
                .unwrap_or(0);
        }
        chains.insert(cid, chain);
    }
    chains
}

fn find_special_reference_classes(
    ctx: &HeapContext,
    chains: &FxHashMap<u64, Vec<u64>>,
) -> FxHashSet<u64> {
    let special_roots: FxHashSet<u64> = SPECIAL_REFERENCE_CLASSES
        .iter()
        .filter_map(|name| ctx.class_ids_by_name.get(*name).copied())
        .collect();

    if special_roots.is_empty() {
        return FxHashSet::default();
    }

    chains
        .iter()
        .filter(|(_, chain)| chain.iter().any(|cid| special_roots.contains(cid)))
        .map(|(&cid, _)| cid)
        .collect()
}

/// Locate `java/lang/ref/Reference`'s `referent` field and collect every
/// name id in scope that decodes to the same bytes.
fn find_referent_name_ids(
    reader: &HeapDumpFile,
    index: &Index,
    ctx: &HeapContext,
    classes: &FxHashMap<u64, ClassInfo>,
    special: &FxHashSet<u64>,
) -> Result<FxHashSet<u64>> {
    let mut out = FxHashSet::default();

    let base_has_referent = match ctx.class_ids_by_name.get(REFERENCE_CLASS_NAME) {
        Some(&reference_cid) => match classes.get(&reference_cid) {
            Some(info) => {
                let mut found = false;
                for fd in &info.instance_fields {
                    if fd.field_type() != FieldType::Object {
                        continue;
                    }
                    if let Some(bytes) = resolve_name(reader, index, fd.name_id().id())? {
                        if bytes == REFERENT_FIELD_NAME {
                            out.insert(fd.name_id().id());
                            found = true;
                        }
                    }
                }
                found
            }
            None => false,
        },
        None => false,
    };

    if !base_has_referent {
        return Ok(FxHashSet::default());
    }

    // other UTF8 records may duplicate the same bytes under different ids;
    // scan the field names of the affected hierarchies so every alias is
    // caught
    for cid in special {
        if let Some(info) = classes.get(cid) {
            for fd in &info.instance_fields {
                if fd.field_type() != FieldType::Object
                    || out.contains(&fd.name_id().id())
                {
                    continue;
                }
                if let Some(bytes) = resolve_name(reader, index, fd.name_id().id())? {
                    if bytes == REFERENT_FIELD_NAME {
                        out.insert(fd.name_id().id());
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Per-build tallies of recoverable resolution problems, reported at phase
/// end.
#[derive(Default, Debug)]
pub struct ResolveStats {
    pub missing_referents: u64,
    pub layout_mismatches: u64,
}

/// Computes outgoing references for each record kind. Edges to null, self
/// edges, and edges to ids that resolve to nothing are dropped here, so the
/// persisted tables only contain live edges.
pub struct Resolver<'a> {
    index: &'a Index,
    classes: &'a ClassTable,
    /// `java/lang/Class`'s id; every class object is an instance of it.
    java_lang_class_id: u64,
    pub stats: ResolveStats,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a Index, classes: &'a ClassTable, ctx: &HeapContext) -> Resolver<'a> {
        Resolver {
            index,
            classes,
            java_lang_class_id: ctx
                .class_ids_by_name
                .get(CLASS_CLASS_NAME)
                .copied()
                .unwrap_or(0),
            stats: ResolveStats::default(),
        }
    }

    fn push_if_live(
        &mut self,
        out: &mut Vec<(u64, RefKind)>,
        from: u64,
        to: u64,
        kind: RefKind,
    ) -> Result<()> {
        if to == 0 || to == from {
            return Ok(());
        }
        if self.index.record(to)?.is_none() {
            self.stats.missing_referents += 1;
            return Ok(());
        }
        out.push((to, kind));
        Ok(())
    }

    /// Class references: the `java/lang/Class` object, the superclass, the
    /// loader, and every object-typed static.
    pub fn class_refs(&mut self, info: &ClassInfo) -> Result<Vec<(u64, RefKind)>> {
        let mut out = Vec::new();
        let from = info.class_obj_id;
        let jlc = self.java_lang_class_id;
        self.push_if_live(&mut out, from, jlc, RefKind::Class)?;
        self.push_if_live(&mut out, from, info.super_class_obj_id, RefKind::Super)?;
        self.push_if_live(&mut out, from, info.class_loader_obj_id, RefKind::Loader)?;
        for &target in &info.static_object_refs {
            self.push_if_live(&mut out, from, target, RefKind::Static)?;
        }
        Ok(out)
    }

    /// Instance references: the class pointer, then each object-typed field
    /// along the superclass chain, skipping suppressed referent slots.
    pub fn instance_refs(&mut self, instance: &Instance<'_>) -> Result<Vec<(u64, RefKind)>> {
        let from = instance.obj_id().id();
        let class_id = instance.class_obj_id().id();
        let mut out = Vec::new();
        self.push_if_live(&mut out, from, class_id, RefKind::Class)?;

        let descriptors = self.classes.chain_field_descriptors(class_id);
        let suppress = self.classes.is_special_reference(class_id);
        let id_size = self.index.id_size();

        let mut input = instance.values();
        for descriptor in &descriptors {
            if input.len() < descriptor.field_type().size_in_bytes(id_size) {
                self.stats.layout_mismatches += 1;
                warn!(
                    "instance {:#x}: field payload shorter than class layout of {:#x}",
                    from, class_id
                );
                break;
            }
            let (rest, value) = descriptor
                .field_type()
                .parse_value(input, id_size)
                .expect("length checked above");
            input = rest;

            if let FieldValue::ObjectId(target) = value {
                if suppress && self.classes.is_referent_slot(descriptor) {
                    continue;
                }
                self.push_if_live(&mut out, from, target.id(), RefKind::Field)?;
            }
        }

        if !input.is_empty() {
            self.stats.layout_mismatches += 1;
            warn!(
                "instance {:#x}: {} trailing field bytes beyond class layout of {:#x}",
                from,
                input.len(),
                class_id
            );
        }

        Ok(out)
    }

    /// Object array references: the array class, then every non-null
    /// element. `class_id` is the indexed class pointer, which may be a
    /// synthesised stand-in rather than the id in the dump bytes.
    pub fn object_array_refs(
        &mut self,
        array: &ObjectArray<'_>,
        class_id: u64,
    ) -> Result<Vec<(u64, RefKind)>> {
        let from = array.obj_id().id();
        let id_size = self.index.id_size();
        let mut out = Vec::new();
        self.push_if_live(&mut out, from, class_id, RefKind::Class)?;
        for element in array.elements(id_size) {
            match element {
                Ok(id) => self.push_if_live(&mut out, from, id.id(), RefKind::Element)?,
                Err(_) => {
                    self.stats.layout_mismatches += 1;
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Edges from a thread object to the stack locals its frames hold.
    pub fn thread_local_refs(
        &mut self,
        thread_obj_id: u64,
        locals: &[u64],
    ) -> Result<Vec<(u64, RefKind)>> {
        let mut out = Vec::new();
        for &local in locals {
            self.push_if_live(&mut out, thread_obj_id, local, RefKind::ThreadLocal)?;
        }
        Ok(out)
    }
}
